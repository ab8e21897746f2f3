//! Built-in modules.
//!
//! | Module | Kind | Cacheable | Role |
//! |--------|------|-----------|------|
//! | [`ReadFiles`] | collection | no | one document per input file |
//! | [`WriteFiles`] | per-document, serial | no | write content to destinations |
//! | [`SetMetadata`] | per-document, parallel | yes | set a literal key |
//! | [`Filter`] | per-document, parallel | yes | keep documents by a boolean key |
//! | [`SetDestination`] | per-document, parallel | yes | rewrite destinations |
//! | [`SetContent`] | per-document, parallel | yes | template content from metadata |
//! | [`OrderBy`] | collection | yes | stable sort by a key |
//! | [`ConcatOutputs`] | collection | no | append dependency outputs |
//!
//! Per-document modules implement [`DocumentModule`](crate::DocumentModule)
//! and need wrapping in [`PerDocument`](crate::PerDocument) before they go
//! into a pipeline. The [`ModuleRegistry`](crate::ModuleRegistry) does that
//! for configured pipelines.

pub mod collection;
pub mod content;
pub mod files;
pub mod metadata;
pub mod paths;

pub use collection::{ConcatOutputs, OrderBy};
pub use content::SetContent;
pub use files::{ReadFiles, WriteFiles};
pub use metadata::{Filter, SetMetadata};
pub use paths::{DestinationRule, SetDestination, SetDestinationParams};
