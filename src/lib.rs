//! # Quire
//!
//! A pipeline engine for static site generation. A build is a set of named
//! pipelines; each pipeline is a list of modules grouped into four fixed
//! phases; modules turn collections of immutable documents into new
//! collections.
//!
//! # Architecture: Phases as a Dependency Graph
//!
//! ```text
//!  posts:  Input → Process → PostProcess → Output ─┐
//!                                                  ▼
//!  index:                                Input → Process → PostProcess → Output
//! ```
//!
//! Every pipeline runs `Input → Process → PostProcess → Output`. Declaring a
//! dependency adds an edge from the dependency's phase (Output unless stated)
//! to the dependent's Input. The [`plan`] is the union of those edges across
//! all pipelines, checked for cycles before anything runs. The [`engine`]
//! then executes every phase whose predecessors have completed, concurrently
//! and bounded by `max_concurrency`.
//!
//! - A phase receives its pipeline's previous phase outputs. Input receives
//!   the concatenated outputs of declared dependencies, in declaration order
//!   (nothing, for isolated pipelines).
//! - A failed phase skips everything downstream of it. Independent pipelines
//!   keep running and every failure lands in one [`FailureReport`].
//! - Cancellation is cooperative: modules observe the token through their
//!   [`ExecutionContext`].
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`document`] | Immutable documents: identity, source, destination, metadata, content |
//! | [`content`] | Leased, re-openable content with deterministic release |
//! | [`metadata`] | Literal and computed values, settings, the conversion chain |
//! | [`module`] | The module contract and the per-document adapter |
//! | [`modules`] | Built-in modules (read/write files, metadata, ordering) |
//! | [`pipeline`] | Pipeline definitions, phases, dependency declarations |
//! | [`plan`] | Phase graph construction, cycle detection, topological order |
//! | [`engine`] | Scheduler, phase execution, results and failure reports |
//! | [`context`] | What a module sees while it runs |
//! | [`cache`] | Phase-level cache keyed by module configuration and input fingerprints |
//! | [`fs`] | File system collaborator (local and in-memory) |
//! | [`registry`] | Module names → factories for configured pipelines |
//! | [`config`] | `quire.toml` loading, validation, pipeline construction |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Documents Never Change
//!
//! Modules return new documents instead of mutating their inputs. A clone
//! keeps the original's identity and merges a metadata delta over it, so
//! downstream phases can tell a rewritten document from a new one. The
//! source path is fixed once set; the destination is free to change.
//!
//! ## Content Is Leased
//!
//! Each document holding a [`Content`] holds a lease on it. When the last
//! lease goes away the underlying bytes or file handle are released at
//! once, not at some later collection. The engine also drops each phase's
//! outputs as soon as their last consumer has completed, so a large build
//! doesn't keep every intermediate collection alive until the end.
//!
//! ## Conversions Are a Chain
//!
//! Metadata reads go through a conversion chain: exact type, then
//! registered custom converters, then (with [`Converters::standard`], the
//! [`Services`] default) a parser for strings like `"42"` or `"true"`.
//! [`Converters::strict`] leaves the parser out.
//!
//! ## Caching Whole Phases
//!
//! A phase is cached only when every module in it describes its
//! configuration with a cache key. Modules that read anything beyond their
//! inputs (the file system, other pipelines) decline, which keeps a cache
//! hit from hiding an outside change. Cache keys mix in the engine
//! [`version`], so an upgraded binary never trusts old entries, and the
//! [`Services::fingerprint`] of the settings and converters modules read.

pub mod cache;
pub mod config;
pub mod content;
pub mod context;
pub mod document;
pub mod engine;
pub mod fs;
pub mod metadata;
pub mod module;
pub mod modules;
pub mod output;
pub mod pipeline;
pub mod plan;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use content::{Content, ContentError, ContentRef};
pub use context::{DependencyOutputs, ExecutionContext, Services};
pub use document::{ContentUpdate, Document, DocumentError, DocumentId};
pub use engine::{
    CacheMode, Engine, EngineConfig, EngineError, EngineResults, FailureReport, PhaseError,
    PhaseFailure, PhaseState,
};
pub use fs::{FileSystem, FsError, LocalFileSystem, MemoryFileSystem};
pub use metadata::{Converters, FromValue, Metadata, MetadataError, Settings, Value};
pub use module::{DocumentModule, Module, ModuleError, PerDocument};
pub use pipeline::{Phase, Pipeline, PipelineError, Pipelines};
pub use plan::{ExecutionPlan, PlanError};
pub use registry::{ModuleRegistry, RegistryError};

/// Engine version: the package version on release tags, `<version>-dev@<hash>`
/// otherwise. Mixed into every cache key.
pub fn version() -> &'static str {
    if env!("QUIRE_RELEASE_TAG") == "true" {
        return env!("CARGO_PKG_VERSION");
    }
    match env!("QUIRE_GIT_HASH") {
        "" => concat!(env!("CARGO_PKG_VERSION"), "-dev@unknown"),
        _ => concat!(
            env!("CARGO_PKG_VERSION"),
            "-dev@",
            env!("QUIRE_GIT_HASH")
        ),
    }
}
