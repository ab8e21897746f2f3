//! The execution context handed to every module invocation.
//!
//! One context exists per running phase. It carries the engine-wide
//! [`Services`] (file system, settings, converters, cancellation) plus the
//! phase's own position: pipeline name, phase, and the outputs of the
//! pipeline's declared dependencies.
//!
//! ## Metadata reads
//!
//! Typed access goes through [`ExecutionContext::try_get`] and friends. A key
//! is looked up on the document first, then in the global settings.
//! Computed values are evaluated against the reading document and this
//! context; document-level computeds memoize per document instance, settings
//! computeds are re-evaluated on every read since they have no owning
//! document.
//!
//! ## Dependency outputs
//!
//! [`ExecutionContext::outputs_of`] only answers for pipelines this pipeline
//! declared as dependencies. Asking for anything else is an error, even if
//! that pipeline happens to have finished already.

use crate::content::Content;
use crate::document::{ContentUpdate, Document};
use crate::fs::FileSystem;
use crate::metadata::{Converters, FromValue, MetaValue, Metadata, MetadataError, Settings, Value};
use crate::module::ModuleError;
use crate::pipeline::{Phase, pipeline_key};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default number of documents a parallel-safe module processes at once.
pub const DEFAULT_DOCUMENT_CONCURRENCY: usize = 8;

/// Engine-wide services shared by every phase of a run.
#[derive(Clone)]
pub struct Services {
    pub fs: Arc<dyn FileSystem>,
    pub settings: Arc<Settings>,
    pub converters: Arc<Converters>,
    pub cancel: CancellationToken,
    pub document_concurrency: usize,
}

impl Services {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            settings: Arc::new(Settings::default()),
            converters: Arc::new(Converters::standard()),
            cancel: CancellationToken::new(),
            document_concurrency: DEFAULT_DOCUMENT_CONCURRENCY,
        }
    }

    pub fn with_settings(mut self, settings: impl Into<Settings>) -> Self {
        self.settings = Arc::new(settings.into());
        self
    }

    pub fn with_converters(mut self, converters: Converters) -> Self {
        self.converters = Arc::new(converters);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_document_concurrency(mut self, n: usize) -> Self {
        self.document_concurrency = n.max(1);
        self
    }

    /// SHA-256 over everything a module can read besides its inputs and its
    /// own configuration: literal settings (sorted by key) and the converter
    /// signature. `None` when a setting is computed.
    pub fn fingerprint(&self) -> Option<String> {
        let literals: BTreeMap<String, Value> =
            self.settings.metadata().to_literals()?.into_iter().collect();
        let settings = serde_json::to_vec(&literals).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(b"services\0");
        hasher.update(&settings);
        hasher.update(b"\0");
        hasher.update(self.converters.signature().as_bytes());
        Some(format!("{:x}", hasher.finalize()))
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("fs", &self.fs)
            .field("settings", &self.settings.metadata().len())
            .field("converters", &self.converters)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("document_concurrency", &self.document_concurrency)
            .finish()
    }
}

/// Outputs of one declared dependency, as visible to the dependent.
#[derive(Debug, Clone)]
pub struct DependencyOutputs {
    pub pipeline: String,
    pub phase: Phase,
    pub documents: Arc<[Document]>,
}

/// Per-phase view of the engine passed to modules.
#[derive(Clone)]
pub struct ExecutionContext {
    pipeline: String,
    phase: Phase,
    services: Services,
    dependencies: Arc<IndexMap<String, DependencyOutputs>>,
}

impl ExecutionContext {
    pub fn new(pipeline: impl Into<String>, phase: Phase, services: Services) -> Self {
        Self {
            pipeline: pipeline.into(),
            phase,
            services,
            dependencies: Arc::new(IndexMap::new()),
        }
    }

    /// Attach dependency outputs, keyed case-insensitively by pipeline name.
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = DependencyOutputs>) -> Self {
        self.dependencies = Arc::new(
            deps.into_iter()
                .map(|d| (pipeline_key(&d.pipeline), d))
                .collect(),
        );
        self
    }

    pub(crate) fn with_shared_dependencies(
        mut self,
        deps: Arc<IndexMap<String, DependencyOutputs>>,
    ) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.services.fs
    }

    pub fn settings(&self) -> &Settings {
        &self.services.settings
    }

    pub fn converters(&self) -> &Converters {
        &self.services.converters
    }

    pub fn document_concurrency(&self) -> usize {
        self.services.document_concurrency
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.services.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.services.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once the run has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), ModuleError> {
        if self.is_cancelled() {
            Err(ModuleError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Dependency outputs
    // ------------------------------------------------------------------------

    /// Documents produced by a declared dependency.
    pub fn outputs_of(&self, pipeline: &str) -> Result<&[Document], ModuleError> {
        self.dependencies
            .get(&pipeline_key(pipeline))
            .map(|d| &d.documents[..])
            .ok_or_else(|| ModuleError::UndeclaredDependency {
                pipeline: self.pipeline.clone(),
                dependency: pipeline.to_string(),
            })
    }

    /// All declared dependencies in declaration order.
    pub fn dependencies(&self) -> impl Iterator<Item = &DependencyOutputs> {
        self.dependencies.values()
    }

    // ------------------------------------------------------------------------
    // Document factory
    // ------------------------------------------------------------------------

    pub fn create_document(&self, metadata: Metadata, content: Option<Content>) -> Document {
        Document::create(metadata, content)
    }

    pub fn clone_document(
        &self,
        doc: &Document,
        delta: Option<&Metadata>,
        content: ContentUpdate,
    ) -> Document {
        doc.clone_with(delta, content)
    }

    // ------------------------------------------------------------------------
    // Metadata reads
    // ------------------------------------------------------------------------

    /// Raw value for `key`: document first, then settings.
    pub fn get_value(&self, doc: &Document, key: &str) -> Option<Value> {
        match doc.metadata().get(key) {
            Some(MetaValue::Literal(v)) => Some(v.clone()),
            Some(MetaValue::Computed(c)) => Some(c.evaluate(doc, self)),
            None => match self.settings().metadata().get(key)? {
                MetaValue::Literal(v) => Some(v.clone()),
                MetaValue::Computed(c) => Some(c.evaluate_fresh(doc, self)),
            },
        }
    }

    /// Typed read. `None` when the key is absent or no conversion applies.
    pub fn try_get<T: FromValue>(&self, doc: &Document, key: &str) -> Option<T> {
        let value = self.get_value(doc, key)?;
        self.converters().convert(&value)
    }

    pub fn get_or<T: FromValue>(&self, doc: &Document, key: &str, default: T) -> T {
        self.try_get(doc, key).unwrap_or(default)
    }

    /// Typed read distinguishing a missing key from a failed conversion.
    pub fn require<T: FromValue>(&self, doc: &Document, key: &str) -> Result<T, MetadataError> {
        let value = self
            .get_value(doc, key)
            .ok_or_else(|| MetadataError::Missing(key.to_string()))?;
        self.converters()
            .convert(&value)
            .ok_or_else(|| MetadataError::NotConvertible {
                key: key.to_string(),
                target: type_name::<T>(),
            })
    }

    /// Typed read of a global setting, without a reading document.
    pub fn setting<T: FromValue>(&self, key: &str) -> Option<T> {
        self.try_get(&Document::new(), key)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("pipeline", &self.pipeline)
            .field("phase", &self.phase)
            .field("dependencies", &self.dependencies.keys().collect::<Vec<_>>())
            .finish()
    }
}
