//! The module contract: a collection of documents in, a collection out.
//!
//! Modules are the unit of work inside a phase. A phase runs its modules in
//! sequence, each receiving the previous module's output. Modules must not
//! mutate their inputs (documents are immutable anyway) and must produce new
//! documents through [`ExecutionContext::clone_document`] or
//! [`ExecutionContext::create_document`].
//!
//! Most modules transform one document at a time. Those implement
//! [`DocumentModule`] and are wrapped in [`PerDocument`], which handles the
//! iteration: strictly serial by default, concurrent for modules that declare
//! themselves [`parallel_safe`](DocumentModule::parallel_safe). Output order
//! always matches input order.

use crate::content::ContentError;
use crate::context::ExecutionContext;
use crate::document::{Document, DocumentError};
use crate::fs::FsError;
use crate::metadata::MetadataError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("{document}: {source}")]
    OnDocument {
        document: String,
        #[source]
        source: Box<ModuleError>,
    },
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    InvalidDocument(#[from] DocumentError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("pipeline {pipeline} reads outputs of {dependency}, which it does not depend on")]
    UndeclaredDependency { pipeline: String, dependency: String },
    #[error("execution cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl ModuleError {
    pub fn failed(message: impl Into<String>) -> Self {
        ModuleError::Failed(message.into())
    }

    /// Attach the offending document, unless one is already attached.
    pub fn on_document(document: &Document, err: ModuleError) -> Self {
        Self::with_document(document.display_name(), err)
    }

    pub fn with_document(document: impl Into<String>, err: ModuleError) -> Self {
        match err {
            e @ (ModuleError::OnDocument { .. } | ModuleError::Cancelled) => e,
            e => ModuleError::OnDocument {
                document: document.into(),
                source: Box::new(e),
            },
        }
    }

    /// Display name of the document that caused the failure, if known.
    pub fn document(&self) -> Option<&str> {
        match self {
            ModuleError::OnDocument { document, .. } => Some(document),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            ModuleError::Cancelled => true,
            ModuleError::OnDocument { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// A step in a phase.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Stable description of this module's configuration, mixed into the
    /// phase cache key. `None` makes every phase containing it uncacheable.
    fn cache_key(&self) -> Option<String> {
        None
    }

    async fn execute(
        &self,
        inputs: Vec<Document>,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError>;
}

/// A module that maps each input document to zero or more outputs.
#[async_trait]
pub trait DocumentModule: Send + Sync {
    fn name(&self) -> &str;

    /// Whether separate documents may be processed concurrently.
    fn parallel_safe(&self) -> bool {
        false
    }

    fn cache_key(&self) -> Option<String> {
        None
    }

    async fn process(
        &self,
        doc: Document,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError>;
}

/// Adapts a [`DocumentModule`] to the collection-level [`Module`] contract.
#[derive(Debug, Clone)]
pub struct PerDocument<M>(pub M);

impl<M> PerDocument<M> {
    pub fn new(module: M) -> Self {
        Self(module)
    }

    pub fn inner(&self) -> &M {
        &self.0
    }
}

impl<M: DocumentModule> PerDocument<M> {
    async fn process_one(
        &self,
        doc: Document,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        ctx.check_cancelled()?;
        let name = doc.display_name();
        self.0
            .process(doc, ctx)
            .await
            .map_err(|e| ModuleError::with_document(name, e))
    }
}

#[async_trait]
impl<M: DocumentModule> Module for PerDocument<M> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn cache_key(&self) -> Option<String> {
        self.0.cache_key()
    }

    async fn execute(
        &self,
        inputs: Vec<Document>,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        let width = ctx.document_concurrency();
        if !self.0.parallel_safe() || width <= 1 {
            let mut outputs = Vec::with_capacity(inputs.len());
            for doc in inputs {
                outputs.extend(self.process_one(doc, ctx).await?);
            }
            return Ok(outputs);
        }

        // `buffered` polls up to `width` documents at once but yields
        // results in input order.
        let batches: Vec<Vec<Document>> = stream::iter(inputs)
            .map(|doc| self.process_one(doc, ctx))
            .buffered(width)
            .try_collect()
            .await?;
        Ok(batches.into_iter().flatten().collect())
    }
}
