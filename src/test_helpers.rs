//! Shared test utilities for the quire test suite.
//!
//! Provides ready-made services and contexts over an in-memory file system,
//! plus small modules for driving the engine: emitters, recorders that log
//! start/end events, failing modules, and a concurrency gauge.
//!
//! # Usage
//!
//! ```rust,ignore
//! use crate::test_helpers::*;
//!
//! let log = EventLog::new();
//! let pipeline = Pipeline::new("a")
//!     .input(Emit::named(&["x", "y"]))
//!     .process(Record::new("a", &log));
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::context::{ExecutionContext, Services};
use crate::document::Document;
use crate::fs::MemoryFileSystem;
use crate::metadata::Metadata;
use crate::module::{DocumentModule, Module, ModuleError};
use crate::pipeline::Phase;

// =========================================================================
// Services and contexts
// =========================================================================

pub fn test_services() -> Services {
    Services::new(Arc::new(MemoryFileSystem::new()))
}

pub fn test_context() -> ExecutionContext {
    ExecutionContext::new("test", Phase::Process, test_services())
}

/// Context over a specific file system.
pub fn context_with_fs(fs: Arc<MemoryFileSystem>) -> ExecutionContext {
    ExecutionContext::new("test", Phase::Process, Services::new(fs))
}

// =========================================================================
// Event log
// =========================================================================

/// Ordered log of `label:start` / `label:end` events shared across modules.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// =========================================================================
// Modules
// =========================================================================

/// Passes inputs through, then appends fixed documents.
pub struct Emit {
    docs: Vec<Document>,
    delay: Option<Duration>,
    cacheable: bool,
}

impl Emit {
    /// One content-less document per name, with metadata `name`.
    pub fn named(names: &[&str]) -> Self {
        Self::documents(
            names
                .iter()
                .map(|n| Document::create(Metadata::new().with("name", *n), None))
                .collect(),
        )
    }

    pub fn documents(docs: Vec<Document>) -> Self {
        Self {
            docs,
            delay: None,
            cacheable: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }
}

#[async_trait]
impl Module for Emit {
    fn name(&self) -> &str {
        "Emit"
    }

    fn cache_key(&self) -> Option<String> {
        self.cacheable.then(|| format!("{}", self.docs.len()))
    }

    async fn execute(
        &self,
        mut inputs: Vec<Document>,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        inputs.extend(self.docs.iter().cloned());
        Ok(inputs)
    }
}

/// Passes inputs through, logging `label:start` and `label:end`.
pub struct Record {
    label: String,
    log: EventLog,
    delay: Option<Duration>,
    cacheable: bool,
}

impl Record {
    pub fn new(label: &str, log: &EventLog) -> Self {
        Self {
            label: label.to_string(),
            log: log.clone(),
            delay: None,
            cacheable: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }
}

#[async_trait]
impl Module for Record {
    fn name(&self) -> &str {
        "Record"
    }

    fn cache_key(&self) -> Option<String> {
        self.cacheable.then(|| self.label.clone())
    }

    async fn execute(
        &self,
        inputs: Vec<Document>,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        self.log.push(format!("{}:start", self.label));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.log.push(format!("{}:end", self.label));
        Ok(inputs)
    }
}

/// Always fails with the given message.
pub struct Fail(String);

impl Fail {
    pub fn new(message: &str) -> Self {
        Self(message.to_string())
    }
}

#[async_trait]
impl Module for Fail {
    fn name(&self) -> &str {
        "Fail"
    }

    async fn execute(
        &self,
        _inputs: Vec<Document>,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        Err(ModuleError::failed(self.0.clone()))
    }
}

/// Per-document module recording the order it saw documents (metadata `n`)
/// and the peak number of documents in flight.
pub struct ConcurrencyGauge {
    parallel: bool,
    delay: Duration,
    active: AtomicUsize,
    pub seen: Arc<Mutex<Vec<i64>>>,
    pub peak: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    pub fn new(parallel: bool, delay: Duration) -> Self {
        Self {
            parallel,
            delay,
            active: AtomicUsize::new(0),
            seen: Arc::default(),
            peak: Arc::default(),
        }
    }
}

#[async_trait]
impl DocumentModule for ConcurrencyGauge {
    fn name(&self) -> &str {
        "ConcurrencyGauge"
    }

    fn parallel_safe(&self) -> bool {
        self.parallel
    }

    async fn process(
        &self,
        doc: Document,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.seen.lock().unwrap().push(ctx.get_or(&doc, "n", -1));
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![doc])
    }
}
