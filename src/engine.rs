//! The scheduler that executes an [`ExecutionPlan`].
//!
//! # Execution model
//!
//! Each phase node moves through
//!
//! ```text
//! Pending → Scheduled → Running → Completed | Faulted
//!        ↘ Skipped (a predecessor faulted)
//! ```
//!
//! A phase becomes eligible once all its predecessors have completed. Eligible
//! phases are spawned onto the tokio runtime immediately; an optional
//! semaphore caps how many run at once. When several become eligible at the
//! same time they are spawned in plan order (pipeline declaration, then
//! phase), which keeps logs and reports stable across runs.
//!
//! Inside a phase, modules run strictly in sequence: the seed goes to the
//! first module and module *i*'s output is module *i+1*'s input. The seed is
//! the previous phase's output, or for Input the declared dependencies'
//! outputs concatenated in declaration order (empty for isolated pipelines).
//!
//! # Failures
//!
//! A module error faults its phase and discards the phase's partial results.
//! Every phase reachable from the faulted one (the rest of its pipeline and
//! every dependent pipeline) is marked skipped. Unrelated pipelines keep
//! running. When the run ends, all failures are returned together in one
//! [`FailureReport`].
//!
//! Completed phases are also checked before their outputs are published:
//!
//! - no two distinct documents may claim the same source path (every phase),
//! - no two documents may resolve to the same destination (Output phases).
//!
//! # Cancellation
//!
//! Cancelling the [`Services`] token aborts in-flight phases at their next
//! suspension point and makes [`Engine::execute`] return
//! [`EngineError::Cancelled`]. Results of phases that already completed are
//! discarded.
//!
//! # Memory
//!
//! Intermediate outputs are dropped as soon as every consumer has completed,
//! releasing their content leases. Only Output phase collections survive to
//! the final [`EngineResults`].

use crate::cache::{CacheStats, PhaseCache, fingerprint_inputs, phase_key};
use crate::context::{DependencyOutputs, ExecutionContext, Services};
use crate::document::Document;
use crate::module::{Module, ModuleError};
use crate::pipeline::{Phase, Pipelines, pipeline_key};
use crate::plan::{ExecutionPlan, PhaseId, PlanError};
use futures::FutureExt;
use indexmap::IndexMap;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, info, info_span, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid pipeline configuration: {0}")]
    Configuration(#[from] PlanError),
    #[error("{0}")]
    Failed(Box<FailureReport>),
    #[error("execution cancelled")]
    Cancelled,
}

/// Why a single phase did not complete.
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("module {module} failed: {source}")]
    Module {
        module: String,
        #[source]
        source: ModuleError,
    },
    #[error("documents {first} and {second} both write to {}", .destination.display())]
    DuplicateDestination {
        destination: PathBuf,
        first: String,
        second: String,
    },
    #[error("documents {first} and {second} both claim source {}", .path.display())]
    DuplicateSource {
        path: PathBuf,
        first: String,
        second: String,
    },
    #[error("skipped because {0} failed")]
    Skipped(String),
    #[error("phase task panicked: {0}")]
    Panicked(String),
}

impl PhaseError {
    /// The offending document for module failures, when known.
    pub fn document(&self) -> Option<&str> {
        match self {
            PhaseError::Module { source, .. } => source.document(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseState {
    Pending,
    Scheduled,
    Running,
    Completed,
    Faulted,
    Skipped,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PhaseState::Pending => "pending",
            PhaseState::Scheduled => "scheduled",
            PhaseState::Running => "running",
            PhaseState::Completed => "completed",
            PhaseState::Faulted => "faulted",
            PhaseState::Skipped => "skipped",
        })
    }
}

/// One entry of the aggregate failure report.
#[derive(Debug)]
pub struct PhaseFailure {
    pub pipeline: String,
    pub phase: Phase,
    pub error: PhaseError,
}

impl PhaseFailure {
    pub fn is_skip(&self) -> bool {
        matches!(self.error, PhaseError::Skipped(_))
    }
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.pipeline, self.phase, self.error)
    }
}

/// Every failure of a run, plus whatever did complete.
#[derive(Debug)]
pub struct FailureReport {
    pub failures: Vec<PhaseFailure>,
    pub results: EngineResults,
}

impl FailureReport {
    /// Phases that actually faulted (not merely skipped).
    pub fn faulted(&self) -> impl Iterator<Item = &PhaseFailure> {
        self.failures.iter().filter(|f| !f.is_skip())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &PhaseFailure> {
        self.failures.iter().filter(|f| f.is_skip())
    }

    /// Failure entry for a given phase.
    pub fn failure(&self, pipeline: &str, phase: Phase) -> Option<&PhaseFailure> {
        let key = pipeline_key(pipeline);
        self.failures
            .iter()
            .find(|f| f.phase == phase && pipeline_key(&f.pipeline) == key)
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let faulted = self.faulted().count();
        write!(
            f,
            "{faulted} phase{} failed",
            if faulted == 1 { "" } else { "s" }
        )?;
        for failure in &self.failures {
            write!(f, "\n  {failure}")?;
        }
        Ok(())
    }
}

/// What happened to one phase.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub pipeline: String,
    pub phase: Phase,
    pub state: PhaseState,
    pub documents: usize,
    pub from_cache: bool,
    pub elapsed: Duration,
}

/// Final collection of one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub name: String,
    /// Output phase documents; `None` when the pipeline did not complete.
    pub outputs: Option<Vec<Document>>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineResults {
    pipelines: IndexMap<String, PipelineResult>,
    phases: Vec<PhaseReport>,
    cache: CacheStats,
    elapsed: Duration,
}

impl EngineResults {
    /// Output documents of a completed pipeline.
    pub fn outputs(&self, pipeline: &str) -> Option<&[Document]> {
        self.pipelines
            .get(&pipeline_key(pipeline))?
            .outputs
            .as_deref()
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &PipelineResult> {
        self.pipelines.values()
    }

    /// Phase reports in plan order.
    pub fn phases(&self) -> &[PhaseReport] {
        &self.phases
    }

    pub fn phase(&self, pipeline: &str, phase: Phase) -> Option<&PhaseReport> {
        let key = pipeline_key(pipeline);
        self.phases
            .iter()
            .find(|r| r.phase == phase && pipeline_key(&r.pipeline) == key)
    }

    pub fn cache_stats(&self) -> &CacheStats {
        &self.cache
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Where phase outputs are cached between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheMode {
    Disabled,
    Memory,
    Persistent(PathBuf),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrently running phases; `None` is unbounded.
    pub max_concurrency: Option<usize>,
    pub cache: CacheMode,
    /// Mixed into every cache key.
    pub version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            cache: CacheMode::Memory,
            version: crate::version().to_string(),
        }
    }
}

/// Executes a set of pipelines.
pub struct Engine {
    pipelines: Arc<Pipelines>,
    plan: ExecutionPlan,
    services: Services,
    config: EngineConfig,
    cache: Option<Arc<PhaseCache>>,
    /// [`Services::fingerprint`], taken once. `None` disables caching.
    environment: Option<String>,
}

impl Engine {
    /// Validate `pipelines` and build the plan. Configuration errors surface
    /// here, before anything runs.
    pub fn new(pipelines: Pipelines, services: Services) -> Result<Self, EngineError> {
        Self::with_config(pipelines, services, EngineConfig::default())
    }

    pub fn with_config(
        pipelines: Pipelines,
        services: Services,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let plan = ExecutionPlan::build(&pipelines)?;
        debug!(pipelines = pipelines.len(), phases = plan.len(), "plan built");
        let cache = match &config.cache {
            CacheMode::Disabled => None,
            CacheMode::Memory => Some(Arc::new(PhaseCache::in_memory())),
            CacheMode::Persistent(dir) => Some(Arc::new(PhaseCache::persistent(dir))),
        };
        let environment = services.fingerprint();
        if cache.is_some() && environment.is_none() {
            debug!("computed settings present, phases will not be cached");
        }
        Ok(Self {
            pipelines: Arc::new(pipelines),
            plan,
            services,
            config,
            cache,
            environment,
        })
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The token that cancels [`execute`](Self::execute).
    pub fn cancellation(&self) -> CancellationToken {
        self.services.cancel.clone()
    }

    /// Run every pipeline.
    pub async fn execute(&self) -> Result<EngineResults, EngineError> {
        let started = Instant::now();
        let cancel = self.services.cancel.clone();
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(cache) = &self.cache {
            cache.reset_stats();
        }
        info!(
            pipelines = self.pipelines.len(),
            phases = self.plan.len(),
            "execution started"
        );

        let semaphore = self
            .config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let mut run = Run::new(&self.plan);
        let mut tasks: JoinSet<(PhaseId, Result<PhaseOutcome, PhaseError>)> = JoinSet::new();

        loop {
            while let Some(id) = run.ready.pop_first() {
                let job = self.prepare(id, &mut run, semaphore.clone());
                run.board.set(id, PhaseState::Scheduled);
                tasks.spawn(run_phase(job));
            }
            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    warn!("execution cancelled");
                    return Err(EngineError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            // Panics are caught inside the task, so a join error can only
            // come from an abort.
            let Some(Ok((id, result))) = joined else {
                continue;
            };
            self.finish(id, result, &mut run);
        }

        if cancel.is_cancelled() {
            warn!("execution cancelled");
            return Err(EngineError::Cancelled);
        }

        if let Some(cache) = &self.cache
            && let Err(e) = cache.flush()
        {
            warn!(error = %e, "failed to save phase cache");
        }

        let results = self.collect(run.outputs, &run.reports, started.elapsed());
        if run.failures.is_empty() {
            info!(
                elapsed_ms = results.elapsed.as_millis() as u64,
                "execution finished"
            );
            Ok(results)
        } else {
            error!(failures = run.failures.len(), "execution failed");
            Err(EngineError::Failed(Box::new(FailureReport {
                failures: run.failures,
                results,
            })))
        }
    }

    fn prepare(&self, id: PhaseId, run: &mut Run, semaphore: Option<Arc<Semaphore>>) -> PhaseJob {
        let pipeline = self.pipelines.at(id.pipeline);

        let dependencies = run
            .dependency_views
            .entry(id.pipeline)
            .or_insert_with(|| {
                let views: IndexMap<String, DependencyOutputs> = pipeline
                    .dependencies()
                    .iter()
                    .filter_map(|dep| {
                        let index = self.pipelines.index_of(&dep.pipeline)?;
                        let documents = run
                            .outputs
                            .get(&PhaseId::new(index, dep.phase))
                            .cloned()
                            .unwrap_or_else(|| Vec::new().into());
                        Some((
                            pipeline_key(&dep.pipeline),
                            DependencyOutputs {
                                pipeline: self.pipelines.at(index).name().to_string(),
                                phase: dep.phase,
                                documents,
                            },
                        ))
                    })
                    .collect();
                Arc::new(views)
            })
            .clone();

        let seed: Vec<Document> = match id.phase.previous() {
            None if pipeline.is_isolated() => Vec::new(),
            None => pipeline
                .dependencies()
                .iter()
                .filter_map(|dep| {
                    let index = self.pipelines.index_of(&dep.pipeline)?;
                    run.outputs.get(&PhaseId::new(index, dep.phase))
                })
                .flat_map(|docs| docs.iter().cloned())
                .collect(),
            Some(previous) => run
                .outputs
                .get(&PhaseId::new(id.pipeline, previous))
                .map(|docs| docs.to_vec())
                .unwrap_or_default(),
        };

        let ctx = ExecutionContext::new(pipeline.name(), id.phase, self.services.clone())
            .with_shared_dependencies(dependencies);
        let cache = if pipeline.is_no_cache() {
            None
        } else {
            self.cache.clone()
        };

        PhaseJob {
            id,
            pipeline: pipeline.name().to_string(),
            modules: pipeline.modules(id.phase).to_vec(),
            seed,
            ctx,
            cache,
            semaphore,
            board: Arc::clone(&run.board),
            version: self.config.version.clone(),
            environment: self.environment.clone(),
        }
    }

    fn finish(&self, id: PhaseId, result: Result<PhaseOutcome, PhaseError>, run: &mut Run) {
        let outcome = match result.and_then(|outcome| {
            check_sources(&outcome.documents)?;
            if id.phase == Phase::Output {
                check_destinations(&outcome.documents)?;
            }
            Ok(outcome)
        }) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fault(id, e, run);
                return;
            }
        };

        run.board.set(id, PhaseState::Completed);
        run.reports.insert(
            id,
            PhaseReport {
                pipeline: self.pipelines.at(id.pipeline).name().to_string(),
                phase: id.phase,
                state: PhaseState::Completed,
                documents: outcome.documents.len(),
                from_cache: outcome.from_cache,
                elapsed: outcome.elapsed,
            },
        );
        run.outputs.insert(id, outcome.documents.into());

        let Some(node) = self.plan.node(id) else {
            return;
        };
        for next in &node.successors {
            if let Some(remaining) = run.remaining.get_mut(next) {
                *remaining -= 1;
                if *remaining == 0 && run.board.get(*next) == PhaseState::Pending {
                    run.ready.insert(*next);
                }
            }
        }
        for prev in &node.predecessors {
            run.release(*prev);
        }
    }

    fn fault(&self, id: PhaseId, err: PhaseError, run: &mut Run) {
        let label = self.plan.label(id);
        let pipeline = self.pipelines.at(id.pipeline).name().to_string();
        match err.document() {
            Some(document) => error!(phase = %label, document, error = %err, "phase failed"),
            None => error!(phase = %label, error = %err, "phase failed"),
        }
        run.board.set(id, PhaseState::Faulted);
        run.reports.insert(
            id,
            PhaseReport {
                pipeline: pipeline.clone(),
                phase: id.phase,
                state: PhaseState::Faulted,
                documents: 0,
                from_cache: false,
                elapsed: Duration::ZERO,
            },
        );
        run.failures.push(PhaseFailure {
            pipeline,
            phase: id.phase,
            error: err,
        });

        for downstream in self.plan.transitive_successors(id) {
            if run.board.get(downstream) != PhaseState::Pending {
                continue;
            }
            let name = self.pipelines.at(downstream.pipeline).name().to_string();
            warn!(phase = %self.plan.label(downstream), cause = %label, "phase skipped");
            run.board.set(downstream, PhaseState::Skipped);
            run.ready.remove(&downstream);
            run.reports.insert(
                downstream,
                PhaseReport {
                    pipeline: name.clone(),
                    phase: downstream.phase,
                    state: PhaseState::Skipped,
                    documents: 0,
                    from_cache: false,
                    elapsed: Duration::ZERO,
                },
            );
            run.failures.push(PhaseFailure {
                pipeline: name,
                phase: downstream.phase,
                error: PhaseError::Skipped(label.clone()),
            });
        }
    }

    fn collect(
        &self,
        mut outputs: HashMap<PhaseId, Arc<[Document]>>,
        reports: &HashMap<PhaseId, PhaseReport>,
        elapsed: Duration,
    ) -> EngineResults {
        let pipelines = self
            .pipelines
            .iter()
            .enumerate()
            .map(|(index, pipeline)| {
                let outputs = outputs
                    .remove(&PhaseId::new(index, Phase::Output))
                    .map(|docs| docs.to_vec());
                (
                    pipeline_key(pipeline.name()),
                    PipelineResult {
                        name: pipeline.name().to_string(),
                        outputs,
                    },
                )
            })
            .collect();
        let phases = self
            .plan
            .order()
            .iter()
            .filter_map(|id| reports.get(id).cloned())
            .collect();
        EngineResults {
            pipelines,
            phases,
            cache: self
                .cache
                .as_ref()
                .map(|c| c.stats())
                .unwrap_or_default(),
            elapsed,
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("pipelines", &self.pipelines.len())
            .field("phases", &self.plan.len())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Run bookkeeping
// ============================================================================

#[derive(Default)]
struct StateBoard(Mutex<HashMap<PhaseId, PhaseState>>);

impl StateBoard {
    fn get(&self, id: PhaseId) -> PhaseState {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .copied()
            .unwrap_or(PhaseState::Pending)
    }

    fn set(&self, id: PhaseId, state: PhaseState) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, state);
    }
}

struct Run {
    board: Arc<StateBoard>,
    /// Predecessors not yet completed.
    remaining: HashMap<PhaseId, usize>,
    /// Successors not yet completed; outputs are dropped at zero.
    consumers: HashMap<PhaseId, usize>,
    ready: BTreeSet<PhaseId>,
    outputs: HashMap<PhaseId, Arc<[Document]>>,
    /// Dependency outputs per pipeline, captured when its Input is scheduled.
    dependency_views: HashMap<usize, Arc<IndexMap<String, DependencyOutputs>>>,
    reports: HashMap<PhaseId, PhaseReport>,
    failures: Vec<PhaseFailure>,
}

impl Run {
    fn new(plan: &ExecutionPlan) -> Self {
        let mut remaining = HashMap::new();
        let mut consumers = HashMap::new();
        for id in plan.order() {
            if let Some(node) = plan.node(*id) {
                remaining.insert(*id, node.predecessors.len());
                consumers.insert(*id, node.successors.len());
            }
        }
        Self {
            board: Arc::new(StateBoard::default()),
            remaining,
            consumers,
            ready: plan.roots().collect(),
            outputs: HashMap::new(),
            dependency_views: HashMap::new(),
            reports: HashMap::new(),
            failures: Vec::new(),
        }
    }

    /// One consumer of `id` finished; drop intermediate outputs nobody needs.
    fn release(&mut self, id: PhaseId) {
        let Some(count) = self.consumers.get_mut(&id) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 && id.phase != Phase::Output && self.outputs.remove(&id).is_some() {
            debug!(pipeline = id.pipeline, phase = %id.phase, "released intermediate outputs");
        }
    }
}

// ============================================================================
// Phase execution
// ============================================================================

struct PhaseJob {
    id: PhaseId,
    pipeline: String,
    modules: Vec<Arc<dyn Module>>,
    seed: Vec<Document>,
    ctx: ExecutionContext,
    cache: Option<Arc<PhaseCache>>,
    semaphore: Option<Arc<Semaphore>>,
    board: Arc<StateBoard>,
    version: String,
    environment: Option<String>,
}

struct PhaseOutcome {
    documents: Vec<Document>,
    from_cache: bool,
    elapsed: Duration,
}

async fn run_phase(job: PhaseJob) -> (PhaseId, Result<PhaseOutcome, PhaseError>) {
    let id = job.id;
    let span = info_span!("phase", pipeline = %job.pipeline, phase = %id.phase);
    let result = AssertUnwindSafe(execute_phase(job).instrument(span))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(PhaseError::Panicked(panic_message(panic.as_ref()))));
    (id, result)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn execute_phase(job: PhaseJob) -> Result<PhaseOutcome, PhaseError> {
    let _permit = match &job.semaphore {
        Some(semaphore) => Some(
            Arc::clone(semaphore)
                .acquire_owned()
                .await
                .map_err(|_| PhaseError::Module {
                    module: "engine".into(),
                    source: ModuleError::Cancelled,
                })?,
        ),
        None => None,
    };
    job.board.set(job.id, PhaseState::Running);
    let started = Instant::now();
    debug!(inputs = job.seed.len(), modules = job.modules.len(), "phase started");

    // Nothing to run and nothing worth caching.
    if job.modules.is_empty() {
        return Ok(PhaseOutcome {
            documents: job.seed,
            from_cache: false,
            elapsed: started.elapsed(),
        });
    }

    let cache_key = match &job.cache {
        Some(cache) => {
            let key = cache_key_for(&job).await;
            if key.is_none() {
                cache.record_uncacheable();
            }
            key
        }
        None => None,
    };
    if let (Some(cache), Some(key)) = (&job.cache, &cache_key)
        && let Some(documents) = cache.lookup(&job.pipeline, job.id.phase, key)
    {
        info!(documents = documents.len(), "phase restored from cache");
        return Ok(PhaseOutcome {
            documents,
            from_cache: true,
            elapsed: started.elapsed(),
        });
    }
    if cache_key.is_some() {
        debug!("cache miss");
    }

    let mut documents = job.seed;
    for module in &job.modules {
        let name = module.name().to_string();
        job.ctx
            .check_cancelled()
            .map_err(|source| PhaseError::Module {
                module: name.clone(),
                source,
            })?;
        documents = module
            .execute(documents, &job.ctx)
            .instrument(debug_span!("module", name = %name))
            .await
            .map_err(|source| PhaseError::Module {
                module: name,
                source,
            })?;
    }

    if let (Some(cache), Some(key)) = (&job.cache, &cache_key) {
        cache.store(&job.pipeline, job.id.phase, key, &documents);
        debug!("phase outputs cached");
    }

    let elapsed = started.elapsed();
    info!(
        documents = documents.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "phase completed"
    );
    Ok(PhaseOutcome {
        documents,
        from_cache: false,
        elapsed,
    })
}

/// Compute the phase cache key, or `None` when the phase is uncacheable.
async fn cache_key_for(job: &PhaseJob) -> Option<String> {
    let environment = job.environment.as_deref()?;
    let module_keys: Vec<String> = job
        .modules
        .iter()
        .map(|m| m.cache_key().map(|k| format!("{}:{k}", m.name())))
        .collect::<Option<_>>()?;
    let seed = job.seed.clone();
    let fingerprints = match tokio::task::spawn_blocking(move || fingerprint_inputs(&seed)).await {
        Ok(Ok(Some(fps))) => fps,
        Ok(Ok(None)) => return None,
        Ok(Err(e)) => {
            debug!(error = %e, "could not fingerprint inputs");
            return None;
        }
        Err(_) => return None,
    };
    Some(phase_key(
        &job.version,
        environment,
        &job.pipeline,
        job.id.phase,
        &module_keys,
        &fingerprints,
    ))
}

// ============================================================================
// Collision checks
// ============================================================================

/// Distinct documents (by id) must not share a source path.
fn check_sources(documents: &[Document]) -> Result<(), PhaseError> {
    let mut seen: HashMap<&Path, &Document> = HashMap::new();
    for doc in documents {
        let Some(source) = doc.source() else {
            continue;
        };
        match seen.get(source) {
            Some(first) if first.id() != doc.id() => {
                return Err(PhaseError::DuplicateSource {
                    path: source.to_path_buf(),
                    first: first.id().to_string(),
                    second: doc.id().to_string(),
                });
            }
            Some(_) => {}
            None => {
                seen.insert(source, doc);
            }
        }
    }
    Ok(())
}

/// No two documents may write to the same destination.
fn check_destinations(documents: &[Document]) -> Result<(), PhaseError> {
    let mut seen: HashMap<&Path, &Document> = HashMap::new();
    for doc in documents {
        let Some(destination) = doc.destination() else {
            continue;
        };
        if let Some(first) = seen.get(destination) {
            return Err(PhaseError::DuplicateDestination {
                destination: destination.to_path_buf(),
                first: first.display_name(),
                second: doc.display_name(),
            });
        }
        seen.insert(destination, doc);
    }
    Ok(())
}
