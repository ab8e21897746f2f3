//! End-to-end engine behaviour through the public API.

use async_trait::async_trait;
use quire::modules::{ReadFiles, WriteFiles};
use quire::{
    Content, ContentError, ContentUpdate, Converters, Document, DocumentModule, Engine,
    EngineError, ExecutionContext, MemoryFileSystem, Metadata, Module, ModuleError, PerDocument,
    Phase, PhaseError, Pipeline, Pipelines, PlanError, Services,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

fn services() -> (Arc<MemoryFileSystem>, Services) {
    let fs = Arc::new(MemoryFileSystem::new());
    let services = Services::new(fs.clone());
    (fs, services)
}

/// Logs `<label>:start` / `<label>:end` around an optional sleep.
struct Mark {
    label: String,
    log: Log,
    delay: Duration,
}

impl Mark {
    fn new(label: &str, log: &Log, delay_ms: u64) -> Self {
        Self {
            label: label.to_string(),
            log: log.clone(),
            delay: Duration::from_millis(delay_ms),
        }
    }
}

#[async_trait]
impl Module for Mark {
    fn name(&self) -> &str {
        "Mark"
    }

    async fn execute(
        &self,
        inputs: Vec<Document>,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        self.log.lock().unwrap().push(format!("{}:start", self.label));
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push(format!("{}:end", self.label));
        Ok(inputs)
    }
}

/// Passes every document through untouched.
struct Identity;

#[async_trait]
impl DocumentModule for Identity {
    fn name(&self) -> &str {
        "Identity"
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn process(
        &self,
        doc: Document,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        Ok(vec![doc])
    }
}

/// Emits fixed documents, ignoring its inputs.
struct Fixed(Vec<Document>);

#[async_trait]
impl Module for Fixed {
    fn name(&self) -> &str {
        "Fixed"
    }

    async fn execute(
        &self,
        _inputs: Vec<Document>,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        Ok(self.0.clone())
    }
}

// =========================================================================
// Documents and content
// =========================================================================

#[test]
fn clone_preserves_identity_and_merges_metadata() {
    let original = Document::create(
        Metadata::new().with("title", "Draft").with("author", "kim"),
        None,
    );
    let delta = Metadata::new().with("title", "Final").with("tags", vec!["a"]);

    let clone = original.clone_with(Some(&delta), ContentUpdate::Inherit);

    assert_eq!(clone.id(), original.id());
    let literal = |d: &Document, k: &str| d.metadata().literal(k).cloned();
    assert_eq!(literal(&clone, "title"), Some("Final".into()));
    assert_eq!(literal(&clone, "author"), Some("kim".into()));
    assert!(clone.metadata().contains_key("tags"));
    assert_eq!(literal(&original, "title"), Some("Draft".into()));
}

#[test]
fn shared_content_released_with_last_document() {
    let first = Document::create(Metadata::new(), Some(Content::from_string("shared body")));
    let observer = first.content_ref().unwrap();
    let clones: Vec<Document> = (0..3)
        .map(|i| first.clone_with(Some(&Metadata::new().with("i", i)), ContentUpdate::Inherit))
        .collect();

    drop(first);
    let mut clones = clones.into_iter();
    drop(clones.next());
    drop(clones.next());
    assert!(observer.open().is_ok());

    drop(clones.next());
    assert!(matches!(observer.open(), Err(ContentError::Disposed)));
}

// =========================================================================
// Scheduling
// =========================================================================

#[tokio::test]
async fn dependent_input_waits_for_dependency_output() {
    let log: Log = Arc::default();
    let pipelines = Pipelines::new()
        .with(Pipeline::new("b").depends_on("a").input(Mark::new("b:input", &log, 0)))
        .unwrap()
        .with(
            Pipeline::new("a")
                .input(Mark::new("a:input", &log, 10))
                .output(Mark::new("a:output", &log, 30)),
        )
        .unwrap();
    let (_, services) = services();

    Engine::new(pipelines, services).unwrap().execute().await.unwrap();

    let events = log.lock().unwrap().clone();
    let pos = |e: &str| events.iter().position(|x| x == e).unwrap();
    assert!(pos("a:output:end") < pos("b:input:start"));
}

#[tokio::test]
async fn cycle_fails_before_anything_runs() {
    let log: Log = Arc::default();
    let pipelines = Pipelines::new()
        .with(Pipeline::new("a").depends_on("b").input(Mark::new("a", &log, 0)))
        .unwrap()
        .with(Pipeline::new("b").depends_on("a").input(Mark::new("b", &log, 0)))
        .unwrap();
    let (_, services) = services();

    let err = Engine::new(pipelines, services).err().unwrap();

    assert!(matches!(err, EngineError::Configuration(PlanError::Cycle(_))));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn serial_module_sees_documents_one_at_a_time() {
    struct Serial {
        active: AtomicUsize,
        peak: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl DocumentModule for Serial {
        fn name(&self) -> &str {
            "Serial"
        }

        async fn process(
            &self,
            doc: Document,
            ctx: &ExecutionContext,
        ) -> Result<Vec<Document>, ModuleError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().unwrap().push(ctx.get_or(&doc, "n", -1));
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![doc])
        }
    }

    let peak = Arc::new(AtomicUsize::new(0));
    let seen: Arc<Mutex<Vec<i64>>> = Arc::default();
    let docs = (0..5)
        .map(|n| Document::create(Metadata::new().with("n", n), None))
        .collect();
    let log: Log = Arc::default();
    let pipelines = Pipelines::new()
        .with(
            Pipeline::new("serial")
                .input(Fixed(docs))
                .process(PerDocument(Serial {
                    active: AtomicUsize::new(0),
                    peak: peak.clone(),
                    seen: seen.clone(),
                })),
        )
        .unwrap()
        .with(Pipeline::new("sibling").process(Mark::new("sibling", &log, 10)))
        .unwrap();
    let (_, services) = services();

    let results = Engine::new(pipelines, services.with_document_concurrency(8))
        .unwrap()
        .execute()
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(results.outputs("serial").unwrap().len(), 5);
    assert_eq!(log.lock().unwrap().len(), 2);
}

// =========================================================================
// Aggregation checks
// =========================================================================

#[tokio::test]
async fn duplicate_destination_fails_the_pipeline() {
    let a = Document::create(Metadata::new(), None)
        .derive()
        .source("a.md")
        .destination("index.html")
        .build()
        .unwrap();
    let b = Document::create(Metadata::new(), None)
        .derive()
        .source("b.md")
        .destination("index.html")
        .build()
        .unwrap();
    let pipelines = Pipelines::new()
        .with(Pipeline::new("site").input(Fixed(vec![a, b])))
        .unwrap()
        .with(Pipeline::new("other").input(Fixed(Vec::new())))
        .unwrap();
    let (_, services) = services();

    let Err(EngineError::Failed(report)) =
        Engine::new(pipelines, services).unwrap().execute().await
    else {
        panic!("expected a failed run");
    };

    let failure = report.failure("site", Phase::Output).unwrap();
    match &failure.error {
        PhaseError::DuplicateDestination {
            destination,
            first,
            second,
        } => {
            assert_eq!(destination, Path::new("index.html"));
            assert_eq!(first, "a.md");
            assert_eq!(second, "b.md");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(report.results.outputs("other").is_some());
}

// =========================================================================
// Files through the engine
// =========================================================================

#[tokio::test]
async fn read_identity_write_preserves_order_and_sources() {
    let (fs, services) = services();
    fs.add_input("pages/b.txt", "two");
    fs.add_input("pages/a.txt", "one");
    fs.add_input("pages/c.txt", "three");
    let pipelines = Pipelines::new()
        .with(
            Pipeline::new("pages")
                .input(ReadFiles::new("pages"))
                .process(PerDocument(Identity))
                .output(PerDocument(WriteFiles::new())),
        )
        .unwrap();

    let results = Engine::new(pipelines, services).unwrap().execute().await.unwrap();

    let outputs = results.outputs("pages").unwrap();
    assert_eq!(outputs.len(), 3);
    let sources: Vec<_> = outputs.iter().map(|d| d.source().unwrap()).collect();
    assert_eq!(
        sources,
        vec![
            Path::new("pages/a.txt"),
            Path::new("pages/b.txt"),
            Path::new("pages/c.txt")
        ]
    );
    assert_eq!(fs.output("pages/c.txt").unwrap().as_ref(), b"three");
}

// =========================================================================
// Conversions
// =========================================================================

#[test]
fn string_count_needs_a_converter() {
    let doc = Document::create(Metadata::new().with("Count", "42"), None);
    let (fs, _) = services();

    let mut converters = Converters::strict();
    converters.register(|v: &quire::Value| v.as_str()?.parse::<i64>().ok());
    let with = ExecutionContext::new(
        "p",
        Phase::Process,
        Services::new(fs.clone()).with_converters(converters),
    );
    assert_eq!(with.try_get::<i64>(&doc, "Count"), Some(42));

    let without = ExecutionContext::new(
        "p",
        Phase::Process,
        Services::new(fs).with_converters(Converters::strict()),
    );
    assert_eq!(without.try_get::<i64>(&doc, "Count"), None);
    assert_eq!(without.get_or::<i64>(&doc, "Count", 0), 0);
}
