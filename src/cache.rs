//! Phase output cache for incremental runs.
//!
//! A phase whose inputs and module configuration are unchanged since the
//! last run produces the same documents again, so the engine can skip it
//! and reuse the stored outputs.
//!
//! # Cache keys
//!
//! The key is **content-addressed**: SHA-256 over
//!
//! - the engine version string (a new build invalidates everything),
//! - the [`Services` fingerprint](crate::Services::fingerprint): literal
//!   settings and the converter signature,
//! - the pipeline name and phase,
//! - each module's [`cache_key`](crate::Module::cache_key), in order,
//! - the [`fingerprint`](crate::Document::fingerprint) of every input
//!   document, in order.
//!
//! A phase is uncacheable when any of its modules returns no cache key, any
//! input document carries computed metadata, or a setting is computed. Uncacheable phases always
//! run.
//!
//! # Layers
//!
//! The memory layer keeps the most recent outputs of every phase for the
//! lifetime of the [`PhaseCache`], sharing content leases with the live
//! documents. The optional disk layer persists literal-only outputs in a JSON
//! manifest next to a `blobs/` directory of content files named by their
//! SHA-256, so the next process can pick up where this one left off.
//!
//! Documents restored from disk get fresh ids. Identity is per run, but
//! documents that shared an id when stored share one again on restore, so
//! clones of one document still count as one for source checks.
//!
//! Both layers keep a single entry per (pipeline, phase): storing a new key
//! evicts the previous one, so the cache never grows past the phase count.
//!
//! # Failure handling
//!
//! The cache is an optimization. Unreadable manifests load as empty, missing
//! blobs are misses, and write failures are logged and otherwise ignored.

use crate::content::{Content, ContentError, ContentSource};
use crate::document::{Document, DocumentId};
use crate::metadata::{Metadata, Value};
use crate::pipeline::{Phase, pipeline_key};
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the cache manifest file within the cache directory.
const MANIFEST_FILENAME: &str = "phase-cache.json";

/// Directory of content blobs within the cache directory.
const BLOB_DIR: &str = "blobs";

/// Version of the cache manifest format. Bump this to invalidate all
/// existing caches when the format or key computation changes.
const MANIFEST_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("manifest error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Content(#[from] ContentError),
}

/// A document as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedDocument {
    pub source: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub metadata: IndexMap<String, Value>,
    /// Blob name (content hash), `None` for documents without content.
    pub content: Option<String>,
    /// Index of the first earlier document in the entry with the same id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_as: Option<usize>,
}

/// The stored outputs of one phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub pipeline: String,
    pub phase: Phase,
    pub documents: Vec<CachedDocument>,
}

/// On-disk manifest mapping phase keys to their stored outputs.
///
/// Lookups by phase go through a runtime `phase_index` mapping
/// `"{pipeline}:{phase}"` to the current key, so stale entries are evicted
/// when a phase's key changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    pub version: u32,
    pub entries: HashMap<String, CacheEntry>,
    /// Runtime reverse index. Built at load time, maintained on insert.
    #[serde(skip)]
    phase_index: HashMap<String, String>,
}

impl CacheManifest {
    /// Create an empty manifest (first run or unreadable cache).
    pub fn empty() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: HashMap::new(),
            phase_index: HashMap::new(),
        }
    }

    /// Load from the cache directory. Returns an empty manifest if the
    /// file doesn't exist or can't be parsed (version mismatch, corruption).
    pub fn load(cache_dir: &Path) -> Self {
        let path = manifest_path(cache_dir);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Self::empty(),
        };
        let mut manifest: Self = match serde_json::from_str(&content) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable cache manifest");
                return Self::empty();
            }
        };
        if manifest.version != MANIFEST_VERSION {
            return Self::empty();
        }
        manifest.phase_index = build_phase_index(&manifest.entries);
        manifest
    }

    /// Save to the cache directory, creating it if needed.
    pub fn save(&self, cache_dir: &Path) -> Result<(), CacheError> {
        std::fs::create_dir_all(cache_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(manifest_path(cache_dir), json)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Record a phase's outputs, evicting the phase's previous entry.
    pub fn insert(&mut self, key: String, entry: CacheEntry) {
        let slot = phase_slot(&entry.pipeline, entry.phase);
        if let Some(old_key) = self.phase_index.get(&slot)
            && *old_key != key
        {
            self.entries.remove(old_key.as_str());
        }
        self.phase_index.insert(slot, key.clone());
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn phase_slot(pipeline: &str, phase: Phase) -> String {
    format!("{}:{}", pipeline_key(pipeline), phase)
}

fn build_phase_index(entries: &HashMap<String, CacheEntry>) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(key, entry)| (phase_slot(&entry.pipeline, entry.phase), key.clone()))
        .collect()
}

/// Resolve the manifest path for a cache directory.
pub fn manifest_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(MANIFEST_FILENAME)
}

// ============================================================================
// Keys
// ============================================================================

/// SHA-256 cache key for one phase execution.
pub fn phase_key(
    version: &str,
    environment: &str,
    pipeline: &str,
    phase: Phase,
    module_keys: &[String],
    input_fingerprints: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"phase\0");
    hasher.update(version.as_bytes());
    hasher.update(b"\0");
    hasher.update(environment.as_bytes());
    hasher.update(b"\0");
    hasher.update(pipeline_key(pipeline).as_bytes());
    hasher.update(b"\0");
    hasher.update(phase.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update((module_keys.len() as u64).to_le_bytes());
    for key in module_keys {
        hasher.update(key.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update((input_fingerprints.len() as u64).to_le_bytes());
    for fp in input_fingerprints {
        hasher.update(fp.as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

/// Fingerprint every input document on the rayon pool.
///
/// `Ok(None)` when any document has no stable fingerprint.
pub fn fingerprint_inputs(docs: &[Document]) -> Result<Option<Vec<String>>, ContentError> {
    let fingerprints: Vec<Option<String>> = docs
        .par_iter()
        .map(Document::fingerprint)
        .collect::<Result<_, _>>()?;
    Ok(fingerprints.into_iter().collect())
}

// ============================================================================
// Stats
// ============================================================================

/// Summary of cache behaviour for a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub misses: u32,
    pub uncacheable: u32,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn miss(&mut self) {
        self.misses += 1;
    }

    pub fn skip(&mut self) {
        self.uncacheable += 1;
    }

    pub fn total(&self) -> u32 {
        self.hits + self.misses + self.uncacheable
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits > 0 {
            write!(
                f,
                "{} cached, {} executed ({} total)",
                self.hits,
                self.misses + self.uncacheable,
                self.total()
            )
        } else {
            write!(f, "{} executed", self.total())
        }
    }
}

// ============================================================================
// PhaseCache
// ============================================================================

struct DiskCache {
    dir: PathBuf,
    manifest: Mutex<CacheManifest>,
}

impl DiskCache {
    fn blob_dir(&self) -> PathBuf {
        self.dir.join(BLOB_DIR)
    }

    fn restore(&self, key: &str) -> Option<Vec<Document>> {
        let manifest = lock(&self.manifest);
        let entry = manifest.get(key)?;
        let blobs = self.blob_dir();
        let mut docs: Vec<Document> = Vec::with_capacity(entry.documents.len());
        for cached in &entry.documents {
            let doc = restore_document(cached, &blobs)?;
            let doc = match cached.same_as.and_then(|i| docs.get(i)) {
                Some(first) => doc.with_identity_of(first),
                None => doc,
            };
            docs.push(doc);
        }
        Some(docs)
    }

    fn persist(&self, key: &str, pipeline: &str, phase: Phase, docs: &[Document]) -> Result<bool, CacheError> {
        let mut documents = Vec::with_capacity(docs.len());
        let mut first_by_id: HashMap<DocumentId, usize> = HashMap::new();
        for (index, doc) in docs.iter().enumerate() {
            let Some(metadata) = doc.metadata().to_literals() else {
                return Ok(false);
            };
            let content = match doc.content() {
                Some(c) => Some(self.write_blob(c)?),
                None => None,
            };
            let first = *first_by_id.entry(doc.id()).or_insert(index);
            documents.push(CachedDocument {
                source: doc.source().map(Path::to_path_buf),
                destination: doc.destination().map(Path::to_path_buf),
                metadata,
                content,
                same_as: (first != index).then_some(first),
            });
        }
        lock(&self.manifest).insert(
            key.to_string(),
            CacheEntry {
                pipeline: pipeline.to_string(),
                phase,
                documents,
            },
        );
        Ok(true)
    }

    fn write_blob(&self, content: &Content) -> Result<String, CacheError> {
        let hash = content.content_hash()?;
        let dir = self.blob_dir();
        let path = dir.join(&hash);
        if path.exists() {
            return Ok(hash);
        }
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        io::copy(&mut content.open()?, &mut tmp)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(hash)
    }
}

fn restore_document(cached: &CachedDocument, blobs: &Path) -> Option<Document> {
    let content = match &cached.content {
        Some(hash) => {
            let path = blobs.join(hash);
            if !path.is_file() {
                return None;
            }
            Some(Content::new(BlobContent { path }))
        }
        None => None,
    };
    let doc = Document::create(Metadata::from_literals(cached.metadata.clone()), content);
    let mut builder = doc.derive();
    if let Some(source) = &cached.source {
        builder = builder.source(source);
    }
    if let Some(dest) = &cached.destination {
        builder = builder.destination(dest);
    }
    builder.build().ok()
}

/// A content blob in the cache directory.
#[derive(Debug)]
struct BlobContent {
    path: PathBuf,
}

impl ContentSource for BlobContent {
    fn open(&self) -> Result<Box<dyn Read + Send>, ContentError> {
        Ok(Box::new(std::fs::File::open(&self.path)?))
    }

    fn len_hint(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }
}

type MemorySlot = (String, Arc<[Document]>);

/// Two-layer phase output cache.
pub struct PhaseCache {
    memory: Mutex<HashMap<String, MemorySlot>>,
    disk: Option<DiskCache>,
    stats: Mutex<CacheStats>,
}

impl PhaseCache {
    /// Memory layer only.
    pub fn in_memory() -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            disk: None,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Memory layer plus a persistent layer under `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let manifest = CacheManifest::load(&dir);
        debug!(dir = %dir.display(), entries = manifest.len(), "loaded phase cache");
        Self {
            disk: Some(DiskCache {
                dir,
                manifest: Mutex::new(manifest),
            }),
            ..Self::in_memory()
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.disk.as_ref().map(|d| d.dir.as_path())
    }

    /// Stored outputs for `key`, counting a hit or a miss.
    pub fn lookup(&self, pipeline: &str, phase: Phase, key: &str) -> Option<Vec<Document>> {
        let found = self.lookup_memory(pipeline, phase, key).or_else(|| {
            let docs = self.disk.as_ref()?.restore(key)?;
            let shared: Arc<[Document]> = docs.clone().into();
            lock(&self.memory).insert(phase_slot(pipeline, phase), (key.to_string(), shared));
            Some(docs)
        });
        let mut stats = lock(&self.stats);
        match found {
            Some(_) => stats.hit(),
            None => stats.miss(),
        }
        found
    }

    fn lookup_memory(&self, pipeline: &str, phase: Phase, key: &str) -> Option<Vec<Document>> {
        let memory = lock(&self.memory);
        let (stored_key, docs) = memory.get(&phase_slot(pipeline, phase))?;
        (stored_key == key).then(|| docs.to_vec())
    }

    /// Record `docs` as the outputs for `key`.
    pub fn store(&self, pipeline: &str, phase: Phase, key: &str, docs: &[Document]) {
        lock(&self.memory).insert(
            phase_slot(pipeline, phase),
            (key.to_string(), docs.to_vec().into()),
        );
        if let Some(disk) = &self.disk {
            match disk.persist(key, pipeline, phase, docs) {
                Ok(true) => {}
                Ok(false) => debug!(pipeline, %phase, "outputs carry computed metadata, not persisted"),
                Err(e) => warn!(pipeline, %phase, error = %e, "failed to persist phase outputs"),
            }
        }
    }

    /// Count a phase that could not be keyed.
    pub fn record_uncacheable(&self) {
        lock(&self.stats).skip();
    }

    /// Write the manifest to disk (no-op for memory-only caches).
    pub fn flush(&self) -> Result<(), CacheError> {
        if let Some(disk) = &self.disk {
            lock(&disk.manifest).save(&disk.dir)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        lock(&self.stats).clone()
    }

    /// Reset the per-run counters.
    pub fn reset_stats(&self) {
        *lock(&self.stats) = CacheStats::default();
    }
}

impl fmt::Debug for PhaseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseCache")
            .field("dir", &self.dir())
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn doc(name: &str, body: &str) -> Document {
        Document::create(
            Metadata::new().with("name", name),
            Some(Content::from_string(body)),
        )
        .derive()
        .source(format!("{name}.md"))
        .destination(format!("{name}.html"))
        .build()
        .unwrap()
    }

    // =========================================================================
    // CacheManifest basics
    // =========================================================================

    #[test]
    fn empty_manifest_has_no_entries() {
        let m = CacheManifest::empty();
        assert_eq!(m.version, MANIFEST_VERSION);
        assert!(m.is_empty());
        assert!(m.phase_index.is_empty());
    }

    #[test]
    fn insert_evicts_previous_key_for_same_phase() {
        let mut m = CacheManifest::empty();
        let entry = |p: &str| CacheEntry {
            pipeline: p.into(),
            phase: Phase::Process,
            documents: Vec::new(),
        };
        m.insert("k1".into(), entry("posts"));
        m.insert("k2".into(), entry("Posts"));
        m.insert("k3".into(), entry("pages"));

        assert!(m.get("k1").is_none());
        assert!(m.get("k2").is_some());
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn save_and_load_roundtrip_rebuilds_index() {
        let tmp = TempDir::new().unwrap();
        let mut m = CacheManifest::empty();
        m.insert(
            "k1".into(),
            CacheEntry {
                pipeline: "posts".into(),
                phase: Phase::Output,
                documents: Vec::new(),
            },
        );
        m.save(tmp.path()).unwrap();

        let mut loaded = CacheManifest::load(tmp.path());
        assert!(loaded.get("k1").is_some());
        loaded.insert(
            "k2".into(),
            CacheEntry {
                pipeline: "posts".into(),
                phase: Phase::Output,
                documents: Vec::new(),
            },
        );
        assert!(loaded.get("k1").is_none());
    }

    #[test]
    fn load_corrupt_manifest_returns_empty() {
        let tmp = TempDir::new().unwrap();
        fs::write(manifest_path(tmp.path()), "not json").unwrap();
        assert!(CacheManifest::load(tmp.path()).is_empty());
    }

    #[test]
    fn load_wrong_version_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let json = format!(r#"{{"version": {}, "entries": {{}}}}"#, MANIFEST_VERSION + 99);
        fs::write(manifest_path(tmp.path()), json).unwrap();
        assert!(CacheManifest::load(tmp.path()).is_empty());
    }

    // =========================================================================
    // Keys
    // =========================================================================

    #[test]
    fn phase_key_depends_on_every_input() {
        let key = |version: &str, env: &str, pipeline: &str, phase: Phase, module: &str, input: &str| {
            phase_key(version, env, pipeline, phase, &[module.into()], &[input.into()])
        };
        let base = key("1", "e", "posts", Phase::Process, "m", "a");
        assert_eq!(base, key("1", "e", "POSTS", Phase::Process, "m", "a"));
        assert_ne!(base, key("2", "e", "posts", Phase::Process, "m", "a"));
        assert_ne!(base, key("1", "f", "posts", Phase::Process, "m", "a"));
        assert_ne!(base, key("1", "e", "posts", Phase::Output, "m", "a"));
        assert_ne!(base, key("1", "e", "posts", Phase::Process, "n", "a"));
        assert_ne!(base, key("1", "e", "posts", Phase::Process, "m", "b"));
    }

    #[test]
    fn fingerprint_inputs_none_with_computed_metadata() {
        let mut meta = Metadata::new();
        meta.insert_computed("x", |_, _| Value::Null);
        let docs = vec![doc("a", "1"), Document::create(meta, None)];
        assert_eq!(fingerprint_inputs(&docs).unwrap(), None);
    }

    #[test]
    fn fingerprint_inputs_preserves_order() {
        let docs = vec![doc("a", "1"), doc("b", "2")];
        let fps = fingerprint_inputs(&docs).unwrap().unwrap();
        assert_eq!(fps[0], docs[0].fingerprint().unwrap().unwrap());
        assert_eq!(fps[1], docs[1].fingerprint().unwrap().unwrap());
    }

    // =========================================================================
    // PhaseCache layers
    // =========================================================================

    #[test]
    fn memory_hit_returns_same_content() {
        let cache = PhaseCache::in_memory();
        let docs = vec![doc("a", "alpha")];
        cache.store("posts", Phase::Process, "k", &docs);

        let hit = cache.lookup("posts", Phase::Process, "k").unwrap();
        assert_eq!(hit[0].id(), docs[0].id());
        assert!(hit[0].content().unwrap().same_content(docs[0].content().unwrap()));
        assert!(cache.lookup("posts", Phase::Process, "other").is_none());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn persistent_cache_survives_reload() {
        let tmp = TempDir::new().unwrap();
        {
            let cache = PhaseCache::persistent(tmp.path());
            cache.store("posts", Phase::Output, "k", &[doc("a", "alpha")]);
            cache.flush().unwrap();
        }

        let cache = PhaseCache::persistent(tmp.path());
        let restored = cache.lookup("posts", Phase::Output, "k").unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].source(), Some(Path::new("a.md")));
        assert_eq!(restored[0].destination(), Some(Path::new("a.html")));
        assert_eq!(restored[0].read_string().unwrap(), "alpha");
        assert_eq!(
            restored[0].metadata().literal("name"),
            Some(&Value::String("a".into()))
        );
    }

    #[test]
    fn persistent_cache_keeps_clone_groups() {
        let tmp = TempDir::new().unwrap();
        let base = doc("same", "body");
        let a = base.derive().destination("a.html").build().unwrap();
        let b = base.derive().destination("b.html").build().unwrap();
        let other = doc("other", "x");
        {
            let cache = PhaseCache::persistent(tmp.path());
            cache.store("site", Phase::Input, "k", &[a, other, b]);
            cache.flush().unwrap();
        }

        let cache = PhaseCache::persistent(tmp.path());
        let restored = cache.lookup("site", Phase::Input, "k").unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored[0].id(), restored[2].id());
        assert_ne!(restored[0].id(), restored[1].id());
        assert_eq!(restored[2].destination(), Some(Path::new("b.html")));
    }

    #[test]
    fn missing_blob_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        {
            let cache = PhaseCache::persistent(tmp.path());
            cache.store("posts", Phase::Output, "k", &[doc("a", "alpha")]);
            cache.flush().unwrap();
        }
        fs::remove_dir_all(tmp.path().join(BLOB_DIR)).unwrap();

        let cache = PhaseCache::persistent(tmp.path());
        assert!(cache.lookup("posts", Phase::Output, "k").is_none());
    }

    #[test]
    fn stats_display() {
        let mut s = CacheStats::default();
        s.miss();
        s.skip();
        assert_eq!(s.to_string(), "2 executed");
        s.hit();
        assert_eq!(s.to_string(), "1 cached, 2 executed (3 total)");
    }
}
