//! Immutable documents with copy-on-write cloning.
//!
//! A [`Document`] is never mutated after construction. Every transformation
//! produces a new document: [`Document::clone_with`] (the low-level contract)
//! or [`Document::derive`] (a builder over the same semantics).
//!
//! ## Clone semantics
//!
//! - The [`DocumentId`] is preserved. Identity survives any number of clones.
//! - Metadata deltas are merged over the existing entries: new keys are
//!   added, existing keys overwritten, no key is ever removed.
//! - Content is inherited unless replaced. [`ContentUpdate::Inherit`] takes
//!   another lease on the same content cell; [`NULL_CONTENT`] clears it.
//! - `Source` is set-once. Setting it again to the same path is a no-op;
//!   setting a different path fails with [`DocumentError::ImmutableSource`].
//!
//! Dropping a document releases its content lease. There is no separate
//! dispose call: the owning collection's lifetime is the document's lifetime.

use crate::content::{Content, ContentError, ContentRef};
use crate::fs::FileSystem;
use crate::metadata::{Metadata, MetaValue, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("document {id} already has source {existing}, cannot change it to {attempted}")]
    ImmutableSource {
        id: DocumentId,
        existing: PathBuf,
        attempted: PathBuf,
    },
}

/// Stable identity of a document across all of its clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Uuid);

impl DocumentId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// How a clone treats the source document's content.
#[derive(Debug, Clone, Default)]
pub enum ContentUpdate {
    /// Share the existing content (another lease on the same cell).
    #[default]
    Inherit,
    /// Explicitly drop content on the clone.
    Clear,
    /// Use new content.
    Replace(Content),
}

/// Sentinel for "clear content on clone", distinct from "not specified".
pub const NULL_CONTENT: ContentUpdate = ContentUpdate::Clear;

impl From<Content> for ContentUpdate {
    fn from(c: Content) -> Self {
        ContentUpdate::Replace(c)
    }
}

impl From<Option<Content>> for ContentUpdate {
    fn from(c: Option<Content>) -> Self {
        c.map_or(ContentUpdate::Inherit, ContentUpdate::Replace)
    }
}

/// An immutable record of metadata, paths, and a content lease.
#[derive(Clone)]
pub struct Document {
    id: DocumentId,
    source: Option<PathBuf>,
    destination: Option<PathBuf>,
    metadata: Metadata,
    content: Option<Content>,
}

impl Document {
    /// An empty document with a fresh identity.
    pub fn new() -> Self {
        Self::create(Metadata::new(), None)
    }

    pub fn create(metadata: Metadata, content: Option<Content>) -> Self {
        Self {
            id: DocumentId::new(),
            source: None,
            destination: None,
            metadata,
            content,
        }
    }

    /// A document for an input file: source and destination are both the
    /// file's logical path, content reads through the file system.
    pub fn from_file(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            id: DocumentId::new(),
            source: Some(path.clone()),
            destination: Some(path.clone()),
            metadata: Metadata::new(),
            content: Some(Content::from_file(fs, path)),
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Same document, carrying `other`'s identity. Used to rebuild clone
    /// groups when restoring cached outputs.
    pub(crate) fn with_identity_of(mut self, other: &Document) -> Self {
        self.id = other.id;
        self
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn content(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    /// Observer handle on this document's content cell.
    pub fn content_ref(&self) -> Option<ContentRef> {
        self.content.as_ref().map(Content::observe)
    }

    /// Content as UTF-8, empty when the document has none.
    pub fn read_string(&self) -> Result<String, ContentError> {
        match &self.content {
            Some(c) => c.read_to_string(),
            None => Ok(String::new()),
        }
    }

    /// Clone preserving identity, merging `delta` and applying `content`.
    pub fn clone_with(&self, delta: Option<&Metadata>, content: ContentUpdate) -> Document {
        let mut metadata = self.metadata.clone();
        if let Some(delta) = delta {
            metadata.merge(delta);
        }
        let content = match content {
            ContentUpdate::Inherit => self.content.clone(),
            ContentUpdate::Clear => None,
            ContentUpdate::Replace(c) => Some(c),
        };
        Document {
            id: self.id,
            source: self.source.clone(),
            destination: self.destination.clone(),
            metadata,
            content,
        }
    }

    /// Start a clone with several changes.
    pub fn derive(&self) -> DocumentBuilder<'_> {
        DocumentBuilder {
            base: self,
            delta: Metadata::new(),
            content: ContentUpdate::Inherit,
            source: None,
            destination: None,
        }
    }

    /// Safe identity for logs and error messages: the source path, then the
    /// destination, then the id.
    pub fn display_name(&self) -> String {
        match (&self.source, &self.destination) {
            (Some(src), _) => src.display().to_string(),
            (None, Some(dest)) => format!("<{}> (destination {})", self.id, dest.display()),
            (None, None) => format!("<{}>", self.id),
        }
    }

    /// SHA-256 over paths, literal metadata, and content hash.
    ///
    /// `Ok(None)` when the document carries computed metadata, which has no
    /// stable fingerprint outside an execution context.
    pub fn fingerprint(&self) -> Result<Option<String>, ContentError> {
        let Some(literals) = self.metadata.to_literals() else {
            return Ok(None);
        };
        let mut hasher = Sha256::new();
        hasher.update(b"document\0");
        for path in [&self.source, &self.destination] {
            match path {
                Some(p) => {
                    hasher.update(b"\x01");
                    hasher.update(p.to_string_lossy().as_bytes());
                    hasher.update(b"\0");
                }
                None => hasher.update(b"\x00"),
            }
        }
        for (key, value) in &literals {
            hasher.update(key.as_bytes());
            hasher.update(b"\0");
            hasher.update(serde_json::to_string(value).unwrap_or_default().as_bytes());
            hasher.update(b"\0");
        }
        match &self.content {
            Some(c) => {
                hasher.update(b"\x01");
                hasher.update(c.content_hash()?.as_bytes());
            }
            None => hasher.update(b"\x00"),
        }
        Ok(Some(format!("{:x}", hasher.finalize())))
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id.to_string())
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("metadata_keys", &self.metadata.keys().collect::<Vec<_>>())
            .field("has_content", &self.content.is_some())
            .finish()
    }
}

/// Accumulates changes for a clone. See [`Document::derive`].
pub struct DocumentBuilder<'a> {
    base: &'a Document,
    delta: Metadata,
    content: ContentUpdate,
    source: Option<PathBuf>,
    destination: Option<PathBuf>,
}

impl DocumentBuilder<'_> {
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.delta.insert(key, value);
        self
    }

    pub fn meta_value(mut self, key: impl Into<String>, value: MetaValue) -> Self {
        self.delta.set(key, value);
        self
    }

    pub fn merge(mut self, delta: &Metadata) -> Self {
        self.delta.merge(delta);
        self
    }

    pub fn content(mut self, content: impl Into<ContentUpdate>) -> Self {
        self.content = content.into();
        self
    }

    pub fn source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Document, DocumentError> {
        let mut doc = self.base.clone_with(Some(&self.delta), self.content);
        if let Some(attempted) = self.source {
            match &doc.source {
                Some(existing) if *existing != attempted => {
                    return Err(DocumentError::ImmutableSource {
                        id: doc.id,
                        existing: existing.clone(),
                        attempted,
                    });
                }
                Some(_) => {}
                None => doc.source = Some(attempted),
            }
        }
        if let Some(dest) = self.destination {
            doc.destination = Some(dest);
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;

    // =========================================================================
    // Identity and metadata merging
    // =========================================================================

    #[test]
    fn clone_preserves_id_and_merges_metadata() {
        let doc = Document::create(Metadata::new().with("title", "A").with("n", 1), None);
        let delta = Metadata::new().with("n", 2).with("extra", true);
        let clone = doc.clone_with(Some(&delta), ContentUpdate::Inherit);

        assert_eq!(clone.id(), doc.id());
        assert_eq!(clone.metadata().literal("title"), Some(&Value::from("A")));
        assert_eq!(clone.metadata().literal("n"), Some(&Value::Int(2)));
        assert_eq!(clone.metadata().literal("extra"), Some(&Value::Bool(true)));
        // Original untouched
        assert_eq!(doc.metadata().literal("n"), Some(&Value::Int(1)));
        assert!(!doc.metadata().contains_key("extra"));
    }

    #[test]
    fn create_assigns_fresh_ids() {
        assert_ne!(Document::new().id(), Document::new().id());
    }

    // =========================================================================
    // Content inheritance
    // =========================================================================

    #[test]
    fn inherit_shares_content_and_takes_lease() {
        let doc = Document::create(Metadata::new(), Some(Content::from_string("body")));
        let clone = doc.clone_with(None, ContentUpdate::Inherit);
        assert!(clone
            .content()
            .unwrap()
            .same_content(doc.content().unwrap()));
        assert_eq!(doc.content().unwrap().lease_count(), 2);
    }

    #[test]
    fn null_content_clears_instead_of_inheriting() {
        let doc = Document::create(Metadata::new(), Some(Content::from_string("body")));
        let cleared = doc.clone_with(None, NULL_CONTENT);
        assert!(!cleared.has_content());
        assert_eq!(cleared.read_string().unwrap(), "");
        assert!(doc.has_content());
    }

    #[test]
    fn replace_swaps_content() {
        let doc = Document::create(Metadata::new(), Some(Content::from_string("old")));
        let replaced = doc.clone_with(None, Content::from_string("new").into());
        assert_eq!(replaced.read_string().unwrap(), "new");
        assert_eq!(doc.read_string().unwrap(), "old");
    }

    #[test]
    fn dropping_all_sharing_documents_disposes_content() {
        let doc = Document::create(Metadata::new(), Some(Content::from_string("shared")));
        let observer = doc.content_ref().unwrap();
        let clones: Vec<Document> = (0..3).map(|_| doc.clone_with(None, ContentUpdate::Inherit)).collect();
        drop(doc);

        let mut clones = clones;
        clones.truncate(1);
        assert!(observer.open().is_ok());
        drop(clones);
        assert!(matches!(observer.open(), Err(ContentError::Disposed)));
    }

    // =========================================================================
    // Source immutability
    // =========================================================================

    #[test]
    fn source_can_be_set_once() {
        let doc = Document::new().derive().source("a.md").build().unwrap();
        assert_eq!(doc.source(), Some(Path::new("a.md")));
    }

    #[test]
    fn setting_same_source_again_is_ignored() {
        let doc = Document::new().derive().source("a.md").build().unwrap();
        let again = doc.derive().source("a.md").build().unwrap();
        assert_eq!(again.source(), Some(Path::new("a.md")));
        assert_eq!(again.id(), doc.id());
    }

    #[test]
    fn changing_source_is_rejected() {
        let doc = Document::new().derive().source("a.md").build().unwrap();
        let err = doc.derive().source("b.md").build().unwrap_err();
        assert!(matches!(err, DocumentError::ImmutableSource { .. }));
    }

    #[test]
    fn destination_can_change_freely() {
        let doc = Document::new().derive().destination("a.html").build().unwrap();
        let moved = doc.derive().destination("b/index.html").build().unwrap();
        assert_eq!(moved.destination(), Some(Path::new("b/index.html")));
    }

    #[test]
    fn from_file_sets_paths_and_content() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.add_input("posts/a.md", "# A");
        let doc = Document::from_file(fs, "posts/a.md");
        assert_eq!(doc.source(), Some(Path::new("posts/a.md")));
        assert_eq!(doc.destination(), Some(Path::new("posts/a.md")));
        assert_eq!(doc.read_string().unwrap(), "# A");
        assert_eq!(doc.display_name(), "posts/a.md");
    }

    // =========================================================================
    // Fingerprints
    // =========================================================================

    #[test]
    fn fingerprint_ignores_identity_but_tracks_content() {
        let a = Document::create(Metadata::new().with("k", 1), Some(Content::from_string("x")));
        let b = Document::create(Metadata::new().with("k", 1), Some(Content::from_string("x")));
        let c = Document::create(Metadata::new().with("k", 1), Some(Content::from_string("y")));
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
    }

    #[test]
    fn fingerprint_is_none_with_computed_metadata() {
        let mut m = Metadata::new();
        m.insert_computed("now", |_, _| Value::Int(0));
        let doc = Document::create(m, None);
        assert!(doc.fingerprint().unwrap().is_none());
    }
}
