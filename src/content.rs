//! Reference-counted, re-readable document content.
//!
//! A document does not own bytes. It holds a [`Content`] *lease* on a shared
//! content cell, and every clone of the document that keeps its content holds
//! another lease on the same cell. The cell keeps an explicit atomic lease
//! count; when the last lease is dropped the underlying [`ContentSource`]
//! (buffer, file handle, spool file) is released and any later
//! [`ContentRef::open`] fails with [`ContentError::Disposed`].
//!
//! ```text
//!  doc A ──lease──┐
//!  doc A' ─lease──┼──► ContentCell { leases: 3, source: Some(..) }
//!  doc A''─lease──┘
//! ```
//!
//! [`ContentRef`] is a non-owning observer. It keeps the cell alive but not
//! the source, which is what lets callers assert disposal happened.
//!
//! Every source is re-readable: [`ContentSource::open`] always returns a
//! fresh reader positioned at the start, never a consumed stream.

use crate::fs::{FileSystem, FsError};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("content has been disposed")]
    Disposed,
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("content is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A byte-producing source that can be read from the start any number of times.
pub trait ContentSource: Send + Sync + fmt::Debug {
    /// Open a fresh reader at offset zero.
    fn open(&self) -> Result<Box<dyn Read + Send>, ContentError>;

    /// Length in bytes when cheaply known.
    fn len_hint(&self) -> Option<u64> {
        None
    }
}

struct ContentCell {
    leases: AtomicUsize,
    source: RwLock<Option<Arc<dyn ContentSource>>>,
    hash: OnceLock<String>,
}

impl ContentCell {
    fn source(&self) -> Result<Arc<dyn ContentSource>, ContentError> {
        self.source
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ContentError::Disposed)
    }

    fn open(&self) -> Result<Box<dyn Read + Send>, ContentError> {
        self.source()?.open()
    }
}

/// An owning lease on shared content.
///
/// Cloning takes another lease; dropping releases one. The source itself
/// is dropped when the lease count reaches zero.
pub struct Content {
    cell: Arc<ContentCell>,
}

impl Content {
    pub fn new(source: impl ContentSource + 'static) -> Self {
        Self {
            cell: Arc::new(ContentCell {
                leases: AtomicUsize::new(1),
                source: RwLock::new(Some(Arc::new(source))),
                hash: OnceLock::new(),
            }),
        }
    }

    /// In-memory content.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(MemoryContent::new(bytes))
    }

    /// In-memory UTF-8 content.
    pub fn from_string(text: impl Into<String>) -> Self {
        Self::from_bytes(Bytes::from(text.into()))
    }

    /// Content backed by an input file, re-opened through the file system on every read.
    pub fn from_file(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self::new(FileContent::new(fs, path))
    }

    /// Drain a one-shot reader into a spool file so it becomes re-readable.
    pub fn spool(reader: &mut dyn Read) -> Result<Self, ContentError> {
        Ok(Self::new(SpooledContent::from_reader(reader)?))
    }

    /// Open a reader at the start of the content.
    pub fn open(&self) -> Result<Box<dyn Read + Send>, ContentError> {
        self.cell.open()
    }

    pub fn read_to_bytes(&self) -> Result<Vec<u8>, ContentError> {
        let mut buf = Vec::new();
        self.open()?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn read_to_string(&self) -> Result<String, ContentError> {
        Ok(String::from_utf8(self.read_to_bytes()?)?)
    }

    /// SHA-256 of the full content as lowercase hex. Computed once per cell.
    pub fn content_hash(&self) -> Result<String, ContentError> {
        if let Some(hash) = self.cell.hash.get() {
            return Ok(hash.clone());
        }
        let mut reader = self.open()?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let hash = format!("{:x}", hasher.finalize());
        Ok(self.cell.hash.get_or_init(|| hash).clone())
    }

    pub fn len_hint(&self) -> Option<u64> {
        self.cell.source().ok().and_then(|s| s.len_hint())
    }

    /// A non-owning handle to the same cell.
    pub fn observe(&self) -> ContentRef {
        ContentRef {
            cell: Arc::clone(&self.cell),
        }
    }

    /// Number of live leases on this content.
    pub fn lease_count(&self) -> usize {
        self.cell.leases.load(Ordering::Acquire)
    }

    /// Whether two leases point at the same content cell.
    pub fn same_content(&self, other: &Content) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Clone for Content {
    fn clone(&self) -> Self {
        self.cell.leases.fetch_add(1, Ordering::AcqRel);
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl Drop for Content {
    fn drop(&mut self) {
        if self.cell.leases.fetch_sub(1, Ordering::AcqRel) == 1 {
            let released = self
                .cell
                .source
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            drop(released);
        }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Content")
            .field("leases", &self.lease_count())
            .finish()
    }
}

/// Non-owning observer of a content cell.
#[derive(Clone)]
pub struct ContentRef {
    cell: Arc<ContentCell>,
}

impl ContentRef {
    /// Open the content, failing with [`ContentError::Disposed`] once every lease is gone.
    pub fn open(&self) -> Result<Box<dyn Read + Send>, ContentError> {
        self.cell.open()
    }

    pub fn is_disposed(&self) -> bool {
        self.cell
            .source
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    pub fn lease_count(&self) -> usize {
        self.cell.leases.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentRef")
            .field("leases", &self.lease_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ============================================================================
// Sources
// ============================================================================

/// Bytes held in memory, shared without copying.
#[derive(Debug, Clone)]
pub struct MemoryContent {
    bytes: Bytes,
}

impl MemoryContent {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl ContentSource for MemoryContent {
    fn open(&self) -> Result<Box<dyn Read + Send>, ContentError> {
        Ok(Box::new(io::Cursor::new(self.bytes.clone())))
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.bytes.len() as u64)
    }
}

/// An input file, opened through the [`FileSystem`] collaborator on demand.
#[derive(Debug)]
pub struct FileContent {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl FileContent {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ContentSource for FileContent {
    fn open(&self) -> Result<Box<dyn Read + Send>, ContentError> {
        Ok(self.fs.open_read(&self.path)?)
    }
}

/// A one-shot stream drained into an anonymous spool file.
///
/// Each `open` re-opens the spool file with its own offset, so concurrent
/// readers never disturb each other. The spool file is deleted with the source.
#[derive(Debug)]
pub struct SpooledContent {
    file: tempfile::NamedTempFile,
    len: u64,
}

impl SpooledContent {
    pub fn from_reader(reader: &mut dyn Read) -> Result<Self, ContentError> {
        let mut file = tempfile::NamedTempFile::new()?;
        let len = io::copy(reader, &mut file)?;
        Ok(Self { file, len })
    }
}

impl ContentSource for SpooledContent {
    fn open(&self) -> Result<Box<dyn Read + Send>, ContentError> {
        Ok(Box::new(self.file.reopen()?))
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.len)
    }
}
