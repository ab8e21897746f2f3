//! File system collaborator consumed by content providers and file modules.
//!
//! The engine never touches OS paths directly. Everything goes through the
//! [`FileSystem`] trait using *logical* paths: relative, forward-only paths
//! resolved against an input root (reads) or an output root (writes).
//!
//! Two implementations ship with the crate:
//!
//! - [`LocalFileSystem`]: real directories. Enumeration uses `walkdir`;
//!   writes go to a temp file in the destination directory and are renamed
//!   into place, so a reader never observes a half-written output file.
//! - [`MemoryFileSystem`]: maps of path → bytes behind a lock. Used by the
//!   test suite and by hosts that want to run pipelines without disk I/O.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("path escapes its root or is absolute: {0}")]
    InvalidPath(PathBuf),
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            FsError::NotFound(path.to_path_buf())
        } else {
            FsError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Capabilities the engine needs from a file system.
///
/// Read-side paths are relative to the input root, write-side paths to the
/// output root. Implementations must be shareable across phases running on
/// different worker threads.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Whether an input file exists.
    fn exists(&self, path: &Path) -> bool;

    /// Open an input file for reading from the start.
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>, FsError>;

    /// All input files under `dir`, recursively, as sorted logical paths.
    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, FsError>;

    /// Write `reader` to an output file, creating parent directories.
    ///
    /// The write is atomic from the point of view of other readers: the
    /// destination either keeps its old content or holds the full new one.
    fn write(&self, path: &Path, reader: &mut dyn Read) -> Result<u64, FsError>;
}

/// Normalize a logical path: strip `.` components, reject absolute paths
/// and any `..` component.
pub fn logical_path(path: &Path) -> Result<PathBuf, FsError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FsError::InvalidPath(path.to_path_buf()));
            }
        }
    }
    Ok(out)
}

// ============================================================================
// Local directories
// ============================================================================

/// A file system rooted at two real directories.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    input_root: PathBuf,
    output_root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
        }
    }

    pub fn input_root(&self) -> &Path {
        &self.input_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }
}

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        logical_path(path)
            .map(|p| self.input_root.join(p).is_file())
            .unwrap_or(false)
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>, FsError> {
        let full = self.input_root.join(logical_path(path)?);
        let file = std::fs::File::open(&full).map_err(|e| FsError::io(path, e))?;
        Ok(Box::new(file))
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, FsError> {
        let start = self.input_root.join(logical_path(dir)?);
        if !start.is_dir() {
            return Err(FsError::NotFound(dir.to_path_buf()));
        }
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&start).sort_by_file_name() {
            let entry = entry.map_err(|e| FsError::Io {
                path: dir.to_path_buf(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            // Entries always live under input_root, strip_prefix cannot fail.
            if let Ok(relative) = entry.path().strip_prefix(&self.input_root) {
                files.push(relative.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    fn write(&self, path: &Path, reader: &mut dyn Read) -> Result<u64, FsError> {
        let target = self.output_root.join(logical_path(path)?);
        let parent = target.parent().unwrap_or(&self.output_root).to_path_buf();
        std::fs::create_dir_all(&parent).map_err(|e| FsError::io(path, e))?;

        let mut staged = tempfile::NamedTempFile::new_in(&parent).map_err(|e| FsError::io(path, e))?;
        let written = io::copy(reader, &mut staged).map_err(|e| FsError::io(path, e))?;
        staged
            .persist(&target)
            .map_err(|e| FsError::io(path, e.error))?;
        Ok(written)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// An in-memory file system with separate input and output trees.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    inputs: RwLock<BTreeMap<PathBuf, Bytes>>,
    outputs: RwLock<BTreeMap<PathBuf, Bytes>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an input file. Invalid logical paths are ignored.
    pub fn add_input(&self, path: impl AsRef<Path>, content: impl Into<Bytes>) {
        if let Ok(p) = logical_path(path.as_ref()) {
            self.inputs
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(p, content.into());
        }
    }

    /// Content written to an output path, if any.
    pub fn output(&self, path: impl AsRef<Path>) -> Option<Bytes> {
        let p = logical_path(path.as_ref()).ok()?;
        self.outputs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&p)
            .cloned()
    }

    /// All written output paths, sorted.
    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.outputs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl FileSystem for MemoryFileSystem {
    fn exists(&self, path: &Path) -> bool {
        logical_path(path)
            .map(|p| {
                self.inputs
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains_key(&p)
            })
            .unwrap_or(false)
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>, FsError> {
        let p = logical_path(path)?;
        let bytes = self
            .inputs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&p)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, FsError> {
        let dir = logical_path(dir)?;
        let inputs = self.inputs.read().unwrap_or_else(|e| e.into_inner());
        let files: Vec<PathBuf> = inputs
            .keys()
            .filter(|p| p.starts_with(&dir))
            .cloned()
            .collect();
        if files.is_empty() && !dir.as_os_str().is_empty() {
            return Err(FsError::NotFound(dir));
        }
        Ok(files)
    }

    fn write(&self, path: &Path, reader: &mut dyn Read) -> Result<u64, FsError> {
        let p = logical_path(path)?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .map_err(|e| FsError::io(path, e))?;
        let len = buf.len() as u64;
        self.outputs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(p, Bytes::from(buf));
        Ok(len)
    }
}
