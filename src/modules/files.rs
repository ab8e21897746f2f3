//! Reading input files and writing output files.

use crate::context::ExecutionContext;
use crate::document::{ContentUpdate, Document};
use crate::metadata::Metadata;
use crate::module::{DocumentModule, Module, ModuleError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Emit one document per input file under `dir`.
///
/// Each document's source is the file's logical path and its destination
/// starts out as the same path. Content is read lazily through the file
/// system on first access. Incoming documents are replaced, not passed
/// through.
///
/// Never cacheable: the module reads outside its input documents.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadFiles {
    /// Directory relative to the input root; empty means the root itself.
    pub dir: PathBuf,
    /// Case-insensitive extensions without the dot; empty means all files.
    pub extensions: Vec<String>,
}

impl ReadFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extensions: Vec::new(),
        }
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|e| e.to_string()).collect();
        self
    }

    fn accepts(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.extensions
            .iter()
            .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// Path-derived metadata every read document carries.
fn path_metadata(path: &Path) -> Metadata {
    let text = |s: Option<&std::ffi::OsStr>| {
        s.map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    Metadata::new()
        .with("relative_path", path.to_string_lossy().replace('\\', "/"))
        .with("file_name", text(path.file_name()))
        .with("file_stem", text(path.file_stem()))
        .with("extension", text(path.extension()))
}

#[async_trait]
impl Module for ReadFiles {
    fn name(&self) -> &str {
        "ReadFiles"
    }

    async fn execute(
        &self,
        _inputs: Vec<Document>,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        ctx.check_cancelled()?;
        let fs = ctx.fs().clone();
        let dir = self.dir.clone();
        let paths = tokio::task::spawn_blocking(move || fs.list_files(&dir))
            .await
            .map_err(|e| ModuleError::failed(format!("listing files: {e}")))??;

        let docs: Vec<Document> = paths
            .into_iter()
            .filter(|p| self.accepts(p))
            .map(|path| {
                let meta = path_metadata(&path);
                Document::from_file(ctx.fs().clone(), path)
                    .clone_with(Some(&meta), ContentUpdate::Inherit)
            })
            .collect();
        debug!(dir = %self.dir.display(), files = docs.len(), "read files");
        Ok(docs)
    }
}

/// Write each document's content to its destination, in arrival order.
///
/// Documents without a destination pass through unwritten; documents
/// without content produce empty files. Outputs are the inputs, unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFiles {}

impl WriteFiles {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl DocumentModule for WriteFiles {
    fn name(&self) -> &str {
        "WriteFiles"
    }

    async fn process(
        &self,
        doc: Document,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        let Some(destination) = doc.destination().map(Path::to_path_buf) else {
            return Ok(vec![doc]);
        };
        ctx.check_cancelled()?;

        let fs = ctx.fs().clone();
        let content = doc.content().cloned();
        let target = destination.clone();
        let written = tokio::task::spawn_blocking(move || -> Result<u64, ModuleError> {
            let mut reader: Box<dyn std::io::Read + Send> = match &content {
                Some(c) => c.open()?,
                None => Box::new(std::io::empty()),
            };
            Ok(fs.write(&target, &mut reader)?)
        })
        .await
        .map_err(|e| ModuleError::failed(format!("writing file: {e}")))??;

        debug!(destination = %destination.display(), bytes = written, "wrote file");
        Ok(vec![doc])
    }
}
