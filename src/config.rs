//! Project configuration.
//!
//! A project is described by one `quire.toml`. User values are layered over
//! stock defaults (table merge), deserialized with unknown keys rejected,
//! and validated.
//!
//! ## Configuration Options
//!
//! ```toml
//! [paths]
//! input = "input"          # Relative to the directory holding quire.toml
//! output = "output"
//! cache = ".quire-cache"
//!
//! [engine]
//! max_concurrency = 4      # Concurrently running phases (omit for unbounded)
//! document_concurrency = 8 # Documents in flight for parallel-safe modules
//! cache = true             # Persistent phase cache
//! parse_strings = true     # Metadata strings convert to numbers/bools/lists
//! max_threads = 4          # Hashing workers (omit for auto = CPU cores)
//!
//! [settings]
//! site_title = "Notes"     # Global metadata, read after document metadata
//!
//! [[pipelines]]
//! name = "posts"
//! input = [{ module = "ReadFiles", dir = "posts", extensions = ["md"] }]
//! process = [{ module = "SetDestination", extension = "html" }]
//! output = [{ module = "WriteFiles" }]
//!
//! [[pipelines]]
//! name = "index"
//! dependencies = ["posts"]
//! ```
//!
//! A dependency is either a pipeline name (waits for its Output phase) or a
//! table `{ pipeline = "posts", phase = "process" }`. Module entries take
//! `module` plus that module's parameters.

use crate::context::Services;
use crate::engine::{CacheMode, EngineConfig};
use crate::fs::LocalFileSystem;
use crate::metadata::{Converters, Metadata, Settings};
use crate::pipeline::{Phase, Pipeline, PipelineError, Pipelines};
use crate::registry::{ModuleRegistry, RegistryError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const CONFIG_FILENAME: &str = "quire.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
    #[error("pipeline {pipeline}: {source}")]
    Registry {
        pipeline: String,
        source: RegistryError,
    },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Contents of `quire.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub paths: PathsConfig,
    pub engine: EngineSection,
    /// Free-form global metadata.
    pub settings: toml::Table,
    pub pipelines: Vec<PipelineConfig>,
    /// Directory relative paths resolve against. Set by [`load_config`].
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub cache: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("input"),
            output: PathBuf::from("output"),
            cache: PathBuf::from(".quire-cache"),
        }
    }
}

/// The `[engine]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    /// Concurrently running phases. `None` is unbounded.
    pub max_concurrency: Option<usize>,
    pub document_concurrency: usize,
    pub cache: bool,
    /// Register the structured string parser with the converter chain.
    pub parse_strings: bool,
    /// Hashing workers. When absent, the number of CPU cores; larger values
    /// are clamped down.
    pub max_threads: Option<usize>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            document_concurrency: crate::context::DEFAULT_DOCUMENT_CONCURRENCY,
            cache: true,
            parse_strings: true,
            max_threads: None,
        }
    }
}

/// One `[[pipelines]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub input: Vec<ModuleConfig>,
    #[serde(default)]
    pub process: Vec<ModuleConfig>,
    #[serde(default)]
    pub post_process: Vec<ModuleConfig>,
    #[serde(default)]
    pub output: Vec<ModuleConfig>,
}

impl PipelineConfig {
    pub fn modules(&self, phase: Phase) -> &[ModuleConfig] {
        match phase {
            Phase::Input => &self.input,
            Phase::Process => &self.process,
            Phase::PostProcess => &self.post_process,
            Phase::Output => &self.output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyConfig {
    Pipeline(String),
    Phase { pipeline: String, phase: Phase },
}

/// `{ module = "Name", ...params }`. Parameters are checked by the module's
/// factory, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub module: String,
    #[serde(flatten)]
    pub params: toml::Table,
}

impl ProjectConfig {
    /// Validate values the types can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.document_concurrency == 0 {
            return Err(ConfigError::Validation(
                "engine.document_concurrency must be at least 1".into(),
            ));
        }
        if self.engine.max_concurrency == Some(0) {
            return Err(ConfigError::Validation(
                "engine.max_concurrency must be at least 1 (omit for unbounded)".into(),
            ));
        }
        if self.engine.max_threads == Some(0) {
            return Err(ConfigError::Validation(
                "engine.max_threads must be at least 1 (omit for auto)".into(),
            ));
        }
        for pipeline in &self.pipelines {
            if pipeline.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "pipelines.name must not be empty".into(),
                ));
            }
            let empty = Phase::ALL.iter().all(|p| pipeline.modules(*p).is_empty());
            if empty && pipeline.dependencies.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "pipeline {} has no modules and no dependencies",
                    pipeline.name
                )));
            }
        }
        Ok(())
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join(&self.paths.input)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(&self.paths.output)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(&self.paths.cache)
    }

    /// Instantiate every configured pipeline through `registry`.
    pub fn build_pipelines(&self, registry: &ModuleRegistry) -> Result<Pipelines, ConfigError> {
        let mut pipelines = Pipelines::new();
        for pc in &self.pipelines {
            let mut pipeline = Pipeline::new(pc.name.as_str());
            for phase in Phase::ALL {
                for mc in pc.modules(phase) {
                    let module = registry.create(&mc.module, &mc.params).map_err(|source| {
                        ConfigError::Registry {
                            pipeline: pc.name.clone(),
                            source,
                        }
                    })?;
                    pipeline = pipeline.with_shared_module(phase, module);
                }
            }
            for dep in &pc.dependencies {
                pipeline = match dep {
                    DependencyConfig::Pipeline(name) => pipeline.depends_on(name.as_str()),
                    DependencyConfig::Phase { pipeline: name, phase } => {
                        pipeline.depends_on_phase(name.as_str(), *phase)
                    }
                };
            }
            if pc.isolated {
                pipeline = pipeline.isolated();
            }
            if pc.no_cache {
                pipeline = pipeline.no_cache();
            }
            pipelines.add(pipeline)?;
        }
        pipelines.validate()?;
        Ok(pipelines)
    }

    /// The `[settings]` table as the global metadata layer.
    pub fn settings(&self) -> Settings {
        Settings::new(self.settings.clone().into_iter().collect::<Metadata>())
    }

    /// Engine services over the configured input and output directories.
    pub fn services(&self) -> Services {
        let converters = if self.engine.parse_strings {
            Converters::standard()
        } else {
            Converters::strict()
        };
        Services::new(Arc::new(LocalFileSystem::new(
            self.input_dir(),
            self.output_dir(),
        )))
        .with_settings(self.settings())
        .with_converters(converters)
        .with_document_concurrency(self.engine.document_concurrency)
    }

    /// Engine settings. `no_cache` (the CLI flag) overrides `engine.cache`.
    pub fn engine_config(&self, version: &str, no_cache: bool) -> EngineConfig {
        let cache = if no_cache || !self.engine.cache {
            CacheMode::Disabled
        } else {
            CacheMode::Persistent(self.cache_dir())
        };
        EngineConfig {
            max_concurrency: self.engine.max_concurrency,
            cache,
            version: version.to_string(),
        }
    }
}

/// Resolve the effective hashing thread count.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(engine: &EngineSection) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    engine.max_threads.map(|n| n.min(cores)).unwrap_or(cores)
}

/// The stock defaults as a `toml::Value::Table`, the base layer for merging.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(ProjectConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely, so a user
///   `[[pipelines]]` list replaces the (empty) stock list.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file as raw TOML. `Ok(None)` when the file doesn't exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto the stock defaults, deserialize, validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<ProjectConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: ProjectConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load `path` (a `quire.toml`), resolving relative paths against its
/// directory. A missing file yields the stock defaults.
pub fn load_config(path: &Path) -> Result<ProjectConfig, ConfigError> {
    let mut config = resolve_config(load_raw_config(path)?)?;
    config.root = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(config)
}

/// A fully-commented stock `quire.toml`, printed by `gen-config`.
pub fn stock_config_toml() -> &'static str {
    r##"# Quire Configuration
# ===================
# Values shown below are the defaults. Relative paths resolve against the
# directory holding this file.

[paths]
# Files read by ReadFiles.
input = "input"
# Files written by WriteFiles.
output = "output"
# Persistent phase cache (manifest plus content blobs).
cache = ".quire-cache"

[engine]
# Maximum phases running at once, across all pipelines.
# Omit for unbounded.
# max_concurrency = 4

# Documents in flight at once inside a parallel-safe module.
document_concurrency = 8

# Reuse unchanged phase outputs across runs. `quire build --no-cache`
# overrides this for one run.
cache = true

# Let metadata strings convert to numbers, booleans, and lists on read
# ("42" reads as 42). When false, only exact types convert.
parse_strings = true

# Worker threads used to fingerprint documents for the cache.
# Omit for auto (= number of CPU cores). Larger values are clamped down.
# max_threads = 4

# ---------------------------------------------------------------------------
# Global metadata, consulted when a document doesn't carry a key.
# ---------------------------------------------------------------------------
[settings]
# site_title = "My Site"

# ---------------------------------------------------------------------------
# Pipelines. Each runs Input -> Process -> PostProcess -> Output; each phase
# is a list of modules `{ module = "<name>", ...parameters }`.
#
# Built-in modules:
#   ReadFiles      { dir = "", extensions = [] }   one document per file
#   WriteFiles     {}                              write to destinations
#   SetMetadata    { key, value }
#   SetDestination { extension } or { key }
#   SetContent     { text }                        "{{key}}" substitution
#   Filter         { key, negate = false }
#   OrderBy        { key, descending = false }
#   ConcatOutputs  { pipelines = [] }              append dependency outputs
#
# Dependencies: a pipeline name (wait for its Output phase and start from
# its documents), or { pipeline = "...", phase = "process" }. Set
# `isolated = true` to wait without inheriting documents, and
# `no_cache = true` to always execute.
# ---------------------------------------------------------------------------

# [[pipelines]]
# name = "pages"
# input = [{ module = "ReadFiles", dir = "pages", extensions = ["html"] }]
# output = [{ module = "WriteFiles" }]
"##
}
