//! Named pipelines: per-phase module lists plus dependency declarations.
//!
//! Every pipeline has the same four phases, run in fixed order:
//!
//! ```text
//! Input → Process → PostProcess → Output
//! ```
//!
//! A phase with no modules passes its seed collection through unchanged.
//!
//! ## Dependencies
//!
//! `b.depends_on("a")` means b's Input phase waits for a's Output phase and,
//! unless b is isolated, starts from a's Output documents. A dependency can
//! name an earlier phase instead ([`Pipeline::depends_on_phase`]) to consume
//! intermediate documents.
//!
//! When several dependencies are declared, the seed is their concatenation
//! in *declaration* order, never in completion order.
//!
//! ## Names
//!
//! Pipeline names are unique case-insensitively: `Posts` and `posts` are
//! the same pipeline for lookups, duplicates, and dependency references.
//! The original spelling is kept for display.

use crate::module::Module;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline name must not be empty")]
    EmptyName,
    #[error("duplicate pipeline name: {0} (names are case-insensitive)")]
    DuplicateName(String),
    #[error("pipeline {pipeline} depends on unknown pipeline {dependency}")]
    UnknownDependency { pipeline: String, dependency: String },
    #[error("pipeline {pipeline} declares dependency {dependency} more than once")]
    DuplicateDependency { pipeline: String, dependency: String },
    #[error("unknown phase: {0} (expected input, process, post_process, or output)")]
    UnknownPhase(String),
}

/// One of the four fixed stages of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Input,
    Process,
    PostProcess,
    Output,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Input, Phase::Process, Phase::PostProcess, Phase::Output];

    pub fn index(self) -> usize {
        match self {
            Phase::Input => 0,
            Phase::Process => 1,
            Phase::PostProcess => 2,
            Phase::Output => 3,
        }
    }

    /// The phase that runs before this one in the same pipeline.
    pub fn previous(self) -> Option<Phase> {
        match self {
            Phase::Input => None,
            Phase::Process => Some(Phase::Input),
            Phase::PostProcess => Some(Phase::Process),
            Phase::Output => Some(Phase::PostProcess),
        }
    }

    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Input => Some(Phase::Process),
            Phase::Process => Some(Phase::PostProcess),
            Phase::PostProcess => Some(Phase::Output),
            Phase::Output => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Input => "Input",
            Phase::Process => "Process",
            Phase::PostProcess => "PostProcess",
            Phase::Output => "Output",
        })
    }
}

impl FromStr for Phase {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "input" => Ok(Phase::Input),
            "process" => Ok(Phase::Process),
            "postprocess" => Ok(Phase::PostProcess),
            "output" => Ok(Phase::Output),
            _ => Err(PipelineError::UnknownPhase(s.to_string())),
        }
    }
}

/// A declared dependency: wait for `phase` of `pipeline`, seed from its documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub pipeline: String,
    pub phase: Phase,
}

/// Case-folded lookup key for a pipeline name.
pub fn pipeline_key(name: &str) -> String {
    name.to_lowercase()
}

/// A named pipeline definition.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    phases: [Vec<Arc<dyn Module>>; 4],
    dependencies: Vec<Dependency>,
    isolated: bool,
    no_cache: bool,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Default::default(),
            dependencies: Vec::new(),
            isolated: false,
            no_cache: false,
        }
    }

    pub fn with_module(mut self, phase: Phase, module: impl Module + 'static) -> Self {
        self.phases[phase.index()].push(Arc::new(module));
        self
    }

    pub fn with_shared_module(mut self, phase: Phase, module: Arc<dyn Module>) -> Self {
        self.phases[phase.index()].push(module);
        self
    }

    pub fn input(self, module: impl Module + 'static) -> Self {
        self.with_module(Phase::Input, module)
    }

    pub fn process(self, module: impl Module + 'static) -> Self {
        self.with_module(Phase::Process, module)
    }

    pub fn post_process(self, module: impl Module + 'static) -> Self {
        self.with_module(Phase::PostProcess, module)
    }

    pub fn output(self, module: impl Module + 'static) -> Self {
        self.with_module(Phase::Output, module)
    }

    /// Depend on another pipeline's Output phase.
    pub fn depends_on(self, pipeline: impl Into<String>) -> Self {
        self.depends_on_phase(pipeline, Phase::Output)
    }

    pub fn depends_on_phase(mut self, pipeline: impl Into<String>, phase: Phase) -> Self {
        self.dependencies.push(Dependency {
            pipeline: pipeline.into(),
            phase,
        });
        self
    }

    /// Isolated pipelines still wait for their dependencies but never
    /// receive dependency documents as their Input seed.
    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    /// Never consult or populate the phase cache for this pipeline.
    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn modules(&self, phase: Phase) -> &[Arc<dyn Module>] {
        &self.phases[phase.index()]
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    pub fn is_no_cache(&self) -> bool {
        self.no_cache
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modules: Vec<Vec<&str>> = self
            .phases
            .iter()
            .map(|ms| ms.iter().map(|m| m.name()).collect())
            .collect();
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("modules", &modules)
            .field("dependencies", &self.dependencies)
            .field("isolated", &self.isolated)
            .field("no_cache", &self.no_cache)
            .finish()
    }
}

/// The set of pipelines an engine runs, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Pipelines {
    by_key: IndexMap<String, Pipeline>,
}

impl Pipelines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pipeline: Pipeline) -> Result<&mut Self, PipelineError> {
        if pipeline.name.trim().is_empty() {
            return Err(PipelineError::EmptyName);
        }
        let key = pipeline_key(&pipeline.name);
        if self.by_key.contains_key(&key) {
            return Err(PipelineError::DuplicateName(pipeline.name));
        }
        self.by_key.insert(key, pipeline);
        Ok(self)
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, pipeline: Pipeline) -> Result<Self, PipelineError> {
        self.add(pipeline)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Pipeline> {
        self.by_key.get(&pipeline_key(name))
    }

    /// Declaration index of a pipeline.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_key.get_index_of(&pipeline_key(name))
    }

    pub fn get_index(&self, index: usize) -> Option<&Pipeline> {
        self.by_key.get_index(index).map(|(_, p)| p)
    }

    /// Pipeline at a declaration index taken from a plan built over this set.
    pub(crate) fn at(&self, index: usize) -> &Pipeline {
        &self.by_key[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pipeline> {
        self.by_key.values()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Check every dependency names a declared pipeline, once.
    ///
    /// A pipeline may depend on another through one phase only: the
    /// dependency's documents seed Input a single time.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for pipeline in self.iter() {
            let mut seen = HashSet::new();
            for dep in &pipeline.dependencies {
                if self.get(&dep.pipeline).is_none() {
                    return Err(PipelineError::UnknownDependency {
                        pipeline: pipeline.name.clone(),
                        dependency: dep.pipeline.clone(),
                    });
                }
                if !seen.insert(pipeline_key(&dep.pipeline)) {
                    return Err(PipelineError::DuplicateDependency {
                        pipeline: pipeline.name.clone(),
                        dependency: dep.pipeline.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_run_in_fixed_order() {
        assert_eq!(Phase::Input.next(), Some(Phase::Process));
        assert_eq!(Phase::Output.next(), None);
        assert_eq!(Phase::Output.previous(), Some(Phase::PostProcess));
        assert!(Phase::Input < Phase::Output);
    }

    #[test]
    fn phase_parses_config_spellings() {
        assert_eq!("post_process".parse::<Phase>().unwrap(), Phase::PostProcess);
        assert_eq!("PostProcess".parse::<Phase>().unwrap(), Phase::PostProcess);
        assert_eq!("OUTPUT".parse::<Phase>().unwrap(), Phase::Output);
        assert!("render".parse::<Phase>().is_err());
    }

    #[test]
    fn names_are_unique_case_insensitively() {
        let mut pipelines = Pipelines::new();
        pipelines.add(Pipeline::new("Posts")).unwrap();
        let err = pipelines.add(Pipeline::new("posts")).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateName(name) if name == "posts"));
    }

    #[test]
    fn lookup_is_case_insensitive_and_keeps_spelling() {
        let pipelines = Pipelines::new().with(Pipeline::new("Posts")).unwrap();
        assert_eq!(pipelines.get("POSTS").unwrap().name(), "Posts");
        assert_eq!(pipelines.index_of("posts"), Some(0));
    }

    #[test]
    fn empty_name_rejected() {
        let err = Pipelines::new().with(Pipeline::new("  ")).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyName));
    }

    #[test]
    fn depends_on_defaults_to_output_phase() {
        let p = Pipeline::new("b").depends_on("a").depends_on_phase("c", Phase::Process);
        assert_eq!(
            p.dependencies(),
            &[
                Dependency {
                    pipeline: "a".into(),
                    phase: Phase::Output
                },
                Dependency {
                    pipeline: "c".into(),
                    phase: Phase::Process
                },
            ]
        );
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let pipelines = Pipelines::new()
            .with(Pipeline::new("b").depends_on("missing"))
            .unwrap();
        assert!(matches!(
            pipelines.validate(),
            Err(PipelineError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn validate_rejects_repeated_dependency() {
        let pipelines = Pipelines::new()
            .with(Pipeline::new("posts"))
            .unwrap()
            .with(Pipeline::new("index").depends_on("posts").depends_on("Posts"))
            .unwrap();
        assert!(matches!(
            pipelines.validate(),
            Err(PipelineError::DuplicateDependency { pipeline, dependency })
                if pipeline == "index" && dependency == "Posts"
        ));
    }

    #[test]
    fn validate_rejects_same_dependency_through_two_phases() {
        let pipelines = Pipelines::new()
            .with(Pipeline::new("posts"))
            .unwrap()
            .with(
                Pipeline::new("index")
                    .depends_on("posts")
                    .depends_on_phase("posts", Phase::Process),
            )
            .unwrap();
        assert!(matches!(
            pipelines.validate(),
            Err(PipelineError::DuplicateDependency { .. })
        ));
    }

    #[test]
    fn declaration_order_is_preserved() {
        let pipelines = Pipelines::new()
            .with(Pipeline::new("zeta"))
            .unwrap()
            .with(Pipeline::new("alpha"))
            .unwrap();
        let names: Vec<&str> = pipelines.iter().map(Pipeline::name).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }
}
