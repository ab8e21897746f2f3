//! The phase graph and its execution order.
//!
//! Every (pipeline, phase) pair is a node. Edges come from two rules:
//!
//! - Within a pipeline: `Input → Process → PostProcess → Output`.
//! - Across pipelines: for each declared dependency `b → (a, phase)`, an
//!   edge `a.phase → b.Input`. With the default Output dependency this means
//!   no phase of b starts before every phase of a has completed.
//!
//! The plan is built and checked before anything runs. A cycle anywhere in
//! the graph is a configuration error and no phase executes.

use crate::pipeline::{Phase, PipelineError, Pipelines};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("pipeline {0} depends on itself")]
    SelfDependency(String),
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// A node of the phase graph: pipeline (by declaration index) and phase.
///
/// Ordering is by pipeline index, then phase, which is also the tie-break
/// the scheduler uses when several phases become ready at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhaseId {
    pub pipeline: usize,
    pub phase: Phase,
}

impl PhaseId {
    pub fn new(pipeline: usize, phase: Phase) -> Self {
        Self { pipeline, phase }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseNode {
    pub id: PhaseId,
    pub pipeline_name: String,
    pub module_count: usize,
    pub predecessors: Vec<PhaseId>,
    pub successors: Vec<PhaseId>,
}

impl fmt::Display for PhaseNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pipeline_name, self.id.phase)
    }
}

/// Validated, acyclic phase graph plus a deterministic topological order.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    nodes: HashMap<PhaseId, PhaseNode>,
    order: Vec<PhaseId>,
}

impl ExecutionPlan {
    pub fn build(pipelines: &Pipelines) -> Result<Self, PlanError> {
        pipelines.validate()?;

        let mut nodes: HashMap<PhaseId, PhaseNode> = HashMap::new();
        for (index, pipeline) in pipelines.iter().enumerate() {
            for phase in Phase::ALL {
                let id = PhaseId::new(index, phase);
                nodes.insert(
                    id,
                    PhaseNode {
                        id,
                        pipeline_name: pipeline.name().to_string(),
                        module_count: pipeline.modules(phase).len(),
                        predecessors: Vec::new(),
                        successors: Vec::new(),
                    },
                );
            }
        }

        let mut edges: Vec<(PhaseId, PhaseId)> = Vec::new();
        for (index, pipeline) in pipelines.iter().enumerate() {
            for phase in Phase::ALL {
                if let Some(next) = phase.next() {
                    edges.push((PhaseId::new(index, phase), PhaseId::new(index, next)));
                }
            }
            for dep in pipeline.dependencies() {
                // validate() guarantees the dependency exists.
                let Some(dep_index) = pipelines.index_of(&dep.pipeline) else {
                    continue;
                };
                if dep_index == index {
                    return Err(PlanError::SelfDependency(pipeline.name().to_string()));
                }
                edges.push((
                    PhaseId::new(dep_index, dep.phase),
                    PhaseId::new(index, Phase::Input),
                ));
            }
        }

        for (from, to) in edges {
            if let Some(node) = nodes.get_mut(&from)
                && !node.successors.contains(&to)
            {
                node.successors.push(to);
            }
            if let Some(node) = nodes.get_mut(&to)
                && !node.predecessors.contains(&from)
            {
                node.predecessors.push(from);
            }
        }
        for node in nodes.values_mut() {
            node.successors.sort();
            node.predecessors.sort();
        }

        let order = topological_order(&nodes)?;
        Ok(Self { nodes, order })
    }

    /// Every node, predecessors before successors.
    pub fn order(&self) -> &[PhaseId] {
        &self.order
    }

    pub fn node(&self, id: PhaseId) -> Option<&PhaseNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes with no predecessors.
    pub fn roots(&self) -> impl Iterator<Item = PhaseId> + '_ {
        self.order
            .iter()
            .copied()
            .filter(|id| self.nodes[id].predecessors.is_empty())
    }

    /// Everything reachable from `id`, excluding `id` itself.
    pub fn transitive_successors(&self, id: PhaseId) -> BTreeSet<PhaseId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                for &next in &node.successors {
                    if seen.insert(next) {
                        stack.push(next);
                    }
                }
            }
        }
        seen
    }

    /// `Pipeline/Phase` label for logs.
    pub fn label(&self, id: PhaseId) -> String {
        self.nodes
            .get(&id)
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("#{}/{}", id.pipeline, id.phase))
    }
}

/// Kahn's algorithm with a sorted ready set, so the order is deterministic.
fn topological_order(nodes: &HashMap<PhaseId, PhaseNode>) -> Result<Vec<PhaseId>, PlanError> {
    let mut indegree: HashMap<PhaseId, usize> = nodes
        .iter()
        .map(|(id, n)| (*id, n.predecessors.len()))
        .collect();
    let mut ready: BTreeSet<PhaseId> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = ready.pop_first() {
        order.push(id);
        for next in &nodes[&id].successors {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(*next);
                }
            }
        }
    }

    if order.len() == nodes.len() {
        return Ok(order);
    }

    let stuck: HashSet<PhaseId> = indegree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(id, _)| id)
        .collect();
    Err(PlanError::Cycle(describe_cycle(nodes, &stuck)))
}

/// Walk predecessors inside the unresolved set until a node repeats, then
/// report that loop as pipeline names.
fn describe_cycle(nodes: &HashMap<PhaseId, PhaseNode>, stuck: &HashSet<PhaseId>) -> Vec<String> {
    let Some(mut current) = stuck.iter().min().copied() else {
        return Vec::new();
    };
    let mut path: Vec<PhaseId> = Vec::new();
    loop {
        if let Some(pos) = path.iter().position(|p| *p == current) {
            let mut cycle: Vec<PhaseId> = path[pos..].to_vec();
            cycle.reverse();
            cycle.push(cycle[0]);
            let mut names: Vec<String> = Vec::new();
            for id in cycle {
                let name = &nodes[&id].pipeline_name;
                if names.last() != Some(name) {
                    names.push(name.clone());
                }
            }
            return names;
        }
        path.push(current);
        let Some(prev) = nodes[&current]
            .predecessors
            .iter()
            .find(|p| stuck.contains(p))
            .copied()
        else {
            return vec![nodes[&current].pipeline_name.clone()];
        };
        current = prev;
    }
}
