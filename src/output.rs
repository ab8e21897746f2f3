//! CLI output formatting.
//!
//! # Output Format
//!
//! ## Check
//!
//! ```text
//! Plan (8 phases)
//! 001 posts/Input (1 module)
//! 002 posts/Process (2 modules)
//!     after: posts/Input
//! ...
//! 005 index/Input (0 modules)
//!     after: posts/Output
//! ```
//!
//! ## Build
//!
//! ```text
//! posts: 12 documents
//! index: 1 document
//! drafts: not completed
//! Phases: 3 cached, 5 executed (8 total) in 41ms
//! ```
//!
//! ## Failure
//!
//! ```text
//! 1 phase failed
//! posts/Process
//!     module SetDestination failed: ...
//!     Document: posts/a.md
//! index/Input
//!     skipped because posts/Process failed
//! ```
//!
//! Each has a `format_*` function (returns `Vec<String>`) for testability and
//! a `print_*` wrapper that writes to stdout. Format functions are pure.

use crate::engine::{EngineResults, FailureReport};
use crate::plan::ExecutionPlan;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Every phase in execution order, with its predecessors.
pub fn format_plan(plan: &ExecutionPlan) -> Vec<String> {
    let mut lines = vec![format!("Plan ({})", plural(plan.len(), "phase"))];
    for (pos, id) in plan.order().iter().enumerate() {
        let Some(node) = plan.node(*id) else {
            continue;
        };
        lines.push(format!(
            "{} {} ({})",
            format_index(pos + 1),
            node,
            plural(node.module_count, "module")
        ));
        if !node.predecessors.is_empty() {
            let after: Vec<String> = node.predecessors.iter().map(|p| plan.label(*p)).collect();
            lines.push(format!("{}after: {}", indent(1), after.join(", ")));
        }
    }
    lines
}

pub fn print_plan(plan: &ExecutionPlan) {
    for line in format_plan(plan) {
        println!("{}", line);
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Per-pipeline output counts plus cache statistics.
pub fn format_summary(results: &EngineResults) -> Vec<String> {
    let mut lines: Vec<String> = results
        .pipelines()
        .map(|p| match &p.outputs {
            Some(docs) => format!("{}: {}", p.name, plural(docs.len(), "document")),
            None => format!("{}: not completed", p.name),
        })
        .collect();
    lines.push(format!(
        "Phases: {} in {}ms",
        results.cache_stats(),
        results.elapsed().as_millis()
    ));
    lines
}

pub fn print_summary(results: &EngineResults) {
    for line in format_summary(results) {
        println!("{}", line);
    }
}

// ============================================================================
// Failures
// ============================================================================

/// One header per failed or skipped phase, with the error and the
/// offending document indented beneath it.
pub fn format_failures(report: &FailureReport) -> Vec<String> {
    let faulted = report.faulted().count();
    let mut lines = vec![format!("{} failed", plural(faulted, "phase"))];
    for failure in &report.failures {
        lines.push(format!("{}/{}", failure.pipeline, failure.phase));
        lines.push(format!("{}{}", indent(1), failure.error));
        if let Some(doc) = failure.error.document() {
            lines.push(format!("{}Document: {}", indent(1), doc));
        }
    }
    lines
}

pub fn print_failures(report: &FailureReport) {
    for line in format_failures(report) {
        eprintln!("{}", line);
    }
}
