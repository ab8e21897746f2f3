//! Collection-level transforms: ordering and pulling in other pipelines.

use crate::context::ExecutionContext;
use crate::document::Document;
use crate::metadata::Value;
use crate::module::{Module, ModuleError};
use async_trait::async_trait;
use serde::Deserialize;
use std::cmp::Ordering;

/// Stable sort by a metadata key. Documents missing the key go last, in
/// their original order.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderBy {
    pub key: String,
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            descending: false,
        }
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }
}

/// Numbers compare numerically, everything else by display string.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    let number = |v: &Value| match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    };
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.to_display_string().cmp(&b.to_display_string()),
    }
}

#[async_trait]
impl Module for OrderBy {
    fn name(&self) -> &str {
        "OrderBy"
    }

    fn cache_key(&self) -> Option<String> {
        Some(format!("{}:{}", self.key, self.descending))
    }

    async fn execute(
        &self,
        inputs: Vec<Document>,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        let mut keyed: Vec<(Option<Value>, Document)> = inputs
            .into_iter()
            .map(|doc| (ctx.get_value(&doc, &self.key), doc))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| match (a, b) {
            (Some(a), Some(b)) => {
                let ord = compare_values(a, b);
                if self.descending { ord.reverse() } else { ord }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        Ok(keyed.into_iter().map(|(_, doc)| doc).collect())
    }
}

/// Append the outputs of declared dependency pipelines to the inputs, in
/// the listed order.
///
/// Never cacheable: the appended documents are not part of the phase inputs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcatOutputs {
    pub pipelines: Vec<String>,
}

impl ConcatOutputs {
    pub fn new(pipelines: &[&str]) -> Self {
        Self {
            pipelines: pipelines.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Module for ConcatOutputs {
    fn name(&self) -> &str {
        "ConcatOutputs"
    }

    async fn execute(
        &self,
        mut inputs: Vec<Document>,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        for pipeline in &self.pipelines {
            inputs.extend(ctx.outputs_of(pipeline)?.iter().cloned());
        }
        Ok(inputs)
    }
}
