//! Destination rewriting.

use crate::context::ExecutionContext;
use crate::document::Document;
use crate::module::{DocumentModule, ModuleError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;

/// How [`SetDestination`] computes the new destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationRule {
    /// Swap the extension of the current destination (or the source when
    /// there is none yet).
    Extension(String),
    /// Read the destination from a metadata key. Missing keys are an error.
    FromKey(String),
}

/// Rewrite each document's destination.
#[derive(Debug, Clone)]
pub struct SetDestination {
    rule: DestinationRule,
}

/// TOML form: exactly one of `extension` or `key`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetDestinationParams {
    pub extension: Option<String>,
    pub key: Option<String>,
}

impl SetDestination {
    pub fn extension(ext: impl Into<String>) -> Self {
        Self {
            rule: DestinationRule::Extension(ext.into()),
        }
    }

    pub fn from_key(key: impl Into<String>) -> Self {
        Self {
            rule: DestinationRule::FromKey(key.into()),
        }
    }

    pub fn from_params(params: SetDestinationParams) -> Result<Self, String> {
        match (params.extension, params.key) {
            (Some(ext), None) => Ok(Self::extension(ext)),
            (None, Some(key)) => Ok(Self::from_key(key)),
            _ => Err("set exactly one of `extension` or `key`".into()),
        }
    }

    pub fn rule(&self) -> &DestinationRule {
        &self.rule
    }
}

#[async_trait]
impl DocumentModule for SetDestination {
    fn name(&self) -> &str {
        "SetDestination"
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    fn cache_key(&self) -> Option<String> {
        Some(format!("{:?}", self.rule))
    }

    async fn process(
        &self,
        doc: Document,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        let destination: PathBuf = match &self.rule {
            DestinationRule::FromKey(key) => ctx.require(&doc, key)?,
            DestinationRule::Extension(ext) => {
                let Some(base) = doc.destination().or(doc.source()) else {
                    return Ok(vec![doc]);
                };
                base.with_extension(ext.trim_start_matches('.'))
            }
        };
        Ok(vec![doc.derive().destination(destination).build()?])
    }
}
