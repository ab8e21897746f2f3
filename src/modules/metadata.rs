//! Metadata-level transforms.

use crate::context::ExecutionContext;
use crate::document::{ContentUpdate, Document};
use crate::metadata::{Metadata, Value};
use crate::module::{DocumentModule, ModuleError};
use async_trait::async_trait;
use serde::Deserialize;

/// Set one literal metadata key on every document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetMetadata {
    pub key: String,
    pub value: Value,
}

impl SetMetadata {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl DocumentModule for SetMetadata {
    fn name(&self) -> &str {
        "SetMetadata"
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    fn cache_key(&self) -> Option<String> {
        let value = serde_json::to_string(&self.value).ok()?;
        Some(format!("{}={value}", self.key))
    }

    async fn process(
        &self,
        doc: Document,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        let delta = Metadata::new().with(self.key.as_str(), self.value.clone());
        Ok(vec![ctx.clone_document(&doc, Some(&delta), ContentUpdate::Inherit)])
    }
}

/// Keep documents whose `key` reads as `true` (or `false` when negated).
///
/// Missing or non-boolean values count as `false`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    pub key: String,
    #[serde(default)]
    pub negate: bool,
}

impl Filter {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            negate: false,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }
}

#[async_trait]
impl DocumentModule for Filter {
    fn name(&self) -> &str {
        "Filter"
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    fn cache_key(&self) -> Option<String> {
        Some(format!("{}:{}", self.key, self.negate))
    }

    async fn process(
        &self,
        doc: Document,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        let keep = ctx.get_or(&doc, &self.key, false) != self.negate;
        Ok(if keep { vec![doc] } else { Vec::new() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, PerDocument};
    use crate::test_helpers::test_context;

    fn docs() -> Vec<Document> {
        vec![
            Document::create(Metadata::new().with("name", "a").with("draft", true), None),
            Document::create(Metadata::new().with("name", "b").with("draft", "no"), None),
            Document::create(Metadata::new().with("name", "c"), None),
        ]
    }

    #[tokio::test]
    async fn set_metadata_preserves_identity() {
        let ctx = test_context();
        let input = docs();
        let ids: Vec<_> = input.iter().map(Document::id).collect();

        let out = PerDocument(SetMetadata::new("layout", "post"))
            .execute(input, &ctx)
            .await
            .unwrap();

        assert_eq!(out.iter().map(Document::id).collect::<Vec<_>>(), ids);
        assert!(out
            .iter()
            .all(|d| ctx.try_get::<String>(d, "layout").as_deref() == Some("post")));
        assert_eq!(ctx.try_get::<String>(&out[0], "name").unwrap(), "a");
    }

    #[tokio::test]
    async fn filter_keeps_true_values() {
        let ctx = test_context();
        let out = PerDocument(Filter::new("draft")).execute(docs(), &ctx).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(ctx.try_get::<String>(&out[0], "name").unwrap(), "a");
    }

    #[tokio::test]
    async fn negated_filter_keeps_the_rest_in_order() {
        let ctx = test_context();
        let out = PerDocument(Filter::new("draft").negated())
            .execute(docs(), &ctx)
            .await
            .unwrap();
        let names: Vec<String> = out
            .iter()
            .map(|d| ctx.get_or(d, "name", String::new()))
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn set_metadata_params_accept_any_toml_value() {
        let m: SetMetadata = toml::from_str("key = \"tags\"\nvalue = [\"a\", \"b\"]").unwrap();
        assert_eq!(m.value, Value::from(vec!["a", "b"]));
        assert!(toml::from_str::<SetMetadata>("key = \"x\"\nvalue = 1\nextra = 2").is_err());
    }
}
