//! Content replacement from a metadata template.

use crate::content::Content;
use crate::context::ExecutionContext;
use crate::document::{ContentUpdate, Document};
use crate::module::{DocumentModule, ModuleError};
use async_trait::async_trait;
use serde::Deserialize;

/// Replace each document's content with `text`, substituting `{{key}}`
/// placeholders from metadata.
///
/// `{{content}}` inserts the document's current content. Missing keys
/// render as the empty string; an unclosed `{{` is kept literally.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetContent {
    pub text: String,
}

impl SetContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

enum Piece<'a> {
    Text(&'a str),
    Key(&'a str),
}

fn parse(template: &str) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        if open > 0 {
            pieces.push(Piece::Text(&rest[..open]));
        }
        pieces.push(Piece::Key(rest[open + 2..open + 2 + close].trim()));
        rest = &rest[open + 2 + close + 2..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    pieces
}

#[async_trait]
impl DocumentModule for SetContent {
    fn name(&self) -> &str {
        "SetContent"
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    fn cache_key(&self) -> Option<String> {
        Some(self.text.clone())
    }

    async fn process(
        &self,
        doc: Document,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Document>, ModuleError> {
        let pieces = parse(&self.text);
        let current = if pieces.iter().any(|p| matches!(p, Piece::Key("content"))) {
            let content = doc.content().cloned();
            tokio::task::spawn_blocking(move || match content {
                Some(c) => c.read_to_string(),
                None => Ok(String::new()),
            })
            .await
            .map_err(|e| ModuleError::failed(format!("reading content: {e}")))??
        } else {
            String::new()
        };

        let mut rendered = String::with_capacity(self.text.len());
        for piece in &pieces {
            match piece {
                Piece::Text(text) => rendered.push_str(text),
                Piece::Key("content") => rendered.push_str(&current),
                Piece::Key(key) => {
                    if let Some(value) = ctx.get_value(&doc, key) {
                        rendered.push_str(&value.to_display_string());
                    }
                }
            }
        }

        let content = ContentUpdate::Replace(Content::from_string(rendered));
        Ok(vec![ctx.clone_document(&doc, None, content)])
    }
}
