//! Ordered, type-converting document metadata.
//!
//! Keys are case-sensitive and unique; enumeration follows insertion order
//! (an overwrite keeps the key's original position). Values are either
//! literals ([`Value`]) or [`Computed`] functions of the reading document and
//! execution context.
//!
//! ## Resolution
//!
//! Typed reads go through [`ExecutionContext::try_get`](crate::ExecutionContext::try_get):
//!
//! ```text
//! document-local entry (computed → evaluated, memoized per document)
//!     └─ absent → settings layer entry (computed → evaluated for this document)
//!         └─ raw Value → Converters chain → Option<T>
//! ```
//!
//! A local entry shadows the settings entry even when it does not convert to
//! the requested type. The settings layer is only ever a fallback for the
//! document, never the other way around.
//!
//! ## Conversion chain
//!
//! [`FromValue::convert`] tries, first success wins:
//!
//! 1. identity and direct cast ([`FromValue::cast`]): the variant already
//!    matches, or a lossless numeric widening applies (`Int` → `f64`,
//!    in-range `Int` → `i32`)
//! 2. custom converters registered on [`Converters`] for the target type
//! 3. structured parse of string values ([`FromValue::parse`]), only when
//!    the chain has parsing enabled
//!
//! If nothing succeeds the key reads as absent for that type, even though
//! it may convert fine to another.

use crate::context::ExecutionContext;
use crate::document::Document;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata key not found: {0}")]
    Missing(String),
    #[error("metadata key {key} cannot be converted to {target}")]
    NotConvertible { key: String, target: &'static str },
}

/// A literal metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Human-readable rendering used for text substitution.
    ///
    /// Strings render without quotes, lists as comma-separated items, null as empty.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join(", "),
            Value::Map(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        i64::try_from(v).map(Value::Int).unwrap_or(Value::Float(v as f64))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<toml::Value> for Value {
    fn from(v: toml::Value) -> Self {
        match v {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Int(i),
            toml::Value::Float(f) => Value::Float(f),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(d) => Value::String(d.to_string()),
            toml::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            toml::Value::Table(table) => Value::Map(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

// ============================================================================
// Computed values
// ============================================================================

type ComputeFn = dyn Fn(&Document, &ExecutionContext) -> Value + Send + Sync;

/// A metadata value computed from the reading document and context.
///
/// Evaluation of a document-local computed value is memoized on that
/// document instance: the function runs at most once per document, and a
/// clone starts with a fresh memo so it re-evaluates against its own state.
pub struct Computed {
    f: Arc<ComputeFn>,
    memo: OnceLock<Value>,
}

impl Computed {
    pub fn new(f: impl Fn(&Document, &ExecutionContext) -> Value + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            memo: OnceLock::new(),
        }
    }

    /// Evaluate once and remember the result.
    pub fn evaluate(&self, doc: &Document, ctx: &ExecutionContext) -> Value {
        if let Some(v) = self.memo.get() {
            return v.clone();
        }
        // Not get_or_init: the function may read other computed keys of
        // the same document, which must not deadlock on this cell.
        let value = (self.f)(doc, ctx);
        let _ = self.memo.set(value.clone());
        value
    }

    /// Evaluate without touching the memo (settings entries shared by many documents).
    pub fn evaluate_fresh(&self, doc: &Document, ctx: &ExecutionContext) -> Value {
        (self.f)(doc, ctx)
    }

    pub fn is_evaluated(&self) -> bool {
        self.memo.get().is_some()
    }
}

impl Clone for Computed {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
            memo: OnceLock::new(),
        }
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("evaluated", &self.is_evaluated())
            .finish()
    }
}

/// A stored metadata entry.
#[derive(Debug, Clone)]
pub enum MetaValue {
    Literal(Value),
    Computed(Computed),
}

impl From<Value> for MetaValue {
    fn from(v: Value) -> Self {
        MetaValue::Literal(v)
    }
}

impl From<Computed> for MetaValue {
    fn from(c: Computed) -> Self {
        MetaValue::Computed(c)
    }
}

// ============================================================================
// Metadata store
// ============================================================================

/// Insertion-ordered key → value store.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: IndexMap<String, MetaValue>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style literal insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries
            .insert(key.into(), MetaValue::Literal(value.into()));
    }

    pub fn insert_computed(
        &mut self,
        key: impl Into<String>,
        f: impl Fn(&Document, &ExecutionContext) -> Value + Send + Sync + 'static,
    ) {
        self.entries
            .insert(key.into(), MetaValue::Computed(Computed::new(f)));
    }

    pub fn set(&mut self, key: impl Into<String>, value: MetaValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries.get(key)
    }

    /// The literal stored under `key`, ignoring computed entries.
    pub fn literal(&self, key: &str) -> Option<&Value> {
        match self.entries.get(key)? {
            MetaValue::Literal(v) => Some(v),
            MetaValue::Computed(_) => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overlay `delta`: its keys are added or overwrite, nothing is removed.
    pub fn merge(&mut self, delta: &Metadata) {
        for (key, value) in &delta.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    pub fn has_computed(&self) -> bool {
        self.entries
            .values()
            .any(|v| matches!(v, MetaValue::Computed(_)))
    }

    /// All entries as literals, or `None` if any entry is computed.
    pub fn to_literals(&self) -> Option<IndexMap<String, Value>> {
        self.entries
            .iter()
            .map(|(k, v)| match v {
                MetaValue::Literal(lit) => Some((k.clone(), lit.clone())),
                MetaValue::Computed(_) => None,
            })
            .collect()
    }

    pub fn from_literals(literals: IndexMap<String, Value>) -> Self {
        Self {
            entries: literals
                .into_iter()
                .map(|(k, v)| (k, MetaValue::Literal(v)))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut m = Metadata::new();
        for (k, v) in iter {
            m.insert(k, v);
        }
        m
    }
}

/// Engine-wide fallback metadata, read-only once execution starts.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    metadata: Metadata,
}

impl Settings {
    pub fn new(metadata: Metadata) -> Self {
        Self { metadata }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl From<Metadata> for Settings {
    fn from(metadata: Metadata) -> Self {
        Self::new(metadata)
    }
}

// ============================================================================
// Conversion
// ============================================================================

type ConvertFn = dyn Fn(&Value) -> Option<Box<dyn Any + Send>> + Send + Sync;

/// The pluggable part of the conversion chain.
#[derive(Clone)]
pub struct Converters {
    custom: HashMap<TypeId, Vec<Arc<ConvertFn>>>,
    /// Target type names, in registration order.
    registered: Vec<&'static str>,
    parse_strings: bool,
}

impl Converters {
    /// Identity, casts, and custom converters only. Strings are never parsed.
    pub fn strict() -> Self {
        Self {
            custom: HashMap::new(),
            registered: Vec::new(),
            parse_strings: false,
        }
    }

    /// [`strict`](Self::strict) plus structured string parsing (`"42"` → `42`).
    pub fn standard() -> Self {
        Self {
            parse_strings: true,
            ..Self::strict()
        }
    }

    /// Register a converter for target type `T`. Converters for the same
    /// type run in registration order.
    pub fn register<T: Send + 'static>(
        &mut self,
        f: impl Fn(&Value) -> Option<T> + Send + Sync + 'static,
    ) -> &mut Self {
        let erased: Arc<ConvertFn> =
            Arc::new(move |v: &Value| f(v).map(|t| Box::new(t) as Box<dyn Any + Send>));
        self.custom.entry(TypeId::of::<T>()).or_default().push(erased);
        self.registered.push(std::any::type_name::<T>());
        self
    }

    pub fn parses_strings(&self) -> bool {
        self.parse_strings
    }

    /// Describes the chain's shape: string parsing plus the target type of
    /// each registered converter. Two chains with the same signature convert
    /// alike as long as the converter code is unchanged.
    pub fn signature(&self) -> String {
        format!(
            "parse_strings={};custom=[{}]",
            self.parse_strings,
            self.registered.join(",")
        )
    }

    pub fn convert<T: FromValue>(&self, value: &Value) -> Option<T> {
        T::convert(value, self)
    }

    /// Run the custom converters registered for `T`.
    pub fn custom<T: 'static>(&self, value: &Value) -> Option<T> {
        self.custom
            .get(&TypeId::of::<T>())?
            .iter()
            .find_map(|f| f(value))
            .and_then(|boxed| {
                let any: Box<dyn Any> = boxed;
                any.downcast::<T>().ok().map(|b| *b)
            })
    }
}

impl Default for Converters {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for Converters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converters")
            .field("custom_types", &self.custom.len())
            .field("parse_strings", &self.parse_strings)
            .finish()
    }
}

/// Types readable from metadata.
pub trait FromValue: Sized + Send + 'static {
    /// Identity or lossless direct cast.
    fn cast(value: &Value) -> Option<Self>;

    /// Structured parse from a string.
    fn parse(_text: &str) -> Option<Self> {
        None
    }

    /// The full chain: cast → custom converters → parse.
    fn convert(value: &Value, converters: &Converters) -> Option<Self> {
        Self::cast(value)
            .or_else(|| converters.custom::<Self>(value))
            .or_else(|| match value {
                Value::String(s) if converters.parses_strings() => Self::parse(s.trim()),
                _ => None,
            })
    }
}

impl FromValue for Value {
    fn cast(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for bool {
    fn cast(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn cast(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => Some(value.to_display_string()),
            _ => None,
        }
    }
}

impl FromValue for PathBuf {
    fn cast(value: &Value) -> Option<Self> {
        value.as_str().map(PathBuf::from)
    }
}

impl FromValue for f64 {
    fn cast(value: &Value) -> Option<Self> {
        match value {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    fn parse(text: &str) -> Option<Self> {
        text.parse().ok()
    }
}

macro_rules! integer_from_value {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn cast(value: &Value) -> Option<Self> {
                    match value {
                        Value::Int(i) => <$t>::try_from(*i).ok(),
                        _ => None,
                    }
                }

                fn parse(text: &str) -> Option<Self> {
                    text.parse().ok()
                }
            }
        )*
    };
}

integer_from_value!(i64, i32, u32, u64, usize);

impl<T: FromValue> FromValue for Vec<T> {
    fn cast(value: &Value) -> Option<Self> {
        match value {
            Value::List(items) => items.iter().map(T::cast).collect(),
            _ => None,
        }
    }

    /// Lists project element-wise through the full chain; a scalar becomes
    /// a one-element list.
    fn convert(value: &Value, converters: &Converters) -> Option<Self> {
        if let Some(v) = Self::cast(value) {
            return Some(v);
        }
        if let Some(v) = converters.custom::<Self>(value) {
            return Some(v);
        }
        match value {
            Value::List(items) => items.iter().map(|i| T::convert(i, converters)).collect(),
            Value::Null => None,
            scalar => T::convert(scalar, converters).map(|v| vec![v]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Store ordering and merging
    // =========================================================================

    #[test]
    fn keys_enumerate_in_insertion_order() {
        let m = Metadata::new()
            .with("zeta", 1)
            .with("alpha", 2)
            .with("mid", 3);
        assert_eq!(m.keys().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn overwrite_keeps_position() {
        let mut m = Metadata::new().with("a", 1).with("b", 2);
        m.insert("a", 10);
        assert_eq!(m.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(m.literal("a"), Some(&Value::Int(10)));
    }

    #[test]
    fn keys_are_case_sensitive() {
        let m = Metadata::new().with("Title", "x");
        assert!(m.contains_key("Title"));
        assert!(!m.contains_key("title"));
    }

    #[test]
    fn merge_overrides_and_adds_without_removing() {
        let mut base = Metadata::new().with("a", 1).with("b", 2);
        let delta = Metadata::new().with("b", 20).with("c", 30);
        base.merge(&delta);
        assert_eq!(base.literal("a"), Some(&Value::Int(1)));
        assert_eq!(base.literal("b"), Some(&Value::Int(20)));
        assert_eq!(base.literal("c"), Some(&Value::Int(30)));
        assert_eq!(base.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn to_literals_refuses_computed_entries() {
        let mut m = Metadata::new().with("a", 1);
        assert!(m.to_literals().is_some());
        m.insert_computed("b", |_, _| Value::Null);
        assert!(m.has_computed());
        assert!(m.to_literals().is_none());
    }

    // =========================================================================
    // Conversion chain
    // =========================================================================

    #[test]
    fn identity_and_widening_casts() {
        let c = Converters::strict();
        assert_eq!(c.convert::<i64>(&Value::Int(7)), Some(7));
        assert_eq!(c.convert::<f64>(&Value::Int(7)), Some(7.0));
        assert_eq!(c.convert::<i32>(&Value::Int(i64::MAX)), None);
        assert_eq!(c.convert::<i64>(&Value::Float(7.5)), None);
        assert_eq!(c.convert::<String>(&Value::Int(7)), Some("7".to_string()));
    }

    #[test]
    fn strict_chain_does_not_parse_strings() {
        let c = Converters::strict();
        assert_eq!(c.convert::<i32>(&Value::from("42")), None);
    }

    #[test]
    fn standard_chain_parses_strings() {
        let c = Converters::standard();
        assert_eq!(c.convert::<i32>(&Value::from(" 42 ")), Some(42));
        assert_eq!(c.convert::<bool>(&Value::from("yes")), Some(true));
        assert_eq!(c.convert::<f64>(&Value::from("2.5")), Some(2.5));
        assert_eq!(c.convert::<i32>(&Value::from("forty-two")), None);
    }

    #[test]
    fn custom_converter_runs_before_parse() {
        let mut c = Converters::standard();
        c.register::<i32>(|v| v.as_str().filter(|s| *s == "answer").map(|_| 42));
        assert_eq!(c.convert::<i32>(&Value::from("answer")), Some(42));
        // Falls through to parse when the custom converter declines
        assert_eq!(c.convert::<i32>(&Value::from("7")), Some(7));
    }

    #[test]
    fn custom_converter_enables_strings_in_strict_chain() {
        let mut c = Converters::strict();
        c.register::<i32>(|v| v.as_str().and_then(|s| s.parse().ok()));
        assert_eq!(c.convert::<i32>(&Value::from("42")), Some(42));
    }

    #[test]
    fn signature_tracks_parsing_and_registrations() {
        let strict = Converters::strict().signature();
        assert_ne!(strict, Converters::standard().signature());

        let mut c = Converters::strict();
        c.register::<i32>(|_| None);
        assert_ne!(c.signature(), strict);
        assert!(c.signature().contains("i32"));
    }

    #[test]
    fn list_projects_element_wise() {
        let c = Converters::standard();
        let v = Value::List(vec![Value::Int(1), Value::from("2"), Value::Int(3)]);
        assert_eq!(c.convert::<Vec<i64>>(&v), Some(vec![1, 2, 3]));
        assert_eq!(Converters::strict().convert::<Vec<i64>>(&v), None);
    }

    #[test]
    fn scalar_projects_to_single_element_list() {
        let c = Converters::strict();
        assert_eq!(
            c.convert::<Vec<String>>(&Value::from("tag")),
            Some(vec!["tag".to_string()])
        );
        assert_eq!(c.convert::<Vec<String>>(&Value::Null), None);
    }

    #[test]
    fn toml_values_convert() {
        let t: toml::Value = toml::from_str("a = [1, 2]\nb = { c = true }").unwrap();
        let v = Value::from(t);
        let Value::Map(map) = v else {
            panic!("expected map");
        };
        assert_eq!(map["a"], Value::List(vec![Value::Int(1), Value::Int(2)]));
        let Value::Map(inner) = &map["b"] else {
            panic!("expected nested map");
        };
        assert_eq!(inner["c"], Value::Bool(true));
    }

    #[test]
    fn display_string_renders_lists() {
        let v = Value::from(vec!["a", "b"]);
        assert_eq!(v.to_display_string(), "a, b");
        assert_eq!(Value::Null.to_display_string(), "");
    }
}
