//! Pluggable line parsers.
//!
//! A formatter turns one raw line (or a reassembled multi-line record) into a
//! partial record: a JSON object whose keys are record fields. Formatters are
//! registered by name at startup and resolved from configuration; an unknown
//! name is a configuration error, never a per-record one.

pub mod builtin;

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Fields produced by a formatter. Keys are record field names; anything the
/// formatter does not set is filled with defaults by the normalizer.
pub type PartialRecord = Map<String, Value>;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed line: {0}")]
    Malformed(String),

    #[error("redirect to unknown formatter '{0}'")]
    UnknownRedirect(String),

    #[error("formatter '{inner}' redirected again from inside a redirect issued by '{outer}'")]
    NestedRedirect { outer: String, inner: String },
}

#[derive(Debug, Error)]
#[error("unknown formatter '{name}'")]
pub struct UnknownFormatter {
    pub name: String,
}

/// Result of parsing one raw record
#[derive(Debug, Clone, PartialEq)]
pub enum FormatOutput {
    Record(PartialRecord),

    /// The line is an envelope around a payload in another format. `fields`
    /// are envelope-level values merged before the inner formatter's output.
    Redirect {
        formatter: String,
        raw: String,
        fields: PartialRecord,
    },
}

pub trait Formatter: Send + Sync {
    fn name(&self) -> &str;

    fn parse(&self, raw: &str) -> Result<FormatOutput, FormatError>;

    /// Whether this formatter ever treats a line as a continuation. Formatters
    /// returning false have every record end at its own newline.
    fn supports_multiline(&self) -> bool {
        false
    }

    fn is_continuation(&self, _line: &str) -> bool {
        false
    }
}

/// Adapts a plain function into a [`Formatter`]
pub struct FnFormatter<F> {
    name: String,
    parse: F,
}

impl<F> FnFormatter<F>
where
    F: Fn(&str) -> Result<FormatOutput, FormatError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, parse: F) -> Self {
        Self {
            name: name.into(),
            parse,
        }
    }
}

impl<F> Formatter for FnFormatter<F>
where
    F: Fn(&str) -> Result<FormatOutput, FormatError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn parse(&self, raw: &str) -> Result<FormatOutput, FormatError> {
        (self.parse)(raw)
    }
}

/// Wraps a formatter with a configured continuation regex, replacing the
/// formatter's own predicate
pub struct ContinuationOverride {
    inner: Arc<dyn Formatter>,
    pattern: Regex,
}

impl ContinuationOverride {
    pub fn new(inner: Arc<dyn Formatter>, pattern: Regex) -> Self {
        Self { inner, pattern }
    }
}

impl Formatter for ContinuationOverride {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn parse(&self, raw: &str) -> Result<FormatOutput, FormatError> {
        self.inner.parse(raw)
    }

    fn supports_multiline(&self) -> bool {
        true
    }

    fn is_continuation(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

/// Name → formatter table, built once at startup
#[derive(Clone, Default)]
pub struct FormatterRegistry {
    formatters: BTreeMap<String, Arc<dyn Formatter>>,
}

impl FormatterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every formatter in [`builtin`]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for formatter in builtin::all() {
            registry.register(formatter);
        }
        registry
    }

    /// Register a formatter under its own name, replacing any previous entry
    pub fn register(&mut self, formatter: Arc<dyn Formatter>) {
        self.formatters
            .insert(formatter.name().to_string(), formatter);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Formatter>, UnknownFormatter> {
        self.formatters
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownFormatter {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formatters.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.formatters.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upper() -> Arc<dyn Formatter> {
        Arc::new(FnFormatter::new("upper", |raw: &str| {
            let mut fields = PartialRecord::new();
            fields.insert("event".to_string(), json!(raw.to_uppercase()));
            Ok(FormatOutput::Record(fields))
        }))
    }

    #[test]
    fn test_resolve_registered_formatter() {
        let mut registry = FormatterRegistry::new();
        registry.register(upper());

        let formatter = registry.resolve("upper").unwrap();
        let output = formatter.parse("hello").unwrap();

        match output {
            FormatOutput::Record(fields) => assert_eq!(fields["event"], json!("HELLO")),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_unknown_formatter() {
        let registry = FormatterRegistry::new();
        let err = registry.resolve("missing").err().unwrap();
        assert_eq!(err.name, "missing");
    }

    #[test]
    fn test_default_is_never_a_continuation() {
        let formatter = upper();
        assert!(!formatter.supports_multiline());
        assert!(!formatter.is_continuation("  indented"));
    }

    #[test]
    fn test_continuation_override() {
        let formatter = ContinuationOverride::new(upper(), Regex::new(r"^\s").unwrap());

        assert_eq!(formatter.name(), "upper");
        assert!(formatter.supports_multiline());
        assert!(formatter.is_continuation(" stack trace line 1"));
        assert!(!formatter.is_continuation("2020-01-01T00:00:00 INFO started"));
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = FormatterRegistry::with_builtins();
        for name in ["raw", "json", "nginx_access", "mongodb", "docker_file_driver", "python_traceback"] {
            assert!(registry.contains(name), "missing builtin {name}");
        }
    }
}
