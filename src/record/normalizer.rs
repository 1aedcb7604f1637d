use super::schema::{self, SchemaError};
use super::Record;
use crate::formatter::{FormatError, FormatOutput, Formatter, FormatterRegistry, PartialRecord};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_TYPE: &str = "log";
const DEFAULT_LEVEL: &str = "debug";
const DEFAULT_EVENT: &str = "event";

/// Outcome of normalizing one raw record. Both variants are shipped; a
/// failed format keeps the raw text and carries the error trace.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Formatted(Record),
    FormatFailed(Record),
}

impl Normalized {
    pub fn record(&self) -> &Record {
        match self {
            Normalized::Formatted(record) | Normalized::FormatFailed(record) => record,
        }
    }

    pub fn into_record(self) -> Record {
        match self {
            Normalized::Formatted(record) | Normalized::FormatFailed(record) => record,
        }
    }
}

/// Applies a formatter to raw text and produces a schema-valid [`Record`]
pub struct Normalizer {
    host: String,
    formatters: Arc<FormatterRegistry>,
}

impl Normalizer {
    pub fn new(host: impl Into<String>, formatters: Arc<FormatterRegistry>) -> Self {
        Self {
            host: host.into(),
            formatters,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Normalize one raw record read from `source_path`.
    ///
    /// Formatter failures are recovered into [`Normalized::FormatFailed`].
    /// `Err` means the record violates the schema and must be dropped.
    pub fn normalize(
        &self,
        source_path: &str,
        formatter: &dyn Formatter,
        raw: &str,
    ) -> Result<Normalized, SchemaError> {
        let mut record = self.defaults(source_path, formatter.name(), raw);

        match self.apply(formatter, raw) {
            Ok((formatter_name, overlays)) => {
                record.insert("formatter_name".to_string(), Value::String(formatter_name));
                for overlay in overlays {
                    merge(&mut record, overlay);
                }
                schema::flatten(&mut record);
                decode(record).map(Normalized::Formatted)
            }
            Err(err) => {
                tracing::debug!(
                    formatter = formatter.name(),
                    path = source_path,
                    error = %err,
                    "Formatter failed, shipping raw record with error"
                );
                record.insert("error".to_string(), Value::Bool(true));
                record.insert(
                    "error_trace".to_string(),
                    Value::String(format!("{}: {}", formatter.name(), err)),
                );
                decode(record).map(Normalized::FormatFailed)
            }
        }
    }

    fn defaults(&self, source_path: &str, formatter_name: &str, raw: &str) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert(
            "id".to_string(),
            Value::String(Uuid::now_v7().simple().to_string()),
        );
        record.insert("source_path".to_string(), Value::String(source_path.to_string()));
        record.insert("host".to_string(), Value::String(self.host.clone()));
        record.insert(
            "formatter_name".to_string(),
            Value::String(formatter_name.to_string()),
        );
        record.insert("raw".to_string(), Value::String(raw.to_string()));
        record.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()),
        );
        record.insert("type".to_string(), Value::String(DEFAULT_TYPE.to_string()));
        record.insert("level".to_string(), Value::String(DEFAULT_LEVEL.to_string()));
        record.insert("event".to_string(), Value::String(DEFAULT_EVENT.to_string()));
        record.insert("data".to_string(), Value::Object(Map::new()));
        record
    }

    /// Run the formatter, following at most one redirect. Returns the name of
    /// the formatter that produced the final fields and the overlays to merge
    /// in order.
    fn apply(
        &self,
        formatter: &dyn Formatter,
        raw: &str,
    ) -> Result<(String, Vec<PartialRecord>), FormatError> {
        match formatter.parse(raw)? {
            FormatOutput::Record(fields) => Ok((formatter.name().to_string(), vec![fields])),
            FormatOutput::Redirect {
                formatter: inner_name,
                raw: inner_raw,
                fields,
            } => {
                let inner = self
                    .formatters
                    .resolve(&inner_name)
                    .map_err(|_| FormatError::UnknownRedirect(inner_name.clone()))?;

                match inner.parse(&inner_raw)? {
                    FormatOutput::Record(inner_fields) => {
                        Ok((inner.name().to_string(), vec![fields, inner_fields]))
                    }
                    FormatOutput::Redirect { .. } => Err(FormatError::NestedRedirect {
                        outer: formatter.name().to_string(),
                        inner: inner.name().to_string(),
                    }),
                }
            }
        }
    }
}

/// Overlay formatter fields onto the record. Nulls count as "not supplied"
/// and leave the default in place.
fn merge(record: &mut Map<String, Value>, overlay: PartialRecord) {
    for (key, value) in overlay {
        if !value.is_null() {
            record.insert(key, value);
        }
    }
}

fn decode(record: Map<String, Value>) -> Result<Record, SchemaError> {
    schema::validate(&record)?;
    serde_json::from_value(Value::Object(record)).map_err(|e| SchemaError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::FnFormatter;
    use serde_json::json;

    fn normalizer() -> Normalizer {
        Normalizer::new("test-host", Arc::new(FormatterRegistry::with_builtins()))
    }

    fn fields(value: Value) -> PartialRecord {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let formatter = FnFormatter::new("empty", |_: &str| {
            Ok(FormatOutput::Record(PartialRecord::new()))
        });

        let normalized = normalizer()
            .normalize("/var/log/a.log", &formatter, "hello")
            .unwrap();
        let record = match normalized {
            Normalized::Formatted(record) => record,
            other => panic!("unexpected {other:?}"),
        };

        assert_eq!(record.source_path, "/var/log/a.log");
        assert_eq!(record.host, "test-host");
        assert_eq!(record.formatter_name, "empty");
        assert_eq!(record.raw, "hello");
        assert_eq!(record.kind, "log");
        assert_eq!(record.level, "debug");
        assert_eq!(record.event, "event");
        assert!(record.data.is_empty());
        assert!(!record.error);
        assert_eq!(record.id.len(), 32);
    }

    #[test]
    fn test_formatter_fields_override_defaults() {
        let formatter = FnFormatter::new("custom", |_: &str| {
            Ok(FormatOutput::Record(fields(json!({
                "id": "my-id",
                "level": "error",
                "timestamp": "2020-01-01T00:00:00",
                "event": null,
                "data": { "k": "v" }
            }))))
        });

        let record = normalizer()
            .normalize("/a", &formatter, "x")
            .unwrap()
            .into_record();

        assert_eq!(record.id, "my-id");
        assert_eq!(record.level, "error");
        assert_eq!(record.timestamp, "2020-01-01T00:00:00");
        assert_eq!(record.event, "event");
        assert_eq!(record.data["k"], json!("v"));
    }

    #[test]
    fn test_data_duplicates_are_flattened() {
        let formatter = FnFormatter::new("dup", |_: &str| {
            Ok(FormatOutput::Record(fields(json!({
                "data": { "level": "warning", "user": "root" }
            }))))
        });

        let record = normalizer()
            .normalize("/a", &formatter, "x")
            .unwrap()
            .into_record();

        assert_eq!(record.level, "warning");
        assert!(!record.data.contains_key("level"));
        assert_eq!(record.data["user"], json!("root"));
    }

    #[test]
    fn test_json_key_colliding_with_record_field_is_kept() {
        let record = normalizer()
            .normalize(
                "/a",
                &crate::formatter::builtin::Json,
                r#"{"msg":"hi","host":7}"#,
            )
            .unwrap()
            .into_record();

        assert_eq!(record.host, "7");
        assert_eq!(record.data["msg"], json!("hi"));
        assert!(!record.data.contains_key("host"));
    }

    #[test]
    fn test_format_error_still_produces_record() {
        let normalized = normalizer()
            .normalize("/a", &crate::formatter::builtin::Json, "not json")
            .unwrap();

        match normalized {
            Normalized::FormatFailed(record) => {
                assert!(record.error);
                assert_eq!(record.raw, "not json");
                assert!(record.error_trace.unwrap().starts_with("json: invalid json"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_wrong_typed_field_is_rejected() {
        let formatter = FnFormatter::new("bad", |_: &str| {
            Ok(FormatOutput::Record(fields(json!({ "level": 3 }))))
        });

        let err = normalizer().normalize("/a", &formatter, "x").unwrap_err();
        assert!(matches!(err, SchemaError::WrongType { field: "level", .. }));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let formatter = FnFormatter::new("extra", |_: &str| {
            Ok(FormatOutput::Record(fields(json!({ "severity": "high" }))))
        });

        let err = normalizer().normalize("/a", &formatter, "x").unwrap_err();
        assert_eq!(err, SchemaError::UnknownField("severity".to_string()));
    }

    #[test]
    fn test_redirect_is_resolved_once() {
        let inner = json!({
            "message": "{\"level\": \"info\", \"event\": \"login\", \"user\": \"bob\"}",
            "host": "container-1",
            "extra": { "formatter": "json" }
        });
        let line = json!({ "msg": inner.to_string() }).to_string();

        let record = normalizer()
            .normalize("/a", &crate::formatter::builtin::DockerFileDriver, &line)
            .unwrap()
            .into_record();

        assert_eq!(record.formatter_name, "json");
        assert_eq!(record.host, "container-1");
        assert_eq!(record.level, "info");
        assert_eq!(record.event, "login");
        assert_eq!(record.data["user"], json!("bob"));
        assert_eq!(record.raw, line);
    }

    #[test]
    fn test_nested_redirect_is_a_format_error() {
        let mut registry = FormatterRegistry::new();
        registry.register(Arc::new(FnFormatter::new("loop", |raw: &str| {
            Ok(FormatOutput::Redirect {
                formatter: "loop".to_string(),
                raw: raw.to_string(),
                fields: PartialRecord::new(),
            })
        })));
        let normalizer = Normalizer::new("h", Arc::new(registry.clone()));
        let formatter = registry.resolve("loop").unwrap();

        let normalized = normalizer.normalize("/a", formatter.as_ref(), "x").unwrap();
        match normalized {
            Normalized::FormatFailed(record) => {
                assert!(record.error_trace.unwrap().contains("redirected again"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_redirect_to_unknown_formatter() {
        let formatter = FnFormatter::new("outer", |_: &str| {
            Ok(FormatOutput::Redirect {
                formatter: "nope".to_string(),
                raw: String::new(),
                fields: PartialRecord::new(),
            })
        });

        let normalized = normalizer().normalize("/a", &formatter, "x").unwrap();
        assert!(matches!(normalized, Normalized::FormatFailed(_)));
    }
}
