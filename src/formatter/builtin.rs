use super::{FormatError, FormatOutput, Formatter, PartialRecord};
use chrono::DateTime;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub fn all() -> Vec<Arc<dyn Formatter>> {
    vec![
        Arc::new(Raw),
        Arc::new(Json),
        Arc::new(NginxAccess),
        Arc::new(MongoDb::new()),
        Arc::new(DockerFileDriver),
        Arc::new(PythonTraceback::new()),
    ]
}

fn literal_regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("builtin formatter pattern is valid")
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, FormatError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(FormatError::Malformed(format!(
            "expected a JSON object, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The whole line as `data.message`
pub struct Raw;

impl Formatter for Raw {
    fn name(&self) -> &str {
        "raw"
    }

    fn parse(&self, raw: &str) -> Result<FormatOutput, FormatError> {
        let mut fields = PartialRecord::new();
        fields.insert("data".to_string(), json!({ "message": raw }));
        Ok(FormatOutput::Record(fields))
    }
}

/// One JSON object per line. Standard record keys found in the object are
/// lifted to the top level (as strings); everything else stays in `data`.
pub struct Json;

const LIFTED_KEYS: [&str; 5] = ["id", "timestamp", "type", "level", "event"];

impl Formatter for Json {
    fn name(&self) -> &str {
        "json"
    }

    fn parse(&self, raw: &str) -> Result<FormatOutput, FormatError> {
        let mut data = parse_object(raw)?;
        let mut fields = PartialRecord::new();

        for key in LIFTED_KEYS {
            match data.remove(key) {
                Some(Value::String(s)) => {
                    fields.insert(key.to_string(), Value::String(s));
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    fields.insert(key.to_string(), Value::String(other.to_string()));
                }
            }
        }

        fields.insert("data".to_string(), Value::Object(data));
        Ok(FormatOutput::Record(fields))
    }
}

/// nginx access log written with a JSON `log_format`
pub struct NginxAccess;

impl NginxAccess {
    fn number(value: Option<&Value>) -> Result<f64, FormatError> {
        match value {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| FormatError::Malformed(format!("number out of range: {}", n))),
            Some(Value::String(s)) if s.contains('-') && s.trim_matches('-').is_empty() => Ok(0.0),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| FormatError::Malformed(format!("not a number: '{}'", s))),
            Some(other) => Err(FormatError::Malformed(format!(
                "expected a number, found {}",
                json_kind(other)
            ))),
            None => Ok(0.0),
        }
    }
}

impl Formatter for NginxAccess {
    fn name(&self) -> &str {
        "nginx_access"
    }

    fn parse(&self, raw: &str) -> Result<FormatOutput, FormatError> {
        let mut log = parse_object(raw)?;

        let epoch = Self::number(log.get("timestamp"))?;
        let secs = epoch.trunc() as i64;
        let micros = ((epoch.fract() * 1e6).round() as u32).min(999_999);
        let timestamp = DateTime::from_timestamp(secs, micros * 1000)
            .ok_or_else(|| FormatError::Malformed(format!("timestamp out of range: {}", epoch)))?
            .naive_utc()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string();
        log.insert("timestamp".to_string(), Value::String(timestamp.clone()));

        for key in ["body_bytes_sent", "request_time", "upstream_response_time"] {
            let value = Self::number(log.get(key))?;
            log.insert(key.to_string(), json!(value));
        }

        let method = log
            .get("request")
            .and_then(Value::as_str)
            .and_then(|request| request.split(' ').next())
            .filter(|method| !method.is_empty())
            .ok_or_else(|| FormatError::Malformed("missing request line".to_string()))?;
        let event = format!("{}_request", method);

        let mut fields = PartialRecord::new();
        fields.insert("timestamp".to_string(), Value::String(timestamp));
        fields.insert("type".to_string(), json!("metric"));
        fields.insert("event".to_string(), Value::String(event));
        fields.insert("data".to_string(), Value::Object(log));
        Ok(FormatOutput::Record(fields))
    }
}

/// `timestamp severity component context message`, whitespace separated
pub struct MongoDb {
    separator: Regex,
}

impl MongoDb {
    pub fn new() -> Self {
        Self {
            separator: literal_regex(r"\s+"),
        }
    }
}

impl Default for MongoDb {
    fn default() -> Self {
        Self::new()
    }
}

impl Formatter for MongoDb {
    fn name(&self) -> &str {
        "mongodb"
    }

    fn parse(&self, raw: &str) -> Result<FormatOutput, FormatError> {
        const KEYS: [&str; 5] = ["timestamp", "severity", "component", "context", "message"];

        let values: Vec<&str> = self.separator.splitn(raw.trim_end(), KEYS.len()).collect();
        let timestamp = match values.first() {
            Some(ts) if !ts.is_empty() => ts.to_string(),
            _ => return Err(FormatError::Malformed("empty mongodb line".to_string())),
        };

        let data: Map<String, Value> = KEYS
            .iter()
            .zip(values.iter())
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();

        let mut fields = PartialRecord::new();
        fields.insert("timestamp".to_string(), Value::String(timestamp));
        fields.insert("type".to_string(), json!("log"));
        fields.insert("data".to_string(), Value::Object(data));
        Ok(FormatOutput::Record(fields))
    }
}

/// Docker `json-file` style envelope: `{"msg": "<json log>"}`. When the inner
/// log names its own formatter under `extra.formatter`, parsing is handed to
/// that formatter with the inner `message` as the raw payload.
pub struct DockerFileDriver;

impl Formatter for DockerFileDriver {
    fn name(&self) -> &str {
        "docker_file_driver"
    }

    fn parse(&self, raw: &str) -> Result<FormatOutput, FormatError> {
        let envelope = parse_object(raw)?;
        let msg = envelope
            .get("msg")
            .and_then(Value::as_str)
            .ok_or_else(|| FormatError::Malformed("envelope has no string 'msg'".to_string()))?;
        let log = parse_object(msg)?;

        let inner_formatter = log
            .get("extra")
            .and_then(|extra| extra.get("formatter"))
            .and_then(Value::as_str);

        if let Some(formatter) = inner_formatter {
            let raw = log
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let mut fields = PartialRecord::new();
            for key in ["host", "timestamp"] {
                if let Some(value @ Value::String(_)) = log.get(key) {
                    fields.insert(key.to_string(), value.clone());
                }
            }

            return Ok(FormatOutput::Redirect {
                formatter: formatter.to_string(),
                raw,
                fields,
            });
        }

        let mut fields = PartialRecord::new();
        if let Some(timestamp @ Value::String(_)) = log.get("timestamp") {
            fields.insert("timestamp".to_string(), timestamp.clone());
        }
        fields.insert("type".to_string(), json!("log"));
        fields.insert("data".to_string(), Value::Object(log));
        Ok(FormatOutput::Record(fields))
    }
}

/// Python `logging` output where tracebacks follow the log line.
/// Indented lines, `Traceback` headers and the final exception line are
/// continuations of the preceding record.
pub struct PythonTraceback {
    header: Regex,
    exception_tail: Regex,
}

impl PythonTraceback {
    pub fn new() -> Self {
        Self {
            header: literal_regex(
                r"^(?P<timestamp>\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?)\s+(?P<level>[A-Z]+)\s+(?P<message>.*)$",
            ),
            exception_tail: literal_regex(r"^[A-Za-z_][\w.]*(?:Error|Exception|Exit|Interrupt)(?::|$)"),
        }
    }
}

impl Default for PythonTraceback {
    fn default() -> Self {
        Self::new()
    }
}

impl Formatter for PythonTraceback {
    fn name(&self) -> &str {
        "python_traceback"
    }

    fn parse(&self, raw: &str) -> Result<FormatOutput, FormatError> {
        let (first, rest) = match raw.split_once('\n') {
            Some((first, rest)) => (first, Some(rest)),
            None => (raw, None),
        };

        let mut fields = PartialRecord::new();
        let mut data = Map::new();

        match self.header.captures(first) {
            Some(caps) => {
                let timestamp = caps["timestamp"].replacen(' ', "T", 1).replace(',', ".");
                fields.insert("timestamp".to_string(), Value::String(timestamp));
                fields.insert("level".to_string(), json!(caps["level"].to_lowercase()));
                data.insert("message".to_string(), json!(&caps["message"]));
            }
            None => {
                data.insert("message".to_string(), json!(first));
            }
        }

        if let Some(rest) = rest {
            data.insert("traceback".to_string(), json!(rest));
        }

        fields.insert("data".to_string(), Value::Object(data));
        Ok(FormatOutput::Record(fields))
    }

    fn supports_multiline(&self) -> bool {
        true
    }

    fn is_continuation(&self, line: &str) -> bool {
        line.starts_with(char::is_whitespace)
            || line.starts_with("Traceback (most recent call last)")
            || line.starts_with("During handling of the above exception")
            || self.exception_tail.is_match(line)
    }
}
