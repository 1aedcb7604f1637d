pub mod normalizer;
pub mod schema;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use normalizer::{Normalized, Normalizer};
pub use schema::SchemaError;

/// The normalized unit shipped to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Absolute path of the originating file at enqueue time
    pub source_path: String,
    pub host: String,
    pub formatter_name: String,
    /// Original line(s), newline-joined when reassembled
    pub raw: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub level: String,
    pub event: String,
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_trace: Option<String>,
}

impl Record {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
