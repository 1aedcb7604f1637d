use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host identity stamped on every record; defaults to the machine hostname
    #[serde(default)]
    pub host: Option<String>,
    pub sources: Vec<SourceConfig>,
    pub sink: SinkConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub tailer: TailerConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Config {
    /// Resolve the host identity, falling back to the machine hostname
    pub fn host_identity(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.to_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// One `(glob_pattern, formatter_name)` pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub pattern: String,
    pub formatter: String,
    /// Regex that marks continuation lines, overriding the formatter's own predicate
    #[serde(default)]
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub address: String,
    pub topic: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: u64,
    #[serde(default = "default_heartbeat_topic")]
    pub heartbeat_topic: String,
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl SinkConfig {
    pub fn new(address: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topic: topic.into(),
            max_depth: default_max_depth(),
            heartbeat_topic: default_heartbeat_topic(),
            timeout: default_sink_timeout(),
        }
    }
}

fn default_max_depth() -> u64 {
    1_000_000
}

fn default_heartbeat_topic() -> String {
    "Heartbeat#ephemeral".to_string()
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/state")))
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("logship")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Bounded wait of a single `put` attempt before it logs and retries
    #[serde(default = "default_one_second", with = "humantime_serde")]
    pub put_timeout: Duration,
    /// How long the sender waits on an empty queue before re-checking its flush timer
    #[serde(default = "default_one_second", with = "humantime_serde")]
    pub get_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            put_timeout: default_one_second(),
            get_timeout: default_one_second(),
        }
    }
}

fn default_queue_capacity() -> usize {
    2000
}

fn default_one_second() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_one_second", with = "humantime_serde")]
    pub max_batch_age: Duration,
    /// Fixed wait between readiness checks and between failed deliveries
    #[serde(default = "default_one_second", with = "humantime_serde")]
    pub retry_wait: Duration,
    #[serde(default = "default_one_second", with = "humantime_serde")]
    pub restart_delay: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: default_max_batch_bytes(),
            max_batch_age: default_one_second(),
            retry_wait: default_one_second(),
            restart_delay: default_one_second(),
        }
    }
}

fn default_max_batch_bytes() -> usize {
    5_000_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailerConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub restart_delay: Duration,
    /// Flush a pending multi-line group once the file has been idle this long.
    /// Unset keeps the group until a definitive record boundary arrives.
    #[serde(default, with = "humantime_serde")]
    pub flush_pending_after: Option<Duration>,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            restart_delay: default_poll_interval(),
            flush_pending_after: None,
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_thirty_seconds", with = "humantime_serde")]
    pub interval: Duration,
    /// Stop and forget tailers whose files have disappeared
    #[serde(default)]
    pub retire_missing: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: default_thirty_seconds(),
            retire_missing: false,
        }
    }
}

fn default_thirty_seconds() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_enabled")]
    pub enabled: bool,
    #[serde(default = "default_thirty_seconds", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_thirty_seconds", with = "humantime_serde")]
    pub restart_delay: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_heartbeat_enabled(),
            interval: default_thirty_seconds(),
            restart_delay: default_thirty_seconds(),
        }
    }
}

fn default_heartbeat_enabled() -> bool {
    true
}
