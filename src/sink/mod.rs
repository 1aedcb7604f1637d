//! Message broker endpoints records are delivered to.

pub mod memory;
pub mod nsq;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemorySink;
pub use nsq::NsqSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink returned error status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("topic '{0}' missing at sink")]
    TopicMissing(String),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// A depth-observable broker endpoint. Errors are transport failures; a full
/// sink is reported through [`Sink::is_ready`], not as an error.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Create `topic` if it does not exist yet
    async fn ensure_topic(&self, topic: &str) -> Result<()>;

    /// Whether `topic` has room for more messages
    async fn is_ready(&self, topic: &str) -> Result<bool>;

    /// Deliver `messages` to `topic` in order
    async fn publish(&self, topic: &str, messages: &[String]) -> Result<()>;
}
