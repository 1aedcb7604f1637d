use crate::sink::{Sink, SinkError};
use crate::supervisor::Service;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("sink not ready for heartbeat")]
    NotReady,

    #[error("failed to encode heartbeat: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatPayload {
    pub host: String,
    pub heartbeat_number: u64,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

/// Periodic liveness signal published straight to the sink, outside the
/// record queue
pub struct Heartbeat {
    sink: Arc<dyn Sink>,
    topic: String,
    host: String,
    interval: Duration,
    sequence: u64,
}

impl Heartbeat {
    pub fn new(
        sink: Arc<dyn Sink>,
        topic: impl Into<String>,
        host: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            sink,
            topic: topic.into(),
            host: host.into(),
            interval,
            sequence: 0,
        }
    }

    /// Number of heartbeats delivered so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn payload(&self) -> HeartbeatPayload {
        let now = chrono::Utc::now();
        HeartbeatPayload {
            host: self.host.clone(),
            heartbeat_number: self.sequence,
            timestamp: now.timestamp_micros() as f64 / 1e6,
        }
    }

    /// Send one heartbeat. The sequence number moves only on success.
    pub async fn beat(&mut self) -> Result<(), HeartbeatError> {
        if !self.sink.is_ready(&self.topic).await? {
            return Err(HeartbeatError::NotReady);
        }

        let payload = serde_json::to_string(&self.payload())?;
        self.sink.publish(&self.topic, &[payload]).await?;
        tracing::debug!(
            topic = %self.topic,
            heartbeat_number = self.sequence,
            "Heartbeat sent"
        );
        self.sequence += 1;
        Ok(())
    }

    /// Beat on every interval until cancelled. An `Err` return is meant to be
    /// restarted by the caller.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), HeartbeatError> {
        loop {
            self.beat().await?;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[async_trait]
impl Service for Heartbeat {
    type Error = HeartbeatError;

    fn name(&self) -> String {
        format!("heartbeat:{}", self.topic)
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<(), HeartbeatError> {
        Heartbeat::run(self, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use serde_json::Value;

    #[tokio::test]
    async fn test_sequence_increments_on_success() {
        let sink = Arc::new(MemorySink::new());
        let mut heartbeat = Heartbeat::new(
            sink.clone(),
            "Heartbeat#ephemeral",
            "web-1",
            Duration::from_secs(30),
        );

        heartbeat.beat().await.unwrap();
        heartbeat.beat().await.unwrap();

        let published = sink.published("Heartbeat#ephemeral");
        assert_eq!(published.len(), 2);

        let second: Value = serde_json::from_str(&published[1]).unwrap();
        assert_eq!(second["host"], "web-1");
        assert_eq!(second["heartbeat_number"], 1);
        assert!(second["timestamp"].as_f64().unwrap() > 1_500_000_000.0);
        assert_eq!(heartbeat.sequence(), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_sequence() {
        let sink = Arc::new(MemorySink::new());
        let mut heartbeat = Heartbeat::new(sink.clone(), "hb", "h", Duration::from_secs(30));

        sink.set_failing(true);
        assert!(matches!(heartbeat.beat().await, Err(HeartbeatError::Sink(_))));
        sink.set_failing(false);
        sink.set_ready(false);
        assert!(matches!(heartbeat.beat().await, Err(HeartbeatError::NotReady)));
        assert_eq!(heartbeat.sequence(), 0);

        sink.set_ready(true);
        heartbeat.beat().await.unwrap();
        let first: Value = serde_json::from_str(&sink.published("hb")[0]).unwrap();
        assert_eq!(first["heartbeat_number"], 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let sink = Arc::new(MemorySink::new());
        let mut heartbeat = Heartbeat::new(sink.clone(), "hb", "h", Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                heartbeat.run(&cancel).await.unwrap();
                heartbeat.sequence()
            })
        };

        sink.wait_for("hb", 3, Duration::from_secs(2)).await;
        cancel.cancel();
        let sequence = task.await.unwrap();
        assert!(sequence >= 3);
    }
}
