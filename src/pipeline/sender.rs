use super::batch::{Batch, FlushPolicy};
use super::queue::{QueueConsumer, QueueError, QueuedMessage};
use crate::config::types::SenderConfig;
use crate::sink::{Sink, SinkError};
use crate::storage::CursorError;
use crate::supervisor::Service;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("failed to persist confirmed offset: {0}")]
    Cursor(#[from] CursorError),
}

enum Attempt {
    Delivered,
    SinkFull,
}

/// Drains the queue into batches and delivers them to the sink.
///
/// Offsets are confirmed only after the sink accepted the whole batch, so a
/// crash in between replays records instead of losing them.
pub struct Sender {
    sink: Arc<dyn Sink>,
    topic: String,
    queue: QueueConsumer<QueuedMessage>,
    policy: FlushPolicy,
    retry_wait: Duration,
    batch: Batch,
    last_push: Instant,
}

impl Sender {
    pub fn new(
        sink: Arc<dyn Sink>,
        topic: impl Into<String>,
        queue: QueueConsumer<QueuedMessage>,
        config: &SenderConfig,
    ) -> Self {
        Self {
            sink,
            topic: topic.into(),
            queue,
            policy: FlushPolicy {
                max_bytes: config.max_batch_bytes,
                max_age: config.max_batch_age,
            },
            retry_wait: config.retry_wait,
            batch: Batch::new(),
            last_push: Instant::now(),
        }
    }

    /// Run until cancelled or until every producer is gone. The open batch
    /// survives an `Err` return, so calling `run` again resumes it.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), SenderError> {
        info!(topic = %self.topic, "Sender started");

        loop {
            if self.policy.is_due(&self.batch, self.last_push.elapsed()) {
                if !self.deliver(cancel).await {
                    return self.shutdown().await;
                }
                self.confirm().await?;
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.shutdown().await;
                }
                next = self.queue.get() => match next {
                    Ok(Some(message)) => self.batch.push(message),
                    Ok(None) => {}
                    Err(QueueError::Closed) => {
                        info!("Queue closed, sender stopping");
                        return self.shutdown().await;
                    }
                },
            }
        }
    }

    /// Deliver the open batch, retrying without limit. Returns false if
    /// cancelled before the sink accepted it.
    async fn deliver(&self, cancel: &CancellationToken) -> bool {
        let payloads = self.batch.payloads();
        debug!(
            messages = payloads.len(),
            bytes = self.batch.bytes(),
            "Pushing batch"
        );

        loop {
            match self.attempt(&payloads).await {
                Ok(Attempt::Delivered) => return true,
                Ok(Attempt::SinkFull) => {
                    info!(topic = %self.topic, "Sink is full, waiting for it to drain");
                }
                Err(e) => {
                    warn!(
                        topic = %self.topic,
                        messages = payloads.len(),
                        error = %e,
                        "Batch delivery failed, retrying"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_wait) => {}
            }
        }
    }

    async fn attempt(&self, payloads: &[String]) -> Result<Attempt, SinkError> {
        if !self.sink.is_ready(&self.topic).await? {
            return Ok(Attempt::SinkFull);
        }
        self.sink.publish(&self.topic, payloads).await?;
        Ok(Attempt::Delivered)
    }

    /// Advance every file's cursor past what the delivered batch contained
    async fn confirm(&mut self) -> Result<(), SenderError> {
        let confirmations = self.batch.confirmations();
        let delivered = self.batch.len();
        self.batch.clear();
        self.last_push = Instant::now();

        for confirmation in confirmations {
            let moved = confirmation
                .cursor
                .advance(confirmation.incarnation, confirmation.offset)
                .await?;
            debug!(
                path = %confirmation.source.display(),
                offset = confirmation.offset,
                moved,
                "Offset confirmed"
            );
        }

        debug!(messages = delivered, "Batch delivered");
        Ok(())
    }

    /// One last delivery of whatever is already queued, without retrying
    async fn shutdown(&mut self) -> Result<(), SenderError> {
        while let Some(message) = self.queue.try_get() {
            self.batch.push(message);
        }
        if self.batch.is_empty() {
            return Ok(());
        }

        let payloads = self.batch.payloads();
        match self.attempt(&payloads).await {
            Ok(Attempt::Delivered) => {
                info!(messages = payloads.len(), "Delivered final batch");
                self.confirm().await
            }
            Ok(Attempt::SinkFull) => {
                warn!(
                    messages = payloads.len(),
                    "Sink full at shutdown, unsent records will be re-read on restart"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    messages = payloads.len(),
                    error = %e,
                    "Final delivery failed, unsent records will be re-read on restart"
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Service for Sender {
    type Error = SenderError;

    fn name(&self) -> String {
        format!("sender:{}", self.topic)
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<(), SenderError> {
        Sender::run(self, cancel).await
    }
}
