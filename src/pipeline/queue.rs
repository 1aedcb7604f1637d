use crate::storage::{FileCursor, Incarnation};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
}

/// A serialized record on its way to the sink, with what the sender needs
/// to confirm it back to the file's cursor
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: String,
    pub source: PathBuf,
    pub incarnation: Incarnation,
    /// Offset just past the record's last byte
    pub end_offset: u64,
    pub cursor: Arc<FileCursor>,
}

/// Create a bounded FIFO. Producers block while it is full; nothing is
/// ever dropped.
pub fn bounded<T>(
    capacity: usize,
    put_timeout: Duration,
    get_timeout: Duration,
) -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueueProducer { tx, put_timeout },
        QueueConsumer { rx, get_timeout },
    )
}

#[derive(Debug)]
pub struct QueueProducer<T> {
    tx: mpsc::Sender<T>,
    put_timeout: Duration,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            put_timeout: self.put_timeout,
        }
    }
}

impl<T> QueueProducer<T> {
    /// Enqueue `item`, waiting as long as the queue stays full. Each
    /// `put_timeout` spent waiting is logged as backpressure.
    pub async fn put(&self, item: T) -> Result<(), QueueError> {
        let mut item = item;
        loop {
            match self.tx.send_timeout(item, self.put_timeout).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    tracing::warn!(
                        capacity = self.capacity(),
                        "Queue full, applying backpressure"
                    );
                    item = returned;
                }
                Err(SendTimeoutError::Closed(_)) => return Err(QueueError::Closed),
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct QueueConsumer<T> {
    rx: mpsc::Receiver<T>,
    get_timeout: Duration,
}

impl<T> QueueConsumer<T> {
    /// Wait up to `get_timeout` for the next item. `Ok(None)` means the wait
    /// timed out; `Err` means every producer is gone and the queue is drained.
    pub async fn get(&mut self) -> Result<Option<T>, QueueError> {
        match tokio::time::timeout(self.get_timeout, self.rx.recv()).await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Ok(None),
        }
    }

    /// Take an item only if one is already waiting
    pub fn try_get(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = bounded(4, Duration::from_millis(50), Duration::from_millis(50));
        for i in 0..3 {
            tx.put(i).await.unwrap();
        }
        assert_eq!(tx.len(), 3);

        assert_eq!(rx.get().await.unwrap(), Some(0));
        assert_eq!(rx.get().await.unwrap(), Some(1));
        assert_eq!(rx.get().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_get_times_out_when_empty() {
        let (_tx, mut rx) = bounded::<u32>(2, Duration::from_millis(10), Duration::from_millis(20));
        assert_eq!(rx.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_reports_closed_after_producers_drop() {
        let (tx, mut rx) = bounded(2, Duration::from_millis(10), Duration::from_millis(20));
        tx.put("last").await.unwrap();
        drop(tx);

        assert_eq!(rx.get().await.unwrap(), Some("last"));
        assert_eq!(rx.get().await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_third_put_blocks_until_a_get() {
        let (tx, mut rx) = bounded(2, Duration::from_millis(10), Duration::from_millis(100));

        let mut producers = Vec::new();
        for i in 0..2 {
            let tx = tx.clone();
            producers.push(tokio::spawn(async move { tx.put(i).await }));
        }
        for handle in producers {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(tx.len(), 2);

        let third = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.put(2).await })
        };

        // Still blocked well past several put timeouts
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!third.is_finished());
        assert_eq!(tx.len(), 2);

        assert_eq!(rx.get().await.unwrap(), Some(0));
        tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .expect("put should complete after a get")
            .unwrap()
            .unwrap();
        assert_eq!(tx.len(), 2);
    }

    #[tokio::test]
    async fn test_try_get() {
        let (tx, mut rx) = bounded(2, Duration::from_millis(10), Duration::from_millis(10));
        assert_eq!(rx.try_get(), None);
        tx.put(7).await.unwrap();
        assert_eq!(rx.try_get(), Some(7));
    }
}
