use super::queue::QueuedMessage;
use crate::storage::{FileCursor, Incarnation};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Offset to confirm for one file incarnation after a delivery
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub source: PathBuf,
    pub incarnation: Incarnation,
    pub offset: u64,
    pub cursor: Arc<FileCursor>,
}

/// Messages accumulated by the sender between two deliveries
#[derive(Debug, Default)]
pub struct Batch {
    messages: Vec<QueuedMessage>,
    bytes: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: QueuedMessage) {
        self.bytes += message.payload.len();
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn payloads(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.payload.clone()).collect()
    }

    /// One confirmation per file incarnation in the batch, carrying the
    /// highest end offset seen for it regardless of dequeue order
    pub fn confirmations(&self) -> Vec<Confirmation> {
        let mut index: HashMap<(&PathBuf, Incarnation), usize> = HashMap::new();
        let mut confirmations: Vec<Confirmation> = Vec::new();

        for message in &self.messages {
            match index.get(&(&message.source, message.incarnation)) {
                Some(&i) => {
                    let confirmation = &mut confirmations[i];
                    confirmation.offset = confirmation.offset.max(message.end_offset);
                }
                None => {
                    index.insert((&message.source, message.incarnation), confirmations.len());
                    confirmations.push(Confirmation {
                        source: message.source.clone(),
                        incarnation: message.incarnation,
                        offset: message.end_offset,
                        cursor: Arc::clone(&message.cursor),
                    });
                }
            }
        }

        confirmations
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.bytes = 0;
    }
}

/// Size and age thresholds that close a batch
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub max_bytes: usize,
    pub max_age: Duration,
}

impl FlushPolicy {
    /// An empty batch is never due
    pub fn is_due(&self, batch: &Batch, since_last_push: Duration) -> bool {
        !batch.is_empty() && (batch.bytes() >= self.max_bytes || since_last_push >= self.max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CursorStore;
    use std::path::Path;
    use tempfile::tempdir;

    use crate::source::FileIdentity;

    const ID_A: Incarnation = Incarnation {
        identity: FileIdentity { dev: 1, inode: 1 },
        generation: 1,
    };
    const ID_B: Incarnation = Incarnation {
        identity: FileIdentity { dev: 1, inode: 2 },
        generation: 1,
    };

    async fn cursor(dir: &Path, source: &str) -> Arc<FileCursor> {
        Arc::new(CursorStore::new(dir).open(Path::new(source)).await.unwrap())
    }

    fn message(
        payload: &str,
        source: &str,
        incarnation: Incarnation,
        end_offset: u64,
        cursor: &Arc<FileCursor>,
    ) -> QueuedMessage {
        QueuedMessage {
            payload: payload.to_string(),
            source: PathBuf::from(source),
            incarnation,
            end_offset,
            cursor: Arc::clone(cursor),
        }
    }

    #[tokio::test]
    async fn test_confirmations_keep_max_offset_per_identity() {
        let dir = tempdir().unwrap();
        let a = cursor(dir.path(), "/a").await;
        let b = cursor(dir.path(), "/b").await;

        let mut batch = Batch::new();
        batch.push(message("1", "/a", ID_A, 10, &a));
        batch.push(message("2", "/b", ID_B, 7, &b));
        batch.push(message("3", "/a", ID_A, 30, &a));
        batch.push(message("4", "/a", ID_A, 20, &a));

        let confirmations = batch.confirmations();
        assert_eq!(confirmations.len(), 2);
        assert_eq!(confirmations[0].source, PathBuf::from("/a"));
        assert_eq!(confirmations[0].offset, 30);
        assert_eq!(confirmations[1].source, PathBuf::from("/b"));
        assert_eq!(confirmations[1].offset, 7);
    }

    #[tokio::test]
    async fn test_rotated_file_gets_separate_confirmation() {
        let dir = tempdir().unwrap();
        let a = cursor(dir.path(), "/a").await;

        let mut batch = Batch::new();
        batch.push(message("old", "/a", ID_A, 500, &a));
        batch.push(message("new", "/a", ID_B, 4, &a));

        let confirmations = batch.confirmations();
        assert_eq!(confirmations.len(), 2);
        assert_eq!(confirmations[1].incarnation, ID_B);
        assert_eq!(confirmations[1].offset, 4);
    }

    #[tokio::test]
    async fn test_truncated_file_never_inherits_the_old_maximum() {
        let dir = tempdir().unwrap();
        let a = cursor(dir.path(), "/a").await;
        let before = a.reset(ID_A.identity).await.unwrap();

        // Records from before and after an in-place truncation share one batch
        let mut batch = Batch::new();
        batch.push(message("old", "/a", before, 36, &a));
        let after = a.reset(ID_A.identity).await.unwrap();
        batch.push(message("new", "/a", after, 5, &a));

        let confirmations = batch.confirmations();
        assert_eq!(confirmations.len(), 2);
        assert_eq!(confirmations[0].incarnation, before);
        assert_eq!(confirmations[1].incarnation, after);
        assert_eq!(confirmations[1].offset, 5);

        for confirmation in &confirmations {
            a.advance(confirmation.incarnation, confirmation.offset)
                .await
                .unwrap();
        }
        assert_eq!(a.offset().await, 5);
    }

    #[tokio::test]
    async fn test_overlapping_batches_never_regress_the_cursor() {
        let dir = tempdir().unwrap();
        let a = cursor(dir.path(), "/a").await;
        let current = a.reset(ID_A.identity).await.unwrap();

        let mut first = Batch::new();
        first.push(message("1", "/a", current, 10, &a));
        first.push(message("3", "/a", current, 30, &a));
        let mut second = Batch::new();
        second.push(message("2", "/a", current, 20, &a));
        second.push(message("4", "/a", current, 25, &a));

        // The batch reaching further confirms before the other one lands
        for batch in [&first, &second] {
            for confirmation in batch.confirmations() {
                a.advance(confirmation.incarnation, confirmation.offset)
                    .await
                    .unwrap();
            }
        }
        assert_eq!(a.offset().await, 30);
    }

    #[tokio::test]
    async fn test_flush_policy() {
        let dir = tempdir().unwrap();
        let a = cursor(dir.path(), "/a").await;
        let policy = FlushPolicy {
            max_bytes: 10,
            max_age: Duration::from_secs(1),
        };

        let mut batch = Batch::new();
        assert!(!policy.is_due(&batch, Duration::from_secs(60)));

        batch.push(message("12345", "/a", ID_A, 6, &a));
        assert_eq!(batch.bytes(), 5);
        assert!(!policy.is_due(&batch, Duration::from_millis(10)));
        assert!(policy.is_due(&batch, Duration::from_secs(1)));

        batch.push(message("67890", "/a", ID_A, 12, &a));
        assert!(policy.is_due(&batch, Duration::ZERO));

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.bytes(), 0);
    }
}
