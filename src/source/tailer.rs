use super::assembler::{CompletedRecord, LineAssembler};
use super::identity::{FileIdentity, IdentitySet};
use crate::config::types::TailerConfig;
use crate::formatter::Formatter;
use crate::pipeline::{QueueError, QueueProducer, QueuedMessage};
use crate::record::{Normalized, Normalizer};
use crate::storage::{CursorError, FileCursor, Incarnation};
use crate::supervisor::Service;
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TailerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cursor error: {0}")]
    Cursor(#[from] CursorError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Open handle on one file incarnation plus everything read but not yet
/// enqueued
struct ReadState {
    incarnation: Incarnation,
    reader: BufReader<File>,
    /// Position just past the last byte read, partial line included
    read_offset: u64,
    /// End offset of the last record handed to the queue
    enqueued_offset: u64,
    /// Bytes of a line whose newline has not been written yet
    partial: Vec<u8>,
    assembler: LineAssembler,
    last_growth: Instant,
}

/// Follows one file, turning appended lines into queued records
pub struct Tailer {
    path: PathBuf,
    source_path: String,
    formatter: Arc<dyn Formatter>,
    normalizer: Arc<Normalizer>,
    cursor: Arc<FileCursor>,
    queue: QueueProducer<QueuedMessage>,
    poll_interval: Duration,
    flush_pending_after: Option<Duration>,
    state: Option<ReadState>,
    /// Where to reopen after a failure, if the same incarnation is still there
    resume_at: Option<(Incarnation, u64)>,
    followed: IdentitySet,
}

impl Tailer {
    pub fn new(
        path: PathBuf,
        formatter: Arc<dyn Formatter>,
        normalizer: Arc<Normalizer>,
        cursor: Arc<FileCursor>,
        queue: QueueProducer<QueuedMessage>,
        config: &TailerConfig,
    ) -> Self {
        Self {
            source_path: path.to_string_lossy().into_owned(),
            path,
            formatter,
            normalizer,
            cursor,
            queue,
            poll_interval: config.poll_interval,
            flush_pending_after: config.flush_pending_after,
            state: None,
            resume_at: None,
            followed: IdentitySet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identities this tailer has read from, updated as it follows rotations
    pub fn followed(&self) -> IdentitySet {
        self.followed.clone()
    }

    /// Current read position, if the file is open
    pub fn read_offset(&self) -> Option<u64> {
        self.state.as_ref().map(|s| s.read_offset)
    }

    /// Read everything currently available and enqueue the completed records.
    /// On failure the open handle is dropped; the next call reopens the file.
    pub async fn poll_once(&mut self) -> Result<(), TailerError> {
        let result = self.poll_inner().await;
        if result.is_err() {
            if let Some(state) = self.state.take() {
                self.resume_at = Some((state.incarnation, state.enqueued_offset));
            }
        }
        result
    }

    async fn poll_inner(&mut self) -> Result<(), TailerError> {
        if self.state.is_none() {
            self.state = Some(self.open().await?);
        }

        self.check_rotation().await?;
        let grew = self.drain().await?;

        if let Some(after) = self.flush_pending_after {
            let idle = self.state.as_mut().and_then(|state| {
                let quiet = !grew && state.last_growth.elapsed() >= after;
                if quiet {
                    state.assembler.flush()
                } else {
                    None
                }
            });
            if let Some(record) = idle {
                debug!(path = %self.path.display(), "Flushing idle multi-line record");
                self.emit(record).await?;
            }
        }

        Ok(())
    }

    async fn open(&mut self) -> Result<ReadState, TailerError> {
        let file = File::open(&self.path).await?;
        let metadata = file.metadata().await?;
        let identity = FileIdentity::from_metadata(&metadata);

        let (incarnation, offset) = match self.resume_at.take() {
            Some((previous, offset))
                if previous.identity == identity && offset <= metadata.len() =>
            {
                (previous, offset)
            }
            _ => self.cursor.resume(identity, metadata.len()).await?,
        };
        self.followed.insert(identity);

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset)).await?;
        info!(
            path = %self.path.display(),
            incarnation = %incarnation,
            offset,
            "Tailing file"
        );

        Ok(ReadState {
            incarnation,
            reader,
            read_offset: offset,
            enqueued_offset: offset,
            partial: Vec::new(),
            assembler: LineAssembler::new(self.formatter.supports_multiline()),
            last_growth: Instant::now(),
        })
    }

    /// Handle a replaced or truncated file before reading
    async fn check_rotation(&mut self) -> Result<(), TailerError> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            // Moved away and not recreated yet; keep reading the open handle
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let identity = FileIdentity::from_metadata(&metadata);

        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        if identity != state.incarnation.identity {
            info!(
                path = %self.path.display(),
                old = %state.incarnation.identity,
                new = %identity,
                "File rotated, reading new file from the top"
            );
            // Whatever the old incarnation still holds is its final content
            self.drain().await?;
            if let Some(record) = self.state.as_mut().and_then(|s| s.assembler.flush()) {
                self.emit(record).await?;
            }

            self.cursor.reset(identity).await?;
            self.state = Some(self.open().await?);
            return Ok(());
        }

        if metadata.len() < state.read_offset {
            warn!(
                path = %self.path.display(),
                size = metadata.len(),
                offset = state.read_offset,
                "File truncated, reading from the top"
            );
            state.reader.seek(SeekFrom::Start(0)).await?;
            state.read_offset = 0;
            state.enqueued_offset = 0;
            state.partial.clear();
            state.assembler.clear();
            // Records still in flight belong to the previous incarnation
            state.incarnation = self.cursor.reset(identity).await?;
        }

        Ok(())
    }

    /// Read to the current end of file. Returns whether any bytes arrived.
    async fn drain(&mut self) -> Result<bool, TailerError> {
        let mut grew = false;
        let mut buf = Vec::new();

        loop {
            let Some(state) = self.state.as_mut() else {
                return Ok(grew);
            };

            buf.clear();
            let n = state.reader.read_until(b'\n', &mut buf).await?;
            if n == 0 {
                break;
            }
            grew = true;
            state.read_offset += n as u64;
            state.last_growth = Instant::now();

            if buf.last() != Some(&b'\n') {
                state.partial.extend_from_slice(&buf);
                continue;
            }

            let mut bytes = std::mem::take(&mut state.partial);
            bytes.extend_from_slice(&buf[..buf.len() - 1]);
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            let line = String::from_utf8_lossy(&bytes).into_owned();

            let continuation = self.formatter.is_continuation(&line);
            if let Some(record) = state.assembler.push(line, state.read_offset, continuation) {
                self.emit(record).await?;
            }
        }

        Ok(grew)
    }

    async fn emit(&mut self, record: CompletedRecord) -> Result<(), TailerError> {
        let Some(incarnation) = self.state.as_ref().map(|s| s.incarnation) else {
            return Ok(());
        };

        match self
            .normalizer
            .normalize(&self.source_path, self.formatter.as_ref(), &record.raw)
        {
            Ok(normalized) => {
                if let Normalized::FormatFailed(failed) = &normalized {
                    debug!(
                        path = %self.path.display(),
                        error = failed.error_trace.as_deref().unwrap_or_default(),
                        "Enqueuing record that failed to format"
                    );
                }
                let payload = normalized.record().to_json()?;
                self.queue
                    .put(QueuedMessage {
                        payload,
                        source: self.path.clone(),
                        incarnation,
                        end_offset: record.end_offset,
                        cursor: Arc::clone(&self.cursor),
                    })
                    .await?;
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    formatter = self.formatter.name(),
                    error = %e,
                    "Dropping record that fails schema validation"
                );
            }
        }

        if let Some(state) = self.state.as_mut() {
            state.enqueued_offset = record.end_offset;
        }
        Ok(())
    }

    /// Poll until cancelled
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), TailerError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.poll_once() => result?,
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[async_trait]
impl Service for Tailer {
    type Error = TailerError;

    fn name(&self) -> String {
        format!("tailer:{}", self.path.display())
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<(), TailerError> {
        Tailer::run(self, cancel).await
    }
}
