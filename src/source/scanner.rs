use super::identity::{FileIdentity, IdentitySet};
use super::tailer::Tailer;
use crate::config::types::{ScannerConfig, SourceConfig, TailerConfig};
use crate::formatter::{ContinuationOverride, Formatter, FormatterRegistry, UnknownFormatter};
use crate::pipeline::{QueueProducer, QueuedMessage};
use crate::record::Normalizer;
use crate::storage::{CursorStore, FileCursor};
use crate::supervisor::{keep_running, Service};
use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    UnknownFormatter(#[from] UnknownFormatter),

    #[error("invalid glob pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("invalid continuation regex for '{pattern}': {source}")]
    Continuation {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

struct TrackedFile {
    followed: IdentitySet,
    cursor: Arc<FileCursor>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Live tailers, one per tracked path
#[derive(Default)]
pub struct TailerRegistry {
    entries: BTreeMap<PathBuf, TrackedFile>,
}

impl TailerRegistry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.keys().cloned().collect()
    }

    /// Path of the tailer that is reading, or has already read, `identity`
    fn holder_of(&self, identity: FileIdentity) -> Option<&Path> {
        self.entries
            .iter()
            .find(|(_, tracked)| tracked.followed.contains(identity))
            .map(|(path, _)| path.as_path())
    }

    fn insert(&mut self, path: PathBuf, tracked: TrackedFile) {
        self.entries.insert(path, tracked);
    }

    /// Stop one tailer and wait for it
    async fn retire(&mut self, path: &Path) -> Option<Arc<FileCursor>> {
        let tracked = self.entries.remove(path)?;
        tracked.cancel.cancel();
        if let Err(e) = tracked.handle.await {
            warn!(path = %path.display(), error = %e, "Tailer task ended abnormally");
        }
        Some(tracked.cursor)
    }

    /// Stop every tailer and wait for all of them
    pub async fn shutdown(&mut self) {
        for tracked in self.entries.values() {
            tracked.cancel.cancel();
        }
        let (paths, handles): (Vec<PathBuf>, Vec<JoinHandle<()>>) =
            std::mem::take(&mut self.entries)
                .into_iter()
                .map(|(path, tracked)| (path, tracked.handle))
                .unzip();
        for (path, joined) in paths.iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                warn!(path = %path.display(), error = %e, "Tailer task ended abnormally");
            }
        }
    }
}

/// Outcome of one pass over the configured patterns
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub started: Vec<PathBuf>,
    pub retired: Vec<PathBuf>,
}

/// Expands the source patterns on an interval and starts a tailer for every
/// file not yet tracked
pub struct Scanner {
    sources: Vec<SourceConfig>,
    formatters: Arc<FormatterRegistry>,
    normalizer: Arc<Normalizer>,
    cursors: CursorStore,
    queue: QueueProducer<QueuedMessage>,
    tailer_config: TailerConfig,
    interval: Duration,
    retire_missing: bool,
    registry: TailerRegistry,
}

impl Scanner {
    pub fn new(
        sources: Vec<SourceConfig>,
        formatters: Arc<FormatterRegistry>,
        normalizer: Arc<Normalizer>,
        cursors: CursorStore,
        queue: QueueProducer<QueuedMessage>,
        tailer_config: TailerConfig,
        config: &ScannerConfig,
    ) -> Self {
        Self {
            sources,
            formatters,
            normalizer,
            cursors,
            queue,
            tailer_config,
            interval: config.interval,
            retire_missing: config.retire_missing,
            registry: TailerRegistry::default(),
        }
    }

    pub fn registry(&self) -> &TailerRegistry {
        &self.registry
    }

    fn resolve_formatter(&self, source: &SourceConfig) -> Result<Arc<dyn Formatter>, ScanError> {
        let formatter = self.formatters.resolve(&source.formatter)?;
        match &source.continuation {
            Some(pattern) => {
                let regex = Regex::new(pattern).map_err(|e| ScanError::Continuation {
                    pattern: source.pattern.clone(),
                    source: e,
                })?;
                Ok(Arc::new(ContinuationOverride::new(formatter, regex)))
            }
            None => Ok(formatter),
        }
    }

    /// One pass: start tailers for new files and, when enabled, retire the
    /// ones whose files are gone. Only configuration errors are returned;
    /// filesystem trouble is logged and retried next pass.
    pub async fn scan_once(&mut self, cancel: &CancellationToken) -> Result<ScanReport, ScanError> {
        let mut report = ScanReport::default();
        let mut seen = HashSet::new();

        for index in 0..self.sources.len() {
            let source = self.sources[index].clone();
            let entries = glob::glob(&source.pattern).map_err(|e| ScanError::Pattern {
                pattern: source.pattern.clone(),
                source: e,
            })?;
            let mut formatter = None;

            for entry in entries {
                let path = match entry {
                    Ok(path) => absolute(path),
                    Err(e) => {
                        warn!(pattern = %source.pattern, error = %e, "Unreadable glob match");
                        continue;
                    }
                };

                let metadata = match tokio::fs::metadata(&path).await {
                    Ok(metadata) if metadata.is_file() => metadata,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Cannot stat matched file");
                        continue;
                    }
                };
                seen.insert(path.clone());

                if self.registry.contains(&path) {
                    continue;
                }

                let identity = FileIdentity::from_metadata(&metadata);
                if let Some(holder) = self.registry.holder_of(identity) {
                    debug!(
                        path = %path.display(),
                        tracked_as = %holder.display(),
                        "File already tracked under another path"
                    );
                    continue;
                }

                let formatter = match &formatter {
                    Some(formatter) => Arc::clone(formatter),
                    None => {
                        let resolved = self.resolve_formatter(&source)?;
                        info!(formatter = %source.formatter, "Resolved formatter");
                        formatter = Some(Arc::clone(&resolved));
                        resolved
                    }
                };

                let cursor = match self.cursors.open(&path).await {
                    Ok(cursor) => Arc::new(cursor),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Cannot open cursor, will retry");
                        continue;
                    }
                };

                self.start_tailer(path.clone(), identity, formatter, cursor, cancel);
                report.started.push(path);
            }
        }

        if self.retire_missing {
            for path in self.registry.paths() {
                if seen.contains(&path) {
                    continue;
                }
                info!(path = %path.display(), "File no longer matched, retiring tailer");
                if let Some(cursor) = self.registry.retire(&path).await {
                    if !path.exists() {
                        if let Err(e) = cursor.forget().await {
                            warn!(path = %path.display(), error = %e, "Cannot remove cursor file");
                        }
                    }
                }
                report.retired.push(path);
            }
        }

        Ok(report)
    }

    fn start_tailer(
        &mut self,
        path: PathBuf,
        identity: FileIdentity,
        formatter: Arc<dyn Formatter>,
        cursor: Arc<FileCursor>,
        cancel: &CancellationToken,
    ) {
        let mut tailer = Tailer::new(
            path.clone(),
            formatter,
            Arc::clone(&self.normalizer),
            Arc::clone(&cursor),
            self.queue.clone(),
            &self.tailer_config,
        );
        let restart_delay = self.tailer_config.restart_delay;
        let token = cancel.child_token();
        let followed = tailer.followed();
        followed.insert(identity);

        let handle = {
            let token = token.clone();
            tokio::spawn(async move {
                // Tailer errors are never fatal, keep_running only returns on cancel
                let _ = keep_running(&mut tailer, restart_delay, &token).await;
            })
        };

        info!(path = %path.display(), identity = %identity, "Started tailer");
        self.registry.insert(
            path,
            TrackedFile {
                followed,
                cursor,
                cancel: token,
                handle,
            },
        );
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), ScanError> {
        let result = self.scan_loop(cancel).await;
        self.registry.shutdown().await;
        result
    }

    async fn scan_loop(&mut self, cancel: &CancellationToken) -> Result<(), ScanError> {
        loop {
            let report = self.scan_once(cancel).await?;
            debug!(
                started = report.started.len(),
                retired = report.retired.len(),
                tracked = self.registry.len(),
                "Scan complete"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[async_trait]
impl Service for Scanner {
    type Error = ScanError;

    fn name(&self) -> String {
        "scanner".to_string()
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<(), ScanError> {
        Scanner::run(self, cancel).await
    }

    /// Every scan error is a configuration error
    fn is_fatal(_error: &ScanError) -> bool {
        true
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}
