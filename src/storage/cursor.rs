use crate::source::identity::FileIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cursor serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CursorError>;

/// On-disk layout of one cursor file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorFile {
    version: u32,
    path: PathBuf,
    dev: u64,
    inode: u64,
    #[serde(default)]
    generation: u64,
    offset: u64,
    updated_at: DateTime<Utc>,
}

/// One life of a file under its cursor. The generation moves every time the
/// cursor restarts from 0, so a truncated file is a new incarnation even
/// though its identity is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Incarnation {
    pub identity: FileIdentity,
    pub generation: u64,
}

impl std::fmt::Display for Incarnation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.identity, self.generation)
    }
}

#[derive(Debug, Default)]
struct CursorState {
    identity: Option<FileIdentity>,
    generation: u64,
    offset: u64,
}

impl CursorState {
    fn incarnation(&self) -> Option<Incarnation> {
        self.identity.map(|identity| Incarnation {
            identity,
            generation: self.generation,
        })
    }

    fn restart(&mut self, identity: FileIdentity) -> Incarnation {
        self.identity = Some(identity);
        self.generation += 1;
        self.offset = 0;
        Incarnation {
            identity,
            generation: self.generation,
        }
    }
}

/// Directory holding one cursor file per tracked source file
#[derive(Debug, Clone)]
pub struct CursorStore {
    dir: PathBuf,
}

impl CursorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cursor file location for a source path: `<dir>/<sha256(path)>.cursor.json`
    pub fn cursor_path(&self, source: &Path) -> PathBuf {
        let digest = Sha256::digest(source.to_string_lossy().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.cursor.json", hex))
    }

    /// Load (or start) the cursor for `source`. A missing, unreadable or
    /// foreign-version cursor file starts from an empty state.
    pub async fn open(&self, source: &Path) -> Result<FileCursor> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = self.cursor_path(source);

        let state = match tokio::fs::read(&file).await {
            Ok(bytes) => match serde_json::from_slice::<CursorFile>(&bytes) {
                Ok(stored) if stored.version == CURRENT_VERSION => CursorState {
                    identity: Some(FileIdentity {
                        dev: stored.dev,
                        inode: stored.inode,
                    }),
                    generation: stored.generation,
                    offset: stored.offset,
                },
                Ok(stored) => {
                    tracing::warn!(
                        path = %source.display(),
                        version = stored.version,
                        expected = CURRENT_VERSION,
                        "Cursor version mismatch, ignoring stored cursor"
                    );
                    CursorState::default()
                }
                Err(e) => {
                    tracing::warn!(
                        path = %source.display(),
                        error = %e,
                        "Unreadable cursor file, starting from the top"
                    );
                    CursorState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CursorState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(FileCursor {
            source: source.to_path_buf(),
            file,
            state: Mutex::new(state),
        })
    }
}

/// Durable read position of one source file.
///
/// The offset only moves forward within one [`Incarnation`]. Confirmations
/// carrying any other incarnation are stale (the file rotated or was
/// truncated since) and are ignored.
#[derive(Debug)]
pub struct FileCursor {
    source: PathBuf,
    file: PathBuf,
    state: Mutex<CursorState>,
}

impl FileCursor {
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub async fn offset(&self) -> u64 {
        self.state.lock().await.offset
    }

    pub async fn identity(&self) -> Option<FileIdentity> {
        self.state.lock().await.identity
    }

    pub async fn incarnation(&self) -> Option<Incarnation> {
        self.state.lock().await.incarnation()
    }

    /// Incarnation and offset to resume reading `identity` from, given the
    /// file's current size. Anything but an exact identity match within the
    /// file's bounds starts a new incarnation at 0.
    pub async fn resume(&self, identity: FileIdentity, size: u64) -> Result<(Incarnation, u64)> {
        let mut state = self.state.lock().await;
        if let Some(current) = state.incarnation() {
            if current.identity == identity && state.offset <= size {
                return Ok((current, state.offset));
            }
        }

        let incarnation = state.restart(identity);
        self.persist(&state).await?;
        Ok((incarnation, 0))
    }

    /// Start a new incarnation of `identity` at offset 0
    pub async fn reset(&self, identity: FileIdentity) -> Result<Incarnation> {
        let mut state = self.state.lock().await;
        let incarnation = state.restart(identity);
        self.persist(&state).await?;
        Ok(incarnation)
    }

    /// Record that every byte of `incarnation` before `offset` is delivered.
    /// Returns whether the stored position moved.
    pub async fn advance(&self, incarnation: Incarnation, offset: u64) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.incarnation() != Some(incarnation) {
            tracing::debug!(
                path = %self.source.display(),
                incarnation = %incarnation,
                "Ignoring confirmation for a previous file incarnation"
            );
            return Ok(false);
        }
        if offset <= state.offset {
            return Ok(false);
        }

        state.offset = offset;
        self.persist(&state).await?;
        Ok(true)
    }

    /// Remove the cursor file, used when a file is retired
    pub async fn forget(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, state: &CursorState) -> Result<()> {
        let Some(identity) = state.identity else {
            return Ok(());
        };

        let contents = serde_json::to_vec_pretty(&CursorFile {
            version: CURRENT_VERSION,
            path: self.source.clone(),
            dev: identity.dev,
            inode: identity.inode,
            generation: state.generation,
            offset: state.offset,
            updated_at: Utc::now(),
        })?;

        let tmp = self.file.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.file).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ID_A: FileIdentity = FileIdentity { dev: 1, inode: 10 };
    const ID_B: FileIdentity = FileIdentity { dev: 1, inode: 11 };

    #[tokio::test]
    async fn test_fresh_cursor_starts_at_zero() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path());
        let cursor = store.open(Path::new("/var/log/a.log")).await.unwrap();

        assert_eq!(cursor.offset().await, 0);
        assert_eq!(cursor.identity().await, None);
        let (incarnation, offset) = cursor.resume(ID_A, 100).await.unwrap();
        assert_eq!(offset, 0);
        assert_eq!(incarnation.identity, ID_A);
        assert_eq!(cursor.incarnation().await, Some(incarnation));
    }

    #[tokio::test]
    async fn test_advance_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path());
        let source = Path::new("/var/log/a.log");

        let cursor = store.open(source).await.unwrap();
        let a = cursor.reset(ID_A).await.unwrap();
        assert!(cursor.advance(a, 42).await.unwrap());
        drop(cursor);

        let reopened = store.open(source).await.unwrap();
        assert_eq!(reopened.identity().await, Some(ID_A));
        assert_eq!(reopened.resume(ID_A, 100).await.unwrap(), (a, 42));
    }

    #[tokio::test]
    async fn test_offset_never_regresses() {
        let dir = tempdir().unwrap();
        let cursor = CursorStore::new(dir.path())
            .open(Path::new("/a"))
            .await
            .unwrap();
        let a = cursor.reset(ID_A).await.unwrap();

        assert!(cursor.advance(a, 50).await.unwrap());
        assert!(!cursor.advance(a, 30).await.unwrap());
        assert!(!cursor.advance(a, 50).await.unwrap());
        assert!(cursor.advance(a, 80).await.unwrap());
        assert_eq!(cursor.offset().await, 80);
    }

    #[tokio::test]
    async fn test_stale_identity_is_ignored() {
        let dir = tempdir().unwrap();
        let cursor = CursorStore::new(dir.path())
            .open(Path::new("/a"))
            .await
            .unwrap();
        let a = cursor.reset(ID_A).await.unwrap();
        cursor.advance(a, 500).await.unwrap();

        let b = cursor.reset(ID_B).await.unwrap();
        assert!(!cursor.advance(a, 900).await.unwrap());
        assert_eq!(cursor.offset().await, 0);
        assert!(cursor.advance(b, 20).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_of_same_identity_rejects_earlier_confirmations() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path());
        let cursor = store.open(Path::new("/a")).await.unwrap();
        let before = cursor.reset(ID_A).await.unwrap();
        cursor.advance(before, 36).await.unwrap();

        // Truncated in place: same identity, new generation
        let after = cursor.reset(ID_A).await.unwrap();
        assert_eq!(after.identity, before.identity);
        assert_ne!(after, before);

        assert!(!cursor.advance(before, 60).await.unwrap());
        assert_eq!(cursor.offset().await, 0);
        assert!(cursor.advance(after, 5).await.unwrap());

        // The generation survives a reopen
        drop(cursor);
        let reopened = store.open(Path::new("/a")).await.unwrap();
        assert_eq!(reopened.incarnation().await, Some(after));
        assert!(!reopened.advance(before, 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_with_other_identity_or_shrunk_file_resets() {
        let dir = tempdir().unwrap();
        let cursor = CursorStore::new(dir.path())
            .open(Path::new("/a"))
            .await
            .unwrap();
        let a = cursor.reset(ID_A).await.unwrap();
        cursor.advance(a, 200).await.unwrap();

        let (shrunk, offset) = cursor.resume(ID_A, 100).await.unwrap();
        assert_eq!(offset, 0);
        assert_eq!(shrunk.identity, ID_A);
        assert_ne!(shrunk, a);

        cursor.advance(shrunk, 50).await.unwrap();
        let (b, offset) = cursor.resume(ID_B, 1000).await.unwrap();
        assert_eq!(offset, 0);
        assert_eq!(b.identity, ID_B);
        assert_eq!(cursor.identity().await, Some(ID_B));
    }

    #[tokio::test]
    async fn test_unknown_version_and_garbage_are_ignored() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path());
        let source = Path::new("/a");

        let future = serde_json::json!({
            "version": 99, "path": "/a", "dev": 1, "inode": 10,
            "offset": 7, "updated_at": "2020-01-01T00:00:00Z"
        });
        std::fs::write(store.cursor_path(source), future.to_string()).unwrap();
        assert_eq!(store.open(source).await.unwrap().offset().await, 0);

        std::fs::write(store.cursor_path(source), "not json").unwrap();
        assert_eq!(store.open(source).await.unwrap().identity().await, None);
    }

    #[tokio::test]
    async fn test_cursor_paths_are_distinct_per_source() {
        let store = CursorStore::new("/state");
        let a = store.cursor_path(Path::new("/var/log/a.log"));
        let b = store.cursor_path(Path::new("/var/log/b.log"));

        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with(".cursor.json"));
        assert!(a.starts_with("/state"));
    }

    #[tokio::test]
    async fn test_forget_removes_file() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path());
        let cursor = store.open(Path::new("/a")).await.unwrap();
        cursor.reset(ID_A).await.unwrap();
        assert!(store.cursor_path(Path::new("/a")).exists());

        cursor.forget().await.unwrap();
        assert!(!store.cursor_path(Path::new("/a")).exists());
        cursor.forget().await.unwrap();
    }
}
