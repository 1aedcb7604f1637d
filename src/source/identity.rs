use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::Metadata;
use std::sync::{Arc, Mutex};

/// Identity of one incarnation of a file. A rotated or recreated file at the
/// same path has a different identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            inode: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        // No inode here; creation time is the closest stable fingerprint
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        if let Ok(created) = metadata.created() {
            created.hash(&mut hasher);
        }
        Self {
            dev: 0,
            inode: hasher.finish(),
        }
    }

    pub async fn of_path(path: &std::path::Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self::from_metadata(&metadata))
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.inode)
    }
}

/// Every identity one tailer has read from. Shared with the scanner so a
/// rotated-away file the tailer already drained is not picked up again
/// under its new name.
#[derive(Debug, Clone, Default)]
pub struct IdentitySet(Arc<Mutex<HashSet<FileIdentity>>>);

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: FileIdentity) {
        if let Ok(mut identities) = self.0.lock() {
            identities.insert(identity);
        }
    }

    pub fn contains(&self, identity: FileIdentity) -> bool {
        self.0
            .lock()
            .map(|identities| identities.contains(&identity))
            .unwrap_or(false)
    }
}
