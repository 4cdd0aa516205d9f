//! Duplicate-suppression cache.
//!
//! A bounded FIFO window of recently-forwarded message ids. An id that
//! was recorded stays visible for at least the next N distinct recorded
//! ids, after which it may be evicted and treated as new again — bounded
//! memory over perfect dedup.
//!
//! The window survives restarts through a small JSON snapshot, loaded at
//! startup and written at shutdown with the temp-file-and-rename idiom.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Debug)]
pub struct DedupCache {
    /// Insertion order, oldest at the front. Kept consistent with `members`.
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Pure membership test, no side effects.
    pub fn seen(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Record an id, evicting the oldest once capacity is exceeded.
    pub fn record(&mut self, id: String) {
        if id.is_empty() || !self.members.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Load the snapshot written by a previous run. A missing or corrupt
    /// snapshot yields an empty cache; duplicate suppression degrades, the
    /// relay does not.
    pub async fn load(path: impl AsRef<Path>, capacity: usize) -> Self {
        let path = path.as_ref();
        let mut cache = Self::new(capacity);
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No dedup snapshot, starting fresh");
                return cache;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read dedup snapshot");
                return cache;
            }
        };
        match serde_json::from_str::<Vec<String>>(&contents) {
            Ok(ids) => {
                let count = ids.len();
                for id in ids {
                    cache.record(id);
                }
                info!(imported = count, retained = cache.len(), "Imported dedup snapshot");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt dedup snapshot, starting fresh");
            }
        }
        cache
    }

    /// Persist the current window as a JSON id array.
    pub async fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let ids: Vec<&String> = self.order.iter().collect();
        let data = serde_json::to_vec(&ids)?;
        atomic_write_file(path.as_ref(), &data).await
    }
}

/// Write data to a temp file, fsync it, then atomically rename to the
/// final path. The temp name carries a ULID to avoid collisions.
async fn atomic_write_file(final_path: &Path, data: &[u8]) -> std::io::Result<()> {
    let file_name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let temp_path = final_path.with_file_name(format!("{}.{}.tmp", file_name, ulid::Ulid::new()));

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    fs::rename(&temp_path, final_path).await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_seen() {
        let mut cache = DedupCache::new(10);
        assert!(!cache.seen("a"));
        cache.record("a".to_string());
        assert!(cache.seen("a"));
        assert!(!cache.seen("b"));
    }

    #[test]
    fn test_fifo_eviction_beyond_capacity() {
        let mut cache = DedupCache::new(3);
        for id in ["a", "b", "c"] {
            cache.record(id.to_string());
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.seen("a"));

        // The fourth distinct id evicts the oldest.
        cache.record("d".to_string());
        assert_eq!(cache.len(), 3);
        assert!(!cache.seen("a"));
        assert!(cache.seen("b"));
        assert!(cache.seen("c"));
        assert!(cache.seen("d"));
    }

    #[test]
    fn test_sliding_window_guarantee() {
        // An id stays visible for at least the next N distinct ids.
        let n = 50;
        let mut cache = DedupCache::new(n);
        cache.record("first".to_string());
        for i in 0..n - 1 {
            cache.record(format!("id-{i}"));
            assert!(cache.seen("first"));
        }
        cache.record("one-too-many".to_string());
        assert!(!cache.seen("first"));
    }

    #[test]
    fn test_rerecording_does_not_grow() {
        let mut cache = DedupCache::new(5);
        cache.record("a".to_string());
        cache.record("a".to_string());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_empty_id_is_ignored() {
        let mut cache = DedupCache::new(5);
        cache.record(String::new());
        assert!(cache.is_empty());
        assert!(!cache.seen(""));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dedup.json");

        let mut cache = DedupCache::new(10);
        cache.record("x".to_string());
        cache.record("y".to_string());
        cache.save(&path).await.unwrap();

        let restored = DedupCache::load(&path, 10).await;
        assert_eq!(restored.len(), 2);
        assert!(restored.seen("x"));
        assert!(restored.seen("y"));
        assert!(!restored.seen("z"));
    }

    #[tokio::test]
    async fn test_load_missing_snapshot() {
        let dir = TempDir::new().unwrap();
        let cache = DedupCache::load(dir.path().join("nope.json"), 10).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_load_corrupt_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dedup.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let cache = DedupCache::load(&path, 10).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_load_truncates_to_capacity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dedup.json");
        let ids: Vec<String> = (0..20).map(|i| format!("id-{i}")).collect();
        tokio::fs::write(&path, serde_json::to_vec(&ids).unwrap())
            .await
            .unwrap();

        let cache = DedupCache::load(&path, 5).await;
        assert_eq!(cache.len(), 5);
        // The newest ids survive the replay.
        assert!(cache.seen("id-19"));
        assert!(!cache.seen("id-0"));
    }
}
