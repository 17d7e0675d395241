//! Build artifact cache.
//!
//! Artifacts live as raw bytes under `<cache_dir>/artifacts/<hash>`, where
//! the hash covers the component source, its ordered parameter signature,
//! and the compiler version, so a compiler upgrade can never produce a
//! stale hit. Writes are atomic (`.tmp` + rename); cleanup is age-based.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use super::metadata::write_atomic;
use crate::error::Result;

/// Hash of everything that determines a compile's output.
pub fn artifact_hash(source: &[u8], parameter_signature: &str, compiler_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source);
    hasher.update([0]);
    hasher.update(parameter_signature.as_bytes());
    hasher.update([0]);
    hasher.update(compiler_version.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hit/miss counters for the artifact cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactStats {
    pub hits: u64,
    pub misses: u64,
}

/// On-disk cache of compiled template artifacts.
pub struct ArtifactCache {
    dir: PathBuf,
    max_age: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("dir", &self.dir)
            .field("max_age", &self.max_age)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn get(&self, hash: &str) -> Option<Vec<u8>> {
        match fs::read(self.dir.join(hash)).await {
            Ok(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(bytes)
            }
            Err(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn put(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dir.join(hash);
        write_atomic(&path, bytes).await?;
        debug!(hash, size = bytes.len(), "artifact cached");
        Ok(())
    }

    /// Remove artifacts older than the configured age. Returns how many
    /// files were removed.
    pub async fn cleanup(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0), // nothing cached yet
        };
        let now = SystemTime::now();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let expired = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .is_some_and(|age| age > self.max_age);
            if expired {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(error) => {
                        warn!(path = %path.display(), %error, "failed to remove stale artifact")
                    }
                }
            }
        }
        if removed > 0 {
            info!(removed, "artifact cache cleanup");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> ArtifactStats {
        ArtifactStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_covers_source_signature_and_compiler_version() {
        let base = artifact_hash(b"body", "text string", "v1");
        assert_ne!(base, artifact_hash(b"body2", "text string", "v1"));
        assert_ne!(base, artifact_hash(b"body", "text string, n int", "v1"));
        assert_ne!(base, artifact_hash(b"body", "text string", "v2"));
        assert_eq!(base, artifact_hash(b"body", "text string", "v1"));
    }

    #[tokio::test]
    async fn round_trips_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(tmp.path().join("artifacts"), Duration::from_secs(60));

        assert!(cache.get("abc").await.is_none());
        cache.put("abc", b"compiled output").await.unwrap();
        assert_eq!(cache.get("abc").await.unwrap(), b"compiled output");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_files() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(tmp.path().join("artifacts"), Duration::ZERO);
        cache.put("stale", b"old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let removed = cache.cleanup().await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get("stale").await.is_none());
    }
}
