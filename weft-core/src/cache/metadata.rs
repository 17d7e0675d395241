//! Two-level cache for parsed template metadata.
//!
//! Level one is an in-memory LRU keyed by `(canonical_path, fingerprint)`;
//! level two is an optional on-disk overflow under
//! `<cache_dir>/metadata/<hash[0..2]>/<hash>.json`, written atomically
//! (write to `.tmp`, rename). The stored value is the serialized
//! [`crate::component::ParsedFile`]; the cache itself treats it as opaque
//! bytes and guarantees a hit is byte-identical to the last `set` for the
//! key. Entries expire lazily on read after the TTL.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

/// Compound cache key: the validated path plus the content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: PathBuf,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(path: impl Into<PathBuf>, fingerprint: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fingerprint: fingerprint.into(),
        }
    }

    fn storage_key(&self) -> String {
        format!("{}\n{}", self.path.display(), self.fingerprint)
    }

    /// Stable on-disk name: hex SHA-256 of the storage key.
    fn disk_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.storage_key().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Tuning knobs for the metadata cache.
#[derive(Debug, Clone)]
pub struct MetadataCacheConfig {
    /// In-memory entry bound.
    pub capacity: usize,
    /// Entries older than this are treated as absent.
    pub ttl: Duration,
    /// On-disk overflow root; `None` keeps the cache memory-only.
    pub disk_dir: Option<PathBuf>,
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            ttl: Duration::from_secs(3_600),
            disk_dir: None,
        }
    }
}

/// Hit/miss counters exported for observability.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct MemEntry {
    bytes: Vec<u8>,
    stored_at: Instant,
    path: PathBuf,
}

/// Bounded, TTL'd, content-addressed map from `(path, fingerprint)` to
/// serialized parse results.
pub struct MetadataCache {
    config: MetadataCacheConfig,
    entries: Mutex<LruCache<String, MemEntry>>,
    /// Paths of entries spilled to disk this run, so `invalidate` can reach
    /// them without a directory walk.
    disk_index: Mutex<HashMap<PathBuf, HashSet<String>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl MetadataCache {
    pub fn new(config: MetadataCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).expect("nonzero capacity");
        Self {
            config,
            entries: Mutex::new(LruCache::new(capacity)),
            disk_index: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up previously stored bytes. TTL expiry is applied lazily here.
    pub async fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let storage_key = key.storage_key();
        {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            match entries.get(&storage_key) {
                Some(entry) if entry.stored_at.elapsed() <= self.config.ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.bytes.clone());
                }
                Some(_) => {
                    entries.pop(&storage_key);
                }
                None => {}
            }
        }

        if let Some(bytes) = self.get_from_disk(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            // Promote so repeated lookups stay in memory.
            self.insert_mem(&storage_key, key.path.clone(), bytes.clone());
            return Some(bytes);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store bytes for a key. The cache never merges: a later `set` for the
    /// same key fully replaces the earlier one.
    pub async fn set(&self, key: &CacheKey, bytes: Vec<u8>) {
        let storage_key = key.storage_key();
        self.insert_mem(&storage_key, key.path.clone(), bytes.clone());

        let Some(disk_dir) = &self.config.disk_dir else {
            return;
        };
        let name = key.disk_name();
        let final_path = shard_path(disk_dir, &name);
        if let Err(error) = write_atomic(&final_path, &bytes).await {
            // Storage IO downgrades to a miss later; never fail the caller.
            warn!(path = %final_path.display(), %error, "metadata cache disk write failed");
            return;
        }
        self.disk_index
            .lock()
            .expect("disk index poisoned")
            .entry(key.path.clone())
            .or_default()
            .insert(name);
    }

    /// Drop every entry whose path equals `path` or lives under it. Returns
    /// the number of entries removed.
    pub async fn invalidate(&self, path: &Path) -> usize {
        let mut removed = 0;
        {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.path == path || entry.path.starts_with(path))
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                entries.pop(&key);
                removed += 1;
            }
        }

        let stale_disk: Vec<(PathBuf, HashSet<String>)> = {
            let mut index = self.disk_index.lock().expect("disk index poisoned");
            let keys: Vec<PathBuf> = index
                .keys()
                .filter(|p| *p == path || p.starts_with(path))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|p| index.remove_entry(&p))
                .collect()
        };

        if let Some(disk_dir) = &self.config.disk_dir {
            for (_, names) in stale_disk {
                for name in names {
                    let file = shard_path(disk_dir, &name);
                    if fs::remove_file(&file).await.is_ok() {
                        removed += 1;
                    }
                }
            }
        }

        debug!(path = %path.display(), removed, "metadata cache invalidated");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().expect("cache lock poisoned").len(),
        }
    }

    fn insert_mem(&self, storage_key: &str, path: PathBuf, bytes: Vec<u8>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.put(
            storage_key.to_string(),
            MemEntry {
                bytes,
                stored_at: Instant::now(),
                path,
            },
        );
    }

    async fn get_from_disk(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let disk_dir = self.config.disk_dir.as_ref()?;
        let file = shard_path(disk_dir, &key.disk_name());

        let meta = fs::metadata(&file).await.ok()?;
        let expired = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .is_some_and(|age| age > self.config.ttl);
        if expired {
            let _ = fs::remove_file(&file).await;
            return None;
        }

        match fs::read(&file).await {
            Ok(bytes) => Some(bytes),
            Err(error) => {
                warn!(path = %file.display(), %error, "metadata cache disk read failed");
                None
            }
        }
    }
}

fn shard_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(&name[..2]).join(format!("{name}.json"))
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    fs::create_dir_all(parent).await?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str, fingerprint: &str) -> CacheKey {
        CacheKey::new(PathBuf::from(path), fingerprint)
    }

    #[tokio::test]
    async fn hit_is_byte_identical_to_last_set() {
        let cache = MetadataCache::new(MetadataCacheConfig::default());
        let k = key("/p/a.templ", "crc32:1234");
        cache.set(&k, b"first".to_vec()).await;
        cache.set(&k, b"second".to_vec()).await;
        assert_eq!(cache.get(&k).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn distinct_fingerprints_are_distinct_entries() {
        let cache = MetadataCache::new(MetadataCacheConfig::default());
        cache.set(&key("/p/a.templ", "f1"), b"one".to_vec()).await;
        cache.set(&key("/p/a.templ", "f2"), b"two".to_vec()).await;
        assert_eq!(cache.get(&key("/p/a.templ", "f1")).await.unwrap(), b"one");
        assert_eq!(cache.get(&key("/p/a.templ", "f2")).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn ttl_expires_lazily_on_read() {
        let cache = MetadataCache::new(MetadataCacheConfig {
            ttl: Duration::ZERO,
            ..Default::default()
        });
        let k = key("/p/a.templ", "f1");
        cache.set(&k, b"soon stale".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get(&k).await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let cache = MetadataCache::new(MetadataCacheConfig {
            capacity: 2,
            ..Default::default()
        });
        cache.set(&key("/p/a.templ", "f"), b"a".to_vec()).await;
        cache.set(&key("/p/b.templ", "f"), b"b".to_vec()).await;
        // Touch `a` so `b` is the eviction candidate.
        assert!(cache.get(&key("/p/a.templ", "f")).await.is_some());
        cache.set(&key("/p/c.templ", "f"), b"c".to_vec()).await;

        assert!(cache.get(&key("/p/b.templ", "f")).await.is_none());
        assert!(cache.get(&key("/p/a.templ", "f")).await.is_some());
        assert!(cache.get(&key("/p/c.templ", "f")).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_removes_by_path_prefix() {
        let cache = MetadataCache::new(MetadataCacheConfig::default());
        cache
            .set(&key("/p/components/a.templ", "f"), b"a".to_vec())
            .await;
        cache
            .set(&key("/p/components/b.templ", "f"), b"b".to_vec())
            .await;
        cache.set(&key("/p/pages/c.templ", "f"), b"c".to_vec()).await;

        let removed = cache.invalidate(Path::new("/p/components")).await;
        assert_eq!(removed, 2);
        assert!(cache.get(&key("/p/components/a.templ", "f")).await.is_none());
        assert!(cache.get(&key("/p/pages/c.templ", "f")).await.is_some());
    }

    #[tokio::test]
    async fn disk_overflow_survives_memory_eviction() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = MetadataCache::new(MetadataCacheConfig {
            capacity: 1,
            disk_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        });

        let a = key("/p/a.templ", "f");
        let b = key("/p/b.templ", "f");
        cache.set(&a, b"alpha".to_vec()).await;
        cache.set(&b, b"beta".to_vec()).await; // evicts `a` from memory

        assert_eq!(cache.get(&a).await.unwrap(), b"alpha");
        assert_eq!(cache.get(&b).await.unwrap(), b"beta");
    }

    #[tokio::test]
    async fn disk_files_are_sharded_by_hash_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = MetadataCache::new(MetadataCacheConfig {
            disk_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        });
        cache.set(&key("/p/a.templ", "f"), b"a".to_vec()).await;

        let shard = std::fs::read_dir(tmp.path())
            .unwrap()
            .next()
            .expect("one shard dir")
            .unwrap();
        assert_eq!(shard.file_name().len(), 2);
        let entry = std::fs::read_dir(shard.path()).unwrap().next().unwrap().unwrap();
        assert!(entry.file_name().to_string_lossy().ends_with(".json"));
    }
}
