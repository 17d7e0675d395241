//! Component discovery.
//!
//! The scanner turns template files into [`Component`] records and keeps the
//! registry in sync, going through the metadata cache so an unchanged file is
//! never re-parsed. Directory scans run on a small persistent worker pool
//! with a bounded shared queue; when the queue is saturated the submitter
//! processes the job inline instead of blocking.

pub mod fingerprint;
pub mod parse;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{CacheKey, MetadataCache};
use crate::component::{Component, ParsedFile};
use crate::error::{Result, WeftError};
use crate::paths::{ValidationProfile, relative_to_root, sanitize_identifier};
use crate::project::Project;
use crate::registry::ComponentRegistry;

use fingerprint::{FULL_CRC_LIMIT, fingerprint_content, fingerprint_large};

/// Files above this size are read in [`READ_CHUNK`]-sized chunks.
const STREAM_THRESHOLD: u64 = 64 * 1024;
const READ_CHUNK: usize = 32 * 1024;

/// Default pool size: one worker per CPU, capped.
pub fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 8)
}

/// Scanner tuning knobs.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Persistent worker count for directory scans.
    pub worker_count: usize,
    /// Glob patterns (relative to the project root) excluded from scans.
    pub exclude: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            exclude: Vec::new(),
        }
    }
}

/// Counters exported for observability. Cache hit/miss counters live on the
/// metadata cache itself.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    files_processed: AtomicU64,
    components_discovered: AtomicU64,
    parse_fallbacks: AtomicU64,
    bytes_read: AtomicU64,
    in_flight_bytes: AtomicU64,
    peak_in_flight_bytes: AtomicU64,
    scan_millis: AtomicU64,
}

/// Point-in-time view of [`ScanMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ScanMetricsSnapshot {
    pub files_processed: u64,
    pub components_discovered: u64,
    pub parse_fallbacks: u64,
    pub bytes_read: u64,
    pub peak_in_flight_bytes: u64,
    pub scan_millis: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl ScanMetrics {
    fn snapshot(&self, cache: &MetadataCache) -> ScanMetricsSnapshot {
        let cache_stats = cache.stats();
        ScanMetricsSnapshot {
            files_processed: self.files_processed.load(Ordering::Relaxed),
            components_discovered: self.components_discovered.load(Ordering::Relaxed),
            parse_fallbacks: self.parse_fallbacks.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            peak_in_flight_bytes: self.peak_in_flight_bytes.load(Ordering::Relaxed),
            scan_millis: self.scan_millis.load(Ordering::Relaxed),
            cache_hits: cache_stats.hits,
            cache_misses: cache_stats.misses,
        }
    }

    fn track_read(&self, len: u64) -> ReadGuard<'_> {
        self.bytes_read.fetch_add(len, Ordering::Relaxed);
        let now = self.in_flight_bytes.fetch_add(len, Ordering::Relaxed) + len;
        self.peak_in_flight_bytes.fetch_max(now, Ordering::Relaxed);
        ReadGuard { metrics: self, len }
    }
}

struct ReadGuard<'a> {
    metrics: &'a ScanMetrics,
    len: u64,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.metrics
            .in_flight_bytes
            .fetch_sub(self.len, Ordering::Relaxed);
    }
}

/// Hook applied to every component between parsing and registry
/// publication. The plugin host implements this; the scanner stays unaware
/// of plugin machinery.
#[async_trait::async_trait]
pub trait ComponentTransform: Send + Sync {
    async fn transform(&self, component: Component) -> Result<Component>;
}

/// Result of scanning one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Names published from this file after the registry diff.
    pub components: Vec<String>,
    pub cache_hit: bool,
    /// True when the strict parser rejected the file and line-oriented
    /// extraction was used instead.
    pub used_fallback: bool,
    /// Components removed because the file vanished or no longer declares
    /// them.
    pub removed: usize,
    /// Components withheld from publication because a transform rejected
    /// them. Their previous records, if any, stay registered.
    pub plugin_failures: usize,
}

struct ScanJob {
    path: PathBuf,
    done: oneshot::Sender<usize>,
}

struct ScanPool {
    tx: mpsc::Sender<ScanJob>,
    workers: Vec<JoinHandle<()>>,
}

/// Discovers templates and publishes component records through the registry.
pub struct ComponentScanner {
    project: Arc<Project>,
    registry: Arc<ComponentRegistry>,
    cache: Arc<MetadataCache>,
    config: ScannerConfig,
    metrics: Arc<ScanMetrics>,
    pool: Mutex<Option<ScanPool>>,
    transform: std::sync::RwLock<Option<Arc<dyn ComponentTransform>>>,
}

impl std::fmt::Debug for ComponentScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentScanner")
            .field("root", &self.project.root())
            .field("workers", &self.config.worker_count)
            .finish()
    }
}

impl ComponentScanner {
    pub fn new(
        project: Arc<Project>,
        registry: Arc<ComponentRegistry>,
        cache: Arc<MetadataCache>,
        config: ScannerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            project,
            registry,
            cache,
            config,
            metrics: Arc::new(ScanMetrics::default()),
            pool: Mutex::new(None),
            transform: std::sync::RwLock::new(None),
        })
    }

    /// Install the component transform applied between parsing and registry
    /// publication. Replaces any previous transform.
    pub fn set_transform(&self, transform: Arc<dyn ComponentTransform>) {
        *self.transform.write().expect("transform lock poisoned") = Some(transform);
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> ScanMetricsSnapshot {
        self.metrics.snapshot(&self.cache)
    }

    /// Walk `dir` recursively and process every template file through the
    /// worker pool. Returns the aggregated error count (hard failures plus
    /// files that needed the parse fallback).
    pub async fn scan_directory(self: &Arc<Self>, dir: impl AsRef<Path>) -> Result<usize> {
        let started = Instant::now();
        let dir = self
            .project
            .validator()
            .validate(&dir.as_ref().to_string_lossy(), ValidationProfile::Filesystem)?;

        let files = self.collect_templates(&dir);
        info!(dir = %dir.display(), files = files.len(), "scanning directory");

        self.ensure_pool().await;
        let mut pending = Vec::new();
        let mut errors = 0usize;

        for path in files {
            let (done_tx, done_rx) = oneshot::channel();
            let job = ScanJob {
                path: path.clone(),
                done: done_tx,
            };
            let submitted = {
                let pool = self.pool.lock().await;
                match pool.as_ref() {
                    Some(pool) => pool.tx.try_send(job).is_ok(),
                    None => false,
                }
            };
            if submitted {
                pending.push(done_rx);
            } else {
                // Queue saturated (or pool closed): the submitter does the
                // work itself rather than blocking.
                errors += self.scan_path_counting(&path).await;
            }
        }

        for done in pending {
            errors += done.await.unwrap_or(1);
        }

        self.metrics
            .scan_millis
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        let snapshot = self.metrics();
        debug!(
            files = snapshot.files_processed,
            components = snapshot.components_discovered,
            cache_hits = snapshot.cache_hits,
            errors,
            "directory scan finished"
        );
        Ok(errors)
    }

    /// Parse one file in the caller's task and reconcile the registry.
    pub async fn scan_file(&self, path: impl AsRef<Path>) -> Result<ScanOutcome> {
        let canonical = self
            .project
            .validator()
            .validate(&path.as_ref().to_string_lossy(), ValidationProfile::Filesystem)?;
        let relative = relative_to_root(self.project.root(), &canonical);

        let mut file = match File::open(&canonical).await {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between discovery and scan: treat as removal.
                let removed = self.forget_file(&canonical, &relative).await;
                return Ok(ScanOutcome {
                    removed,
                    ..ScanOutcome::default()
                });
            }
            Err(error) => return Err(error.into()),
        };
        let meta = file.metadata().await?;
        let size = meta.len();
        let last_mod: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());

        // Fingerprint first: for large files this touches only the sample
        // windows, so a cache hit skips reading the body entirely.
        let mut content: Option<Vec<u8>> = None;
        let fingerprint = if size > FULL_CRC_LIMIT {
            fingerprint_large(&mut file, size, last_mod.timestamp()).await?
        } else {
            let bytes = read_full(&mut file, size).await?;
            let fp = fingerprint_content(&bytes);
            content = Some(bytes);
            fp
        };

        let key = CacheKey::new(canonical.clone(), fingerprint.clone());
        if let Some(bytes) = self.cache.get(&key).await {
            match serde_json::from_slice::<ParsedFile>(&bytes) {
                Ok(parsed) => {
                    let (names, removed, plugin_failures) =
                        self.publish(&relative, parsed.components).await;
                    self.metrics.files_processed.fetch_add(1, Ordering::Relaxed);
                    return Ok(ScanOutcome {
                        components: names,
                        cache_hit: true,
                        used_fallback: false,
                        removed,
                        plugin_failures,
                    });
                }
                Err(error) => {
                    // A corrupt entry downgrades to a miss.
                    warn!(path = %canonical.display(), %error, "discarding corrupt cache entry");
                    self.cache.invalidate(&canonical).await;
                }
            }
        }

        let bytes = match content.take() {
            Some(bytes) => bytes,
            None => {
                file.seek(SeekFrom::Start(0)).await?;
                read_full(&mut file, size).await?
            }
        };
        let _read_guard = self.metrics.track_read(bytes.len() as u64);
        let source = String::from_utf8_lossy(&bytes);

        let (signature, used_fallback) = match parse::parse_template(&canonical, &source) {
            Ok(signature) => (signature, false),
            Err(error) => {
                warn!(path = %canonical.display(), %error, "strict parse failed; using line extraction");
                self.metrics.parse_fallbacks.fetch_add(1, Ordering::Relaxed);
                (parse::extract_loose(&source), true)
            }
        };

        let components = self.build_records(&relative, &fingerprint, last_mod, signature);

        // The cache stores the untransformed parse; the plugin transform
        // runs on every publication so plugin changes take effect without
        // invalidating parse results.
        let parsed = ParsedFile {
            components: components.clone(),
            file_hash: fingerprint.clone(),
            parsed_at: Utc::now(),
        };
        match serde_json::to_vec(&parsed) {
            Ok(serialized) => self.cache.set(&key, serialized).await,
            Err(error) => warn!(path = %canonical.display(), %error, "failed to serialize parse result"),
        }

        let discovered = components.len() as u64;
        let (names, removed, plugin_failures) = self.publish(&relative, components).await;
        self.metrics.files_processed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .components_discovered
            .fetch_add(discovered, Ordering::Relaxed);

        Ok(ScanOutcome {
            components: names,
            cache_hit: false,
            used_fallback,
            removed,
            plugin_failures,
        })
    }

    /// Transform (when a transform is installed) and reconcile one file's
    /// components with the registry. A component whose transform fails is
    /// withheld; its previous record, if this file published one, stays put.
    async fn publish(
        &self,
        relative: &Path,
        components: Vec<Component>,
    ) -> (Vec<String>, usize, usize) {
        let transform = self
            .transform
            .read()
            .expect("transform lock poisoned")
            .clone();

        let (mut publishable, mut failures) = (Vec::with_capacity(components.len()), 0usize);
        match transform {
            None => publishable = components,
            Some(transform) => {
                for component in components {
                    let name = component.name.clone();
                    match transform.transform(component).await {
                        Ok(component) => publishable.push(component),
                        Err(error) => {
                            warn!(component = %name, %error, "transform failed; withholding publication");
                            failures += 1;
                            if let Some(previous) = self.registry.get(&name)
                                && previous.file_path == relative
                            {
                                // Re-publishing the unchanged record is a
                                // no-op that protects it from the diff below.
                                publishable.push(previous.as_ref().clone());
                            }
                        }
                    }
                }
            }
        }

        let names: Vec<String> = publishable.iter().map(|c| c.name.clone()).collect();
        let summary = self.registry.sync_file(relative, publishable);
        (names, summary.removed, failures)
    }

    /// Drop everything known about `path`: cache entries and registry
    /// records. Used for deletions. Returns removed component count.
    pub async fn remove_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let canonical = self
            .project
            .validator()
            .validate(&path.as_ref().to_string_lossy(), ValidationProfile::Filesystem)?;
        let relative = relative_to_root(self.project.root(), &canonical);
        Ok(self.forget_file(&canonical, &relative).await)
    }

    /// Shut down the owned worker pool. Queued jobs are drained first.
    pub async fn close(&self) {
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            drop(pool.tx);
            for worker in pool.workers {
                let _ = worker.await;
            }
            debug!("scanner worker pool stopped");
        }
    }

    async fn forget_file(&self, canonical: &Path, relative: &Path) -> usize {
        self.cache.invalidate(canonical).await;
        self.registry.remove_file(relative)
    }

    fn build_records(
        &self,
        relative: &Path,
        fingerprint: &str,
        last_mod: DateTime<Utc>,
        signature: parse::ParsedSignature,
    ) -> Vec<Component> {
        let package = sanitize_identifier(&signature.package);
        signature
            .components
            .into_iter()
            .map(|raw| Component {
                name: sanitize_identifier(&raw.name),
                package: package.clone(),
                file_path: relative.to_path_buf(),
                parameters: raw.parameters,
                imports: signature.imports.clone(),
                dependencies: raw
                    .dependencies
                    .iter()
                    .map(|d| sanitize_identifier(d))
                    .collect(),
                last_mod,
                hash: fingerprint.to_string(),
                metadata: Default::default(),
            })
            .collect()
    }

    fn collect_templates(&self, dir: &Path) -> Vec<PathBuf> {
        let excludes: Vec<glob::Pattern> = self
            .config
            .exclude
            .iter()
            .filter_map(|raw| match glob::Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(error) => {
                    warn!(pattern = %raw, %error, "ignoring invalid exclude pattern");
                    None
                }
            })
            .collect();

        WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_ignored_dir(entry))
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.project.is_template(path))
            .filter(|path| {
                let relative = relative_to_root(self.project.root(), path);
                !excludes.iter().any(|p| p.matches_path(&relative))
            })
            .collect()
    }

    async fn ensure_pool(self: &Arc<Self>) {
        let mut pool = self.pool.lock().await;
        if pool.is_some() {
            return;
        }
        let workers = self.config.worker_count.max(1);
        let (tx, rx) = mpsc::channel::<ScanJob>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let scanner = Arc::clone(self);
                tokio::spawn(async move {
                    debug!(id, "scan worker started");
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        let errors = scanner.scan_path_counting(&job.path).await;
                        let _ = job.done.send(errors);
                    }
                    debug!(id, "scan worker stopped");
                })
            })
            .collect();
        *pool = Some(ScanPool {
            tx,
            workers: handles,
        });
    }

    async fn scan_path_counting(&self, path: &Path) -> usize {
        match self.scan_file(path).await {
            Ok(outcome) => usize::from(outcome.used_fallback) + outcome.plugin_failures,
            Err(error) => {
                warn!(path = %path.display(), %error, "scan failed");
                1
            }
        }
    }
}

fn is_ignored_dir(entry: &walkdir::DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| {
            matches!(name, "node_modules" | "target" | "vendor")
                || (name.starts_with('.') && name.len() > 1)
        })
}

async fn read_full(file: &mut File, size: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size as usize);
    if size <= STREAM_THRESHOLD {
        file.read_to_end(&mut buf).await?;
        return Ok(buf);
    }
    // Bounded chunks keep transient buffers small for big files.
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

impl From<walkdir::Error> for WeftError {
    fn from(error: walkdir::Error) -> Self {
        match error.io_error() {
            Some(_) => WeftError::Io(error.into_io_error().expect("io error present")),
            None => WeftError::Internal(error.to_string()),
        }
    }
}
