//! Filesystem watching.
//!
//! A thin wrapper around `notify` that debounces raw filesystem
//! notifications into ordered, per-path de-duplicated batches and hands them
//! to registered handlers. Handlers run sequentially on a dedicated task so
//! batch order is preserved; a slow handler backpressures delivery but never
//! the OS event stream: when the handler falls more than a bounded number
//! of batches behind, the oldest batches are dropped and counted.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::event::{EventKind, ModifyKind, RemoveKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Notify, mpsc};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::component::{ChangeEvent, ChangeKind};
use crate::error::{Result, WeftError};

/// Configuration knobs for watch processing.
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Debounce window for coalescing rapid event bursts.
    pub debounce_window: Duration,
    /// Maximum number of changes bundled into a single flushed batch.
    pub max_batch_events: usize,
    /// Batches queued for a lagging handler before the oldest are dropped.
    pub max_pending_batches: usize,
    /// User-supplied ignore globs, matched against the full path.
    pub ignore_globs: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(100),
            max_batch_events: 1024,
            max_pending_batches: 10,
            ignore_globs: Vec::new(),
        }
    }
}

/// Pure predicate over path and change kind; `false` drops the event.
pub type ChangeFilter = Box<dyn Fn(&Path, ChangeKind) -> bool + Send + Sync>;

/// Receives flushed batches, in order, one at a time.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle_batch(&self, batch: &[ChangeEvent]);
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

struct PendingChange {
    first_kind: ChangeKind,
    last_kind: ChangeKind,
    first_seen: DateTime<Utc>,
    count: usize,
}

struct Running {
    /// Dropping the watcher stops the notify stream.
    _watcher: RecommendedWatcher,
    delivery: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Debouncing filesystem watcher.
pub struct FileWatcher {
    config: WatcherConfig,
    paths: Vec<PathBuf>,
    filters: Vec<ChangeFilter>,
    handlers: Vec<Arc<dyn ChangeHandler>>,
    dropped_batches: Arc<AtomicU64>,
    running: Option<Running>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("paths", &self.paths)
            .field("handlers", &self.handlers.len())
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl FileWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            paths: Vec::new(),
            filters: Vec::new(),
            handlers: Vec::new(),
            dropped_batches: Arc::new(AtomicU64::new(0)),
            running: None,
        }
    }

    /// Watch `path` (recursively) once started.
    pub fn add_path(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    pub fn add_filter(&mut self, filter: ChangeFilter) {
        self.filters.push(filter);
    }

    pub fn add_handler(&mut self, handler: Arc<dyn ChangeHandler>) {
        self.handlers.push(handler);
    }

    /// Batches dropped because handlers lagged too far behind.
    pub fn dropped_batch_count(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    /// Start watching. Runs until `ctx` is cancelled or [`stop`](Self::stop)
    /// is called; on return from either, all queued batches have been
    /// observed by the handlers.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        if self.running.is_some() {
            return Err(WeftError::Internal("watcher already started".to_string()));
        }
        if self.paths.is_empty() {
            return Err(WeftError::Internal("no paths to watch".to_string()));
        }

        let capacity = self.config.max_batch_events.max(64) * 4;
        let (raw_tx, raw_rx) = mpsc::channel::<WatchMessage>(capacity);

        let paths = self.paths.clone();
        let watcher = spawn_blocking(move || init_watcher(paths, raw_tx))
            .await
            .map_err(|e| WeftError::Internal(format!("watcher init panicked: {e}")))??;

        let cancel = ctx.child_token();
        let queue = Arc::new(BatchQueue {
            batches: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_pending: self.config.max_pending_batches,
            dropped: Arc::clone(&self.dropped_batches),
        });

        let ignore = IgnoreRules::new(&self.config.ignore_globs);
        let filters = std::mem::take(&mut self.filters);
        let dispatcher = tokio::spawn(dispatch_loop(
            self.config.clone(),
            raw_rx,
            cancel.clone(),
            ignore,
            filters,
            Arc::clone(&queue),
        ));

        let handlers = self.handlers.clone();
        let delivery = tokio::spawn(delivery_loop(queue, handlers, dispatcher));

        self.running = Some(Running {
            _watcher: watcher,
            delivery,
            cancel,
        });
        Ok(())
    }

    /// Stop watching. Idempotent; returns after all internal tasks exit and
    /// every already-queued batch has been handled.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.delivery.await;
        debug!("file watcher stopped");
    }
}

struct BatchQueue {
    batches: std::sync::Mutex<VecDeque<Vec<ChangeEvent>>>,
    notify: Notify,
    max_pending: usize,
    dropped: Arc<AtomicU64>,
}

impl BatchQueue {
    fn push(&self, batch: Vec<ChangeEvent>) {
        {
            let mut batches = self.batches.lock().expect("batch queue poisoned");
            if batches.len() >= self.max_pending {
                batches.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "watch handler lagging; dropped oldest batch");
            }
            batches.push_back(batch);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Vec<ChangeEvent>> {
        self.batches.lock().expect("batch queue poisoned").pop_front()
    }
}

async fn dispatch_loop(
    config: WatcherConfig,
    mut raw_rx: mpsc::Receiver<WatchMessage>,
    cancel: CancellationToken,
    ignore: IgnoreRules,
    filters: Vec<ChangeFilter>,
    queue: Arc<BatchQueue>,
) {
    let mut pending: HashMap<PathBuf, PendingChange> = HashMap::new();

    loop {
        let msg = if pending.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = raw_rx.recv() => msg,
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {
                    flush(&mut pending, &queue);
                    break;
                }
                res = timeout(config.debounce_window, raw_rx.recv()) => match res {
                    Ok(msg) => msg,
                    Err(_) => {
                        flush(&mut pending, &queue);
                        continue;
                    }
                },
            }
        };

        let Some(msg) = msg else {
            flush(&mut pending, &queue);
            break;
        };

        match msg {
            WatchMessage::Event(event) => {
                for (path, kind) in classify(&event) {
                    if ignore.matches(&path) {
                        continue;
                    }
                    if !filters.iter().all(|f| f(&path, kind)) {
                        continue;
                    }
                    match pending.get_mut(&path) {
                        Some(entry) => {
                            entry.last_kind = kind;
                            entry.count += 1;
                        }
                        None => {
                            pending.insert(
                                path,
                                PendingChange {
                                    first_kind: kind,
                                    last_kind: kind,
                                    first_seen: Utc::now(),
                                    count: 1,
                                },
                            );
                        }
                    }
                }
                if pending.len() >= config.max_batch_events {
                    flush(&mut pending, &queue);
                }
            }
            WatchMessage::Error(error) => {
                warn!(%error, "watch backend error");
            }
        }
    }
}

async fn delivery_loop(
    queue: Arc<BatchQueue>,
    handlers: Vec<Arc<dyn ChangeHandler>>,
    mut dispatcher: JoinHandle<()>,
) {
    loop {
        while let Some(batch) = queue.pop() {
            for handler in &handlers {
                handler.handle_batch(&batch).await;
            }
        }
        tokio::select! {
            _ = queue.notify.notified() => {}
            _ = &mut dispatcher => {
                // Dispatcher exited (cancelled or stream closed): drain what
                // it flushed on the way out, then stop.
                while let Some(batch) = queue.pop() {
                    for handler in &handlers {
                        handler.handle_batch(&batch).await;
                    }
                }
                break;
            }
        }
    }
}

/// Collapse pending per-path changes and emit one ordered batch.
fn flush(pending: &mut HashMap<PathBuf, PendingChange>, queue: &BatchQueue) {
    if pending.is_empty() {
        return;
    }
    let mut batch: Vec<ChangeEvent> = pending
        .drain()
        .filter_map(|(path, entry)| {
            resolve_kind(&entry).map(|kind| ChangeEvent {
                path,
                kind,
                timestamp: entry.first_seen,
            })
        })
        .collect();
    batch.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path)));
    if !batch.is_empty() {
        queue.push(batch);
    }
}

/// Coalescing rules: a lone event keeps its kind; multiple events for one
/// path collapse to `modify`, unless the last was `delete` (then `delete`),
/// unless the path was also created inside the window (then it was transient
/// and is dropped).
fn resolve_kind(entry: &PendingChange) -> Option<ChangeKind> {
    if entry.count == 1 {
        return Some(entry.last_kind);
    }
    match (entry.first_kind, entry.last_kind) {
        (ChangeKind::Create, ChangeKind::Delete) => None,
        (_, ChangeKind::Delete) => Some(ChangeKind::Delete),
        _ => Some(ChangeKind::Modify),
    }
}

fn classify(event: &Event) -> Vec<(PathBuf, ChangeKind)> {
    let kind = match &event.kind {
        EventKind::Create(_) => ChangeKind::Create,
        EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Rename,
        EventKind::Modify(_) => ChangeKind::Modify,
        EventKind::Remove(RemoveKind::File | RemoveKind::Folder | RemoveKind::Any) => {
            ChangeKind::Delete
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other | EventKind::Remove(_) => {
            return Vec::new();
        }
    };
    event.paths.iter().map(|p| (p.clone(), kind)).collect()
}

struct IgnoreRules {
    globs: Vec<glob::Pattern>,
}

impl IgnoreRules {
    fn new(raw: &[String]) -> Self {
        let globs = raw
            .iter()
            .filter_map(|pattern| match glob::Pattern::new(pattern) {
                Ok(p) => Some(p),
                Err(error) => {
                    warn!(%pattern, %error, "ignoring invalid watch glob");
                    None
                }
            })
            .collect();
        Self { globs }
    }

    fn matches(&self, path: &Path) -> bool {
        if path.components().any(|c| {
            c.as_os_str().to_str().is_some_and(|s| {
                matches!(s, ".git" | "node_modules" | "target")
                    || (s.starts_with('.') && s.len() > 1)
            })
        }) {
            return true;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && (name.ends_with('~')
                || name.ends_with(".tmp")
                || name.ends_with(".swp")
                || name.ends_with(".swx")
                || name.starts_with(".#"))
        {
            return true;
        }
        self.globs.iter().any(|g| g.matches_path(path))
    }
}

fn init_watcher(
    paths: Vec<PathBuf>,
    tx: mpsc::Sender<WatchMessage>,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                if tx.blocking_send(WatchMessage::Event(event)).is_err() {
                    // Dispatcher gone; the stream is shutting down.
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchMessage::Error(err.to_string()));
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|err| WeftError::Internal(format!("failed to create watcher: {err}")))?;

    for path in &paths {
        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|err| {
                WeftError::Internal(format!("failed to watch {}: {err}", path.display()))
            })?;
    }

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn entry(kinds: &[ChangeKind]) -> PendingChange {
        PendingChange {
            first_kind: kinds[0],
            last_kind: *kinds.last().unwrap(),
            first_seen: Utc::now(),
            count: kinds.len(),
        }
    }

    #[test]
    fn coalescing_rules() {
        use ChangeKind::*;
        assert_eq!(resolve_kind(&entry(&[Create])), Some(Create));
        assert_eq!(resolve_kind(&entry(&[Delete])), Some(Delete));
        assert_eq!(resolve_kind(&entry(&[Modify, Modify])), Some(Modify));
        assert_eq!(resolve_kind(&entry(&[Modify, Delete])), Some(Delete));
        assert_eq!(resolve_kind(&entry(&[Create, Modify])), Some(Modify));
        assert_eq!(resolve_kind(&entry(&[Create, Modify, Delete])), None);
        assert_eq!(resolve_kind(&entry(&[Rename, Modify])), Some(Modify));
    }

    #[test]
    fn builtin_ignores() {
        let rules = IgnoreRules::new(&[]);
        assert!(rules.matches(Path::new("/p/.git/config")));
        assert!(rules.matches(Path::new("/p/node_modules/x/y.templ")));
        assert!(rules.matches(Path::new("/p/a/file.templ.swp")));
        assert!(rules.matches(Path::new("/p/a/file.templ~")));
        assert!(rules.matches(Path::new("/p/a/.#file.templ")));
        assert!(rules.matches(Path::new("/p/.hidden/file.templ")));
        assert!(!rules.matches(Path::new("/p/a/file.templ")));
    }

    #[test]
    fn user_globs_extend_ignores() {
        let rules = IgnoreRules::new(&["**/generated/**".to_string()]);
        assert!(rules.matches(Path::new("/p/generated/out.templ")));
        assert!(!rules.matches(Path::new("/p/src/in.templ")));
    }

    #[test]
    fn flush_orders_by_first_seen() {
        let queue = BatchQueue {
            batches: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_pending: 10,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let mut pending = HashMap::new();
        let base = Utc::now();
        for (i, name) in ["c.templ", "a.templ", "b.templ"].iter().enumerate() {
            pending.insert(
                PathBuf::from(name),
                PendingChange {
                    first_kind: ChangeKind::Modify,
                    last_kind: ChangeKind::Modify,
                    first_seen: base + chrono::Duration::milliseconds(i as i64),
                    count: 1,
                },
            );
        }
        flush(&mut pending, &queue);
        let batch = queue.pop().unwrap();
        let order: Vec<_> = batch.iter().map(|e| e.path.clone()).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("c.templ"),
                PathBuf::from("a.templ"),
                PathBuf::from("b.templ")
            ]
        );
    }

    #[test]
    fn lagging_handlers_drop_oldest_batches() {
        let queue = BatchQueue {
            batches: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_pending: 2,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        for i in 0..4 {
            queue.push(vec![ChangeEvent {
                path: PathBuf::from(format!("{i}.templ")),
                kind: ChangeKind::Modify,
                timestamp: Utc::now(),
            }]);
        }
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 2);
        assert_eq!(queue.pop().unwrap()[0].path, PathBuf::from("2.templ"));
    }

    struct Recorder {
        batches: Mutex<Vec<Vec<ChangeEvent>>>,
    }

    #[async_trait]
    impl ChangeHandler for Recorder {
        async fn handle_batch(&self, batch: &[ChangeEvent]) {
            self.batches.lock().unwrap().push(batch.to_vec());
        }
    }

    #[tokio::test]
    async fn watches_create_modify_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();

        let recorder = Arc::new(Recorder {
            batches: Mutex::new(Vec::new()),
        });
        let mut watcher = FileWatcher::new(WatcherConfig {
            debounce_window: Duration::from_millis(150),
            ..Default::default()
        });
        watcher.add_path(&root);
        watcher.add_handler(recorder.clone());

        let ctx = CancellationToken::new();
        watcher.start(ctx.clone()).await.unwrap();

        let file = root.join("button.templ");
        tokio::fs::write(&file, "package x\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::fs::remove_file(&file).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        watcher.stop().await;
        watcher.stop().await; // idempotent

        let batches = recorder.batches.lock().unwrap();
        let all: Vec<&ChangeEvent> = batches.iter().flatten().collect();
        assert!(
            all.iter()
                .any(|e| e.path == file && e.kind != ChangeKind::Delete),
            "expected a create/modify for {file:?}, got {all:?}"
        );
        assert!(
            all.iter()
                .any(|e| e.path == file && e.kind == ChangeKind::Delete),
            "expected a delete for {file:?}, got {all:?}"
        );
        for batch in batches.iter() {
            assert!(batch.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
    }

    #[tokio::test]
    async fn double_start_is_rejected_without_disturbing_the_first() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let recorder = Arc::new(Recorder {
            batches: Mutex::new(Vec::new()),
        });

        let mut watcher = FileWatcher::new(WatcherConfig {
            debounce_window: Duration::from_millis(100),
            ..Default::default()
        });
        watcher.add_path(&root);
        watcher.add_handler(recorder.clone());

        let ctx = CancellationToken::new();
        watcher.start(ctx.clone()).await.unwrap();

        let err = watcher.start(ctx.clone()).await.unwrap_err();
        assert!(err.to_string().contains("already started"));

        // The original watch keeps running after the rejected second start.
        tokio::fs::write(root.join("still.templ"), "package x\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        watcher.stop().await;

        let batches = recorder.batches.lock().unwrap();
        assert!(
            batches
                .iter()
                .flatten()
                .any(|e| e.path == root.join("still.templ")),
            "first start must stay live: {batches:?}"
        );
    }

    #[tokio::test]
    async fn filters_drop_events() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let recorder = Arc::new(Recorder {
            batches: Mutex::new(Vec::new()),
        });

        let mut watcher = FileWatcher::new(WatcherConfig {
            debounce_window: Duration::from_millis(100),
            ..Default::default()
        });
        watcher.add_path(&root);
        watcher.add_filter(Box::new(|path: &Path, _| {
            path.extension().is_some_and(|e| e == "templ")
        }));
        watcher.add_handler(recorder.clone());

        let ctx = CancellationToken::new();
        watcher.start(ctx).await.unwrap();

        tokio::fs::write(root.join("notes.txt"), "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        watcher.stop().await;

        let batches = recorder.batches.lock().unwrap();
        assert!(
            batches.iter().flatten().all(|e| e.path.extension().is_some_and(|x| x == "templ")),
            "non-template events must be filtered: {batches:?}"
        );
    }
}
