//! Build pipeline and worker pool.
//!
//! `submit` enqueues a compile for one component and returns a oneshot
//! receiver for its [`BuildResult`]; results are also broadcast in
//! completion order for observers. Each task goes through three stages:
//! artifact-cache probe, external compiler invocation, and diagnostic
//! parsing. Compile errors are reported, never retried; transport failures
//! (spawn errors, timeouts) retry with exponential backoff. A panicking
//! worker is replaced and the task it held fails once with a
//! "worker restarted" error.

pub mod diagnostics;

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::{Semaphore, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ArtifactCache, artifact_hash};
use crate::component::{BuildPriority, BuildResult, BuildStatus, Component};
use crate::error::{Result, WeftError};
use crate::paths::ValidationProfile;
use crate::project::Project;

use diagnostics::parse_diagnostics;

/// The compiler invocation, as seen by build plugins. Rewrites may adjust
/// arguments; the program itself stays pinned to the allow-listed compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Installed by the embedder to let build plugins rewrite the invocation.
pub type CommandRewriter = Arc<dyn Fn(BuildCommand) -> BuildCommand + Send + Sync>;

/// Build pipeline tuning.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// The one allow-listed compiler binary.
    pub compiler_path: PathBuf,
    /// Extra arguments placed before the template path.
    pub compiler_args: Vec<String>,
    pub worker_count: usize,
    /// Queue slots; submissions beyond this block up to `submit_timeout`.
    pub queue_capacity: usize,
    pub submit_timeout: Duration,
    pub compile_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_factor: u32,
    pub retry_cap: Duration,
    /// Total transport attempts (first try included).
    pub retry_attempts: u32,
    pub artifact_max_age: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let workers = crate::scanner::default_worker_count();
        Self {
            compiler_path: PathBuf::from("templc"),
            compiler_args: Vec::new(),
            worker_count: workers,
            queue_capacity: workers * 2,
            submit_timeout: Duration::from_secs(5),
            compile_timeout: Duration::from_secs(60),
            retry_initial: Duration::from_millis(100),
            retry_factor: 2,
            retry_cap: Duration::from_secs(5),
            retry_attempts: 3,
            artifact_max_age: Duration::from_secs(7 * 24 * 3_600),
        }
    }
}

/// Counters exported for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BuildMetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub cache_hits: u64,
    pub compile_failures: u64,
    pub transport_failures: u64,
    pub cancelled: u64,
    pub worker_restarts: u64,
}

#[derive(Debug, Default)]
struct BuildMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    cache_hits: AtomicU64,
    compile_failures: AtomicU64,
    transport_failures: AtomicU64,
    cancelled: AtomicU64,
    worker_restarts: AtomicU64,
}

impl BuildMetrics {
    fn snapshot(&self) -> BuildMetricsSnapshot {
        BuildMetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &BuildResult) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if result.cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        match result.status {
            BuildStatus::Succeeded => {}
            BuildStatus::FailedCompile => {
                self.compile_failures.fetch_add(1, Ordering::Relaxed);
            }
            BuildStatus::FailedTransport => {
                self.transport_failures.fetch_add(1, Ordering::Relaxed);
            }
            BuildStatus::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

struct QueuedTask {
    component: Arc<Component>,
    priority: BuildPriority,
    sequence: u64,
    respond: oneshot::Sender<BuildResult>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Heap wrapper ordering by priority, then FIFO within a level.
struct HeapEntry(QueuedTask);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.sequence == other.0.sequence
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, then earlier sequence.
        match self.0.priority.cmp(&other.0.priority) {
            CmpOrdering::Equal => other.0.sequence.cmp(&self.0.sequence),
            ordering => ordering,
        }
    }
}

struct InFlight {
    component: String,
    respond: oneshot::Sender<BuildResult>,
}

struct PoolShared {
    project: Arc<Project>,
    config: BuildConfig,
    compiler_version: String,
    artifacts: ArtifactCache,
    queue: std::sync::Mutex<BinaryHeap<HeapEntry>>,
    queue_sem: Arc<Semaphore>,
    wake: tokio::sync::Notify,
    cancel: CancellationToken,
    slots: Vec<Arc<std::sync::Mutex<Option<InFlight>>>>,
    results_tx: broadcast::Sender<BuildResult>,
    sequence: AtomicU64,
    metrics: BuildMetrics,
    worker_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    rewriter: std::sync::RwLock<Option<CommandRewriter>>,
}

/// Bounded, priority-aware compile pool.
pub struct BuildPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for BuildPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildPool")
            .field("compiler", &self.shared.config.compiler_path)
            .field("workers", &self.shared.config.worker_count)
            .field("metrics", &self.shared.metrics.snapshot())
            .finish()
    }
}

impl BuildPool {
    /// Probes the compiler version (for artifact hashing) and starts the
    /// workers.
    pub async fn new(project: Arc<Project>, config: BuildConfig) -> Result<Self> {
        project
            .validator()
            .validate_argument(&config.compiler_path.to_string_lossy())?;
        for arg in &config.compiler_args {
            project.validator().validate_argument(arg)?;
        }

        let compiler_version = probe_compiler_version(&config.compiler_path).await;
        let (results_tx, _) = broadcast::channel(256);
        let workers = config.worker_count.max(1);
        let artifacts = ArtifactCache::new(project.artifacts_dir(), config.artifact_max_age);

        let shared = Arc::new(PoolShared {
            queue_sem: Arc::new(Semaphore::new(config.queue_capacity.max(1))),
            slots: (0..workers)
                .map(|_| Arc::new(std::sync::Mutex::new(None)))
                .collect(),
            project,
            config,
            compiler_version,
            artifacts,
            queue: std::sync::Mutex::new(BinaryHeap::new()),
            wake: tokio::sync::Notify::new(),
            cancel: CancellationToken::new(),
            results_tx,
            sequence: AtomicU64::new(0),
            metrics: BuildMetrics::default(),
            worker_handles: std::sync::Mutex::new(Vec::new()),
            rewriter: std::sync::RwLock::new(None),
        });

        for id in 0..workers {
            spawn_worker(Arc::clone(&shared), id);
        }
        info!(workers, compiler = %shared.config.compiler_path.display(), "build pool started");

        Ok(Self { shared })
    }

    /// Enqueue a compile. Blocks up to the submit timeout when the queue is
    /// full, then fails with `Backpressure`. The receiver resolves with
    /// exactly one terminal result.
    pub async fn submit(
        &self,
        component: Arc<Component>,
        priority: BuildPriority,
    ) -> Result<oneshot::Receiver<BuildResult>> {
        if self.shared.cancel.is_cancelled() {
            return Err(WeftError::Cancelled("build pool is shut down".to_string()));
        }

        let permit = match timeout(
            self.shared.config.submit_timeout,
            Arc::clone(&self.shared.queue_sem).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(WeftError::Cancelled("build pool is shut down".to_string()));
            }
            Err(_) => return Err(WeftError::Backpressure(self.shared.config.submit_timeout)),
        };

        let (respond, receiver) = oneshot::channel();
        let task = QueuedTask {
            component,
            priority,
            sequence: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            respond,
            _permit: permit,
        };
        self.shared
            .queue
            .lock()
            .expect("build queue poisoned")
            .push(HeapEntry(task));
        self.shared.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.wake.notify_one();
        Ok(receiver)
    }

    /// Results of every finished task, in completion order.
    pub fn subscribe_results(&self) -> broadcast::Receiver<BuildResult> {
        self.shared.results_tx.subscribe()
    }

    pub fn metrics(&self) -> BuildMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn artifact_cache(&self) -> &ArtifactCache {
        &self.shared.artifacts
    }

    /// The version string folded into artifact hashes.
    pub fn compiler_version(&self) -> &str {
        &self.shared.compiler_version
    }

    /// Install the build-command rewrite chain (typically the plugin
    /// host's). Rewrites that change the program or produce arguments that
    /// fail validation are discarded; the compiler stays allow-listed.
    pub fn set_command_rewriter(&self, rewriter: CommandRewriter) {
        *self
            .shared
            .rewriter
            .write()
            .expect("rewriter lock poisoned") = Some(rewriter);
    }

    /// Drain in-flight work, cancel everything still queued, and stop the
    /// workers.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.queue_sem.close();
        self.shared.wake.notify_waiters();

        // Queued-but-never-started tasks terminate as cancelled.
        let drained: Vec<HeapEntry> = {
            let mut queue = self.shared.queue.lock().expect("build queue poisoned");
            queue.drain().collect()
        };
        for HeapEntry(task) in drained {
            let result = BuildResult::cancelled(&task.component.name);
            self.shared.metrics.record(&result);
            let _ = self.shared.results_tx.send(result.clone());
            let _ = task.respond.send(result);
        }

        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut guard = self
                    .shared
                    .worker_handles
                    .lock()
                    .expect("worker handles poisoned");
                std::mem::take(&mut *guard)
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
        info!("build pool stopped");
    }
}

fn spawn_worker(shared: Arc<PoolShared>, id: usize) {
    let slot = Arc::clone(&shared.slots[id]);
    let worker_shared = Arc::clone(&shared);
    let worker = tokio::spawn(async move {
        debug!(id, "build worker started");
        loop {
            if worker_shared.cancel.is_cancelled() {
                break;
            }
            let task = {
                let mut queue = worker_shared.queue.lock().expect("build queue poisoned");
                queue.pop()
            };
            match task {
                Some(HeapEntry(task)) => {
                    let QueuedTask {
                        component,
                        respond,
                        _permit: permit,
                        ..
                    } = task;
                    // The queue slot frees as soon as the task starts.
                    drop(permit);
                    // Wake a sibling in case more work is queued behind us.
                    worker_shared.wake.notify_one();
                    *slot.lock().expect("slot poisoned") = Some(InFlight {
                        component: component.name.clone(),
                        respond,
                    });
                    let result = process_task(&worker_shared, &component).await;
                    if let Some(in_flight) = slot.lock().expect("slot poisoned").take() {
                        worker_shared.metrics.record(&result);
                        let _ = worker_shared.results_tx.send(result.clone());
                        let _ = in_flight.respond.send(result);
                    }
                }
                None => {
                    tokio::select! {
                        _ = worker_shared.cancel.cancelled() => break,
                        _ = worker_shared.wake.notified() => {}
                    }
                }
            }
        }
        debug!(id, "build worker stopped");
    });

    let monitor_shared = Arc::clone(&shared);
    let monitor_slot = Arc::clone(&shared.slots[id]);
    let monitor = tokio::spawn(async move {
        if let Err(join_error) = worker.await
            && join_error.is_panic()
        {
            monitor_shared
                .metrics
                .worker_restarts
                .fetch_add(1, Ordering::Relaxed);
            warn!(id, "build worker panicked; restarting");
            if let Some(in_flight) = monitor_slot.lock().expect("slot poisoned").take() {
                let result = transport_failure(&in_flight.component, "worker restarted");
                monitor_shared.metrics.record(&result);
                let _ = monitor_shared.results_tx.send(result.clone());
                let _ = in_flight.respond.send(result);
            }
            if !monitor_shared.cancel.is_cancelled() {
                spawn_worker(monitor_shared, id);
            }
        }
    });
    shared
        .worker_handles
        .lock()
        .expect("worker handles poisoned")
        .push(monitor);
}

/// Stage two + three: invoke the compiler and parse its output. Stage one
/// (the artifact probe) happens before this is called.
async fn process_task(shared: &Arc<PoolShared>, component: &Arc<Component>) -> BuildResult {
    let started = Instant::now();
    let name = component.name.clone();

    if shared.cancel.is_cancelled() {
        return BuildResult::cancelled(&name);
    }

    // Resolve and re-validate the template path with the argument profile:
    // it is about to be placed on a command line.
    let source_path = match shared.project.validator().validate(
        &component.file_path.to_string_lossy(),
        ValidationProfile::Argument,
    ) {
        Ok(path) => path,
        Err(error) => {
            return compile_failure(&name, started, error.to_string(), Vec::new());
        }
    };

    let source = match tokio::fs::read(&source_path).await {
        Ok(source) => source,
        Err(error) => {
            return transport_failure(&name, &format!("failed to read source: {error}"));
        }
    };

    // Stage one: artifact cache probe.
    let hash = artifact_hash(
        &source,
        &component.parameter_signature(),
        &shared.compiler_version,
    );
    if let Some(artifact) = shared.artifacts.get(&hash).await {
        debug!(component = %name, "artifact cache hit");
        return BuildResult {
            component: name,
            status: BuildStatus::Succeeded,
            success: true,
            cached: true,
            duration: started.elapsed(),
            output_bytes: artifact.len() as u64,
            error: None,
            parsed_errors: Vec::new(),
        };
    }

    // Stage two: compile, retrying transport failures with backoff.
    let mut delay = shared.config.retry_initial;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if shared.cancel.is_cancelled() {
            return BuildResult::cancelled(&name);
        }

        match run_compiler(shared, &source_path).await {
            Ok(output) if output.success => {
                if let Err(error) = shared.artifacts.put(&hash, &output.stdout).await {
                    warn!(component = %name, %error, "failed to store artifact");
                }
                return BuildResult {
                    component: name,
                    status: BuildStatus::Succeeded,
                    success: true,
                    cached: false,
                    duration: started.elapsed(),
                    output_bytes: output.stdout.len() as u64,
                    error: None,
                    parsed_errors: Vec::new(),
                };
            }
            Ok(output) => {
                // Stage three: structured diagnostics. Compile errors are
                // reported, not retried.
                let combined = format!(
                    "{}\n{}",
                    String::from_utf8_lossy(&output.stderr),
                    String::from_utf8_lossy(&output.stdout)
                );
                let diagnostics = parse_diagnostics(&combined);
                let message = format!(
                    "compiler exited with {}: {}",
                    output.exit_code,
                    first_line(&combined)
                );
                return compile_failure(&name, started, message, diagnostics);
            }
            Err(error) => {
                if attempt >= shared.config.retry_attempts {
                    warn!(component = %name, attempt, %error, "transport failure; giving up");
                    return transport_failure(&name, &error);
                }
                debug!(component = %name, attempt, %error, "transport failure; retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * shared.config.retry_factor).min(shared.config.retry_cap);
            }
        }
    }
}

struct CompilerOutput {
    success: bool,
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Apply the installed rewrite chain, holding the program to the allow-list
/// and every argument to the validator.
fn effective_command(shared: &PoolShared) -> BuildCommand {
    let base = BuildCommand {
        program: shared.config.compiler_path.clone(),
        args: shared.config.compiler_args.clone(),
    };
    let rewriter = shared.rewriter.read().expect("rewriter lock poisoned");
    let Some(rewriter) = rewriter.as_ref() else {
        return base;
    };
    let rewritten = rewriter(base.clone());
    if rewritten.program != base.program {
        warn!(
            program = %rewritten.program.display(),
            "command rewrite changed the compiler; keeping the allow-listed binary"
        );
        return base;
    }
    for arg in &rewritten.args {
        if shared.project.validator().validate_argument(arg).is_err() {
            warn!(arg = %arg.escape_default(), "command rewrite produced an invalid argument; discarding rewrite");
            return base;
        }
    }
    rewritten
}

async fn run_compiler(
    shared: &Arc<PoolShared>,
    source_path: &std::path::Path,
) -> std::result::Result<CompilerOutput, String> {
    let config = &shared.config;
    let invocation = effective_command(shared);
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .arg(source_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match timeout(config.compile_timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(error)) => return Err(format!("failed to launch compiler: {error}")),
        Err(_) => {
            return Err(format!(
                "compiler timed out after {:?}",
                config.compile_timeout
            ));
        }
    };

    Ok(CompilerOutput {
        success: output.status.success(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

async fn probe_compiler_version(compiler: &std::path::Path) -> String {
    let mut probe = Command::new(compiler);
    probe
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match timeout(Duration::from_secs(5), probe.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            first_line(&version).to_string()
        }
        _ => {
            // Unknown version only widens cache misses; never falsifies hits.
            warn!(compiler = %compiler.display(), "could not probe compiler version");
            String::new()
        }
    }
}

fn first_line(s: &str) -> &str {
    s.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

fn compile_failure(
    name: &str,
    started: Instant,
    message: String,
    parsed_errors: Vec<crate::component::Diagnostic>,
) -> BuildResult {
    BuildResult {
        component: name.to_string(),
        status: BuildStatus::FailedCompile,
        success: false,
        cached: false,
        duration: started.elapsed(),
        output_bytes: 0,
        error: Some(message),
        parsed_errors,
    }
}

fn transport_failure(name: &str, message: &str) -> BuildResult {
    BuildResult {
        component: name.to_string(),
        status: BuildStatus::FailedTransport,
        success: false,
        cached: false,
        duration: Duration::ZERO,
        output_bytes: 0,
        error: Some(message.to_string()),
        parsed_errors: Vec::new(),
    }
}
