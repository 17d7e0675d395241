//! Wires the pipeline end to end: watcher batches drive the scanner, the
//! registry's events and the build pool's results become reload events, and
//! freshly scanned components are queued for rebuilds with pre/post build
//! hooks around each batch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::paths::relative_to_root;
use weft_core::watch::{ChangeHandler, FileWatcher};
use weft_core::{BuildPriority, BuildStatus, ChangeEvent, ChangeKind, Component, RegistryEvent};

use crate::reload::ReloadEvent;
use crate::state::AppState;

pub struct Orchestrator {
    watcher: FileWatcher,
    tasks: Vec<JoinHandle<()>>,
}

/// Run the initial scan, start the watcher, and hook the registry and build
/// pool up to the reload hub.
pub async fn start(state: &AppState, ctx: &CancellationToken) -> anyhow::Result<Orchestrator> {
    let mut initial_errors = 0usize;
    for path in &state.config.scanner.paths {
        let dir = if path.is_absolute() {
            path.clone()
        } else {
            state.project.root().join(path)
        };
        if !dir.is_dir() {
            warn!(path = %dir.display(), "configured scan path is not a directory; skipping");
            continue;
        }
        initial_errors += state.scanner.scan_directory(&dir).await?;
    }
    info!(
        components = state.registry.count(),
        errors = initial_errors,
        "initial scan complete"
    );

    let mut tasks = Vec::new();

    // Registry events → per-component reload events.
    {
        let state = state.clone();
        let ctx = ctx.clone();
        let mut events = state.registry.watch();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let change = event.kind();
                        if let RegistryEvent::Added { component, .. }
                        | RegistryEvent::Updated { component, .. }
                        | RegistryEvent::Removed { component, .. } = event
                        {
                            state
                                .hub
                                .broadcast(ReloadEvent::component_changed(component.name, change));
                        }
                    }
                }
            }
        }));
    }

    // Build results → build_succeeded / build_failed, in completion order.
    {
        let state = state.clone();
        let ctx = ctx.clone();
        let mut results = state.build_pool.subscribe_results();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    result = results.recv() => {
                        let Ok(result) = result else { break };
                        let event = match result.status {
                            BuildStatus::Succeeded => {
                                ReloadEvent::build_succeeded(&result.component, result.cached)
                            }
                            BuildStatus::Cancelled => continue,
                            _ => ReloadEvent::build_failed(
                                &result.component,
                                result.error.as_deref(),
                                &result.parsed_errors,
                            ),
                        };
                        state.hub.broadcast(event);
                    }
                }
            }
        }));
    }

    // Watcher → scanner → builds.
    let mut watcher = FileWatcher::new(
        state
            .config
            .scanner
            .watcher_config(state.plugins.watcher_patterns()),
    );
    for path in &state.config.scanner.paths {
        let dir = if path.is_absolute() {
            path.clone()
        } else {
            state.project.root().join(path)
        };
        if dir.is_dir() {
            watcher.add_path(dir);
        }
    }
    watcher.add_handler(Arc::new(PipelineHandler {
        state: state.clone(),
    }));
    watcher.start(ctx.clone()).await?;

    Ok(Orchestrator { watcher, tasks })
}

impl Orchestrator {
    pub async fn shutdown(mut self) {
        self.watcher.stop().await;
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

struct PipelineHandler {
    state: AppState,
}

#[async_trait]
impl ChangeHandler for PipelineHandler {
    async fn handle_batch(&self, batch: &[ChangeEvent]) {
        self.state.plugins.notify_change(batch).await;

        let mut affected: HashMap<String, Arc<Component>> = HashMap::new();
        for event in batch {
            if !self.state.project.is_template(&event.path) {
                continue;
            }
            let display = relative_to_root(self.state.project.root(), &event.path)
                .display()
                .to_string();

            match event.kind {
                ChangeKind::Delete => match self.state.scanner.remove_file(&event.path).await {
                    Ok(_) => self.state.hub.broadcast(ReloadEvent::file_changed(display)),
                    Err(error) => {
                        warn!(path = %event.path.display(), %error, "failed to process deletion");
                    }
                },
                // Renames land here too: a vanished path scans as a removal,
                // a present one as a regular parse.
                _ => match self.state.scanner.scan_file(&event.path).await {
                    Ok(outcome) => {
                        self.state.hub.broadcast(ReloadEvent::file_changed(display));
                        for name in outcome.components {
                            if let Some(component) = self.state.registry.get(&name) {
                                affected.insert(name, component);
                            }
                        }
                    }
                    Err(error) => {
                        warn!(path = %event.path.display(), %error, "failed to scan changed file");
                    }
                },
            }
        }

        if affected.is_empty() {
            return;
        }
        let components: Vec<Arc<Component>> = affected.into_values().collect();
        let state = self.state.clone();
        // Builds run off the watcher's dispatch path so slow compiles never
        // delay the next change batch.
        tokio::spawn(async move {
            state.plugins.pre_build(&components).await;
            let mut receivers = Vec::new();
            for component in &components {
                match state
                    .build_pool
                    .submit(Arc::clone(component), BuildPriority::Watcher)
                    .await
                {
                    Ok(receiver) => receivers.push(receiver),
                    Err(error) => {
                        warn!(component = %component.name, %error, "build submission failed");
                    }
                }
            }
            let mut results = Vec::new();
            for receiver in receivers {
                if let Ok(result) = receiver.await {
                    results.push(result);
                }
            }
            state.plugins.post_build(&components, &results).await;
        });
    }
}
