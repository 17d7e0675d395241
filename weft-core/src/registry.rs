//! The canonical component catalogue.
//!
//! The registry is the only shared mutable structure in the pipeline. Reads
//! (`get`, `get_all`, `count`) take a shared lock and proceed in parallel;
//! mutations serialize and each one emits exactly one [`RegistryEvent`] per
//! affected component. Subscribers get a bounded queue with drop-oldest
//! semantics; a dropped-event counter is kept for observability.
//!
//! The namespace is flat: the key is the component name alone. A name
//! declared by two files logs a warning and the most recent publish wins.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::component::{Component, RegistryEvent};

/// Default per-subscriber event queue depth.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Outcome summary of a per-file synchronization.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

#[derive(Default)]
struct RegistryState {
    components: HashMap<String, Arc<Component>>,
    /// Reverse index so removal by file is O(components-in-file).
    by_file: HashMap<PathBuf, HashSet<String>>,
}

/// Canonical catalogue of discovered components.
pub struct ComponentRegistry {
    state: RwLock<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
    dropped_events: Arc<AtomicU64>,
    /// Serializes mutation + emission as a unit so any one subscriber sees
    /// events for a component in mutation order. Emission itself happens
    /// after the write lock is released.
    publish: Mutex<()>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("count", &self.count())
            .field("subscribers", &self.events.receiver_count())
            .field(
                "dropped_events",
                &self.dropped_events.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_queue_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
            dropped_events: Arc::new(AtomicU64::new(0)),
            publish: Mutex::new(()),
        }
    }

    /// Publish one component. Emits `added` or `updated`; re-publishing a
    /// record whose hash is unchanged for the same file is a no-op.
    pub fn register(&self, component: Component) -> Option<RegistryEvent> {
        let _publish = self.publish.lock().expect("publish lock poisoned");
        let event = {
            let mut state = self.state.write().expect("registry lock poisoned");
            register_locked(&mut state, component)
        };
        if let Some(event) = &event {
            self.emit(event.clone());
        }
        event
    }

    /// Remove one component by name, emitting `removed` with the last-known
    /// snapshot.
    pub fn remove_component(&self, name: &str) -> Option<Arc<Component>> {
        let _publish = self.publish.lock().expect("publish lock poisoned");
        let removed = {
            let mut state = self.state.write().expect("registry lock poisoned");
            remove_locked(&mut state, name)
        };
        if let Some(component) = &removed {
            self.emit(RegistryEvent::Removed {
                component: component.as_ref().clone(),
                timestamp: Utc::now(),
            });
        }
        removed
    }

    /// Remove every component declared by `file`. Returns how many were
    /// removed.
    pub fn remove_file(&self, file: &Path) -> usize {
        let _publish = self.publish.lock().expect("publish lock poisoned");
        let removed = {
            let mut state = self.state.write().expect("registry lock poisoned");
            let names: Vec<String> = state
                .by_file
                .remove(file)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
            names
                .iter()
                .filter_map(|name| state.components.remove(name))
                .collect::<Vec<_>>()
        };
        let count = removed.len();
        for component in removed {
            self.emit(RegistryEvent::Removed {
                component: component.as_ref().clone(),
                timestamp: Utc::now(),
            });
        }
        count
    }

    /// Reconcile the catalogue with a fresh parse of `file`: new records are
    /// added or updated, records previously attributed to the file and
    /// missing from `components` are removed.
    pub fn sync_file(&self, file: &Path, components: Vec<Component>) -> SyncSummary {
        let _publish = self.publish.lock().expect("publish lock poisoned");
        let mut summary = SyncSummary::default();
        let mut events = Vec::new();

        {
            let mut state = self.state.write().expect("registry lock poisoned");
            let previous: HashSet<String> = state.by_file.get(file).cloned().unwrap_or_default();
            let mut current = HashSet::with_capacity(components.len());

            for component in components {
                current.insert(component.name.clone());
                match register_locked(&mut state, component) {
                    Some(event @ RegistryEvent::Added { .. }) => {
                        summary.added += 1;
                        events.push(event);
                    }
                    Some(event @ RegistryEvent::Updated { .. }) => {
                        summary.updated += 1;
                        events.push(event);
                    }
                    Some(_) => unreachable!("register emits added or updated"),
                    None => summary.unchanged += 1,
                }
            }

            for name in previous.difference(&current) {
                if let Some(component) = remove_locked(&mut state, name) {
                    summary.removed += 1;
                    events.push(RegistryEvent::Removed {
                        component: component.as_ref().clone(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        for event in events {
            self.emit(event);
        }
        summary
    }

    pub fn get(&self, name: &str) -> Option<Arc<Component>> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .components
            .get(name)
            .cloned()
    }

    /// Point-in-time snapshot; never reflects concurrent mutations.
    pub fn get_all(&self) -> Vec<Arc<Component>> {
        let state = self.state.read().expect("registry lock poisoned");
        let mut all: Vec<Arc<Component>> = state.components.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn count(&self) -> usize {
        self.state
            .read()
            .expect("registry lock poisoned")
            .components
            .len()
    }

    /// Component names currently attributed to `file`.
    pub fn components_in_file(&self, file: &Path) -> Vec<String> {
        let state = self.state.read().expect("registry lock poisoned");
        state
            .by_file
            .get(file)
            .map(|set| {
                let mut names: Vec<String> = set.iter().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    /// Subscribe to catalogue changes. Dropping the stream (or calling
    /// [`EventStream::unsubscribe`]) ends the subscription.
    pub fn watch(&self) -> EventStream {
        EventStream {
            rx: self.events.subscribe(),
            dropped: Arc::clone(&self.dropped_events),
        }
    }

    /// Events lost to slow subscribers since startup.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn emit(&self, event: RegistryEvent) {
        debug!(
            kind = event.kind(),
            component = %event.component().name,
            "registry event"
        );
        // No subscribers is fine; events are fire-and-forget.
        let _ = self.events.send(event);
    }
}

fn register_locked(state: &mut RegistryState, component: Component) -> Option<RegistryEvent> {
    let name = component.name.clone();
    let file = component.file_path.clone();
    let record = Arc::new(component);

    let previous = state.components.get(&name).cloned();
    if let Some(prev) = &previous {
        if prev.file_path == record.file_path && prev.hash == record.hash {
            return None;
        }
        if prev.file_path != record.file_path {
            warn!(
                component = %name,
                old_file = %prev.file_path.display(),
                new_file = %record.file_path.display(),
                "component name collision across files; last publish wins"
            );
            if let Some(set) = state.by_file.get_mut(&prev.file_path) {
                set.remove(&name);
                if set.is_empty() {
                    state.by_file.remove(&prev.file_path);
                }
            }
        }
    }

    state.components.insert(name.clone(), Arc::clone(&record));
    state.by_file.entry(file).or_default().insert(name);

    let timestamp = Utc::now();
    Some(match previous {
        None => RegistryEvent::Added {
            component: record.as_ref().clone(),
            timestamp,
        },
        Some(_) => RegistryEvent::Updated {
            component: record.as_ref().clone(),
            timestamp,
        },
    })
}

fn remove_locked(state: &mut RegistryState, name: &str) -> Option<Arc<Component>> {
    let removed = state.components.remove(name)?;
    if let Some(set) = state.by_file.get_mut(&removed.file_path) {
        set.remove(name);
        if set.is_empty() {
            state.by_file.remove(&removed.file_path);
        }
    }
    Some(removed)
}

/// Bounded subscription to registry events. When the subscriber falls more
/// than the queue capacity behind, the oldest events are dropped and counted.
pub struct EventStream {
    rx: broadcast::Receiver<RegistryEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Next event, or `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<RegistryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!(skipped, "registry subscriber lagged; oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<RegistryEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!(skipped, "registry subscriber lagged; oldest events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
