//! Fan-out broadcaster for reload events.
//!
//! The hub owns client connections once registered: each client gets a
//! bounded outgoing queue, sends never block the broadcaster, and a client
//! whose queue overflows is evicted and its connection closed. The hub does
//! not debounce (upstream coalescing already happened) but it does collapse
//! bursts of identical events inside a short window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::ReloadEvent;

/// Outgoing queue depth per client.
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Identical events inside this window collapse into one.
const COLLAPSE_WINDOW: Duration = Duration::from_millis(250);

/// What the connection task writes to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// A serialized [`ReloadEvent`] JSON frame.
    Event(String),
    /// Reply to a client `ping` text frame.
    Pong,
    /// Close the connection with a normal-closure status.
    Close,
}

struct Client {
    tx: mpsc::Sender<ClientMessage>,
}

/// Broadcast hub for preview clients.
pub struct ReloadHub {
    version: String,
    buffer: usize,
    clients: Mutex<HashMap<Uuid, Client>>,
    recent: Mutex<HashMap<(String, Option<String>, Option<String>), Instant>>,
    evictions: AtomicU64,
    delivered: AtomicU64,
    collapsed: AtomicU64,
}

impl std::fmt::Debug for ReloadHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadHub")
            .field("clients", &self.client_count())
            .field("evictions", &self.eviction_count())
            .finish()
    }
}

impl ReloadHub {
    pub fn new(version: impl Into<String>) -> Self {
        Self::with_buffer(version, DEFAULT_CLIENT_BUFFER)
    }

    pub fn with_buffer(version: impl Into<String>, buffer: usize) -> Self {
        Self {
            version: version.into(),
            buffer: buffer.max(1),
            clients: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
            evictions: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            collapsed: AtomicU64::new(0),
        }
    }

    /// Register a client. The returned receiver feeds the connection's
    /// outgoing loop; the first queued message is the `connected` event
    /// carrying the assigned id and the hub version.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<ClientMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);

        let hello = ReloadEvent::connected(id, &self.version);
        if let Ok(frame) = serde_json::to_string(&hello) {
            let _ = tx.try_send(ClientMessage::Event(frame));
        }

        self.clients
            .lock()
            .expect("hub clients poisoned")
            .insert(id, Client { tx });
        info!(client = %id, "reload client connected");
        (id, rx)
    }

    pub fn unregister(&self, id: Uuid) {
        if self
            .clients
            .lock()
            .expect("hub clients poisoned")
            .remove(&id)
            .is_some()
        {
            info!(client = %id, "reload client disconnected");
        }
    }

    /// Broadcast to every client, collapsing identical events inside the
    /// collapse window. Never blocks: full clients are evicted.
    pub fn broadcast(&self, event: ReloadEvent) {
        if self.should_collapse(&event) {
            self.collapsed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.send_to_all(event);
    }

    /// Admin-initiated broadcast; bypasses collapsing.
    pub fn trigger(&self, event: ReloadEvent) {
        self.send_to_all(event);
    }

    /// Queue a `pong` for one client.
    pub fn pong(&self, id: Uuid) {
        let clients = self.clients.lock().expect("hub clients poisoned");
        if let Some(client) = clients.get(&id) {
            let _ = client.tx.try_send(ClientMessage::Pong);
        }
    }

    /// Close every client with a normal-closure status and forget them.
    pub fn shutdown(&self) {
        let mut clients = self.clients.lock().expect("hub clients poisoned");
        for (id, client) in clients.drain() {
            let _ = client.tx.try_send(ClientMessage::Close);
            debug!(client = %id, "reload client closed on shutdown");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("hub clients poisoned").len()
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn collapsed_count(&self) -> u64 {
        self.collapsed.load(Ordering::Relaxed)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn should_collapse(&self, event: &ReloadEvent) -> bool {
        let key = event.collapse_key();
        let now = Instant::now();
        let mut recent = self.recent.lock().expect("hub recent poisoned");
        recent.retain(|_, sent| now.duration_since(*sent) < COLLAPSE_WINDOW);
        match recent.get(&key) {
            Some(_) => true,
            None => {
                recent.insert(key, now);
                false
            }
        }
    }

    fn send_to_all(&self, event: ReloadEvent) {
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to serialize reload event");
                return;
            }
        };

        let mut evicted = Vec::new();
        {
            let clients = self.clients.lock().expect("hub clients poisoned");
            for (id, client) in clients.iter() {
                match client.tx.try_send(ClientMessage::Event(frame.clone())) {
                    Ok(()) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => evicted.push(*id),
                    Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(*id),
                }
            }
        }

        for id in evicted {
            // Dropping the sender ends the connection task's outgoing loop,
            // which closes the socket.
            self.unregister(id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            warn!(client = %id, "reload client evicted (send buffer full)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_events(rx: &mut mpsc::Receiver<ClientMessage>) -> Vec<ReloadEvent> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ClientMessage::Event(frame) = msg {
                events.push(serde_json::from_str(&frame).unwrap());
            }
        }
        events
    }

    #[tokio::test]
    async fn registration_emits_connected_with_id_and_version() {
        let hub = ReloadHub::new("1.2.3");
        let (id, mut rx) = hub.register();
        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ReloadEvent::CONNECTED);
        let data = events[0].data.as_ref().unwrap();
        assert_eq!(data["version"], "1.2.3");
        assert_eq!(data["client_id"], id.to_string());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let hub = ReloadHub::new("test");
        let mut receivers: Vec<_> = (0..3).map(|_| hub.register().1).collect();
        hub.trigger(ReloadEvent::manual_reload());

        for rx in &mut receivers {
            let events = drain_events(rx);
            assert!(
                events.iter().any(|e| e.kind == ReloadEvent::MANUAL_RELOAD),
                "every client receives the broadcast"
            );
        }
    }

    #[tokio::test]
    async fn identical_events_collapse_within_the_window() {
        let hub = ReloadHub::new("test");
        let (_, mut rx) = hub.register();

        hub.broadcast(ReloadEvent::file_changed("a.templ"));
        hub.broadcast(ReloadEvent::file_changed("a.templ"));
        hub.broadcast(ReloadEvent::file_changed("b.templ"));

        let events = drain_events(&mut rx);
        let file_events: Vec<_> = events
            .iter()
            .filter(|e| e.kind == ReloadEvent::FILE_CHANGED)
            .collect();
        assert_eq!(file_events.len(), 2, "duplicate for a.templ collapsed");
        assert_eq!(hub.collapsed_count(), 1);
    }

    #[tokio::test]
    async fn full_clients_are_evicted_and_counted() {
        let hub = ReloadHub::with_buffer("test", 2);
        let (_, mut healthy_rx) = hub.register();
        let (_, slow_rx) = hub.register();
        assert_eq!(hub.client_count(), 2);

        // The healthy client drains after every send; the slow client never
        // does, so its 2-slot buffer (already holding the connected event)
        // overflows on the second broadcast. Distinct files dodge the
        // collapse window.
        let mut healthy_events = drain_events(&mut healthy_rx);
        hub.trigger(ReloadEvent::file_changed("a.templ"));
        healthy_events.extend(drain_events(&mut healthy_rx));
        hub.trigger(ReloadEvent::file_changed("b.templ"));
        healthy_events.extend(drain_events(&mut healthy_rx));

        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.eviction_count(), 1);
        drop(slow_rx);

        // Eviction of the slow client never disturbs the healthy one.
        hub.trigger(ReloadEvent::file_changed("c.templ"));
        healthy_events.extend(drain_events(&mut healthy_rx));
        let files: Vec<_> = healthy_events
            .iter()
            .filter(|e| e.kind == ReloadEvent::FILE_CHANGED)
            .collect();
        assert_eq!(files.len(), 3);
    }

    #[tokio::test]
    async fn large_payloads_survive_intact() {
        let hub = ReloadHub::new("test");
        let (_, mut rx) = hub.register();

        let blob = "x".repeat(120 * 1024);
        let mut event = ReloadEvent::manual_reload();
        event.data = Some(serde_json::json!({ "payload": blob }));
        hub.trigger(event);

        let events = drain_events(&mut rx);
        let big = events
            .iter()
            .find(|e| e.kind == ReloadEvent::MANUAL_RELOAD)
            .unwrap();
        assert_eq!(
            big.data.as_ref().unwrap()["payload"].as_str().unwrap().len(),
            120 * 1024
        );
    }

    #[tokio::test]
    async fn shutdown_sends_close_to_all_clients() {
        let hub = ReloadHub::new("test");
        let (_, mut rx) = hub.register();
        hub.shutdown();
        assert_eq!(hub.client_count(), 0);

        let mut saw_close = false;
        while let Ok(msg) = rx.try_recv() {
            if msg == ClientMessage::Close {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }
}
