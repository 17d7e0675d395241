//! Plugin host.
//!
//! Plugins are named, versioned capability implementations registered as
//! tagged variants with explicit dispatch: [`ComponentPlugin`] transforms
//! component records between the scanner and the registry, [`BuildPlugin`]
//! hooks builds and may rewrite the compiler command, [`WatcherPlugin`]
//! contributes watch patterns and observes change batches, and
//! [`ServerPlugin`] declares HTTP route mounts the server layer wires up. A
//! plugin offering several capabilities registers once per capability.
//!
//! A plugin failure never takes the host down: a failed `initialize`
//! excludes the plugin, hook errors are logged, and repeated health-check
//! failures auto-disable it.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::component::{BuildResult, ChangeEvent, Component};
use crate::error::{Result, WeftError};

pub use crate::build::BuildCommand;

/// Recorded resource limits. `max_tasks` is enforced by the host's call
/// gating; the rest are declarative and surfaced through status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_mem: Option<u64>,
    pub max_cpu_pct: Option<u8>,
    pub max_tasks: Option<usize>,
    pub max_fds: Option<u32>,
}

/// Per-plugin settings from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub resource_limits: ResourceLimits,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 0,
            resource_limits: ResourceLimits::default(),
        }
    }
}

impl PluginSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

/// One configuration entry for a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub settings: PluginSettings,
}

impl PluginConfig {
    pub fn enabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            config: serde_json::Map::new(),
            settings: PluginSettings::default(),
        }
    }
}

/// Base identity and lifecycle every capability shares.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    async fn initialize(&self, _config: &PluginConfig) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Transforms component records before they reach the registry.
#[async_trait]
pub trait ComponentPlugin: Plugin {
    /// Lower runs earlier; ties break on plugin name.
    fn priority(&self) -> i32 {
        100
    }

    async fn transform(&self, component: Component) -> Result<Component>;
}

/// Hooks around the build pipeline.
#[async_trait]
pub trait BuildPlugin: Plugin {
    async fn pre_build(&self, _components: &[Arc<Component>]) -> Result<()> {
        Ok(())
    }

    async fn post_build(
        &self,
        _components: &[Arc<Component>],
        _results: &[BuildResult],
    ) -> Result<()> {
        Ok(())
    }

    fn rewrite_command(&self, command: BuildCommand) -> BuildCommand {
        command
    }
}

/// Contributes watch patterns and observes change batches.
#[async_trait]
pub trait WatcherPlugin: Plugin {
    fn extra_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    async fn on_change(&self, _batch: &[ChangeEvent]) -> Result<()> {
        Ok(())
    }
}

/// Route mount declared by a server plugin. The HTTP layer owns the actual
/// handler wiring; the host only carries the declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSpec {
    pub path: String,
    pub description: String,
}

#[async_trait]
pub trait ServerPlugin: Plugin {
    fn routes(&self) -> Vec<RouteSpec> {
        Vec::new()
    }
}

/// Tagged capability with explicit dispatch.
#[derive(Clone)]
pub enum PluginCapability {
    Component(Arc<dyn ComponentPlugin>),
    Build(Arc<dyn BuildPlugin>),
    Server(Arc<dyn ServerPlugin>),
    Watcher(Arc<dyn WatcherPlugin>),
}

impl PluginCapability {
    fn base(&self) -> &dyn Plugin {
        match self {
            Self::Component(p) => p.as_ref(),
            Self::Build(p) => p.as_ref(),
            Self::Server(p) => p.as_ref(),
            Self::Watcher(p) => p.as_ref(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Component(_) => "component",
            Self::Build(_) => "build",
            Self::Server(_) => "server",
            Self::Watcher(_) => "watcher",
        }
    }
}

/// Lifecycle state of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Ready,
    /// `initialize` failed; excluded from dispatch.
    Error,
    /// Disabled by config or by repeated health failures.
    Disabled,
}

/// Status row exported through the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub version: String,
    pub kind: &'static str,
    pub state: PluginState,
    pub consecutive_health_failures: u32,
}

struct PluginEntry {
    capability: PluginCapability,
    config: PluginConfig,
    state: PluginState,
    consecutive_health_failures: u32,
}

/// Host tuning.
#[derive(Debug, Clone)]
pub struct PluginHostConfig {
    pub health_interval: Duration,
    pub health_timeout: Duration,
    /// Consecutive health failures before auto-disable.
    pub max_health_failures: u32,
    pub shutdown_timeout: Duration,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            max_health_failures: 3,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Ordered plugin registry with isolation and health supervision.
pub struct PluginHost {
    config: PluginHostConfig,
    entries: RwLock<Vec<PluginEntry>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().expect("plugin entries poisoned");
        f.debug_struct("PluginHost")
            .field("plugins", &entries.len())
            .finish()
    }
}

impl PluginHost {
    pub fn new(config: PluginHostConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: RwLock::new(Vec::new()),
            health_task: Mutex::new(None),
        })
    }

    /// Register a capability under its config entry. Registration order is
    /// configuration order and fixes initialization order.
    pub fn register(&self, capability: PluginCapability, config: PluginConfig) {
        let state = if config.enabled {
            PluginState::Ready
        } else {
            PluginState::Disabled
        };
        debug!(
            plugin = %config.name,
            kind = capability.kind(),
            enabled = config.enabled,
            "plugin registered"
        );
        self.entries
            .write()
            .expect("plugin entries poisoned")
            .push(PluginEntry {
                capability,
                config,
                state,
                consecutive_health_failures: 0,
            });
    }

    /// Initialize plugins in registration order. A failing plugin is set to
    /// `Error` and excluded, but never aborts the host.
    pub async fn initialize_all(&self) {
        let targets: Vec<(usize, PluginCapability, PluginConfig)> = {
            let entries = self.entries.read().expect("plugin entries poisoned");
            entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.state == PluginState::Ready)
                .map(|(i, e)| (i, e.capability.clone(), e.config.clone()))
                .collect()
        };

        for (index, capability, config) in targets {
            let call = timeout(
                config.settings.timeout(),
                capability.base().initialize(&config),
            )
            .await;
            match call {
                Ok(Ok(())) => {
                    info!(plugin = %config.name, "plugin initialized");
                }
                Ok(Err(error)) => {
                    warn!(plugin = %config.name, %error, "plugin initialization failed");
                    self.set_state(index, PluginState::Error);
                }
                Err(_) => {
                    warn!(plugin = %config.name, "plugin initialization timed out");
                    self.set_state(index, PluginState::Error);
                }
            }
        }
    }

    /// Pass a component through every enabled component plugin in priority
    /// order. Any error aborts this component's pipeline.
    pub async fn transform_component(&self, mut component: Component) -> Result<Component> {
        let mut transforms: Vec<(String, Duration, Arc<dyn ComponentPlugin>)> = {
            let entries = self.entries.read().expect("plugin entries poisoned");
            entries
                .iter()
                .filter(|e| e.state == PluginState::Ready)
                .filter_map(|e| match &e.capability {
                    PluginCapability::Component(p) => Some((
                        e.config.name.clone(),
                        e.config.settings.timeout(),
                        Arc::clone(p),
                    )),
                    _ => None,
                })
                .collect()
        };
        transforms.sort_by(|a, b| a.2.priority().cmp(&b.2.priority()).then(a.0.cmp(&b.0)));

        for (name, call_timeout, plugin) in transforms {
            component = match timeout(call_timeout, plugin.transform(component)).await {
                Ok(Ok(component)) => component,
                Ok(Err(error)) => {
                    return Err(WeftError::Plugin {
                        name,
                        message: error.to_string(),
                    });
                }
                Err(_) => {
                    return Err(WeftError::Plugin {
                        name,
                        message: "transform timed out".to_string(),
                    });
                }
            };
        }
        Ok(component)
    }

    /// Run `pre_build` hooks. Hook errors isolate to the plugin and are
    /// logged, never propagated.
    pub async fn pre_build(&self, components: &[Arc<Component>]) {
        for (name, call_timeout, plugin) in self.build_plugins() {
            match timeout(call_timeout, plugin.pre_build(components)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(plugin = %name, %error, "pre_build hook failed"),
                Err(_) => warn!(plugin = %name, "pre_build hook timed out"),
            }
        }
    }

    /// Run `post_build` hooks with the batch results.
    pub async fn post_build(&self, components: &[Arc<Component>], results: &[BuildResult]) {
        for (name, call_timeout, plugin) in self.build_plugins() {
            match timeout(call_timeout, plugin.post_build(components, results)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(plugin = %name, %error, "post_build hook failed"),
                Err(_) => warn!(plugin = %name, "post_build hook timed out"),
            }
        }
    }

    /// Fold the compiler invocation through every enabled build plugin.
    pub fn rewrite_command(&self, mut command: BuildCommand) -> BuildCommand {
        for (_, _, plugin) in self.build_plugins() {
            command = plugin.rewrite_command(command);
        }
        command
    }

    /// Extra watch patterns contributed by watcher plugins.
    pub fn watcher_patterns(&self) -> Vec<String> {
        self.watcher_plugins()
            .into_iter()
            .flat_map(|(_, _, p)| p.extra_patterns())
            .collect()
    }

    /// Deliver a change batch to watcher plugins. Errors are logged.
    pub async fn notify_change(&self, batch: &[ChangeEvent]) {
        for (name, call_timeout, plugin) in self.watcher_plugins() {
            match timeout(call_timeout, plugin.on_change(batch)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(plugin = %name, %error, "watch hook failed"),
                Err(_) => warn!(plugin = %name, "watch hook timed out"),
            }
        }
    }

    /// Route mounts declared by enabled server plugins.
    pub fn route_specs(&self) -> Vec<RouteSpec> {
        let entries = self.entries.read().expect("plugin entries poisoned");
        entries
            .iter()
            .filter(|e| e.state == PluginState::Ready)
            .filter_map(|e| match &e.capability {
                PluginCapability::Server(p) => Some(p.routes()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// One health sweep. A plugin failing `max_health_failures` times in a
    /// row is auto-disabled.
    pub async fn run_health_checks(&self) {
        let targets: Vec<(usize, String, PluginCapability)> = {
            let entries = self.entries.read().expect("plugin entries poisoned");
            entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.state == PluginState::Ready)
                .map(|(i, e)| (i, e.config.name.clone(), e.capability.clone()))
                .collect()
        };

        for (index, name, capability) in targets {
            let healthy = matches!(
                timeout(self.config.health_timeout, capability.base().health()).await,
                Ok(Ok(()))
            );
            let mut entries = self.entries.write().expect("plugin entries poisoned");
            let Some(entry) = entries.get_mut(index) else {
                continue;
            };
            if healthy {
                entry.consecutive_health_failures = 0;
                continue;
            }
            entry.consecutive_health_failures += 1;
            warn!(
                plugin = %name,
                failures = entry.consecutive_health_failures,
                "plugin health check failed"
            );
            if entry.consecutive_health_failures >= self.config.max_health_failures {
                entry.state = PluginState::Disabled;
                warn!(plugin = %name, "plugin auto-disabled after repeated health failures");
            }
        }
    }

    /// Start periodic health supervision until `ctx` is cancelled.
    pub async fn start_health_task(self: &Arc<Self>, ctx: CancellationToken) {
        let host = Arc::clone(self);
        let interval = self.config.health_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => host.run_health_checks().await,
                }
            }
        });
        *self.health_task.lock().await = Some(task);
    }

    /// Graceful shutdown with a per-plugin timeout.
    pub async fn shutdown_all(&self) {
        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }
        let targets: Vec<(String, PluginCapability)> = {
            let entries = self.entries.read().expect("plugin entries poisoned");
            entries
                .iter()
                .map(|e| (e.config.name.clone(), e.capability.clone()))
                .collect()
        };
        for (name, capability) in targets {
            match timeout(self.config.shutdown_timeout, capability.base().shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(plugin = %name, %error, "plugin shutdown failed"),
                Err(_) => warn!(plugin = %name, "plugin shutdown timed out"),
            }
        }
    }

    pub fn statuses(&self) -> Vec<PluginStatus> {
        let entries = self.entries.read().expect("plugin entries poisoned");
        entries
            .iter()
            .map(|e| PluginStatus {
                name: e.config.name.clone(),
                version: e.capability.base().version().to_string(),
                kind: e.capability.kind(),
                state: e.state,
                consecutive_health_failures: e.consecutive_health_failures,
            })
            .collect()
    }

    fn build_plugins(&self) -> Vec<(String, Duration, Arc<dyn BuildPlugin>)> {
        let entries = self.entries.read().expect("plugin entries poisoned");
        entries
            .iter()
            .filter(|e| e.state == PluginState::Ready)
            .filter_map(|e| match &e.capability {
                PluginCapability::Build(p) => Some((
                    e.config.name.clone(),
                    e.config.settings.timeout(),
                    Arc::clone(p),
                )),
                _ => None,
            })
            .collect()
    }

    fn watcher_plugins(&self) -> Vec<(String, Duration, Arc<dyn WatcherPlugin>)> {
        let entries = self.entries.read().expect("plugin entries poisoned");
        entries
            .iter()
            .filter(|e| e.state == PluginState::Ready)
            .filter_map(|e| match &e.capability {
                PluginCapability::Watcher(p) => Some((
                    e.config.name.clone(),
                    e.config.settings.timeout(),
                    Arc::clone(p),
                )),
                _ => None,
            })
            .collect()
    }

    fn set_state(&self, index: usize, state: PluginState) {
        let mut entries = self.entries.write().expect("plugin entries poisoned");
        if let Some(entry) = entries.get_mut(index) {
            entry.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn component(name: &str) -> Component {
        Component {
            name: name.to_string(),
            package: "ui".to_string(),
            file_path: PathBuf::from("ui.templ"),
            parameters: Vec::new(),
            imports: Vec::new(),
            dependencies: Default::default(),
            last_mod: chrono::Utc::now(),
            hash: "h".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    struct Tagger {
        name: String,
        priority: i32,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for Tagger {
        fn name(&self) -> &str {
            &self.name
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
    }

    #[async_trait]
    impl ComponentPlugin for Tagger {
        fn priority(&self) -> i32 {
            self.priority
        }

        async fn transform(&self, mut component: Component) -> Result<Component> {
            if self.fail {
                return Err(WeftError::Internal("boom".to_string()));
            }
            let order = component
                .metadata
                .entry("order".to_string())
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let serde_json::Value::Array(list) = order {
                list.push(serde_json::Value::String(self.name.clone()));
            }
            Ok(component)
        }
    }

    fn register_tagger(host: &PluginHost, name: &str, priority: i32, fail: bool) {
        host.register(
            PluginCapability::Component(Arc::new(Tagger {
                name: name.to_string(),
                priority,
                fail,
            })),
            PluginConfig::enabled(name),
        );
    }

    #[tokio::test]
    async fn transforms_run_in_priority_order_with_name_tiebreak() {
        let host = PluginHost::new(PluginHostConfig::default());
        register_tagger(&host, "zeta", 10, false);
        register_tagger(&host, "alpha", 20, false);
        register_tagger(&host, "beta", 10, false);
        host.initialize_all().await;

        let out = host.transform_component(component("Button")).await.unwrap();
        let order = out.metadata.get("order").unwrap();
        assert_eq!(
            order,
            &serde_json::json!(["beta", "zeta", "alpha"]),
            "ascending priority, names break ties"
        );
    }

    #[tokio::test]
    async fn transform_errors_surface_as_plugin_errors() {
        let host = PluginHost::new(PluginHostConfig::default());
        register_tagger(&host, "bad", 1, true);
        host.initialize_all().await;

        let err = host
            .transform_component(component("Button"))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Plugin { ref name, .. } if name == "bad"));
    }

    struct FailingInit {
        initialized: AtomicBool,
    }

    #[async_trait]
    impl Plugin for FailingInit {
        fn name(&self) -> &str {
            "failing-init"
        }
        fn version(&self) -> &str {
            "0.1.0"
        }
        async fn initialize(&self, _config: &PluginConfig) -> Result<()> {
            self.initialized.store(true, Ordering::SeqCst);
            Err(WeftError::Internal("no config".to_string()))
        }
    }

    #[async_trait]
    impl ComponentPlugin for FailingInit {
        async fn transform(&self, _component: Component) -> Result<Component> {
            panic!("must never be dispatched after failed initialize");
        }
    }

    #[tokio::test]
    async fn failed_initialize_excludes_plugin_without_aborting_host() {
        let host = PluginHost::new(PluginHostConfig::default());
        host.register(
            PluginCapability::Component(Arc::new(FailingInit {
                initialized: AtomicBool::new(false),
            })),
            PluginConfig::enabled("failing-init"),
        );
        register_tagger(&host, "good", 1, false);
        host.initialize_all().await;

        let statuses = host.statuses();
        assert_eq!(statuses[0].state, PluginState::Error);
        assert_eq!(statuses[1].state, PluginState::Ready);

        // Transform still works through the healthy plugin.
        let out = host.transform_component(component("Button")).await.unwrap();
        assert!(out.metadata.contains_key("order"));
    }

    struct Flaky {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Plugin for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn version(&self) -> &str {
            "0.1.0"
        }
        async fn health(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(WeftError::Internal("unhealthy".to_string()))
        }
    }

    #[async_trait]
    impl WatcherPlugin for Flaky {
        fn extra_patterns(&self) -> Vec<String> {
            vec!["**/*.css".to_string()]
        }
    }

    #[tokio::test]
    async fn unhealthy_plugin_is_auto_disabled() {
        let host = PluginHost::new(PluginHostConfig {
            max_health_failures: 3,
            ..Default::default()
        });
        host.register(
            PluginCapability::Watcher(Arc::new(Flaky {
                calls: AtomicU32::new(0),
            })),
            PluginConfig::enabled("flaky"),
        );
        host.initialize_all().await;
        assert_eq!(host.watcher_patterns(), vec!["**/*.css".to_string()]);

        for _ in 0..3 {
            host.run_health_checks().await;
        }
        assert_eq!(host.statuses()[0].state, PluginState::Disabled);
        // Disabled plugins contribute nothing.
        assert!(host.watcher_patterns().is_empty());
        // Disabled plugins are no longer health-checked.
        host.run_health_checks().await;
        assert_eq!(host.statuses()[0].consecutive_health_failures, 3);
    }

    #[tokio::test]
    async fn config_disabled_plugins_are_never_dispatched() {
        let host = PluginHost::new(PluginHostConfig::default());
        host.register(
            PluginCapability::Component(Arc::new(Tagger {
                name: "off".to_string(),
                priority: 0,
                fail: true,
            })),
            PluginConfig {
                enabled: false,
                ..PluginConfig::enabled("off")
            },
        );
        host.initialize_all().await;
        let out = host.transform_component(component("Button")).await.unwrap();
        assert!(out.metadata.is_empty());
    }

    struct Rewriter;

    #[async_trait]
    impl Plugin for Rewriter {
        fn name(&self) -> &str {
            "rewriter"
        }
        fn version(&self) -> &str {
            "0.1.0"
        }
    }

    #[async_trait]
    impl BuildPlugin for Rewriter {
        fn rewrite_command(&self, mut command: BuildCommand) -> BuildCommand {
            command.args.push("--minify".to_string());
            command
        }
    }

    #[tokio::test]
    async fn build_plugins_rewrite_the_command() {
        let host = PluginHost::new(PluginHostConfig::default());
        host.register(
            PluginCapability::Build(Arc::new(Rewriter)),
            PluginConfig::enabled("rewriter"),
        );
        host.initialize_all().await;

        let rewritten = host.rewrite_command(BuildCommand {
            program: PathBuf::from("templc"),
            args: vec!["generate".to_string()],
        });
        assert_eq!(rewritten.args, vec!["generate".to_string(), "--minify".to_string()]);
    }
}
