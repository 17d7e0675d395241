//! Configuration model. Every section and field carries a serde default so
//! partial files compose cleanly with the built-in development setup.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use weft_core::build::BuildConfig;
use weft_core::cache::MetadataCacheConfig;
use weft_core::plugins::{PluginConfig, PluginSettings};
use weft_core::scanner::{ScannerConfig, default_worker_count};
use weft_core::watch::WatcherConfig;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub server: ServerSection,
    pub scanner: ScannerSection,
    pub build: BuildSection,
    pub plugins: PluginsSection,
    pub css: CssSection,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// `development`, `production`, or `test`; only affects log defaults.
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub auth: ServerAuth,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7331,
            auth: ServerAuth::default(),
        }
    }
}

/// Bearer-token gate for the control endpoints. Off by default; preview
/// serving never requires auth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerAuth {
    pub enabled: bool,
    pub token: Option<String>,
}

/// Template discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSection {
    /// Directories (relative to the project root) scanned and watched.
    pub paths: Vec<PathBuf>,
    /// Glob patterns excluded from scans, relative to the project root.
    pub exclude: Vec<String>,
    /// Scan pool size. Defaults to one worker per CPU, capped at eight.
    pub worker_count: usize,
    /// Watcher debounce window. Bursts of events inside this window
    /// coalesce into one batch.
    pub debounce_ms: u64,
}

impl Default for ScannerSection {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from(".")],
            exclude: Vec::new(),
            worker_count: default_worker_count(),
            debounce_ms: 100,
        }
    }
}

impl ScannerSection {
    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            worker_count: self.worker_count.clamp(1, 64),
            exclude: self.exclude.clone(),
        }
    }

    pub fn watcher_config(&self, extra_ignores: Vec<String>) -> WatcherConfig {
        let mut ignore_globs = self.exclude.clone();
        ignore_globs.extend(extra_ignores);
        WatcherConfig {
            debounce_window: Duration::from_millis(self.debounce_ms.max(1)),
            ignore_globs,
            ..WatcherConfig::default()
        }
    }
}

/// External compiler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    /// The one allow-listed compiler binary.
    pub compiler_path: PathBuf,
    /// Arguments placed before the template path on every invocation.
    pub compiler_args: Vec<String>,
    pub compiler_timeout_ms: u64,
    /// Cache root for parse metadata and build artifacts. Defaults to
    /// `.weft-cache` under the project root.
    pub cache_dir: PathBuf,
    pub max_workers: usize,
    /// Pending-task slots before submissions start blocking.
    pub queue_capacity: usize,
}

impl Default for BuildSection {
    fn default() -> Self {
        let workers = default_worker_count();
        Self {
            compiler_path: PathBuf::from("templc"),
            compiler_args: Vec::new(),
            compiler_timeout_ms: 60_000,
            cache_dir: PathBuf::from(".weft-cache"),
            max_workers: workers,
            queue_capacity: workers * 2,
        }
    }
}

impl BuildSection {
    pub fn build_config(&self) -> BuildConfig {
        BuildConfig {
            compiler_path: self.compiler_path.clone(),
            compiler_args: self.compiler_args.clone(),
            worker_count: self.max_workers.clamp(1, 64),
            queue_capacity: self.queue_capacity.max(1),
            compile_timeout: Duration::from_millis(self.compiler_timeout_ms.max(1)),
            ..BuildConfig::default()
        }
    }

    pub fn metadata_cache_config(&self) -> MetadataCacheConfig {
        MetadataCacheConfig {
            disk_dir: Some(self.cache_dir.join("metadata")),
            ..MetadataCacheConfig::default()
        }
    }
}

/// One plugin's configuration body (its name is the map key).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginEntry {
    pub enabled: Option<bool>,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub settings: PluginSettings,
}

/// Plugin selection and per-plugin configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Names in activation order; initialization follows this order.
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
    /// Directories probed for out-of-tree plugins.
    pub discovery_paths: Vec<PathBuf>,
    pub configurations: BTreeMap<String, PluginEntry>,
}

impl PluginsSection {
    /// Effective per-plugin configs: `enabled` order first, then any
    /// configured plugin not mentioned in either list.
    pub fn plugin_configs(&self) -> Vec<PluginConfig> {
        let mut configs = Vec::new();
        let mut emitted = std::collections::BTreeSet::new();

        for name in &self.enabled {
            configs.push(self.config_for(name, true));
            emitted.insert(name.clone());
        }
        for (name, entry) in &self.configurations {
            if emitted.contains(name) {
                continue;
            }
            let enabled = !self.disabled.contains(name) && entry.enabled.unwrap_or(true);
            configs.push(self.config_for(name, enabled));
        }
        configs
    }

    fn config_for(&self, name: &str, enabled_by_list: bool) -> PluginConfig {
        let entry = self.configurations.get(name).cloned().unwrap_or_default();
        let enabled =
            enabled_by_list && !self.disabled.contains(&name.to_string()) && entry.enabled.unwrap_or(true);
        PluginConfig {
            name: name.to_string(),
            enabled,
            config: entry.config,
            settings: entry.settings,
        }
    }
}

/// CSS framework integration. Parsed for completeness; drives the external
/// CSS toolchain, not the core pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CssSection {
    pub framework: Option<String>,
    pub output_path: Option<PathBuf>,
    pub source_paths: Vec<PathBuf>,
    pub optimization: BTreeMap<String, serde_json::Value>,
    pub theming: BTreeMap<String, serde_json::Value>,
}
