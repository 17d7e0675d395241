//! Shared application state threaded through every handler.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use weft_config::WeftConfig;
use weft_core::build::BuildPool;
use weft_core::cache::{MetadataCache, MetadataCacheConfig};
use weft_core::plugins::{PluginHost, PluginHostConfig};
use weft_core::scanner::{ComponentScanner, ComponentTransform};
use weft_core::{Component, ComponentRegistry, Project};

use crate::reload::ReloadHub;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<WeftConfig>,
    pub project: Arc<Project>,
    pub registry: Arc<ComponentRegistry>,
    pub scanner: Arc<ComponentScanner>,
    pub build_pool: Arc<BuildPool>,
    pub plugins: Arc<PluginHost>,
    pub hub: Arc<ReloadHub>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Construct every subsystem for the project at `root`. The `Project`
    /// handle built here is the only thing resembling process-wide state,
    /// and it travels by parameter.
    pub async fn initialize(config: WeftConfig, root: &Path) -> anyhow::Result<Self> {
        let cache_dir = if config.build.cache_dir.is_absolute() {
            config.build.cache_dir.clone()
        } else {
            root.join(&config.build.cache_dir)
        };
        let project = Project::new(root, cache_dir)?;

        let registry = Arc::new(ComponentRegistry::new());
        let cache = Arc::new(MetadataCache::new(MetadataCacheConfig {
            disk_dir: Some(project.metadata_cache_dir()),
            ..MetadataCacheConfig::default()
        }));
        let scanner = ComponentScanner::new(
            Arc::clone(&project),
            Arc::clone(&registry),
            cache,
            config.scanner.scanner_config(),
        );

        let plugins = PluginHost::new(PluginHostConfig::default());
        for plugin_config in config.plugins.plugin_configs() {
            if plugin_config.enabled {
                // Plugins are linked in by embedders; a bare server has no
                // providers to satisfy configured names.
                warn!(
                    plugin = %plugin_config.name,
                    "configured plugin has no registered provider; ignoring"
                );
            }
        }
        scanner.set_transform(Arc::new(HostTransform {
            host: Arc::clone(&plugins),
        }));

        let build_pool =
            Arc::new(BuildPool::new(Arc::clone(&project), config.build.build_config()).await?);
        build_pool.set_command_rewriter({
            let plugins = Arc::clone(&plugins);
            Arc::new(move |command| plugins.rewrite_command(command))
        });
        let hub = Arc::new(ReloadHub::new(VERSION));

        Ok(Self {
            config: Arc::new(config),
            project,
            registry,
            scanner,
            build_pool,
            plugins,
            hub,
            started_at: Utc::now(),
        })
    }
}

/// Adapts the plugin host to the scanner's transform seam.
struct HostTransform {
    host: Arc<PluginHost>,
}

#[async_trait]
impl ComponentTransform for HostTransform {
    async fn transform(&self, component: Component) -> weft_core::Result<Component> {
        self.host.transform_component(component).await
    }
}
