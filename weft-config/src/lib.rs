//! Typed configuration for the Weft dev engine.
//!
//! The file format is YAML; every field has a default so an empty file (or
//! no file at all) yields a working development setup. Environment
//! variables prefixed `WEFT__` override file values
//! (`WEFT__SERVER__PORT=9000`). The core crates consume the typed structs
//! produced here, never the raw file.

pub mod models;

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use thiserror::Error;
use tracing::debug;

pub use models::{
    BuildSection, CssSection, PluginEntry, PluginsSection, ScannerSection, ServerAuth,
    ServerSection, WeftConfig,
};

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// Built-in defaults; no file was found.
    #[default]
    Default,
    File(PathBuf),
}

/// Configuration failures map to CLI exit code 3.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Default file names probed in the working directory when no explicit path
/// is given.
const DEFAULT_FILES: &[&str] = &["weft.yaml", "weft.yml", ".weft.yaml"];

impl WeftConfig {
    /// Load configuration from `path`, or probe the default file names, and
    /// apply `WEFT__`-prefixed environment overrides. The result is
    /// validated.
    pub fn load(path: Option<&Path>) -> Result<(Self, ConfigSource), ConfigError> {
        let (file, source) = match path {
            Some(explicit) => {
                if !explicit.is_file() {
                    return Err(ConfigError::Invalid(format!(
                        "configuration file {} does not exist",
                        explicit.display()
                    )));
                }
                (Some(explicit.to_path_buf()), ConfigSource::File(explicit.to_path_buf()))
            }
            None => match DEFAULT_FILES
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.is_file())
            {
                Some(found) => (Some(found.clone()), ConfigSource::File(found)),
                None => (None, ConfigSource::Default),
            },
        };

        let mut builder = Config::builder();
        if let Some(file) = &file {
            builder = builder.add_source(
                File::from(file.as_path()).format(FileFormat::Yaml).required(true),
            );
        }
        builder = builder.add_source(
            Environment::with_prefix("WEFT")
                .prefix_separator("__")
                .separator("__"),
        );

        let loaded: WeftConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        debug!(?source, "configuration loaded");
        Ok((loaded, source))
    }

    /// Structural validation beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Invalid("server.host must not be empty".into()));
        }
        if self.scanner.paths.is_empty() {
            return Err(ConfigError::Invalid(
                "scanner.paths must list at least one directory".into(),
            ));
        }
        if self.scanner.debounce_ms == 0 {
            return Err(ConfigError::Invalid(
                "scanner.debounce_ms must be positive".into(),
            ));
        }
        if self.build.compiler_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "build.compiler_path must not be empty".into(),
            ));
        }
        if self.build.compiler_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "build.compiler_timeout_ms must be positive".into(),
            ));
        }
        for name in &self.plugins.enabled {
            if self.plugins.disabled.contains(name) {
                return Err(ConfigError::Invalid(format!(
                    "plugin {name:?} is both enabled and disabled"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = WeftConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 7331);
        assert_eq!(config.scanner.paths, vec![PathBuf::from(".")]);
    }

    #[test]
    fn loads_a_yaml_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("weft.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 9001\n  environment: production\nscanner:\n  paths: [\"components\", \"pages\"]\n  debounce_ms: 250\nbuild:\n  compiler_path: /usr/local/bin/templc\nplugins:\n  enabled: [\"tailwind\"]\n",
        )
        .unwrap();

        let (config, source) = WeftConfig::load(Some(&path)).unwrap();
        assert_eq!(source, ConfigSource::File(path));
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.environment, "production");
        assert_eq!(config.scanner.paths.len(), 2);
        assert_eq!(config.scanner.debounce_ms, 250);
        assert_eq!(
            config.build.compiler_path,
            PathBuf::from("/usr/local/bin/templc")
        );
        assert_eq!(config.plugins.enabled, vec!["tailwind".to_string()]);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = WeftConfig::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_contradictory_plugin_lists() {
        let mut config = WeftConfig::default();
        config.plugins.enabled = vec!["x".to_string()];
        config.plugins.disabled = vec!["x".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_debounce() {
        let mut config = WeftConfig::default();
        config.scanner.debounce_ms = 0;
        assert!(config.validate().is_err());
    }
}
