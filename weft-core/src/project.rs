//! The process-wide project handle.
//!
//! Constructed once at startup from configuration and threaded through every
//! subsystem constructor. Nothing in the core reads global state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, WeftError};
use crate::paths::{PathValidator, ValidationProfile};

/// Immutable description of the project being served.
#[derive(Debug)]
pub struct Project {
    root: PathBuf,
    cache_dir: PathBuf,
    template_extension: String,
    validator: PathValidator,
}

impl Project {
    /// `root` must exist; it is canonicalized so watcher paths and scanner
    /// paths agree on symlink-free prefixes. `cache_dir` is created when
    /// missing.
    pub fn new(root: impl AsRef<Path>, cache_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| WeftError::PathValidation {
            path: root.display().to_string(),
            reason: format!("project root not accessible: {e}"),
        })?;
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        let validator = PathValidator::new(&root)?;
        Ok(Arc::new(Self {
            root,
            cache_dir,
            template_extension: "templ".to_string(),
            validator,
        }))
    }

    /// Override the extension that marks a file as a template. Without an
    /// override, `.templ` files are scanned.
    pub fn with_template_extension(self: Arc<Self>, extension: impl Into<String>) -> Arc<Self> {
        let mut ext = extension.into();
        if let Some(stripped) = ext.strip_prefix('.') {
            ext = stripped.to_string();
        }
        Arc::new(Self {
            root: self.root.clone(),
            cache_dir: self.cache_dir.clone(),
            template_extension: ext,
            validator: PathValidator::new(&self.root).expect("root already validated"),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn metadata_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("metadata")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.cache_dir.join("artifacts")
    }

    pub fn template_extension(&self) -> &str {
        &self.template_extension
    }

    pub fn validator(&self) -> &PathValidator {
        &self.validator
    }

    /// True when `path` carries the template extension.
    pub fn is_template(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.template_extension))
    }

    /// Validate a raw path for filesystem use and return its canonical form.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        self.validator.validate(raw, ValidationProfile::Filesystem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_cache_dir_and_resolves_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache");
        let project = Project::new(tmp.path(), &cache).unwrap();
        assert!(cache.is_dir());
        let resolved = project.resolve("pages/index.templ").unwrap();
        assert!(resolved.starts_with(project.root()));
    }

    #[test]
    fn template_extension_matching() {
        let tmp = tempfile::tempdir().unwrap();
        let project = Project::new(tmp.path(), tmp.path().join("cache")).unwrap();
        assert!(project.is_template(Path::new("a/b.templ")));
        assert!(project.is_template(Path::new("a/b.TEMPL")));
        assert!(!project.is_template(Path::new("a/b.go")));

        let project = project.with_template_extension(".tmpl");
        assert!(project.is_template(Path::new("x.tmpl")));
        assert!(!project.is_template(Path::new("x.templ")));
    }
}
