//! Path and argument validation.
//!
//! Every path that reaches the scanner, the caches, or the compiler command
//! line goes through [`PathValidator`]. A single allow-listed project root is
//! established at startup; relative paths resolve against it and absolute
//! paths must stay under it. Validation is purely lexical so that paths for
//! files that no longer exist (deletes) can still be checked.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::Mutex;

use lru::LruCache;

use crate::error::{Result, WeftError};

/// How strict the screening is for a given consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationProfile {
    /// Path is used for filesystem access only.
    Filesystem,
    /// Path is passed to an external process as a command argument; shell
    /// metacharacters are rejected outright.
    Argument,
}

/// Bytes that are never allowed in command arguments.
const DANGEROUS_BYTES: &[u8] = b"\0;&|`$()<>\\'\"";

/// Absolute prefixes that are never valid template locations.
const RESTRICTED_ROOTS: &[&str] = &["/etc", "/proc", "/sys", "/dev", "/boot", "/root"];

/// Capacity of the raw-input result cache. Correctness does not depend on
/// the cache; it only skips re-cleaning hot paths during scans.
const CACHE_CAPACITY: usize = 256;

/// Validates paths against a single project root.
pub struct PathValidator {
    root: PathBuf,
    cache: Mutex<LruCache<(String, ValidationProfile), PathBuf>>,
}

impl std::fmt::Debug for PathValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathValidator")
            .field("root", &self.root)
            .finish()
    }
}

impl PathValidator {
    /// `root` must be absolute. It is cleaned lexically but not resolved
    /// through the filesystem; callers canonicalize first when they need
    /// symlink resolution.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(WeftError::PathValidation {
                path: root.display().to_string(),
                reason: "project root must be absolute".to_string(),
            });
        }
        let root = clean_lexically(&root).ok_or_else(|| WeftError::PathValidation {
            path: root.display().to_string(),
            reason: "project root contains traversal".to_string(),
        })?;
        Ok(Self {
            root,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `raw` and return its canonical absolute form under the
    /// project root.
    pub fn validate(&self, raw: &str, profile: ValidationProfile) -> Result<PathBuf> {
        let key = (raw.to_string(), profile);
        if let Some(hit) = self.cache.lock().expect("validator cache poisoned").get(&key) {
            return Ok(hit.clone());
        }

        let canonical = self.validate_uncached(raw, profile)?;
        self.cache
            .lock()
            .expect("validator cache poisoned")
            .put(key, canonical.clone());
        Ok(canonical)
    }

    /// Screen a non-path string destined for the compiler command line.
    pub fn validate_argument(&self, raw: &str) -> Result<()> {
        if raw.is_empty() {
            return Err(WeftError::PathValidation {
                path: raw.to_string(),
                reason: "empty argument".to_string(),
            });
        }
        check_dangerous(raw)?;
        Ok(())
    }

    fn validate_uncached(&self, raw: &str, profile: ValidationProfile) -> Result<PathBuf> {
        if raw.is_empty() {
            return Err(WeftError::PathValidation {
                path: raw.to_string(),
                reason: "empty path".to_string(),
            });
        }
        if raw.as_bytes().contains(&0) {
            return Err(WeftError::PathValidation {
                path: raw.escape_default().to_string(),
                reason: "dangerous character NUL".to_string(),
            });
        }
        if profile == ValidationProfile::Argument {
            check_dangerous(raw)?;
        }

        let candidate = Path::new(raw);
        let absolute = if candidate.is_absolute() {
            for restricted in RESTRICTED_ROOTS {
                if candidate.starts_with(restricted) && !self.root.starts_with(restricted) {
                    return Err(WeftError::PathValidation {
                        path: raw.to_string(),
                        reason: format!("restricted path prefix {restricted}"),
                    });
                }
            }
            clean_lexically(candidate).ok_or_else(|| WeftError::PathValidation {
                path: raw.to_string(),
                reason: "path traversal above filesystem root".to_string(),
            })?
        } else {
            let cleaned =
                clean_relative(candidate).ok_or_else(|| WeftError::PathValidation {
                    path: raw.to_string(),
                    reason: "path traversal escapes the project root".to_string(),
                })?;
            self.root.join(cleaned)
        };

        if !absolute.starts_with(&self.root) {
            return Err(WeftError::PathValidation {
                path: raw.to_string(),
                reason: "resolves outside the project root".to_string(),
            });
        }

        Ok(absolute)
    }
}

fn check_dangerous(raw: &str) -> Result<()> {
    for &byte in raw.as_bytes() {
        if DANGEROUS_BYTES.contains(&byte) {
            let shown = (byte as char).escape_default().to_string();
            return Err(WeftError::PathValidation {
                path: raw.escape_default().to_string(),
                reason: format!("dangerous character '{shown}'"),
            });
        }
    }
    Ok(())
}

/// Lexically normalize an absolute path; `None` when `..` pops past the
/// filesystem root.
fn clean_lexically(path: &Path) -> Option<PathBuf> {
    let mut cleaned = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            PathComponent::Prefix(p) => cleaned.push(p.as_os_str()),
            PathComponent::RootDir => cleaned.push(PathComponent::RootDir.as_os_str()),
            PathComponent::CurDir => {}
            PathComponent::Normal(seg) => {
                cleaned.push(seg);
                depth += 1;
            }
            PathComponent::ParentDir => {
                if depth == 0 {
                    return None;
                }
                cleaned.pop();
                depth -= 1;
            }
        }
    }
    Some(cleaned)
}

/// Lexically normalize a relative path; `None` when `..` escapes upward.
fn clean_relative(path: &Path) -> Option<PathBuf> {
    let mut cleaned = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            PathComponent::Normal(seg) => {
                cleaned.push(seg);
                depth += 1;
            }
            PathComponent::CurDir => {}
            PathComponent::ParentDir => {
                if depth == 0 {
                    return None;
                }
                cleaned.pop();
                depth -= 1;
            }
            PathComponent::Prefix(_) | PathComponent::RootDir => return None,
        }
    }
    Some(cleaned)
}

/// Reduce an identifier to `[A-Za-z0-9_]` so template names can never smuggle
/// shell metacharacters downstream. Empty or digit-leading results get a
/// leading underscore.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut sanitized: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if sanitized.is_empty() || sanitized.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

/// Convenience for diffing sets of validated paths.
pub fn relative_to_root(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}

/// Deduplicate while preserving first-seen order.
pub fn dedup_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> PathValidator {
        PathValidator::new("/srv/project").unwrap()
    }

    #[test]
    fn resolves_relative_paths_under_root() {
        let v = validator();
        let p = v
            .validate("components/button.templ", ValidationProfile::Filesystem)
            .unwrap();
        assert_eq!(p, PathBuf::from("/srv/project/components/button.templ"));
    }

    #[test]
    fn rejects_empty_input() {
        let err = validator()
            .validate("", ValidationProfile::Filesystem)
            .unwrap_err();
        assert!(err.to_string().contains("empty path"));
    }

    #[test]
    fn rejects_shell_metacharacters_in_arguments() {
        let err = validator()
            .validate("config.js; rm -rf /", ValidationProfile::Argument)
            .unwrap_err();
        assert!(err.to_string().contains("dangerous character"));
    }

    #[test]
    fn filesystem_profile_allows_spaces_but_not_nul() {
        let v = validator();
        assert!(
            v.validate("a dir/file.templ", ValidationProfile::Filesystem)
                .is_ok()
        );
        assert!(
            v.validate("bad\0name", ValidationProfile::Filesystem)
                .is_err()
        );
    }

    #[test]
    fn rejects_traversal() {
        let err = validator()
            .validate("../../etc/passwd", ValidationProfile::Filesystem)
            .unwrap_err();
        assert!(err.to_string().contains("traversal"));
    }

    #[test]
    fn rejects_interior_traversal_that_escapes() {
        let err = validator()
            .validate("components/../../outside", ValidationProfile::Filesystem)
            .unwrap_err();
        assert!(err.to_string().contains("traversal"));
    }

    #[test]
    fn interior_traversal_that_stays_inside_is_cleaned() {
        let p = validator()
            .validate("components/sub/../button.templ", ValidationProfile::Filesystem)
            .unwrap();
        assert_eq!(p, PathBuf::from("/srv/project/components/button.templ"));
    }

    #[test]
    fn rejects_restricted_absolute_roots() {
        for raw in ["/etc/passwd", "/proc/self/environ", "/dev/null"] {
            let err = validator()
                .validate(raw, ValidationProfile::Filesystem)
                .unwrap_err();
            assert!(
                err.to_string().contains("restricted path"),
                "expected restricted rejection for {raw}"
            );
        }
    }

    #[test]
    fn rejects_absolute_paths_outside_root() {
        let err = validator()
            .validate("/srv/other/file.templ", ValidationProfile::Filesystem)
            .unwrap_err();
        assert!(err.to_string().contains("outside the project root"));
    }

    #[test]
    fn accepts_absolute_paths_inside_root() {
        let p = validator()
            .validate("/srv/project/nested/x.templ", ValidationProfile::Filesystem)
            .unwrap();
        assert_eq!(p, PathBuf::from("/srv/project/nested/x.templ"));
    }

    #[test]
    fn cached_results_match_uncached() {
        let v = validator();
        let first = v
            .validate("components/a.templ", ValidationProfile::Filesystem)
            .unwrap();
        let second = v
            .validate("components/a.templ", ValidationProfile::Filesystem)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn fuzzes_metacharacters_in_argument_profile() {
        let v = validator();
        for c in [';', '&', '|', '`', '$', '(', ')', '<', '>', '\\', '\'', '"'] {
            let raw = format!("file{c}name.templ");
            assert!(
                v.validate(&raw, ValidationProfile::Argument).is_err(),
                "metacharacter {c:?} must be rejected"
            );
            assert!(v.validate_argument(&raw).is_err());
        }
    }

    #[test]
    fn sanitizes_identifiers() {
        assert_eq!(sanitize_identifier("Button"), "Button");
        assert_eq!(sanitize_identifier("Btn;rm"), "Btnrm");
        assert_eq!(sanitize_identifier("9lives"), "_9lives");
        assert_eq!(sanitize_identifier("$()"), "_");
    }
}
