//! Data model for the discovery-and-reload pipeline.
//!
//! A [`Component`] is an immutable snapshot produced by the scanner; the
//! registry replaces records by value and never mutates them in place. Two
//! records for the same file with equal [`Component::hash`] carry equal
//! parsed fields, which is what lets the metadata cache short-circuit
//! re-parsing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One declared template parameter, in source order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    /// Optional parameters always carry a default; required ones never do.
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl Parameter {
    pub fn required(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            optional: false,
            default: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        ty: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            optional: true,
            default: Some(default.into()),
        }
    }

    /// Canonical `name type[=default]` form used in artifact hashes.
    pub fn signature(&self) -> String {
        match &self.default {
            Some(default) => format!("{} {}={}", self.name, self.ty, default),
            None => format!("{} {}", self.name, self.ty),
        }
    }
}

/// An immutable component snapshot produced by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Identifier matching `[A-Za-z_][A-Za-z0-9_]*`; the registry key.
    pub name: String,
    /// Package the declaring file belongs to.
    pub package: String,
    /// Validated, project-relative path of the declaring file.
    pub file_path: PathBuf,
    /// Declared parameters, in source order.
    pub parameters: Vec<Parameter>,
    /// Import lines of the declaring file, in source order.
    pub imports: Vec<String>,
    /// Names of components referenced from this one. Best-effort; an empty
    /// set is not an error.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Source file mtime observed at parse time.
    pub last_mod: DateTime<Utc>,
    /// Stable fingerprint of the declaring file's content.
    pub hash: String,
    /// Free-form bag mutated only by plugins.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Component {
    /// Ordered parameter signature, the second input to the artifact hash.
    pub fn parameter_signature(&self) -> String {
        self.parameters
            .iter()
            .map(Parameter::signature)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Cached result of parsing one template file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFile {
    pub components: Vec<Component>,
    pub file_hash: String,
    pub parsed_at: DateTime<Utc>,
}

/// Catalogue change notification delivered to registry subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    Added {
        component: Component,
        timestamp: DateTime<Utc>,
    },
    Updated {
        component: Component,
        timestamp: DateTime<Utc>,
    },
    /// Carries the last-known snapshot of the removed component.
    Removed {
        component: Component,
        timestamp: DateTime<Utc>,
    },
}

impl RegistryEvent {
    pub fn component(&self) -> &Component {
        match self {
            Self::Added { component, .. }
            | Self::Updated { component, .. }
            | Self::Removed { component, .. } => component,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Updated { .. } => "updated",
            Self::Removed { .. } => "removed",
        }
    }
}

/// Kind of a filesystem change observed by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Rename,
}

/// One debounced filesystem change. Batches are ordered by first-seen
/// timestamp and de-duplicated per path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

/// Priority levels for build submissions. Within a level, FIFO.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum BuildPriority {
    Background,
    #[default]
    Watcher,
    User,
}

/// Terminal state of a build task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Succeeded,
    FailedCompile,
    FailedTransport,
    Cancelled,
}

/// Diagnostic severity parsed from compiler output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// One structured diagnostic parsed from `file:line:col: message` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub severity: Severity,
}

/// Outcome of one build task, delivered in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub component: String,
    pub status: BuildStatus,
    pub success: bool,
    /// True when stage one satisfied the build from the artifact cache.
    pub cached: bool,
    pub duration: Duration,
    pub output_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parsed_errors: Vec<Diagnostic>,
}

impl BuildResult {
    pub(crate) fn cancelled(component: &str) -> Self {
        Self {
            component: component.to_string(),
            status: BuildStatus::Cancelled,
            success: false,
            cached: false,
            duration: Duration::ZERO,
            output_bytes: 0,
            error: Some("build cancelled".to_string()),
            parsed_errors: Vec::new(),
        }
    }
}
