//! Reload protocol messages.
//!
//! Events are JSON text frames. The `type` field is an open string so newer
//! servers can ship event types older clients simply ignore; structured
//! extras ride in `data`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One server-to-client reload event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ReloadEvent {
    pub const CONNECTED: &'static str = "connected";
    pub const FILE_CHANGED: &'static str = "file_changed";
    pub const COMPONENT_CHANGED: &'static str = "component_changed";
    pub const MANUAL_RELOAD: &'static str = "manual_reload";
    pub const BUILD_SUCCEEDED: &'static str = "build_succeeded";
    pub const BUILD_FAILED: &'static str = "build_failed";

    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            file: None,
            component: None,
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// First frame a client receives; carries its assigned id and the hub
    /// version.
    pub fn connected(client_id: uuid::Uuid, version: &str) -> Self {
        Self {
            data: Some(serde_json::json!({
                "client_id": client_id,
                "version": version,
            })),
            ..Self::new(Self::CONNECTED)
        }
    }

    pub fn file_changed(file: impl Into<String>) -> Self {
        Self {
            file: Some(file.into()),
            ..Self::new(Self::FILE_CHANGED)
        }
    }

    pub fn component_changed(component: impl Into<String>, change: &str) -> Self {
        Self {
            component: Some(component.into()),
            data: Some(serde_json::json!({ "change": change })),
            ..Self::new(Self::COMPONENT_CHANGED)
        }
    }

    pub fn manual_reload() -> Self {
        Self::new(Self::MANUAL_RELOAD)
    }

    pub fn build_succeeded(component: impl Into<String>, cached: bool) -> Self {
        Self {
            component: Some(component.into()),
            data: Some(serde_json::json!({ "cached": cached })),
            ..Self::new(Self::BUILD_SUCCEEDED)
        }
    }

    /// Failure event carrying the structured diagnostics the error overlay
    /// renders.
    pub fn build_failed(
        component: impl Into<String>,
        error: Option<&str>,
        diagnostics: &[weft_core::Diagnostic],
    ) -> Self {
        Self {
            component: Some(component.into()),
            data: Some(serde_json::json!({
                "error": error,
                "diagnostics": diagnostics,
            })),
            ..Self::new(Self::BUILD_FAILED)
        }
    }

    /// Key used to collapse bursts of identical events.
    pub(crate) fn collapse_key(&self) -> (String, Option<String>, Option<String>) {
        (self.kind.clone(), self.file.clone(), self.component.clone())
    }
}

/// Body of `POST /api/hotreload/trigger`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReloadTrigger {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl From<ReloadTrigger> for ReloadEvent {
    fn from(trigger: ReloadTrigger) -> Self {
        Self {
            kind: trigger.kind,
            file: trigger.file,
            component: trigger.component,
            timestamp: Utc::now(),
            data: trigger.data,
        }
    }
}
