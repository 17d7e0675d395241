use axum::{Json, extract::State};
use chrono::Utc;
use serde_json::{Value, json};

use crate::state::{AppState, VERSION};

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let scan = state.scanner.metrics();
    let build = state.build_pool.metrics();
    let registry_drops = state.registry.dropped_event_count();
    let evictions = state.hub.eviction_count();

    // Lossy delivery anywhere downgrades to degraded; the pipeline itself
    // is still serving.
    let status = if registry_drops > 0 || evictions > 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(json!({
        "status": status,
        "timestamp": Utc::now(),
        "version": VERSION,
        "started_at": state.started_at,
        "checks": {
            "registry": {
                "status": if registry_drops > 0 { "degraded" } else { "healthy" },
                "components": state.registry.count(),
                "dropped_events": registry_drops,
            },
            "scanner": {
                "status": "healthy",
                "files_processed": scan.files_processed,
                "cache_hits": scan.cache_hits,
                "cache_misses": scan.cache_misses,
                "parse_fallbacks": scan.parse_fallbacks,
            },
            "build": {
                "status": "healthy",
                "completed": build.completed,
                "cache_hits": build.cache_hits,
                "compile_failures": build.compile_failures,
                "worker_restarts": build.worker_restarts,
            },
            "reload_hub": {
                "status": if evictions > 0 { "degraded" } else { "healthy" },
                "clients": state.hub.client_count(),
                "evictions": evictions,
            },
            "plugins": {
                "status": "healthy",
                "registered": state.plugins.statuses().len(),
            },
        },
    }))
}
