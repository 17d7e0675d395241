use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::reload::{ReloadEvent, ReloadTrigger};
use crate::state::AppState;

/// `GET /api/hotreload/status`
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "clients": state.hub.client_count(),
        "delivered": state.hub.delivered_count(),
        "evictions": state.hub.eviction_count(),
        "collapsed": state.hub.collapsed_count(),
        "version": state.hub.version(),
    }))
}

/// `POST /api/hotreload/trigger`
pub async fn trigger(
    State(state): State<AppState>,
    Json(body): Json<ReloadTrigger>,
) -> Json<Value> {
    let event = ReloadEvent::from(body);
    let kind = event.kind.clone();
    state.hub.trigger(event);
    Json(json!({
        "status": "ok",
        "type": kind,
        "clients": state.hub.client_count(),
    }))
}
