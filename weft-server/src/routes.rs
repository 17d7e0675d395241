use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{components, health, hotreload, ws};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/components", get(components::list_components))
        .route("/api/component/{name}", get(components::get_component))
        .route("/api/hotreload/status", get(hotreload::status))
        .route("/api/hotreload/trigger", post(hotreload::trigger))
        .route("/ws/hotreload", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
