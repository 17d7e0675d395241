use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// `GET /api/components`
pub async fn list_components(State(state): State<AppState>) -> Json<Value> {
    let components: Vec<Value> = state
        .registry
        .get_all()
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "package": c.package,
                "parameters": c.parameters,
            })
        })
        .collect();
    Json(json!({ "components": components, "count": components.len() }))
}

/// `GET /api/component/{name}`
pub async fn get_component(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    match state.registry.get(&name) {
        Some(component) => Ok(Json(serde_json::to_value(component.as_ref()).map_err(
            |e| AppError::internal(format!("failed to serialize component: {e}")),
        )?)),
        None => Err(AppError::not_found(format!("component {name:?} not found"))),
    }
}
