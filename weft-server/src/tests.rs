//! HTTP API tests driven through the router.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;

use crate::reload::{ClientMessage, ReloadEvent};
use crate::routes::router;
use crate::state::AppState;

use weft_config::WeftConfig;

const BUTTON: &str =
    "package components\n\ntempl Button(text string) { <button>{text}</button> }\n";

struct Fixture {
    _tmp: tempfile::TempDir,
    state: AppState,
}

async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    std::fs::write(root.join("button.templ"), BUTTON).unwrap();

    let state = AppState::initialize(WeftConfig::default(), &root)
        .await
        .unwrap();
    state.scanner.scan_file(root.join("button.templ")).await.unwrap();
    Fixture { _tmp: tmp, state }
}

async fn get_json(state: &AppState, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router(state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn health_reports_checks_per_service() {
    let fx = fixture().await;
    let (status, body) = get_json(&fx.state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
    assert_eq!(body["checks"]["registry"]["components"], 1);
    assert_eq!(body["checks"]["registry"]["status"], "healthy");
    assert!(body["checks"]["scanner"]["files_processed"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn components_list_and_single_lookup() {
    let fx = fixture().await;

    let (status, body) = get_json(&fx.state, "/api/components").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["components"][0]["name"], "Button");
    assert_eq!(body["components"][0]["package"], "components");
    assert_eq!(body["components"][0]["parameters"][0]["name"], "text");

    let (status, body) = get_json(&fx.state, "/api/component/Button").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Button");
    assert_eq!(body["file_path"], "button.templ");

    let (status, body) = get_json(&fx.state, "/api/component/Missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn trigger_broadcasts_to_every_connected_client() {
    let fx = fixture().await;
    let mut receivers: Vec<_> = (0..3).map(|_| fx.state.hub.register().1).collect();

    let response = router(fx.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/hotreload/trigger")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"type":"manual_reload"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    for rx in &mut receivers {
        let mut saw_reload = false;
        while let Ok(message) = rx.try_recv() {
            if let ClientMessage::Event(frame) = message {
                let event: ReloadEvent = serde_json::from_str(&frame).unwrap();
                if event.kind == ReloadEvent::MANUAL_RELOAD {
                    saw_reload = true;
                }
            }
        }
        assert!(saw_reload, "every client receives the manual reload");
    }
}

#[tokio::test]
async fn hotreload_status_reports_hub_counters() {
    let fx = fixture().await;
    let _client = fx.state.hub.register();
    let (status, body) = get_json(&fx.state, "/api/hotreload/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["clients"], 1);
    assert_eq!(body["evictions"], 0);
    assert_eq!(body["version"], crate::state::VERSION);
}
