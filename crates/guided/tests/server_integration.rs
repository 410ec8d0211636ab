//! Integration tests for the HTTP control plane.
//!
//! Runs a workflow through the JSON API: create, start, advance, checkpoint
//! decisions, turn signals, dismissal, and metrics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use guide_core::Config;
use guided::dispatch::{DispatchError, StepDispatchRequest, StepDispatchResult, StepPromptDispatcher};
use guided::server::{create_router, AppState};
use guided::service::RunService;
use guided::storage::SqliteStore;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

/// Hands every step to session `sess-1` as turn `turn-N`.
#[derive(Default)]
struct CountingDispatcher {
    calls: AtomicU32,
}

#[async_trait]
impl StepPromptDispatcher for CountingDispatcher {
    async fn dispatch(
        &self,
        _request: &StepDispatchRequest,
    ) -> Result<StepDispatchResult, DispatchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StepDispatchResult {
            dispatched: true,
            session_id: Some("sess-1".to_string()),
            turn_id: Some(format!("turn-{call}")),
            provider: None,
            model: None,
        })
    }
}

async fn create_test_app(
    dispatcher: Option<Arc<dyn StepPromptDispatcher>>,
) -> (axum::Router, Arc<AppState>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::new(&dir.path().join("test.db")).await.unwrap();
    store.migrate_embedded().await.unwrap();

    let mut builder = RunService::builder(Config::default()).store(Arc::new(store));
    if let Some(dispatcher) = dispatcher {
        builder = builder.dispatcher(dispatcher);
    }
    let state = Arc::new(AppState {
        service: builder.build().unwrap(),
        auth_token: None,
    });

    let router = create_router(Arc::clone(&state));
    (router, state, dir)
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap())),
        None => request.body(Body::empty()),
    };
    app.clone().oneshot(request.unwrap()).await.unwrap()
}

async fn create_run(app: &axum::Router, template_id: &str) -> String {
    let body = serde_json::json!({
        "template_id": template_id,
        "workspace_id": "ws-1",
        "worktree_id": "wt-1",
        "user_prompt": "fix the flaky test"
    });
    let response = send(app, "POST", "/runs", Some(body)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_to_json(response).await;
    assert_eq!(json["run"]["status"], "created");
    json["run"]["id"].as_str().unwrap().to_string()
}

// --- Run lifecycle ---

#[tokio::test]
async fn run_lifecycle_create_start_advance() {
    let (app, _, _dir) = create_test_app(None).await;

    let response = send(&app, "GET", "/templates", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["templates"][0]["id"], "solid_phase_delivery");

    let run_id = create_run(&app, "quick_fix").await;

    let response = send(&app, "POST", &format!("/runs/{run_id}/start"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["run"]["status"], "running");
    assert_eq!(json["run"]["phases"][0]["steps"][0]["status"], "completed");

    // quality_checks, then commit.
    for _ in 0..2 {
        let response = send(&app, "POST", &format!("/runs/{run_id}/advance"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(&app, "GET", &format!("/runs/{run_id}"), None).await;
    let json = body_to_json(response).await;
    assert_eq!(json["run"]["status"], "completed");

    let response = send(&app, "GET", &format!("/runs/{run_id}/timeline"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    let events = json["events"].as_array().unwrap();
    assert_eq!(events.first().unwrap()["kind"], "run_created");
    assert_eq!(events.last().unwrap()["kind"], "run_completed");

    let response = send(&app, "POST", &format!("/runs/{run_id}/advance"), None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = send(&app, "GET", "/metrics", None).await;
    let json = body_to_json(response).await;
    assert_eq!(json["metrics"]["runs_started"], 1);
    assert_eq!(json["metrics"]["runs_completed"], 1);
}

#[tokio::test]
async fn create_run_validation_errors() {
    let (app, _, _dir) = create_test_app(None).await;

    let body = serde_json::json!({ "template_id": "quick_fix", "workspace_id": "ws-1" });
    let response = send(&app, "POST", "/runs", Some(body)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("worktree_id"));

    let body = serde_json::json!({
        "template_id": "missing",
        "workspace_id": "ws-1",
        "worktree_id": "wt-1"
    });
    let response = send(&app, "POST", "/runs", Some(body)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = serde_json::json!({
        "template_id": "quick_fix",
        "workspace_id": "ws-1",
        "worktree_id": "wt-1",
        "policy": { "pause_threshold": 2.0 }
    });
    let response = send(&app, "POST", "/runs", Some(body)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pause_resume_and_dismiss() {
    let (app, _, _dir) = create_test_app(None).await;
    let run_id = create_run(&app, "solid_phase_delivery").await;

    let response = send(&app, "POST", &format!("/runs/{run_id}/pause"), None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    send(&app, "POST", &format!("/runs/{run_id}/start"), None).await;
    let response = send(&app, "POST", &format!("/runs/{run_id}/dismiss"), None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = send(&app, "POST", &format!("/runs/{run_id}/pause"), None).await;
    let json = body_to_json(response).await;
    assert_eq!(json["run"]["status"], "paused");

    let response = send(&app, "POST", &format!("/runs/{run_id}/resume"), None).await;
    let json = body_to_json(response).await;
    assert_eq!(json["run"]["status"], "running");

    send(&app, "POST", &format!("/runs/{run_id}/pause"), None).await;
    let response = send(&app, "POST", &format!("/runs/{run_id}/dismiss"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert!(json["run"]["dismissed_at"].is_string());

    let response = send(&app, "GET", "/runs", None).await;
    let json = body_to_json(response).await;
    assert!(json["runs"].as_array().unwrap().is_empty());

    let response = send(&app, "GET", "/runs?include_dismissed=true", None).await;
    let json = body_to_json(response).await;
    assert_eq!(json["runs"].as_array().unwrap().len(), 1);

    let response = send(&app, "GET", "/metrics", None).await;
    let json = body_to_json(response).await;
    assert_eq!(json["metrics"]["intervention_causes"]["manual_pause"], 2);
}

// --- Checkpoints ---

#[tokio::test]
async fn checkpoint_pause_and_approval() {
    let (app, _, _dir) = create_test_app(None).await;
    let body = serde_json::json!({
        "template_id": "quick_fix",
        "workspace_id": "ws-1",
        "worktree_id": "wt-1",
        "policy": { "style": "strict" }
    });
    let response = send(&app, "POST", "/runs", Some(body)).await;
    let run_id = body_to_json(response).await["run"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    send(&app, "POST", &format!("/runs/{run_id}/start"), None).await;
    let response = send(&app, "POST", &format!("/runs/{run_id}/advance"), None).await;
    let json = body_to_json(response).await;
    assert_eq!(json["run"]["status"], "running");

    // The commit checkpoint is a hard gate under the strict preset.
    let response = send(&app, "POST", &format!("/runs/{run_id}/advance"), None).await;
    let json = body_to_json(response).await;
    assert_eq!(json["run"]["status"], "paused");
    let decision = &json["run"]["latest_decision"];
    assert_eq!(decision["decision"], "pause");
    assert_eq!(decision["step_id"], "commit");
    assert_eq!(decision["metadata"]["severity"], "critical");
    let decision_id = decision["id"].as_str().unwrap().to_string();

    let body = serde_json::json!({ "action": "approve_continue", "decision_id": decision_id });
    let response = send(&app, "POST", &format!("/runs/{run_id}/decisions"), Some(body.clone())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["run"]["status"], "completed");

    // Replays are accepted and change nothing.
    let response = send(&app, "POST", &format!("/runs/{run_id}/decisions"), Some(body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let replay = body_to_json(response).await;
    assert_eq!(replay["run"], json["run"]);

    let body = serde_json::json!({ "action": "approve_everything" });
    let response = send(&app, "POST", &format!("/runs/{run_id}/decisions"), Some(body)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

// --- Turns ---

#[tokio::test]
async fn turn_signal_completes_dispatched_step() {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let (app, _, _dir) = create_test_app(Some(dispatcher as Arc<dyn StepPromptDispatcher>)).await;
    let run_id = create_run(&app, "solid_phase_delivery").await;

    let response = send(&app, "POST", &format!("/runs/{run_id}/start"), None).await;
    let json = body_to_json(response).await;
    let step = &json["run"]["phases"][0]["steps"][0];
    assert_eq!(step["awaiting_turn"], true);
    assert_eq!(step["execution_state"], "linked");

    let response = send(&app, "POST", &format!("/runs/{run_id}/advance"), None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let signal = serde_json::json!({
        "session_id": "sess-1",
        "workspace_id": "ws-1",
        "worktree_id": "wt-1",
        "turn_id": "turn-1",
        "terminal": true,
        "status": "completed"
    });
    let response = send(&app, "POST", "/turns", Some(signal.clone())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    let runs = json["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["phases"][0]["steps"][0]["status"], "completed");
    assert_eq!(runs[0]["phases"][0]["steps"][1]["awaiting_turn"], true);

    let response = send(&app, "POST", "/turns", Some(signal)).await;
    let json = body_to_json(response).await;
    assert!(json["runs"].as_array().unwrap().is_empty());

    let response = send(&app, "POST", "/turns", Some(serde_json::json!({}))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert!(json["runs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn failed_turn_and_resume_failed() {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let (app, _, _dir) = create_test_app(Some(dispatcher as Arc<dyn StepPromptDispatcher>)).await;
    let run_id = create_run(&app, "quick_fix").await;
    send(&app, "POST", &format!("/runs/{run_id}/start"), None).await;

    let signal = serde_json::json!({
        "session_id": "sess-1",
        "turn_id": "turn-1",
        "terminal": true,
        "status": "failed"
    });
    let response = send(&app, "POST", "/turns", Some(signal)).await;
    let json = body_to_json(response).await;
    assert_eq!(json["runs"][0]["status"], "failed");

    let response = send(&app, "POST", &format!("/runs/{run_id}/resume-failed"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["run"]["status"], "running");
    assert_eq!(json["run"]["phases"][0]["steps"][0]["attempt"], 2);
}

#[tokio::test]
async fn metrics_reset() {
    let (app, _, _dir) = create_test_app(None).await;
    let run_id = create_run(&app, "quick_fix").await;
    send(&app, "POST", &format!("/runs/{run_id}/start"), None).await;

    let response = send(&app, "POST", "/metrics/reset", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["metrics"]["runs_started"], 0);

    let response = send(&app, "GET", "/metrics", None).await;
    let json = body_to_json(response).await;
    assert_eq!(json["metrics"]["runs_started"], 0);
}
