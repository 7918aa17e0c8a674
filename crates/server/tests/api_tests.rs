use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use server::config::ServerConfig;
use server::create_router;
use server::state::AppState;
use session_core::{ClientCommand, ClientFrame, SessionId};

fn setup_test_server() -> (TestServer, AppState) {
    let mut config = ServerConfig::default();
    config.policy.default = session_core::PolicyDecision::Allow;
    let state = AppState::in_memory(config);
    let app = create_router(state.clone());

    let server = TestServer::new(app).expect("Failed to create test server");

    (server, state)
}

/// Drive one echo run over an in-process connection and wait for it to finish
async fn run_once(state: &AppState, session_id: &str, text: &str) {
    let (conn, _rx) = state.registry.connect();
    let session_id = SessionId::new(session_id);
    state
        .registry
        .handle(
            &conn,
            ClientFrame::new(ClientCommand::Hello).with_session(session_id.clone()),
        )
        .await;
    state
        .registry
        .handle(
            &conn,
            ClientFrame::new(ClientCommand::Send {
                text: text.to_string(),
                client_msg_id: None,
            })
            .with_session(session_id.clone()),
        )
        .await;

    let session = state
        .registry
        .lookup(&session_id)
        .expect("session loaded");
    tokio::time::timeout(Duration::from_secs(10), async {
        while session.active_run().await.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run finished");
    state.registry.disconnect(&conn);
}

mod health {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let (server, _state) = setup_test_server();

        let response = server.get("/health").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["protocol_version"], "1.0.0");
        assert_eq!(body["sessions_loaded"], 0);
    }

    #[tokio::test]
    async fn test_openapi_document() {
        let (server, _state) = setup_test_server();

        let response = server.get("/api/openapi.json").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert!(body["paths"]["/api/sessions"].is_object());
        assert!(body["paths"]["/api/sessions/{id}/snapshot"].is_object());
    }
}

mod sessions_crud {
    use super::*;

    #[tokio::test]
    async fn test_create_session_returns_201_created() {
        let (server, _state) = setup_test_server();

        let response = server.post("/api/sessions").json(&json!({})).await;

        response.assert_status(StatusCode::CREATED);
        let body: Value = response.json();
        assert!(body["session_id"].is_string());
        assert_eq!(body["version"], "1.0.0");
        assert_eq!(body["run_counter"], 0);
        assert!(body["active_run_id"].is_null());
    }

    #[tokio::test]
    async fn test_create_session_with_id() {
        let (server, _state) = setup_test_server();

        let response = server
            .post("/api/sessions")
            .json(&json!({ "session_id": "s-api" }))
            .await;

        response.assert_status(StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(body["session_id"], "s-api");
    }

    #[tokio::test]
    async fn test_create_duplicate_session_conflicts() {
        let (server, _state) = setup_test_server();

        server
            .post("/api/sessions")
            .json(&json!({ "session_id": "s-dup" }))
            .await
            .assert_status(StatusCode::CREATED);

        let response = server
            .post("/api/sessions")
            .json(&json!({ "session_id": "s-dup" }))
            .await;

        response.assert_status(StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["error"], "conflict");
    }

    #[tokio::test]
    async fn test_create_session_rejects_blank_id() {
        let (server, _state) = setup_test_server();

        let response = server
            .post("/api/sessions")
            .json(&json!({ "session_id": "   " }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let (server, _state) = setup_test_server();

        let response = server.get("/api/sessions").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body.as_array().map(Vec::len), Some(0));

        server
            .post("/api/sessions")
            .json(&json!({ "session_id": "s-1" }))
            .await;
        server
            .post("/api/sessions")
            .json(&json!({ "session_id": "s-2" }))
            .await;

        let response = server.get("/api/sessions").await;
        response.assert_status_ok();
        let body: Value = response.json();
        let sessions = body.as_array().expect("array");
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s["loaded"] == true));
        assert!(sessions.iter().all(|s| s["connections"] == 0));
    }

    #[tokio::test]
    async fn test_delete_session() {
        let (server, _state) = setup_test_server();

        server
            .post("/api/sessions")
            .json(&json!({ "session_id": "s-del" }))
            .await;

        let response = server.delete("/api/sessions/s-del").await;
        response.assert_status(StatusCode::NO_CONTENT);

        server
            .get("/api/sessions/s-del/snapshot")
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .delete("/api/sessions/s-del")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}

mod session_views {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_of_unknown_session_is_404() {
        let (server, _state) = setup_test_server();

        let response = server.get("/api/sessions/missing/snapshot").await;

        response.assert_status(StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_snapshot_of_fresh_session() {
        let (server, _state) = setup_test_server();

        server
            .post("/api/sessions")
            .json(&json!({ "session_id": "s-fresh" }))
            .await;

        let response = server.get("/api/sessions/s-fresh/snapshot").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["v"], "1.0.0");
        assert_eq!(body["as_of_event_id"], 0);
        assert!(body["run_state"].is_null());
        assert_eq!(body["transcript"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn test_snapshot_and_runs_after_a_run() {
        let (server, state) = setup_test_server();

        run_once(&state, "s-run", "hello").await;

        let response = server.get("/api/sessions/s-run/snapshot").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["session_state"]["run_counter"], 1);
        assert!(body["session_state"]["active_run_id"].is_null());
        assert_eq!(body["run_state"]["status"], "finished");
        assert!(body["as_of_event_id"].as_u64().unwrap_or(0) >= 4);
        let kinds: Vec<&str> = body["transcript"]
            .as_array()
            .expect("transcript")
            .iter()
            .filter_map(|item| item["type"].as_str())
            .collect();
        assert_eq!(kinds, vec!["user_text", "assistant_text"]);

        let response = server.get("/api/sessions/s-run/runs").await;
        response.assert_status_ok();
        let body: Value = response.json();
        let runs = body.as_array().expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["run_id"], 1);
        assert_eq!(runs[0]["status"], "finished");
    }

    #[tokio::test]
    async fn test_runs_history_newest_first() {
        let (server, state) = setup_test_server();

        run_once(&state, "s-hist", "one").await;
        run_once(&state, "s-hist", "two").await;

        let response = server.get("/api/sessions/s-hist/runs").await;
        response.assert_status_ok();
        let body: Value = response.json();
        let ids: Vec<u64> = body
            .as_array()
            .expect("runs")
            .iter()
            .filter_map(|run| run["run_id"].as_u64())
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_runs_of_unknown_session_is_404() {
        let (server, _state) = setup_test_server();

        server
            .get("/api/sessions/nope/runs")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
