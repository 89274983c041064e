use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    engine::{EngineError, EngineHealth},
    models::{OsFamily, RemediationReport},
    remediation::format_for_display,
    AppState,
};

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::InvalidTarget(_) | EngineError::NotComplete(_) => StatusCode::BAD_REQUEST,
            EngineError::TargetRejected(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Store(e) => {
                error!(error = %e, "store failure while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({"detail": self.to_string()}))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/scan/start", post(start_scan))
        .route("/scans", get(list_scans))
        .route("/scan/:id", get(get_scan).delete(delete_scan))
        .route("/scan/:id/fixes", get(get_fixes))
        .route("/ws/scan/:id", get(scan_stream))
        .with_state(state)
}

pub async fn home() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "online", "system": "Sentra.AI"}))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    engine: EngineHealth,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "online",
        engine: state.engine.health().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    message: String,
    #[serde(default)]
    scan_id: Option<Uuid>,
}

pub async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    if req.message.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "message is empty").into_response();
    }
    Json(state.engine.chat(&req.message, req.scan_id).await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct StartScanRequest {
    target: String,
    #[serde(default)]
    tools: Option<Vec<String>>,
}

pub async fn start_scan(
    State(state): State<AppState>,
    Json(req): Json<StartScanRequest>,
) -> Response {
    match state.engine.start_scan(&req.target, req.tools).await {
        Ok(scan_id) => Json(serde_json::json!({"scan_id": scan_id, "status": "started"}))
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<i64>,
}

pub async fn list_scans(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Response {
    match state.engine.list_recent(q.limit).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn get_scan(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.engine.get(id).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_scan(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.engine.delete(id).await {
        Ok(()) => Json(serde_json::json!({"scan_id": id, "status": "deleted"})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct FixesResponse {
    status: &'static str,
    os_detected: OsFamily,
    fix_count: usize,
    fixes: RemediationReport,
    formatted: String,
}

pub async fn get_fixes(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.engine.fixes(id).await {
        Ok(report) => Json(FixesResponse {
            status: "generated",
            os_detected: report.os_detected,
            fix_count: report.findings.len(),
            formatted: format_for_display(&report),
            fixes: report,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Live narration for one scan: full replay first, then new lines until the scan finishes.
pub async fn scan_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    let session = match state.engine.get(id).await {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };
    if session.status.is_terminal() {
        // rebuilds the log for scans restored from the store
        let lines = session
            .outputs
            .iter()
            .flat_map(|run| run.output.lines().map(ToString::to_string))
            .chain(session.error.iter().map(|e| format!("[!] Scan failed: {e}")))
            .collect::<Vec<_>>();
        state.engine.hub().restore(id, lines).await;
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, id))
}

async fn handle_socket(socket: WebSocket, state: AppState, id: Uuid) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let hub = state.engine.hub().clone();
    let mut subscription = hub.connect(id).await;
    let subscriber = subscription.id;
    let observers = hub.subscriber_count(id).await;
    debug!(scan_id = %id, subscriber, observers, "observer attached");

    let mut forward = tokio::spawn(async move {
        while let Some(line) = subscription.recv().await {
            if ws_sender.send(Message::Text(line.into())).await.is_err() {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let inbound = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut forward => {}
        _ = inbound => forward.abort(),
    }

    hub.disconnect(id, subscriber).await;
    debug!(scan_id = %id, subscriber, "observer detached");
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        broadcast::BroadcastHub,
        config::{AppConfig, OracleConfig},
        db::{memory_pool, SqliteScanStore},
        engine::{EngineSettings, ScanEngine},
        oracle::{Advisor, OpenRouterClient},
        security::HttpOwnershipVerifier,
        tools::{NiktoMode, NiktoTool, NmapTool, ToolRegistry},
    };

    #[test]
    fn engine_errors_map_to_status_codes() {
        let id = Uuid::new_v4();
        let cases = [
            (EngineError::InvalidTarget("-x".into()), StatusCode::BAD_REQUEST),
            (EngineError::TargetRejected("example.com".into()), StatusCode::FORBIDDEN),
            (EngineError::NotFound(id), StatusCode::NOT_FOUND),
            (EngineError::NotComplete(id), StatusCode::BAD_REQUEST),
            (
                EngineError::Store(crate::db::StoreError::Missing(id)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    async fn serve() -> String {
        let cfg = AppConfig {
            pacing_ms: 0,
            verify_timeout_secs: 2,
            ..AppConfig::default()
        };
        let engine = ScanEngine::new(
            ToolRegistry::new(
                Arc::new(NmapTool::new(None)),
                vec![Arc::new(NiktoTool::new(NiktoMode::Missing))],
            ),
            BroadcastHub::default(),
            // no API key: every oracle call fails fast
            Advisor::new(Arc::new(
                OpenRouterClient::new(OracleConfig::default()).expect("client"),
            )),
            Arc::new(HttpOwnershipVerifier::from_config(&cfg).expect("verifier")),
            Arc::new(SqliteScanStore::new(memory_pool().await)),
            EngineSettings::from_config(&cfg),
        );
        let state = AppState { engine };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn scan_lifecycle_over_http() {
        let base = serve().await;
        let client = reqwest::Client::new();

        let started: serde_json::Value = client
            .post(format!("{base}/scan/start"))
            .json(&serde_json::json!({"target": "127.0.0.1"}))
            .send()
            .await
            .expect("start")
            .json()
            .await
            .expect("json");
        let scan_id = started["scan_id"].as_str().expect("scan_id").to_string();

        let mut scan = serde_json::Value::Null;
        for _ in 0..300 {
            scan = client
                .get(format!("{base}/scan/{scan_id}"))
                .send()
                .await
                .expect("get")
                .json()
                .await
                .expect("json");
            if scan["status"] == "complete" || scan["status"] == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(scan["status"], "complete");
        assert_eq!(scan["tools_used"], serde_json::json!(["nmap"]));
        assert_eq!(scan["risk_label"], "LOW");

        let fixes = client
            .get(format!("{base}/scan/{scan_id}/fixes"))
            .send()
            .await
            .expect("fixes");
        assert_eq!(fixes.status(), StatusCode::OK.as_u16());
        let fixes: serde_json::Value = fixes.json().await.expect("json");
        assert_eq!(fixes["fix_count"], 0);
        assert_eq!(fixes["os_detected"], "unknown");

        let listed: Vec<serde_json::Value> = client
            .get(format!("{base}/scans?limit=5"))
            .send()
            .await
            .expect("list")
            .json()
            .await
            .expect("json");
        assert_eq!(listed.len(), 1);

        let deleted = client
            .delete(format!("{base}/scan/{scan_id}"))
            .send()
            .await
            .expect("delete");
        assert_eq!(deleted.status(), StatusCode::OK.as_u16());
        let gone = client
            .get(format!("{base}/scan/{scan_id}"))
            .send()
            .await
            .expect("get");
        assert_eq!(gone.status(), StatusCode::NOT_FOUND.as_u16());
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let base = serve().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/scan/start"))
            .json(&serde_json::json!({"target": "-oN /tmp/out"}))
            .send()
            .await
            .expect("start");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST.as_u16());

        let resp = client
            .get(format!("{base}/scan/{}/fixes", Uuid::new_v4()))
            .send()
            .await
            .expect("fixes");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND.as_u16());

        let health: serde_json::Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .expect("health")
            .json()
            .await
            .expect("json");
        assert_eq!(health["status"], "online");
        assert_eq!(health["baseline"]["name"], "nmap");
        assert_eq!(health["active_scans"], 0);
    }
}
