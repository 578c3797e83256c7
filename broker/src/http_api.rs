//! Diagnostic endpoints that never touch the mux or hub, mounted on the same
//! [`axum::Router`] as the reverse proxy so the router is a believable whole
//! rather than a single catch-all route.
//!
//! Grounded on `applet/server/restapi/{health,system,echo}.go`: a no-op
//! health ping, a system info endpoint, and an echo endpoint for
//! connectivity testing (simplified here to a plain JSON echo rather than
//! the original's WebSocket chat, per the design notes).

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone)]
pub struct ApiState {
    pub broker_id: Arc<str>,
    pub hostname: Arc<str>,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct PingResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct SystemInfo {
    broker_id: Arc<str>,
    hostname: Arc<str>,
    uptime_secs: u64,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health/ping", get(ping))
        .route("/api/system/info", get(system_info))
        .route("/api/echo/chat", post(echo))
        .with_state(state)
}

async fn ping() -> Json<PingResponse> {
    Json(PingResponse { status: "ok" })
}

async fn system_info(State(state): State<ApiState>) -> Json<SystemInfo> {
    Json(SystemInfo {
        broker_id: state.broker_id,
        hostname: state.hostname,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn echo(Json(body): Json<Value>) -> Json<Value> {
    Json(body)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> ApiState {
        ApiState {
            broker_id: Arc::from("broker-1"),
            hostname: Arc::from("host-a"),
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn ping_returns_ok() {
        let app = router(state());
        let response = app
            .oneshot(Request::builder().uri("/api/health/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn echo_round_trips_the_body() {
        let app = router(state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/echo/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"hello":"world"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
