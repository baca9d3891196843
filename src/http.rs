// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP Server for Health and Metrics Endpoints
//!
//! Provides REST endpoints for monitoring and health checks.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::metrics::ServerMetrics;
use crate::router::MessageRouter;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: ServerMetrics,
    pub router: Arc<MessageRouter>,
}

/// Creates the HTTP router with health and metrics endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .with_state(state)
}

/// Root handler - returns basic info.
async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "nexchat-server",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/metrics"]
    }))
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions_online": state.router.sessions().online_count()
    }))
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    state
        .metrics
        .sessions_online
        .set(state.router.sessions().online_count() as i64);
    state
        .metrics
        .offline_queued
        .set(state.router.offline().total_len() as i64);
    let metrics_text = state.metrics.encode();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics_text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;
    use crate::protocol::Request as ChatRequest;
    use crate::session_registry::ConnectionHandle;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_state() -> HttpState {
        let metrics = ServerMetrics::new().unwrap();
        let router = Arc::new(MessageRouter::new(
            Arc::new(MemoryHistoryStore::default()),
            metrics.clone(),
            100,
        ));
        HttpState { metrics, router }
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = create_test_state();
        let (handle, _rx) = ConnectionHandle::new(16);
        state.router.connect("alice", handle);

        let (status, body) = get_body(create_router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("nexchat_sessions_online 1"));
    }

    #[tokio::test]
    async fn test_metrics_report_offline_backlog() {
        let state = create_test_state();
        let (handle, _rx) = ConnectionHandle::new(16);
        state.router.connect("alice", handle);
        state.router.handle(
            "alice",
            ChatRequest::PrivateMessage {
                to: "bob".to_string(),
                content: "later".to_string(),
                message_id: String::new(),
            },
        );

        let (_, body) = get_body(create_router(state), "/metrics").await;
        assert!(body.contains("nexchat_offline_queued 1"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = create_test_state();
        let (status, body) = get_body(create_router(state), "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["sessions_online"], 0);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (status, _) = get_body(create_router(create_test_state()), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
