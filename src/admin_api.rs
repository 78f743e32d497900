//! Read-only admin HTTP surface.
//!
//! Health, registry + breaker snapshots, offline-queue stats and the
//! failed-notification queue, as JSON over HTTP.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::health::HealthTracker;
use crate::notifier::Notifier;
use crate::registry::AgentRegistry;
use crate::storage::OfflineQueueStore;

/// Shared state behind the admin routes.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<AgentRegistry>,
    pub health: Arc<HealthTracker>,
    pub notifier: Arc<Notifier>,
    pub offline_queue: OfflineQueueStore,
}

/// Health response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connected_agents: usize,
}

/// Builds the admin router.
#[must_use]
pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/agents", get(agents))
        .route("/api/v1/queue", get(queue))
        .route("/api/v1/notifications/failed", get(failed_notifications))
        .with_state(state)
}

/// Serves the admin API until the token fires.
///
/// # Errors
///
/// Returns an error when the server fails while running.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(std::io::Error::other)
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connected_agents: state.registry.snapshot().len(),
    })
}

async fn agents(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "agents": state.registry.snapshot(),
        "breakers": state.health.snapshot(),
    }))
}

async fn queue(State(state): State<AdminState>) -> impl IntoResponse {
    match state.offline_queue.pending_counts().await {
        Ok(counts) => {
            let pending: Vec<serde_json::Value> = counts
                .into_iter()
                .map(|(agent, count)| {
                    serde_json::json!({ "agentId": agent.as_str(), "pending": count })
                })
                .collect();
            Json(serde_json::json!({ "pending": pending })).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn failed_notifications(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "metrics": state.notifier.metrics().snapshot(),
        "failed": state.notifier.failed_notifications(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::database::Database;
    use crate::notifier::{ChatApi, ChatApiError};
    use crate::storage::Stores;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoopApi;

    #[async_trait]
    impl ChatApi for NoopApi {
        async fn post_message(
            &self,
            _: &str,
            _: Option<&str>,
            _: &str,
        ) -> Result<String, ChatApiError> {
            Ok("ts".to_string())
        }
        async fn post_blocks(
            &self,
            _: &str,
            _: Option<&str>,
            _: &str,
            _: &serde_json::Value,
        ) -> Result<String, ChatApiError> {
            Ok("ts".to_string())
        }
        async fn update_message(&self, _: &str, _: &str, _: &str) -> Result<(), ChatApiError> {
            Ok(())
        }
        async fn add_reaction(&self, _: &str, _: &str, _: &str) -> Result<(), ChatApiError> {
            Ok(())
        }
        async fn remove_reaction(&self, _: &str, _: &str, _: &str) -> Result<(), ChatApiError> {
            Ok(())
        }
        async fn post_ephemeral(&self, _: &str, _: &str, _: &str) -> Result<(), ChatApiError> {
            Ok(())
        }
        async fn upload_file(&self, _: &str, _: &str, _: &[u8]) -> Result<(), ChatApiError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn read_only_endpoints_respond_with_json() {
        let db = Database::in_memory().await.unwrap();
        let stores = Stores::open(&db).await.unwrap();
        let state = AdminState {
            registry: Arc::new(AgentRegistry::new()),
            health: Arc::new(HealthTracker::new(BreakerConfig::default())),
            notifier: Arc::new(Notifier::new(
                Arc::new(NoopApi),
                3,
                Duration::from_millis(1),
                8,
            )),
            offline_queue: stores.offline_queue.clone(),
        };
        let router = create_router(state);

        for uri in [
            "/api/v1/health",
            "/api/v1/agents",
            "/api/v1/queue",
            "/api/v1/notifications/failed",
        ] {
            let response = router
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
    }
}
