//! HTTP handlers

pub mod jobs;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::config::Config;
use crate::services::jobs::JobManager;
use crate::services::progress::BrokerHandle;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub broker: BrokerHandle,
    pub config: Arc<Config>,
    pub websocket_enabled: bool,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/optimize-async", post(jobs::submit))
        .route("/jobs", get(jobs::list))
        .route("/jobs/{id}", get(jobs::get).delete(jobs::cancel))
        .route("/jobs/{id}/result", get(jobs::result))
        .route("/ws/optimize/{id}", get(ws::upgrade))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    services: HealthServices,
}

#[derive(Debug, Serialize)]
struct HealthServices {
    queue: bool,
    broker: bool,
    store: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue = state.manager.queue_healthy();
    let broker = state.manager.broker_healthy();
    let store = state.manager.store_healthy().await;

    Json(HealthResponse {
        status: if queue && broker && store {
            "ok"
        } else {
            "degraded"
        },
        services: HealthServices {
            queue,
            broker,
            store,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_shape() {
        let response = HealthResponse {
            status: "ok",
            services: HealthServices {
                queue: true,
                broker: true,
                store: false,
            },
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""status":"ok""#));
        assert!(json.contains(r#""store":false"#));
    }
}
