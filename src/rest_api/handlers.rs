//! HTTP handlers for the probes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::instrument;

use crate::controller::ControllerState;

/// The flags the probes report on, shared with the controllers
#[derive(Clone, Debug)]
pub struct HealthState {
    pub ready: Arc<AtomicBool>,
    pub is_leader: Arc<AtomicBool>,
}

impl From<&ControllerState> for HealthState {
    fn from(state: &ControllerState) -> Self {
        Self {
            ready: state.ready.clone(),
            is_leader: state.is_leader.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub leader: bool,
}

#[instrument]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// 200 once the watch loops run. Standby replicas are ready too; `leader`
/// tells which one acts.
#[instrument(skip(state))]
pub async fn readyz(State(state): State<HealthState>) -> (StatusCode, Json<ReadyResponse>) {
    let body = ReadyResponse {
        ready: state.ready.load(Ordering::Relaxed),
        leader: state.is_leader.load(Ordering::Relaxed),
    };
    let code = if body.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(ready: bool, leader: bool) -> HealthState {
        HealthState {
            ready: Arc::new(AtomicBool::new(ready)),
            is_leader: Arc::new(AtomicBool::new(leader)),
        }
    }

    #[tokio::test]
    async fn test_not_ready_before_controllers_start() {
        let (code, Json(body)) = readyz(State(state(false, true))).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.ready);
    }

    #[tokio::test]
    async fn test_standby_replica_is_ready() {
        let (code, Json(body)) = readyz(State(state(true, false))).await;
        assert_eq!(code, StatusCode::OK);
        assert!(!body.leader);
    }

    #[tokio::test]
    async fn test_healthz_reports_version() {
        let Json(body) = healthz().await;
        assert_eq!(body.status, "healthy");
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }
}
