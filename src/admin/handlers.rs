use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::admin::AdminState;
use crate::guard::types::GuardError;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub sites: Vec<String>,
    pub cache_inflight: usize,
}

#[derive(Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub open_breakers: Vec<String>,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        sites: state.guard.site_names(),
        cache_inflight: state.guard.cache().inflight(),
    })
}

/// `degraded` while any configured breaker is open; 503 if the store cannot be read.
pub async fn get_health(State(state): State<AdminState>) -> Response {
    match state.guard.open_breakers().await {
        Ok(open) => {
            let status = if open.is_empty() { "ok" } else { "degraded" };
            Json(HealthReport {
                status,
                open_breakers: open,
            })
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub async fn get_breaker(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> Result<Response, GuardError> {
    Ok(match state.guard.breaker_status(&key).await? {
        Some(snapshot) => Json(snapshot).into_response(),
        None => not_found("breaker", &key),
    })
}

pub async fn get_rate_limit(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> Result<Response, GuardError> {
    Ok(match state.guard.rate_limit_status(&key).await? {
        Some(status) => Json(status).into_response(),
        None => not_found("rate limit", &key),
    })
}

fn not_found(kind: &str, key: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": {
                "code": "not_found",
                "message": format!("no {kind} state for {key}"),
            }
        })),
    )
        .into_response()
}
