//! Solving endpoint, fronted by the admission gate

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};

use super::ApiError;
use crate::services::solver::{AdmissionGate, GateOutcome};
use crate::types::ResultObject;

#[derive(Clone)]
pub struct SolverState {
    pub gate: Arc<AdmissionGate>,
}

pub fn router(state: SolverState) -> Router {
    Router::new()
        .route("/api/main/runjob", post(run_job))
        .with_state(state)
}

pub async fn run_job(
    State(state): State<SolverState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ResultObject>), ApiError> {
    match state.gate.try_handle(&body).await {
        GateOutcome::Completed(result) => Ok((StatusCode::OK, Json(result))),
        GateOutcome::Busy(result) => Ok((StatusCode::SERVICE_UNAVAILABLE, Json(result))),
        GateOutcome::Rejected(reason) => Err(ApiError::BadRequest(reason)),
    }
}
