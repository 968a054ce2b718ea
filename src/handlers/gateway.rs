//! Job submission surface
//!
//! Accepts a job document, sends it through the correlator and waits for the
//! reply. The reply body is returned as a result object.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tracing::{debug, warn};

use super::ApiError;
use crate::services::ledger::{JobLedger, LedgerSnapshot};
use crate::services::rpc::{RpcClient, RpcError};
use crate::types::{ProblemRequest, ResultObject};

pub const NO_DATA_FOUND: &str = "No data found.";

#[derive(Clone)]
pub struct GatewayState {
    pub rpc: Arc<RpcClient>,
    pub ledger: Arc<JobLedger>,
    pub reply_timeout: Duration,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/main/runjob", post(run_job))
        .route("/api/main/jobs", get(list_jobs))
        .with_state(state)
}

impl From<RpcError> for ApiError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::RouteNotFound(e) => ApiError::BadRequest(e.to_string()),
            RpcError::Serialization(e) => ApiError::BadRequest(e.to_string()),
            RpcError::Transport(e) => ApiError::Upstream(e.to_string()),
            RpcError::Cancelled(id) => ApiError::Internal(format!("call {id} was cancelled")),
        }
    }
}

pub async fn run_job(
    State(state): State<GatewayState>,
    body: Bytes,
) -> Result<Json<ResultObject>, ApiError> {
    let mut request: ProblemRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Malformed job document: {e}")))?;
    request.enrich_timestamp(Utc::now());

    let mut reply = state.rpc.call(&request).await?;
    debug!("Waiting for reply to job {}", request.job_id());

    match tokio::time::timeout(state.reply_timeout, &mut reply).await {
        Ok(reply_body) => Ok(Json(interpret_reply(&reply_body?))),
        Err(_) => {
            state.rpc.cancel(reply.correlation_id());
            warn!("Job {} timed out after {:?}", reply.job_id(), state.reply_timeout);
            Err(ApiError::Timeout(format!(
                "No reply for job {} within {} seconds",
                reply.job_id(),
                state.reply_timeout.as_secs()
            )))
        }
    }
}

pub async fn list_jobs(State(state): State<GatewayState>) -> Json<LedgerSnapshot> {
    Json(state.ledger.snapshot())
}

/// Turn a raw reply body into the result object handed back to the caller.
pub fn interpret_reply(body: &[u8]) -> ResultObject {
    if body.iter().all(u8::is_ascii_whitespace) {
        return ResultObject::failure(NO_DATA_FOUND);
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|e| ResultObject::failure(format!("Deserialization failed: {e}")))
}
