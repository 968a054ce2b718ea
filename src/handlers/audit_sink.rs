//! Audit sink
//!
//! Receives audit records over HTTP and appends them to a CSV file. The header
//! row is written only when the file is new or empty.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use parking_lot::Mutex;
use tracing::debug;

use super::ApiError;
use crate::types::AuditRecord;

/// Append-only CSV store. Writers are serialized by the mutex.
pub struct CsvAuditStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CsvAuditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocking append of one record.
    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let _guard = self.lock.lock();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let is_empty = file.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let mut writer = csv::WriterBuilder::new().has_headers(is_empty).from_writer(file);
        writer.serialize(record).context("Failed to write audit record")?;
        writer.flush().context("Failed to flush audit file")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct AuditSinkState {
    pub store: Arc<CsvAuditStore>,
}

pub fn router(state: AuditSinkState) -> Router {
    Router::new()
        .route("/api/main/logging", post(log_record))
        .with_state(state)
}

pub async fn log_record(
    State(state): State<AuditSinkState>,
    Json(record): Json<AuditRecord>,
) -> Result<StatusCode, ApiError> {
    debug!(
        "Audit: {} / {} / job {}",
        record.service_name, record.action_performed, record.job_id
    );
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || store.append(&record))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(StatusCode::OK)
}
