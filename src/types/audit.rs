//! Audit trail record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const TIMESTAMP_FORMAT: &str = "%d/%m/%Y, %H:%M:%S";

/// One job lifecycle event, as accepted by the audit sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    #[serde(alias = "Timestamp")]
    pub timestamp: String,
    #[serde(alias = "ServiceName")]
    pub service_name: String,
    #[serde(alias = "ActionPerformed")]
    pub action_performed: String,
    #[serde(alias = "JobId")]
    pub job_id: i64,
}

impl AuditRecord {
    pub fn new(at: DateTime<Utc>, service_name: &str, action_performed: &str, job_id: i64) -> Self {
        Self {
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            service_name: service_name.to_string(),
            action_performed: action_performed.to_string(),
            job_id,
        }
    }

    pub fn now(service_name: &str, action_performed: &str, job_id: i64) -> Self {
        Self::new(Utc::now(), service_name, action_performed, job_id)
    }
}
