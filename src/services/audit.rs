//! Best-effort audit trail client
//!
//! Posts job lifecycle events to the audit sink. A failing sink is logged
//! and otherwise ignored; it never fails the operation being audited.

use std::time::Duration;

use tracing::{debug, warn};

use crate::types::AuditRecord;

const AUDIT_TIMEOUT: Duration = Duration::from_secs(5);

pub mod actions {
    pub const CONTROLLER: &str = "Solver Controller";
    pub const REQUEST_QUEUED: &str = "Request received & added to queue";
    pub const REPLY_RETURNED: &str = "Sending to requester";

    pub const DISPATCHER: &str = "Solver Dispatcher";
    pub const DISPATCH_STARTED: &str = "Sending to solver for execution";
    pub const DISPATCH_FINISHED: &str = "Added to results queue";

    pub const SOLVER: &str = "Solver Core";
    pub const SOLVED: &str = "Solved the requested problem";
}

#[derive(Clone)]
pub struct AuditLogger {
    service_name: &'static str,
    sink: Option<(reqwest::Client, String)>,
}

impl AuditLogger {
    pub fn new(service_name: &'static str, sink_url: Option<String>) -> Self {
        let sink = sink_url.map(|url| {
            let client = reqwest::Client::builder()
                .timeout(AUDIT_TIMEOUT)
                .build()
                .unwrap_or_default();
            (client, url)
        });
        Self { service_name, sink }
    }

    /// Audit events are traced only.
    #[cfg(test)]
    pub fn disabled(service_name: &'static str) -> Self {
        Self::new(service_name, None)
    }

    pub async fn record(&self, action: &str, job_id: i64) {
        let record = AuditRecord::now(self.service_name, action, job_id);
        debug!(job_id, service = self.service_name, "audit: {}", action);

        let Some((client, url)) = &self.sink else {
            return;
        };

        match client.post(url).json(&record).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(
                "Audit sink rejected event for job {}: HTTP {}",
                job_id,
                response.status()
            ),
            Err(e) => warn!("Audit sink unreachable for job {}: {}", job_id, e),
        }
    }
}
