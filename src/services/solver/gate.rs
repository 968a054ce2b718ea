//! Admission control for the solving endpoint
//!
//! One job solves at a time. A job arriving while the slot is taken gets a
//! busy result immediately instead of waiting.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::PartitionedSolver;
use crate::services::audit::{actions, AuditLogger};
use crate::types::{ProblemRequest, ProblemType, ResultObject, VrpJob};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// The request held the slot and produced a result (which may still report failure).
    Completed(ResultObject),
    /// The slot was taken.
    Busy(ResultObject),
    /// The payload could not be read; no result object is produced.
    Rejected(String),
}

pub struct AdmissionGate {
    slot: Arc<Semaphore>,
    solver: Arc<PartitionedSolver>,
    audit: AuditLogger,
}

impl AdmissionGate {
    pub fn new(solver: Arc<PartitionedSolver>, audit: AuditLogger) -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
            solver,
            audit,
        }
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    pub async fn try_handle(&self, body: &[u8]) -> GateOutcome {
        let request: ProblemRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return GateOutcome::Rejected(format!("Malformed job document: {e}")),
        };
        let job = match request.problem_type {
            ProblemType::Vrp => match VrpJob::from_job_data(&request.job_data) {
                Ok(job) => Some(job),
                Err(e) => return GateOutcome::Rejected(format!("Malformed VRP job data: {e}")),
            },
            ProblemType::Knapsack | ProblemType::CpSat => None,
        };

        let Ok(permit) = self.slot.clone().try_acquire_owned() else {
            info!("Solver busy, turning away job {}", request.job_id());
            return GateOutcome::Busy(ResultObject::busy(request.submitted_at()));
        };

        let job_id = request.job_id();
        let result = match job {
            None => ResultObject::failure(format!(
                "Problem type {} is not supported by this solver",
                request.problem_type
            )),
            Some(job) => {
                debug!("Solving job {} with {} locations", job_id, job.locations.len());
                let solver = Arc::clone(&self.solver);
                let submitted_at = request.submitted_at();
                // The slot stays taken until the blocking solve has returned.
                let solved = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    solver.solve(&job, submitted_at)
                })
                .await;
                match solved {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("Solver task for job {} failed: {}", job_id, e);
                        ResultObject::failure(format!("Solver task failed: {e}"))
                    }
                }
            }
        };

        self.audit.record(actions::SOLVED, job_id).await;
        GateOutcome::Completed(result)
    }
}
