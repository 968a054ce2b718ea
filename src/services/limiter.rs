//! Dispatch concurrency limiter
//!
//! Bounds how many jobs the dispatcher has outstanding at the solving
//! backend. With the default of one global permit, processing is strictly
//! one job at a time across every problem type.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::types::ProblemType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchScope {
    /// One pool of permits shared by every route
    #[default]
    Global,
    /// A separate pool per problem type
    PerRoute,
}

impl FromStr for DispatchScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(DispatchScope::Global),
            "per-route" | "per_route" | "route" => Ok(DispatchScope::PerRoute),
            other => Err(format!("unknown dispatch scope '{other}'")),
        }
    }
}

pub struct DispatchLimiter {
    scope: DispatchScope,
    global: Arc<Semaphore>,
    per_route: HashMap<ProblemType, Arc<Semaphore>>,
}

impl DispatchLimiter {
    pub fn new(scope: DispatchScope, permits: usize) -> Self {
        let permits = permits.max(1);
        let per_route = ProblemType::ALL
            .into_iter()
            .map(|pt| (pt, Arc::new(Semaphore::new(permits))))
            .collect();
        Self {
            scope,
            global: Arc::new(Semaphore::new(permits)),
            per_route,
        }
    }

    /// Single global permit.
    #[cfg(test)]
    pub fn single_flight() -> Self {
        Self::new(DispatchScope::Global, 1)
    }

    /// Wait for a permit covering `problem_type`. The permit is released on drop.
    pub async fn acquire(
        &self,
        problem_type: ProblemType,
    ) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore(problem_type).clone().acquire_owned().await
    }

    #[cfg(test)]
    pub fn available(&self, problem_type: ProblemType) -> usize {
        self.semaphore(problem_type).available_permits()
    }

    fn semaphore(&self, problem_type: ProblemType) -> &Arc<Semaphore> {
        match self.scope {
            DispatchScope::Global => &self.global,
            DispatchScope::PerRoute => self.per_route.get(&problem_type).unwrap_or(&self.global),
        }
    }
}
