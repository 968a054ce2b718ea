//! Partitioned VRP solving
//!
//! Validates a VRP job, splits its locations into geographically sorted
//! partitions, solves every partition in parallel on a dedicated rayon pool
//! and sums the per-partition longest route. The sum is an approximation of
//! the undivided problem's optimum.

mod gate;
mod partition;

pub use gate::{AdmissionGate, GateOutcome};
pub use partition::{partition_count, sort_locations, split, Partition};

use std::num::NonZeroUsize;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::services::geo::distance_matrix;
use crate::services::vrp::{max_route_distance, RoutingEngine, RoutingOutcome, RoutingRequest};
use crate::types::{ResultObject, VrpJob};

pub const NO_LOCATIONS: &str = "No locations found on the JSON. Please check again!";
pub const INVALID_VEHICLE_NUMBER: &str =
    "Vehicle number must be a positive integer. Please check again!";
pub const INVALID_MAX_DISTANCE: &str =
    "Vehicle maximum distance must be a non-negative decimal. Please check again!";

/// What an infeasible partition does to the whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfeasiblePolicy {
    /// Contribute 0 to the aggregate and report the count in `info`
    #[default]
    Zero,
    /// Fail the request
    Fail,
}

impl FromStr for InfeasiblePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zero" => Ok(InfeasiblePolicy::Zero),
            "fail" => Ok(InfeasiblePolicy::Fail),
            other => Err(format!("unknown infeasible partition policy '{other}'")),
        }
    }
}

/// Every rule `job` violates, in a fixed order.
pub fn validate(job: &VrpJob) -> Vec<&'static str> {
    let mut violations = Vec::new();
    if job.locations.is_empty() {
        violations.push(NO_LOCATIONS);
    }
    if job.vehicle_number <= 0 {
        violations.push(INVALID_VEHICLE_NUMBER);
    }
    if job.max_distance < 0 {
        violations.push(INVALID_MAX_DISTANCE);
    }
    violations
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

pub struct PartitionedSolver {
    engine: Box<dyn RoutingEngine>,
    parallelism: usize,
    infeasible_policy: InfeasiblePolicy,
    pool: rayon::ThreadPool,
}

impl PartitionedSolver {
    pub fn new(
        engine: Box<dyn RoutingEngine>,
        parallelism: usize,
        infeasible_policy: InfeasiblePolicy,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let parallelism = parallelism.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("partition-{i}"))
            .build()?;

        info!(
            "Solver ready: engine={} parallelism={} infeasible={:?}",
            engine.name(),
            parallelism,
            infeasible_policy
        );

        Ok(Self {
            engine,
            parallelism,
            infeasible_policy,
            pool,
        })
    }

    /// Solve `job`, blocking the calling thread until every partition is done.
    pub fn solve(&self, job: &VrpJob, submitted_at: Option<DateTime<Utc>>) -> ResultObject {
        let violations = validate(job);
        if !violations.is_empty() {
            debug!("Rejected VRP job: {:?}", violations);
            return ResultObject::failure(violations.join("\n"));
        }

        // Both are positive after validation.
        let vehicles = usize::try_from(job.vehicle_number).unwrap_or(usize::MAX);
        let mut locations = job.locations.clone();
        sort_locations(&mut locations);

        let parts = partition_count(vehicles, self.parallelism);
        let partitions = split(&locations, vehicles, parts);
        debug!(
            "Solving {} locations with {} vehicles in {} partitions",
            locations.len(),
            vehicles,
            parts
        );

        let outcomes: Vec<Result<Option<i64>>> = self.pool.install(|| {
            partitions
                .par_iter()
                .map(|partition| self.solve_partition(partition, job.max_distance))
                .collect()
        });

        let mut total = 0;
        let mut infeasible = 0;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(Some(distance)) => total += distance,
                Ok(None) => infeasible += 1,
                Err(e) => {
                    warn!("Partition {} failed: {:#}", index, e);
                    return ResultObject::failure(format!("Partition {index} failed: {e:#}"));
                }
            }
        }

        if infeasible == 0 {
            return ResultObject::solved(total, submitted_at);
        }

        warn!("{} of {} partitions have no feasible routing", infeasible, parts);
        match self.infeasible_policy {
            InfeasiblePolicy::Fail => ResultObject::failure(format!(
                "{infeasible} of {parts} partitions have no feasible routing"
            )),
            InfeasiblePolicy::Zero => ResultObject::solved(total, submitted_at).with_info(format!(
                "{infeasible} of {parts} partitions had no feasible routing and contributed 0"
            )),
        }
    }

    /// Longest route in the partition, or `None` when it is infeasible.
    fn solve_partition(&self, partition: &Partition, max_distance: i64) -> Result<Option<i64>> {
        if partition.locations.len() <= 1 {
            return Ok(Some(0));
        }

        // Vehicles beyond one per stop can only have empty routes.
        let vehicles = partition
            .vehicle_share
            .min(partition.locations.len().saturating_sub(1))
            .max(1);
        let matrix = distance_matrix(&partition.locations);
        let request = RoutingRequest::new(matrix, vehicles, max_distance);

        match self.engine.solve(&request)? {
            RoutingOutcome::Assigned { routes } => {
                Ok(Some(max_route_distance(&request.matrix, &routes)))
            }
            RoutingOutcome::Infeasible => Ok(None),
        }
    }
}
