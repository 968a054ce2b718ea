//! Adapter to build vrp-pragmatic inputs from a partition's routing request.

use serde_json::{json, Value};
use vrp_pragmatic::format::problem::Matrix;

use super::{Objective, RoutingRequest};
use crate::services::geo::DistanceMatrix;

pub const DEFAULT_PROFILE: &str = "car";
pub const DEFAULT_VEHICLE_TYPE: &str = "vehicle";

/// Routing is distance-only; the shift only has to be wide enough never to bind.
const SHIFT_START: &str = "2024-01-01T00:00:00Z";
const SHIFT_END: &str = "2034-01-01T00:00:00Z";

pub(super) fn job_id(node: usize) -> String {
    format!("node-{node}")
}

pub(super) fn vehicle_id(index: usize) -> String {
    format!("{DEFAULT_VEHICLE_TYPE}_{}", index + 1)
}

/// Lexicographic objective list for `objective`. Every job is served first,
/// then route distances are balanced, then total distance breaks ties.
pub fn pragmatic_objectives(objective: Objective) -> Value {
    match objective {
        Objective::MinimizeMaxRouteLength => json!([
            { "type": "minimize-unassigned" },
            { "type": "balance-distance" },
            { "type": "minimize-cost" }
        ]),
    }
}

/// Job `node-i` sits at matrix index i; every vehicle starts and ends at index 0.
pub fn build_pragmatic_problem(request: &RoutingRequest) -> Value {
    let jobs: Vec<Value> = (1..request.matrix.size)
        .map(|node| {
            json!({
                "id": job_id(node),
                "services": [{
                    "places": [{
                        "location": { "index": node },
                        "duration": 0
                    }]
                }]
            })
        })
        .collect();

    let vehicle_ids: Vec<String> = (0..request.vehicles).map(vehicle_id).collect();

    json!({
        "plan": {
            "jobs": jobs
        },
        "fleet": {
            "vehicles": [{
                "typeId": DEFAULT_VEHICLE_TYPE,
                "vehicleIds": vehicle_ids,
                "profile": { "matrix": DEFAULT_PROFILE },
                "costs": {
                    "fixed": 0.0,
                    "distance": 1.0,
                    "time": 0.0
                },
                "shifts": [{
                    "start": {
                        "earliest": SHIFT_START,
                        "location": { "index": 0 }
                    },
                    "end": {
                        "latest": SHIFT_END,
                        "location": { "index": 0 }
                    }
                }],
                "capacity": [request.matrix.size.max(1)],
                "limits": {
                    "maxDistance": request.max_route_distance as f64
                }
            }],
            "profiles": [{
                "name": DEFAULT_PROFILE
            }]
        },
        "objectives": pragmatic_objectives(request.objective)
    })
}

/// Build pragmatic routing matrix; travel time is not modelled.
pub fn build_pragmatic_matrix(matrix: &DistanceMatrix, profile: &str) -> Matrix {
    let size = matrix.size;
    let mut distances = Vec::with_capacity(size * size);

    for i in 0..size {
        for j in 0..size {
            distances.push(matrix.distance(i, j));
        }
    }

    Matrix {
        profile: Some(profile.to_string()),
        timestamp: None,
        travel_times: vec![0; size * size],
        distances,
        error_codes: None,
    }
}
