//! In-process cheapest-arc route construction
//!
//! Grows all routes together: the vehicle with the shortest closed route so
//! far is extended with the cheapest unvisited node it can still reach and
//! return from within the distance limit. Balancing by extending the
//! shortest route first keeps the longest route short.

use anyhow::Result;
use tracing::debug;

use super::{FirstSolution, Objective, RoutingEngine, RoutingOutcome, RoutingRequest};

#[derive(Debug, Clone, Copy, Default)]
pub struct CheapestArcEngine;

struct VehicleRoute {
    nodes: Vec<usize>,
    /// Distance from the depot to the tail, without the return arc
    length: i64,
}

impl VehicleRoute {
    fn tail(&self) -> usize {
        self.nodes.last().copied().unwrap_or(0)
    }
}

impl RoutingEngine for CheapestArcEngine {
    fn solve(&self, request: &RoutingRequest) -> Result<RoutingOutcome> {
        if request.matrix.size <= 1 {
            return Ok(RoutingOutcome::Assigned {
                routes: vec![Vec::new(); request.vehicles],
            });
        }
        if request.vehicles == 0 {
            return Ok(RoutingOutcome::Infeasible);
        }

        match request.first_solution {
            FirstSolution::CheapestArc => Ok(construct(request)),
        }
    }

    fn name(&self) -> &'static str {
        "cheapest-arc"
    }
}

/// Which route gets the next node: the one the objective is least hurt by extending.
fn priority(objective: Objective, request: &RoutingRequest, route: &VehicleRoute) -> i64 {
    match objective {
        Objective::MinimizeMaxRouteLength => {
            route.length + request.matrix.distance(route.tail(), 0)
        }
    }
}

fn construct(request: &RoutingRequest) -> RoutingOutcome {
    let matrix = &request.matrix;
    let size = matrix.size;

    let mut vehicles: Vec<VehicleRoute> = (0..request.vehicles)
        .map(|_| VehicleRoute {
            nodes: Vec::new(),
            length: 0,
        })
        .collect();
    let mut visited = vec![false; size];
    visited[0] = true;

    for _ in 1..size {
        let mut order: Vec<usize> = (0..vehicles.len()).collect();
        order.sort_by_key(|&v| (priority(request.objective, request, &vehicles[v]), v));

        let placement = order.into_iter().find_map(|v| {
            let route = &vehicles[v];
            let tail = route.tail();
            (1..size)
                .filter(|&node| !visited[node])
                .filter(|&node| {
                    let closed = route.length
                        + matrix.distance(tail, node)
                        + matrix.distance(node, 0);
                    closed <= request.max_route_distance
                })
                .min_by_key(|&node| (matrix.distance(tail, node), node))
                .map(|node| (v, node))
        });

        let Some((v, node)) = placement else {
            debug!(
                "No vehicle can reach another node within {} units",
                request.max_route_distance
            );
            return RoutingOutcome::Infeasible;
        };

        let route = &mut vehicles[v];
        route.length += matrix.distance(route.tail(), node);
        route.nodes.push(node);
        visited[node] = true;
    }

    RoutingOutcome::Assigned {
        routes: vehicles.into_iter().map(|route| route.nodes).collect(),
    }
}
