//! VRP (Vehicle Routing Problem) engines
//!
//! A routing engine receives one partition's distance matrix and fleet, and
//! returns the vehicle routes or reports that no feasible assignment exists.
//! Node 0 is the depot; every route starts and ends there implicitly.

mod adapter;
mod cheapest_arc;
mod config;
mod pragmatic;

pub use adapter::{
    build_pragmatic_matrix, build_pragmatic_problem, pragmatic_objectives, DEFAULT_PROFILE,
};
pub use cheapest_arc::CheapestArcEngine;
pub use config::SolverConfig;
pub use pragmatic::PragmaticEngine;

use std::str::FromStr;

use anyhow::Result;

use crate::services::geo::DistanceMatrix;

/// What the engine minimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Objective {
    /// Length of the longest vehicle route
    #[default]
    MinimizeMaxRouteLength,
}

/// How the engine builds its first solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirstSolution {
    #[default]
    CheapestArc,
}

/// One partition's routing problem.
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    pub matrix: DistanceMatrix,
    pub vehicles: usize,
    /// Route length limit per vehicle, in matrix units
    pub max_route_distance: i64,
    pub objective: Objective,
    pub first_solution: FirstSolution,
}

impl RoutingRequest {
    pub fn new(matrix: DistanceMatrix, vehicles: usize, max_route_distance: i64) -> Self {
        Self {
            matrix,
            vehicles,
            max_route_distance,
            objective: Objective::default(),
            first_solution: FirstSolution::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// Node sequence per vehicle, depot excluded; unused vehicles have empty routes.
    Assigned { routes: Vec<Vec<usize>> },
    Infeasible,
}

/// External route-construction collaborator.
pub trait RoutingEngine: Send + Sync {
    fn solve(&self, request: &RoutingRequest) -> Result<RoutingOutcome>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    #[default]
    Pragmatic,
    CheapestArc,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pragmatic" | "vrp-pragmatic" => Ok(EngineKind::Pragmatic),
            "cheapest-arc" | "cheapest_arc" | "heuristic" => Ok(EngineKind::CheapestArc),
            other => Err(format!("unknown routing engine '{other}'")),
        }
    }
}

impl EngineKind {
    pub fn build(self, config: SolverConfig) -> Box<dyn RoutingEngine> {
        match self {
            EngineKind::Pragmatic => Box::new(PragmaticEngine::new(config)),
            EngineKind::CheapestArc => Box::new(CheapestArcEngine),
        }
    }
}

/// Sum of arc costs along depot -> route -> depot.
pub fn route_distance(matrix: &DistanceMatrix, route: &[usize]) -> i64 {
    if route.is_empty() {
        return 0;
    }
    let mut previous = 0;
    let mut total = 0;
    for &node in route {
        total += matrix.distance(previous, node);
        previous = node;
    }
    total + matrix.distance(previous, 0)
}

/// Longest route of an assignment; 0 when no vehicle moves.
pub fn max_route_distance(matrix: &DistanceMatrix, routes: &[Vec<usize>]) -> i64 {
    routes
        .iter()
        .map(|route| route_distance(matrix, route))
        .max()
        .unwrap_or(0)
}
