//! vrp-pragmatic solver integration.

use std::collections::HashMap;
use std::io::BufWriter;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;
use vrp_cli::extensions::solve::config::{create_builder_from_config, Config, TerminationConfig};
use vrp_core::solver::Solver;
use vrp_pragmatic::format::problem::{Matrix, PragmaticProblem, Problem};
use vrp_pragmatic::format::solution::{
    write_pragmatic, PragmaticOutputType, Solution as PragmaticSolution,
};

use super::adapter::{job_id, vehicle_id};
use super::{
    build_pragmatic_matrix, build_pragmatic_problem, FirstSolution, RoutingEngine, RoutingOutcome,
    RoutingRequest, SolverConfig, DEFAULT_PROFILE,
};

/// Delegates route construction to the vrp-core metaheuristic.
pub struct PragmaticEngine {
    config: SolverConfig,
}

impl PragmaticEngine {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }
}

impl RoutingEngine for PragmaticEngine {
    fn solve(&self, request: &RoutingRequest) -> Result<RoutingOutcome> {
        if request.matrix.size <= 1 {
            return Ok(RoutingOutcome::Assigned {
                routes: vec![Vec::new(); request.vehicles],
            });
        }
        if request.vehicles == 0 {
            return Ok(RoutingOutcome::Infeasible);
        }

        // vrp-core seeds its population with cheapest insertion.
        let construction = match request.first_solution {
            FirstSolution::CheapestArc => "cheapest insertion",
        };
        debug!(
            "Solving {} nodes with {} vehicles, objective {:?}, first solution by {}",
            request.matrix.size - 1,
            request.vehicles,
            request.objective,
            construction
        );

        let problem_json = build_pragmatic_problem(request);
        let problem_format: Problem = serde_json::from_value(problem_json)
            .context("Failed to deserialize pragmatic problem")?;

        let matrix: Matrix = build_pragmatic_matrix(&request.matrix, DEFAULT_PROFILE);
        let core_problem = (problem_format, vec![matrix])
            .read_pragmatic()
            .context("Failed to build core problem from pragmatic format")?;

        let core_problem = Arc::new(core_problem);
        let solver_config = build_solver_config(core_problem.clone(), &self.config)?;

        let solution = Solver::new(core_problem.clone(), solver_config)
            .solve()
            .context("Failed to solve VRP with vrp-pragmatic")?;

        let pragmatic = write_pragmatic_solution(core_problem.as_ref(), &solution)?;
        Ok(map_solution(request, &pragmatic))
    }

    fn name(&self) -> &'static str {
        "vrp-pragmatic"
    }
}

fn build_solver_config(
    problem: Arc<vrp_core::models::Problem>,
    config: &SolverConfig,
) -> Result<
    vrp_core::rosomaxa::evolution::EvolutionConfig<
        vrp_core::solver::RefinementContext,
        vrp_core::models::GoalContext,
        vrp_core::construction::heuristics::InsertionContext,
    >,
> {
    let config = Config {
        termination: Some(TerminationConfig {
            max_time: Some(config.max_time_seconds as usize),
            max_generations: Some(config.max_generations),
            variation: None,
        }),
        evolution: None,
        hyper: None,
        environment: None,
        telemetry: None,
        output: None,
    };

    let builder = create_builder_from_config(problem, Vec::new(), &config)
        .context("Failed to create solver builder")?;

    builder.build().context("Failed to build solver configuration")
}

fn write_pragmatic_solution(
    problem: &vrp_core::models::Problem,
    solution: &vrp_core::models::Solution,
) -> Result<PragmaticSolution> {
    let mut writer = BufWriter::new(Vec::new());
    write_pragmatic(problem, solution, PragmaticOutputType::default(), &mut writer)
        .context("Failed to serialize pragmatic solution")?;

    let bytes = writer.into_inner().context("Failed to flush solution writer")?;
    let parsed: PragmaticSolution =
        serde_json::from_slice(&bytes).context("Failed to parse pragmatic solution JSON")?;

    Ok(parsed)
}

/// Any unassigned job means the partition has no feasible assignment.
fn map_solution(request: &RoutingRequest, solution: &PragmaticSolution) -> RoutingOutcome {
    if let Some(unassigned) = solution.unassigned.as_ref().filter(|jobs| !jobs.is_empty()) {
        let reasons: Vec<String> = unassigned
            .iter()
            .map(|job| {
                let codes: Vec<&str> = job.reasons.iter().map(|r| r.code.as_str()).collect();
                format!("{} ({})", job.job_id, codes.join(", "))
            })
            .collect();
        debug!("Unassigned jobs: {}", reasons.join("; "));
        return RoutingOutcome::Infeasible;
    }

    let node_by_job: HashMap<String, usize> =
        (1..request.matrix.size).map(|node| (job_id(node), node)).collect();
    let vehicle_by_id: HashMap<String, usize> =
        (0..request.vehicles).map(|v| (vehicle_id(v), v)).collect();

    let mut routes = vec![Vec::new(); request.vehicles];
    for tour in &solution.tours {
        let Some(&vehicle) = vehicle_by_id.get(&tour.vehicle_id) else {
            debug!("Tour for unknown vehicle {}", tour.vehicle_id);
            continue;
        };
        for stop in &tour.stops {
            for activity in stop.activities() {
                if let Some(&node) = node_by_job.get(&activity.job_id) {
                    routes[vehicle].push(node);
                }
            }
        }
    }

    RoutingOutcome::Assigned { routes }
}
