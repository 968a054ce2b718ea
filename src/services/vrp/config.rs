//! Search limits for the metaheuristic engine

/// Termination settings passed to vrp-core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolverConfig {
    /// Maximum solving time per partition in seconds
    pub max_time_seconds: u32,
    /// Maximum generations for the metaheuristic
    pub max_generations: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_time_seconds: 30,
            max_generations: 3000,
        }
    }
}

impl SolverConfig {
    pub fn new(max_time_seconds: u32, max_generations: usize) -> Self {
        Self {
            max_time_seconds,
            max_generations,
        }
    }

    /// Short search limits for tests
    #[cfg(test)]
    pub fn instant() -> Self {
        Self {
            max_time_seconds: 2,
            max_generations: 200,
        }
    }
}
