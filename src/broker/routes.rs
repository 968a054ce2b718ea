//! Static mapping from problem type to broker routes

use crate::types::ProblemType;

/// Work and reply routes of one problem type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub problem_type: ProblemType,
    pub work_queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub reply_queue: String,
    pub reply_routing_key: String,
}

impl RouteEntry {
    pub fn new(
        problem_type: ProblemType,
        exchange: &str,
        work_queue: &str,
        routing_key: &str,
        reply_queue: &str,
        reply_routing_key: &str,
    ) -> Self {
        Self {
            problem_type,
            work_queue: work_queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reply_queue: reply_queue.to_string(),
            reply_routing_key: reply_routing_key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteTableError {
    #[error("no route configured for problem type {0}")]
    RouteNotFound(ProblemType),
    #[cfg(test)]
    #[error("problem type {0} is configured more than once")]
    Duplicate(ProblemType),
}

/// Read-only route table, one entry per problem type, loaded at startup.
#[derive(Debug, Clone)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    #[cfg(test)]
    pub fn new(mut entries: Vec<RouteEntry>) -> Result<Self, RouteTableError> {
        entries.sort_by_key(|e| e.problem_type);
        if let Some(pair) = entries.windows(2).find(|w| w[0].problem_type == w[1].problem_type) {
            return Err(RouteTableError::Duplicate(pair[0].problem_type));
        }
        Ok(Self { entries })
    }

    /// The standard queues for every known problem type on `exchange`.
    pub fn with_defaults(exchange: &str) -> Self {
        let entries = vec![
            RouteEntry::new(
                ProblemType::Vrp,
                exchange,
                "VRP_queue",
                "vrp-key",
                "VRP_client_queue",
                "vrp-key-reply",
            ),
            RouteEntry::new(
                ProblemType::Knapsack,
                exchange,
                "Knapsack_queue",
                "knapsack-key",
                "Knapsack_client_queue",
                "knapsack-key-reply",
            ),
            RouteEntry::new(
                ProblemType::CpSat,
                exchange,
                "CpSat_queue",
                "cpsat-key",
                "CpSat_client_queue",
                "cpsat-key-reply",
            ),
        ];
        Self { entries }
    }

    pub fn get(&self, problem_type: ProblemType) -> Result<&RouteEntry, RouteTableError> {
        self.entries
            .iter()
            .find(|e| e.problem_type == problem_type)
            .ok_or(RouteTableError::RouteNotFound(problem_type))
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }
}
