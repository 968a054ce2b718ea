//! CLI argument parsing for the solver-relay binary.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "solver-relay", about = "Broker-mediated job dispatch and VRP solving")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Accept jobs over HTTP and wait for their replies
    Gateway,
    /// Move queued jobs to the solving endpoint, one at a time
    Dispatcher,
    /// Serve the solving endpoint
    Solver,
    /// Append audit records to a CSV file
    AuditSink,
}
