//! Solver Relay - broker-mediated job dispatch and partitioned VRP solving
//!
//! One binary, four roles: the gateway publishes jobs and waits for replies,
//! the dispatcher forwards queued jobs to the solving endpoint, the solver
//! runs the partitioned VRP engine, and the audit sink records job events.

mod broker;
mod cli;
mod config;
mod handlers;
mod services;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::broker::{AmqpBroker, RouteTable};
use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::services::audit::{actions, AuditLogger};
use crate::services::backend::HttpSolverBackend;
use crate::services::dispatcher::Dispatcher;
use crate::services::ledger::JobLedger;
use crate::services::limiter::DispatchLimiter;
use crate::services::rpc::RpcClient;
use crate::services::solver::{AdmissionGate, PartitionedSolver};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs directory - use LOGS_DIR env var or default to ./logs
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "solver-relay.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,solver_relay=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    info!("Starting Solver Relay ({:?})...", cli.command);

    let config = Config::from_env()?;
    info!("Configuration loaded");

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_ctrl_c(shutdown.clone()));

    let result = match cli.command {
        Command::Gateway => run_gateway(&config, shutdown).await,
        Command::Dispatcher => run_dispatcher(&config, shutdown).await,
        Command::Solver => run_solver(&config, shutdown).await,
        Command::AuditSink => run_audit_sink(&config, shutdown).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn shutdown_on_ctrl_c(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown requested");
    shutdown.cancel();
}

async fn run_gateway(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let broker = Arc::new(AmqpBroker::connect(&config.amqp_url, "solver-relay-gateway").await?);
    info!("Connected to AMQP broker");

    let ledger = Arc::new(JobLedger::new("gateway"));
    let rpc = Arc::new(RpcClient::new(
        broker.clone(),
        Arc::new(RouteTable::with_defaults(&config.exchange_name)),
        ledger.clone(),
        AuditLogger::new(actions::CONTROLLER, config.audit_url.clone()),
    ));
    rpc.declare_routes().await?;

    let listener = tokio::spawn(rpc.clone().listen(shutdown.clone()));

    let state = handlers::gateway::GatewayState {
        rpc,
        ledger,
        reply_timeout: config.reply_timeout,
    };
    let router = handlers::gateway::router(state);
    let served = handlers::serve(router, &config.gateway_addr, shutdown.clone()).await;

    shutdown.cancel();
    let listened = listener.await.context("Reply listener panicked")?;
    broker.close().await?;

    served?;
    listened.context("Reply listener failed")
}

async fn run_dispatcher(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let broker = Arc::new(AmqpBroker::connect(&config.amqp_url, "solver-relay-dispatcher").await?);
    info!("Connected to AMQP broker");

    let dispatcher = Arc::new(Dispatcher::new(
        broker.clone(),
        Arc::new(RouteTable::with_defaults(&config.exchange_name)),
        Arc::new(HttpSolverBackend::new(config.solver_url.clone(), config.backend_timeout)),
        Arc::new(DispatchLimiter::new(config.dispatch_scope, config.dispatch_concurrency)),
        Arc::new(JobLedger::new("dispatcher")),
        AuditLogger::new(actions::DISPATCHER, config.audit_url.clone()),
    ));

    let dispatched = dispatcher.run(shutdown).await;
    broker.close().await?;
    dispatched.context("Dispatcher failed")
}

async fn run_solver(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let engine = config.routing_engine.build(config.engine_config);
    let solver = PartitionedSolver::new(engine, config.solver_parallelism, config.infeasible_policy)
        .context("Failed to build partition thread pool")?;
    let gate = AdmissionGate::new(
        Arc::new(solver),
        AuditLogger::new(actions::SOLVER, config.audit_url.clone()),
    );

    let state = handlers::solver::SolverState { gate: Arc::new(gate) };
    handlers::serve(handlers::solver::router(state), &config.solver_addr, shutdown).await
}

async fn run_audit_sink(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let store = handlers::audit_sink::CsvAuditStore::new(&config.audit_csv_path);
    info!("Appending audit records to {}", store.path().display());

    let state = handlers::audit_sink::AuditSinkState { store: Arc::new(store) };
    handlers::serve(handlers::audit_sink::router(state), &config.audit_addr, shutdown).await
}
