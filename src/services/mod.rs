//! Business logic services

pub mod audit;
pub mod backend;
pub mod dispatcher;
pub mod geo;
pub mod ledger;
pub mod limiter;
pub mod rpc;
pub mod solver;
pub mod vrp;
