//! Workflow execution engine for clipflow: graph parsing and validation, generation
//! scheduling, cost estimation, node execution, credit settlement and the HTTP surface.

pub mod config;
pub mod cost;
pub mod error;
pub mod executor;
pub mod graph;
pub mod ledger;
pub mod logging;
pub mod model_registry;
pub mod model_runner;
pub mod node;
pub mod nodes;
pub mod schedule;
pub mod server;
pub mod types;
