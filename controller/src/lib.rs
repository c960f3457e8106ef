mod controller;
mod metrics;

pub mod config;
pub mod error;
pub mod platform;
pub mod pools;
pub mod predicates;
pub mod statemachine;
pub mod telemetry;
pub mod workqueue;

pub use crate::controller::{DrainController, ReconcileOutcome};
