//! Stratus Core
//!
//! Core library for driving remote cloud resources to a converged state:
//! status classification, the convergence poller and its corrective driver,
//! and the plan/apply loop that turns declarative configuration into calls.

pub mod corrective;
pub mod data;
pub mod differ;
pub mod effect;
pub mod interpreter;
pub mod lock;
pub mod plan;
pub mod poller;
pub mod provider;
pub mod refresh;
pub mod resource;
pub mod status;
pub mod timeouts;
