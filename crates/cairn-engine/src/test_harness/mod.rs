//! Simulated cloud and reference scenario
//!
//! Used by the `cairn` binary and by integration tests to exercise the
//! engine end to end without real cloud credentials.

pub mod app_service;
pub mod simulator;

pub use app_service::{declare_app_service, AppServiceStack, ScenarioError};
pub use simulator::{SimulatedCall, SimulatedCloud, SimulatorConfig};
