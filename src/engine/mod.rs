//! Reconcile engine: dispatcher workers and the controller that runs them.

pub mod control;
pub mod dispatcher;

pub use control::{Controller, ControllerConfig, ControllerState};
pub use dispatcher::{Dispatcher, ProcessOutcome};
