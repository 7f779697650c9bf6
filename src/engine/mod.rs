// Orchestration engine - message handlers that drive nets forward

//! # Engine Module
//!
//! The handlers that sit between the bus and the net model. The
//! [`OrchestratorHandler`] owns the token lifecycle messages and drives the
//! firing protocol; the [`DispatchHandler`] bridges between orchestrator
//! tokens and external shell-command executors.
//!
//! Handlers are stateless: every collaborator arrives through the
//! per-delivery [`crate::Services`] value, so any worker process can handle
//! any message.

pub mod dispatch;
pub mod executor;
pub mod orchestrator;

pub use dispatch::DispatchHandler;
pub use executor::{ForkExecutor, ShellCommandExecutor};
pub use orchestrator::OrchestratorHandler;
