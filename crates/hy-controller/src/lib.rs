//! # hy-controller
//!
//! The optimization control loop of Halyard.
//!
//! [`ExperimentController`] reconciles one experiment per pass against the
//! [`Store`](hy_store::Store), the suggestion and early-stopping engines and a
//! [`Workload`]. [`ControllerRuntime`] drives passes from a work queue, and
//! [`Manager`] is the user-facing facade.

pub mod config;
pub mod controller;
pub mod events;
pub mod manager;
pub mod process;
pub mod runtime;
#[cfg(any(test, feature = "test-util"))]
pub mod simulated;
pub mod template;
pub mod workload;

pub use config::ControllerConfig;
pub use controller::{ExperimentController, ReconcileOutcome};
pub use events::ControllerEvent;
pub use manager::Manager;
pub use process::ProcessWorkload;
pub use runtime::{ControllerRuntime, QueueHandle};
#[cfg(any(test, feature = "test-util"))]
pub use simulated::SimulatedWorkload;
pub use workload::{
    CollectorTarget, JobHandle, JobManifest, JobStatus, MetricsCollector, Workload,
};
