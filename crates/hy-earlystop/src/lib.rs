//! # hy-earlystop
//!
//! Early-stopping decisions for running trials.
//!
//! Strategies are pure functions of the study, their settings and the trial
//! logs: they never touch a workload or the store. The controller applies
//! whatever they recommend.

mod decision;
mod median;
mod service;

pub use decision::StopDecision;
pub use median::{median_stopping, MedianStopping};
pub use service::{EarlyStopper, EarlyStoppingParameterSet, EarlyStoppingService};
