//! Events emitted by the controller for external consumption (logging, UI,
//! alerting).

use hy_types::{ExperimentPhase, TrialStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerEvent {
    TrialCreated {
        experiment: String,
        trial: String,
    },
    TrialCompleted {
        experiment: String,
        trial: String,
        status: TrialStatus,
        objective_value: Option<f64>,
    },
    TrialKilled {
        experiment: String,
        trial: String,
        reason: String,
    },
    ExperimentFinished {
        experiment: String,
        phase: ExperimentPhase,
    },
    ExperimentDeleted {
        experiment: String,
    },
    ReconcileFailed {
        experiment: String,
        error: String,
    },
}

impl ControllerEvent {
    pub fn experiment(&self) -> &str {
        match self {
            Self::TrialCreated { experiment, .. }
            | Self::TrialCompleted { experiment, .. }
            | Self::TrialKilled { experiment, .. }
            | Self::ExperimentFinished { experiment, .. }
            | Self::ExperimentDeleted { experiment }
            | Self::ReconcileFailed { experiment, .. } => experiment,
        }
    }
}
