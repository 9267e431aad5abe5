//! Trials: one concrete parameter assignment and its training job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{HyResult, LogicError};
use crate::study::StudyId;

/// Unique trial identifier.
pub type TrialId = Uuid;

/// A (parameter name, value) pair. Values are always carried as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterAssignment {
    pub name: String,
    pub value: String,
}

impl ParameterAssignment {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Pending may start or end; Running may only end; terminal is final.
    pub fn can_transition_to(self, next: TrialStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A single trial (one parameter combination evaluated by a workload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    /// Deterministic workload name; `<experiment>-<suffix>`.
    pub name: String,
    pub study_id: StudyId,
    pub parameters: Vec<ParameterAssignment>,
    pub status: TrialStatus,
    /// Latest objective value, recorded when the trial succeeds.
    pub objective_value: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(
        study_id: impl Into<StudyId>,
        name: impl Into<String>,
        parameters: Vec<ParameterAssignment>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            study_id: study_id.into(),
            parameters,
            status: TrialStatus::Pending,
            objective_value: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Move to `next`, stamping the completion time on terminal states.
    pub fn transition(&mut self, next: TrialStatus) -> HyResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(LogicError::IllegalTransition {
                trial: self.name.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HyError;

    fn sample_trial() -> Trial {
        Trial::new(
            "mnist",
            "mnist-a1b2c3d4",
            vec![
                ParameterAssignment::new("lr", "0.01"),
                ParameterAssignment::new("layers", "3"),
            ],
        )
    }

    #[test]
    fn trial_lifecycle() {
        let mut trial = sample_trial();
        assert_eq!(trial.status, TrialStatus::Pending);
        assert_eq!(trial.parameter("lr"), Some("0.01"));

        trial.transition(TrialStatus::Running).unwrap();
        assert!(trial.completed_at.is_none());

        trial.transition(TrialStatus::Succeeded).unwrap();
        assert!(trial.status.is_terminal());
        assert!(trial.completed_at.is_some());
    }

    #[test]
    fn terminal_trials_are_never_reused() {
        let mut trial = sample_trial();
        trial.transition(TrialStatus::Killed).unwrap();
        let err = trial.transition(TrialStatus::Running).unwrap_err();
        assert!(matches!(
            err,
            HyError::Logic(LogicError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn same_status_is_a_no_op() {
        let mut trial = sample_trial();
        trial.transition(TrialStatus::Running).unwrap();
        trial.transition(TrialStatus::Running).unwrap();
        assert_eq!(trial.status, TrialStatus::Running);
    }

    #[test]
    fn running_cannot_go_back_to_pending() {
        assert!(!TrialStatus::Running.can_transition_to(TrialStatus::Pending));
        assert!(TrialStatus::Pending.can_transition_to(TrialStatus::Failed));
    }
}
