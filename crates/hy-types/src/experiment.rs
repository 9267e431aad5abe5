//! Experiments: a study plus the controller's bookkeeping and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, HyResult};
use crate::study::{OptimizationType, StudyConfig};
use crate::trial::{ParameterAssignment, Trial, TrialStatus};

/// A named algorithm setting, e.g. `DefaultGrid=4` or `LeastStep=10`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmParameter {
    pub name: String,
    pub value: String,
}

impl AlgorithmParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Look up `name` in `params`; the last occurrence wins.
    pub fn find<'a>(params: &'a [AlgorithmParameter], name: &str) -> Option<&'a str> {
        params
            .iter()
            .rev()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

/// Settings of the median stopping rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingParam {
    /// Minimum number of reported values before a running trial is judged.
    pub least_step: usize,
    pub margin: f64,
    /// Metric to judge by; defaults to the study objective.
    pub eval_metric: Option<String>,
    /// Leading values excluded from running averages.
    pub burn_in: usize,
}

impl Default for EarlyStoppingParam {
    fn default() -> Self {
        Self {
            least_step: 20,
            margin: 0.0,
            eval_metric: None,
            burn_in: 0,
        }
    }
}

impl EarlyStoppingParam {
    pub fn with_least_step(mut self, n: usize) -> Self {
        self.least_step = n;
        self
    }

    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_burn_in(mut self, n: usize) -> Self {
        self.burn_in = n;
        self
    }

    pub fn with_eval_metric(mut self, metric: impl Into<String>) -> Self {
        self.eval_metric = Some(metric.into());
        self
    }

    pub fn eval_metric<'a>(&'a self, study: &'a StudyConfig) -> &'a str {
        self.eval_metric
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(&study.objective_metric)
    }

    /// Build from `LeastStep`, `Margin`, `EvalMetric` and `BurnIn` settings.
    /// Unrecognised names are ignored.
    pub fn from_parameters(params: &[AlgorithmParameter]) -> Result<Self, ConfigError> {
        let mut param = Self::default();
        for p in params {
            match p.name.as_str() {
                "LeastStep" => param.least_step = parse_setting(p)?,
                "Margin" => param.margin = parse_setting(p)?,
                "EvalMetric" => param.eval_metric = Some(p.value.clone()),
                "BurnIn" => param.burn_in = parse_setting(p)?,
                _ => {}
            }
        }
        Ok(param)
    }
}

fn parse_setting<T: std::str::FromStr>(p: &AlgorithmParameter) -> Result<T, ConfigError> {
    p.value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidAlgorithmParameter {
            name: p.name.clone(),
            value: p.value.clone(),
            message: "not a number".to_string(),
        })
}

/// Everything a user supplies to create an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub study: StudyConfig,
    /// Job template; `{{name}}` placeholders are replaced per trial.
    pub trial_template: String,
    #[serde(default)]
    pub suggestion_parameters: Vec<AlgorithmParameter>,
    #[serde(default)]
    pub early_stopping_parameters: Vec<AlgorithmParameter>,
}

impl ExperimentSpec {
    pub fn new(study: StudyConfig, trial_template: impl Into<String>) -> Self {
        Self {
            study,
            trial_template: trial_template.into(),
            suggestion_parameters: Vec::new(),
            early_stopping_parameters: Vec::new(),
        }
    }

    pub fn with_suggestion_parameter(mut self, name: &str, value: &str) -> Self {
        self.suggestion_parameters
            .push(AlgorithmParameter::new(name, value));
        self
    }

    pub fn with_early_stopping_parameter(mut self, name: &str, value: &str) -> Self {
        self.early_stopping_parameters
            .push(AlgorithmParameter::new(name, value));
        self
    }

    pub fn validate(&self) -> HyResult<()> {
        self.study.validate()?;
        EarlyStoppingParam::from_parameters(&self.early_stopping_parameters)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentPhase {
    Created,
    Running,
    Succeeded,
    Failed,
    Terminating,
}

impl ExperimentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Per-status trial counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrialCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub killed: usize,
}

impl TrialCounts {
    pub fn tally<'a>(trials: impl IntoIterator<Item = &'a Trial>) -> Self {
        let mut counts = Self::default();
        for trial in trials {
            match trial.status {
                TrialStatus::Pending => counts.pending += 1,
                TrialStatus::Running => counts.running += 1,
                TrialStatus::Succeeded => counts.succeeded += 1,
                TrialStatus::Failed => counts.failed += 1,
                TrialStatus::Killed => counts.killed += 1,
            }
        }
        counts
    }

    pub fn active(&self) -> usize {
        self.pending + self.running
    }

    pub fn total(&self) -> usize {
        self.active() + self.succeeded + self.failed + self.killed
    }
}

/// Best succeeded trial so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTrial {
    pub trial_name: String,
    pub objective_value: f64,
    pub parameters: Vec<ParameterAssignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatus {
    pub phase: ExperimentPhase,
    pub trials: TrialCounts,
    pub best_trial: Option<BestTrial>,
    /// Most recent error that blocked a reconcile pass.
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for ExperimentStatus {
    fn default() -> Self {
        Self {
            phase: ExperimentPhase::Created,
            trials: TrialCounts::default(),
            best_trial: None,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Top-level experiment record as kept in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub spec: ExperimentSpec,
    pub status: ExperimentStatus,
    /// Trials issued so far. The only field of the study that changes.
    pub total_issued: u32,
    /// Suggestion parameter set registered for this experiment.
    pub suggestion_param_id: Option<String>,
    /// Early-stopping parameter set registered for this experiment.
    pub early_stopping_param_id: Option<String>,
    /// Set while child trials may still exist.
    pub finalizer: bool,
    pub deletion_requested: bool,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(spec: ExperimentSpec) -> Self {
        Self {
            spec,
            status: ExperimentStatus::default(),
            total_issued: 0,
            suggestion_param_id: None,
            early_stopping_param_id: None,
            finalizer: true,
            deletion_requested: false,
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.study.name
    }

    pub fn study(&self) -> &StudyConfig {
        &self.spec.study
    }

    pub fn is_terminal(&self) -> bool {
        self.status.phase.is_terminal()
    }

    pub fn remaining_budget(&self) -> u32 {
        self.spec.study.max_trial_count.saturating_sub(self.total_issued)
    }

    pub fn mark_running(&mut self) {
        if self.status.phase == ExperimentPhase::Created {
            self.status.phase = ExperimentPhase::Running;
            self.status.started_at = Some(Utc::now());
        }
    }

    pub fn mark_succeeded(&mut self) {
        self.status.phase = ExperimentPhase::Succeeded;
        self.status.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status.phase = ExperimentPhase::Failed;
        self.status.completed_at = Some(Utc::now());
        self.status.last_error = Some(error);
    }

    /// Recompute the best trial from scratch over `trials`.
    pub fn recompute_best<'a>(&mut self, trials: impl IntoIterator<Item = &'a Trial>) {
        let direction = self.spec.study.optimization_type;
        let mut best: Option<BestTrial> = None;
        for trial in trials {
            if trial.status != TrialStatus::Succeeded {
                continue;
            }
            let Some(value) = trial.objective_value else {
                continue;
            };
            let dominated = match &best {
                None => direction != OptimizationType::Unknown,
                Some(current) => direction.improves(value, current.objective_value),
            };
            if dominated {
                best = Some(BestTrial {
                    trial_name: trial.name.clone(),
                    objective_value: value,
                    parameters: trial.parameters.clone(),
                });
            }
        }
        self.status.best_trial = best;
    }

    pub fn goal_reached(&self) -> bool {
        let study = &self.spec.study;
        match (study.optimization_goal, &self.status.best_trial) {
            (Some(goal), Some(best)) => study.optimization_type.reaches(best.objective_value, goal),
            _ => false,
        }
    }
}
