//! Early-stopping algorithm registry and parameter sets.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hy_types::{
    AlgorithmParameter, ConfigError, EarlyStoppingParam, HyError, HyResult, StudyConfig, StudyId,
    TrialLog,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::decision::StopDecision;
use crate::median::MedianStopping;

/// An early-stopping strategy.
///
/// `completed` holds the logs of succeeded trials, `running` those of trials
/// still in flight. Only running trials can be recommended for stopping.
pub trait EarlyStopper: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(
        &self,
        study: &StudyConfig,
        param: &EarlyStoppingParam,
        completed: &[TrialLog],
        running: &[TrialLog],
    ) -> Vec<StopDecision>;
}

/// Settings registered by `set_early_stopping_parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingParameterSet {
    pub param_id: String,
    pub study_id: StudyId,
    pub algorithm: String,
    pub parameters: Vec<AlgorithmParameter>,
    pub param: EarlyStoppingParam,
    pub created_at: DateTime<Utc>,
}

pub struct EarlyStoppingService {
    stoppers: HashMap<&'static str, Arc<dyn EarlyStopper>>,
    parameter_sets: DashMap<String, EarlyStoppingParameterSet>,
}

impl EarlyStoppingService {
    pub fn new() -> Self {
        let table: [Arc<dyn EarlyStopper>; 1] = [Arc::new(MedianStopping)];
        Self {
            stoppers: table.into_iter().map(|s| (s.name(), s)).collect(),
            parameter_sets: DashMap::new(),
        }
    }

    pub fn algorithms(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.stoppers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn stopper(&self, algorithm: &str) -> Result<&Arc<dyn EarlyStopper>, ConfigError> {
        self.stoppers
            .get(algorithm)
            .ok_or_else(|| ConfigError::UnsupportedAlgorithm {
                algorithm: algorithm.to_string(),
            })
    }

    /// Validate and register settings; returns the new param id.
    pub fn set_early_stopping_parameters(
        &self,
        study_id: &str,
        algorithm: &str,
        parameters: Vec<AlgorithmParameter>,
    ) -> HyResult<String> {
        self.stopper(algorithm)?;
        let param = EarlyStoppingParam::from_parameters(&parameters)?;
        let param_id = Uuid::new_v4().to_string();
        self.parameter_sets.insert(
            param_id.clone(),
            EarlyStoppingParameterSet {
                param_id: param_id.clone(),
                study_id: study_id.to_string(),
                algorithm: algorithm.to_string(),
                parameters,
                param,
                created_at: Utc::now(),
            },
        );
        info!(study = study_id, algorithm, %param_id, "early stopping parameters registered");
        Ok(param_id)
    }

    pub fn get_early_stopping_parameters(
        &self,
        param_id: &str,
    ) -> HyResult<EarlyStoppingParameterSet> {
        self.parameter_sets
            .get(param_id)
            .map(|set| set.clone())
            .ok_or_else(|| HyError::not_found("early stopping parameter set", param_id))
    }

    pub fn early_stopping_parameter_list(&self, study_id: &str) -> Vec<EarlyStoppingParameterSet> {
        let mut sets: Vec<_> = self
            .parameter_sets
            .iter()
            .filter(|set| set.study_id == study_id)
            .map(|set| set.clone())
            .collect();
        sets.sort_by_key(|set| set.created_at);
        sets
    }

    pub fn remove_study(&self, study_id: &str) {
        self.parameter_sets.retain(|_, set| set.study_id != study_id);
    }

    pub fn remove_parameters(&self, param_id: &str) {
        self.parameter_sets.remove(param_id);
    }

    /// Trials among `running` that should be stopped. With no `param_id`
    /// the default settings apply.
    pub fn should_trial_stop(
        &self,
        study: &StudyConfig,
        algorithm: &str,
        param_id: Option<&str>,
        completed: &[TrialLog],
        running: &[TrialLog],
    ) -> HyResult<Vec<StopDecision>> {
        let stopper = self.stopper(algorithm)?;
        let param = match param_id {
            Some(param_id) => {
                let set = self.get_early_stopping_parameters(param_id)?;
                if set.algorithm != algorithm {
                    warn!(
                        %param_id,
                        registered = %set.algorithm,
                        requested = algorithm,
                        "parameter set belongs to another algorithm"
                    );
                    return Err(ConfigError::InvalidAlgorithmParameter {
                        name: "param_id".to_string(),
                        value: param_id.to_string(),
                        message: format!("registered for algorithm {}", set.algorithm),
                    }
                    .into());
                }
                set.param
            }
            None => EarlyStoppingParam::default(),
        };

        let decisions = stopper.evaluate(study, &param, completed, running);
        for decision in &decisions {
            info!(
                study = %study.name,
                trial = %decision.trial_id,
                "{}",
                decision.summary()
            );
        }
        Ok(decisions)
    }
}

impl Default for EarlyStoppingService {
    fn default() -> Self {
        Self::new()
    }
}
