//! Algorithm registry and named parameter sets.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hy_types::{
    AlgorithmParameter, ConfigError, HyError, HyResult, ParameterConfig, StudyId, Trial,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cursor::{CursorStore, MemoryCursorStore};
use crate::grid::GridSuggester;
use crate::random::RandomSuggester;
use crate::strategy::{AssignmentSet, NoopSuggester, Suggester, SuggestionRequest};

/// Algorithm settings registered by `set_suggestion_parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionParameterSet {
    pub param_id: String,
    pub study_id: StudyId,
    pub algorithm: String,
    pub parameters: Vec<AlgorithmParameter>,
    pub created_at: DateTime<Utc>,
}

/// A `GetSuggestions` call.
#[derive(Debug, Clone, Copy)]
pub struct SuggestionQuery<'a> {
    pub study_id: &'a str,
    pub algorithm: &'a str,
    pub request_count: i32,
    pub parameters: &'a [ParameterConfig],
    pub prior_trials: &'a [Trial],
    /// Registered parameter set; its settings apply and it keys grid state.
    pub param_id: Option<&'a str>,
}

/// Entry point for suggestion requests.
pub struct SuggestionService {
    suggesters: HashMap<&'static str, Arc<dyn Suggester>>,
    parameter_sets: DashMap<String, SuggestionParameterSet>,
    cursors: Arc<dyn CursorStore>,
}

impl SuggestionService {
    pub fn new() -> Self {
        Self::with_cursor_store(Arc::new(MemoryCursorStore::new()))
    }

    pub fn with_cursor_store(cursors: Arc<dyn CursorStore>) -> Self {
        let table: [Arc<dyn Suggester>; 3] = [
            Arc::new(RandomSuggester),
            Arc::new(GridSuggester::new(cursors.clone())),
            Arc::new(NoopSuggester),
        ];
        let suggesters = table.into_iter().map(|s| (s.name(), s)).collect();
        Self {
            suggesters,
            parameter_sets: DashMap::new(),
            cursors,
        }
    }

    /// Ids of every registered algorithm, sorted.
    pub fn algorithms(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.suggesters.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn suggester(&self, algorithm: &str) -> Result<&Arc<dyn Suggester>, ConfigError> {
        self.suggesters
            .get(algorithm)
            .ok_or_else(|| ConfigError::UnsupportedAlgorithm {
                algorithm: algorithm.to_string(),
            })
    }

    /// Register settings for `algorithm` and return the new param id.
    pub fn set_suggestion_parameters(
        &self,
        study_id: &str,
        algorithm: &str,
        parameters: Vec<AlgorithmParameter>,
    ) -> HyResult<String> {
        self.suggester(algorithm)?;
        let param_id = Uuid::new_v4().to_string();
        self.parameter_sets.insert(
            param_id.clone(),
            SuggestionParameterSet {
                param_id: param_id.clone(),
                study_id: study_id.to_string(),
                algorithm: algorithm.to_string(),
                parameters,
                created_at: Utc::now(),
            },
        );
        info!(study = study_id, algorithm, %param_id, "suggestion parameters registered");
        Ok(param_id)
    }

    pub fn get_suggestion_parameters(&self, param_id: &str) -> HyResult<SuggestionParameterSet> {
        self.parameter_sets
            .get(param_id)
            .map(|set| set.clone())
            .ok_or_else(|| HyError::not_found("suggestion parameter set", param_id))
    }

    pub fn suggestion_parameter_list(&self, study_id: &str) -> Vec<SuggestionParameterSet> {
        let mut sets: Vec<_> = self
            .parameter_sets
            .iter()
            .filter(|set| set.study_id == study_id)
            .map(|set| set.clone())
            .collect();
        sets.sort_by_key(|set| set.created_at);
        sets
    }

    /// Drop every parameter set of a study along with its grid cursor.
    pub fn remove_study(&self, study_id: &str) {
        self.parameter_sets.retain(|param_id, set| {
            let keep = set.study_id != study_id;
            if !keep {
                self.cursors.remove(param_id);
            }
            keep
        });
    }

    /// Drop one parameter set and its grid cursor.
    pub fn remove_parameters(&self, param_id: &str) {
        if self.parameter_sets.remove(param_id).is_some() {
            self.cursors.remove(param_id);
        }
    }

    pub fn get_suggestions(&self, query: &SuggestionQuery<'_>) -> HyResult<Vec<AssignmentSet>> {
        let suggester = self.suggester(query.algorithm)?;
        if query.request_count < 0 {
            return Err(ConfigError::NegativeRequestCount {
                count: query.request_count,
            }
            .into());
        }

        let registered = match query.param_id {
            Some(param_id) => {
                let set = self.get_suggestion_parameters(param_id)?;
                if set.algorithm != query.algorithm {
                    warn!(
                        %param_id,
                        registered = %set.algorithm,
                        requested = query.algorithm,
                        "parameter set belongs to another algorithm"
                    );
                    return Err(ConfigError::InvalidAlgorithmParameter {
                        name: "param_id".to_string(),
                        value: param_id.to_string(),
                        message: format!("registered for algorithm {}", set.algorithm),
                    }
                    .into());
                }
                Some(set)
            }
            None => None,
        };

        let request = SuggestionRequest {
            study_id: query.study_id,
            param_id: query.param_id.unwrap_or(query.study_id),
            request_count: query.request_count,
            parameters: query.parameters,
            prior_trials: query.prior_trials,
            settings: registered
                .as_ref()
                .map(|set| set.parameters.as_slice())
                .unwrap_or(&[]),
        };
        suggester.suggest(&request)
    }
}

impl Default for SuggestionService {
    fn default() -> Self {
        Self::new()
    }
}
