//! Study configuration and search-space definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::{ConfigError, HyResult};

/// Unique study identifier (the owning experiment's name).
pub type StudyId = String;

/// Whether we are maximizing or minimizing the objective.
///
/// `Unknown` is what an omitted field deserializes to. Validation rejects it,
/// but stored studies may still carry it and consumers must tolerate that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizationType {
    #[default]
    Unknown,
    Maximize,
    Minimize,
}

impl OptimizationType {
    /// True if `candidate` is strictly better than `incumbent`.
    /// Always false for `Unknown`.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
            Self::Unknown => false,
        }
    }

    /// True if `value` meets or passes `goal`.
    pub fn reaches(self, value: f64, goal: f64) -> bool {
        match self {
            Self::Maximize => value >= goal,
            Self::Minimize => value <= goal,
            Self::Unknown => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterType {
    Double,
    Int,
    Categorical,
    Discrete,
}

/// Allowed values for one parameter, as received from the user.
///
/// Numeric types use `min`/`max`, enumerated types use `list`. Bounds stay
/// strings until [`ParameterConfig::domain`] validates them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeasibleSpace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<String>,
}

/// A single tunable parameter of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    pub name: String,
    pub parameter_type: ParameterType,
    pub feasible: FeasibleSpace,
}

/// Validated, typed view of a parameter's feasible space.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain<'a> {
    Double { min: f64, max: f64 },
    Int { min: i64, max: i64 },
    Values(&'a [String]),
}

impl ParameterConfig {
    pub fn double(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            parameter_type: ParameterType::Double,
            feasible: FeasibleSpace {
                min: Some(min.to_string()),
                max: Some(max.to_string()),
                list: Vec::new(),
            },
        }
    }

    pub fn int(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: name.into(),
            parameter_type: ParameterType::Int,
            feasible: FeasibleSpace {
                min: Some(min.to_string()),
                max: Some(max.to_string()),
                list: Vec::new(),
            },
        }
    }

    pub fn categorical<S: Into<String>>(name: impl Into<String>, values: Vec<S>) -> Self {
        Self::enumerated(name, ParameterType::Categorical, values)
    }

    pub fn discrete<S: Into<String>>(name: impl Into<String>, values: Vec<S>) -> Self {
        Self::enumerated(name, ParameterType::Discrete, values)
    }

    fn enumerated<S: Into<String>>(
        name: impl Into<String>,
        parameter_type: ParameterType,
        values: Vec<S>,
    ) -> Self {
        Self {
            name: name.into(),
            parameter_type,
            feasible: FeasibleSpace {
                min: None,
                max: None,
                list: values.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// Parse and check the feasible space.
    pub fn domain(&self) -> Result<Domain<'_>, ConfigError> {
        match self.parameter_type {
            ParameterType::Double => {
                let min: f64 = self.bound("min", self.feasible.min.as_deref())?;
                let max: f64 = self.bound("max", self.feasible.max.as_deref())?;
                if !min.is_finite() || !max.is_finite() {
                    return Err(self.invalid("bounds must be finite"));
                }
                if min > max {
                    return Err(self.invalid(format!("min {min} is greater than max {max}")));
                }
                Ok(Domain::Double { min, max })
            }
            ParameterType::Int => {
                let min: i64 = self.bound("min", self.feasible.min.as_deref())?;
                let max: i64 = self.bound("max", self.feasible.max.as_deref())?;
                if min > max {
                    return Err(self.invalid(format!("min {min} is greater than max {max}")));
                }
                Ok(Domain::Int { min, max })
            }
            ParameterType::Categorical | ParameterType::Discrete => {
                if self.feasible.list.is_empty() {
                    return Err(self.invalid("value list is empty"));
                }
                Ok(Domain::Values(&self.feasible.list))
            }
        }
    }

    fn bound<T: std::str::FromStr>(&self, which: &str, raw: Option<&str>) -> Result<T, ConfigError> {
        let raw = raw.ok_or_else(|| self.invalid(format!("{which} is missing")))?;
        raw.trim()
            .parse()
            .map_err(|_| self.invalid(format!("{which} {raw:?} is not numeric")))
    }

    fn invalid(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::InvalidSearchSpace {
            parameter: self.name.clone(),
            message: message.into(),
        }
    }
}

/// Static description of an optimization study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub optimization_type: OptimizationType,
    /// Target objective value; reaching it ends the experiment early.
    #[serde(default)]
    pub optimization_goal: Option<f64>,
    pub objective_metric: String,
    #[serde(default)]
    pub additional_metrics: Vec<String>,
    pub parameters: Vec<ParameterConfig>,
    /// Suggestion algorithm id, e.g. "random" or "grid".
    pub suggestion_algorithm: String,
    /// Early-stopping algorithm id; empty disables early stopping.
    #[serde(default)]
    pub early_stopping_algorithm: String,
    pub parallel_trial_count: u32,
    pub max_trial_count: u32,
    /// More failed trials than this fails the whole experiment.
    #[serde(default)]
    pub max_failed_trial_count: Option<u32>,
}

impl StudyConfig {
    pub fn new(name: impl Into<String>, objective_metric: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: String::new(),
            optimization_type: OptimizationType::Maximize,
            optimization_goal: None,
            objective_metric: objective_metric.into(),
            additional_metrics: Vec::new(),
            parameters: Vec::new(),
            suggestion_algorithm: "random".to_string(),
            early_stopping_algorithm: String::new(),
            parallel_trial_count: 1,
            max_trial_count: 10,
            max_failed_trial_count: None,
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterConfig) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_optimization(mut self, optimization_type: OptimizationType, goal: Option<f64>) -> Self {
        self.optimization_type = optimization_type;
        self.optimization_goal = goal;
        self
    }

    pub fn with_additional_metrics<S: Into<String>>(mut self, metrics: Vec<S>) -> Self {
        self.additional_metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_algorithms(mut self, suggestion: &str, early_stopping: &str) -> Self {
        self.suggestion_algorithm = suggestion.to_string();
        self.early_stopping_algorithm = early_stopping.to_string();
        self
    }

    pub fn with_trial_limits(mut self, parallel: u32, max: u32) -> Self {
        self.parallel_trial_count = parallel;
        self.max_trial_count = max;
        self
    }

    pub fn with_max_failed_trials(mut self, n: u32) -> Self {
        self.max_failed_trial_count = Some(n);
        self
    }

    /// Objective followed by the additional metrics, without duplicates.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names = vec![self.objective_metric.clone()];
        for name in &self.additional_metrics {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterConfig> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn validate(&self) -> HyResult<()> {
        if self.name.trim().is_empty() {
            return Err(crate::config_error!("study name is empty"));
        }
        if self.objective_metric.trim().is_empty() {
            return Err(crate::config_error!("objective metric is empty"));
        }
        if self.optimization_type == OptimizationType::Unknown {
            return Err(crate::config_error!(
                "optimization type must be MAXIMIZE or MINIMIZE"
            ));
        }
        if self.parallel_trial_count == 0 {
            return Err(crate::config_error!("parallel trial count must be positive"));
        }
        if self.max_trial_count == 0 {
            return Err(crate::config_error!("max trial count must be positive"));
        }
        if self.parameters.is_empty() {
            return Err(crate::config_error!("search space has no parameters"));
        }

        let mut seen = HashSet::new();
        for parameter in &self.parameters {
            if !seen.insert(parameter.name.as_str()) {
                return Err(ConfigError::InvalidSearchSpace {
                    parameter: parameter.name.clone(),
                    message: "declared more than once".to_string(),
                }
                .into());
            }
            parameter.domain()?;
        }
        Ok(())
    }
}
