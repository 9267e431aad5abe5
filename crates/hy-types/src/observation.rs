//! Metric observations reported by trials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::DataError;
use crate::trial::TrialId;

/// One reported metric value. The value stays as reported; numeric
/// interpretation happens at the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: Option<DateTime<Utc>>,
    pub value: String,
}

impl MetricPoint {
    pub fn new(timestamp: Option<DateTime<Utc>>, value: impl Into<String>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    pub fn numeric(&self) -> Option<f64> {
        self.value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    }

    pub fn try_numeric(&self, metric: &str) -> Result<f64, DataError> {
        self.numeric().ok_or_else(|| DataError::NonNumericValue {
            metric: metric.to_string(),
            value: self.value.clone(),
        })
    }
}

/// Metric name → reported values, in reporting order.
///
/// Append-only: reporting the same metric twice keeps both points.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Observation {
    pub metrics: BTreeMap<String, Vec<MetricPoint>>,
}

impl Observation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metric: impl Into<String>, point: MetricPoint) {
        self.metrics.entry(metric.into()).or_default().push(point);
    }

    /// Append every point of `other`, keeping its order after ours.
    pub fn extend(&mut self, other: Observation) {
        for (metric, points) in other.metrics {
            self.metrics.entry(metric).or_default().extend(points);
        }
    }

    pub fn series(&self, metric: &str) -> &[MetricPoint] {
        self.metrics.get(metric).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recently reported numeric value of `metric`.
    pub fn latest(&self, metric: &str) -> Option<f64> {
        self.series(metric).iter().rev().find_map(MetricPoint::numeric)
    }

    /// Keep only the named metrics; an empty filter keeps everything.
    pub fn filtered(&self, names: &[String]) -> Observation {
        if names.is_empty() {
            return self.clone();
        }
        Observation {
            metrics: self
                .metrics
                .iter()
                .filter(|(name, _)| names.contains(name))
                .map(|(name, points)| (name.clone(), points.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.metrics.values().map(Vec::len).sum()
    }
}

/// A trial's observation, as handed to the early-stopping engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialLog {
    pub trial_id: TrialId,
    pub observation: Observation,
}

impl TrialLog {
    pub fn new(trial_id: TrialId, observation: Observation) -> Self {
        Self {
            trial_id,
            observation,
        }
    }
}
