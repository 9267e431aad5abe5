//! Early-stopping recommendation records.

use hy_types::TrialId;
use serde::{Deserialize, Serialize};

/// A recommendation to stop one running trial, with the numbers behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDecision {
    pub trial_id: TrialId,
    pub eval_metric: String,
    /// Best value the trial has reported so far.
    pub best_value: f64,
    /// The trial's own running average over the compared range.
    pub running_average: f64,
    /// Median running average of the completed trials.
    pub baseline: f64,
}

impl StopDecision {
    pub fn summary(&self) -> String {
        format!(
            "{} best {} vs median {} (running average {})",
            self.eval_metric, self.best_value, self.baseline, self.running_average
        )
    }
}
