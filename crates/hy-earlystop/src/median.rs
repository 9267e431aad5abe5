//! Median stopping rule.
//!
//! A running trial is stopped when the best value it has reported so far is
//! worse than the median of the completed trials' running averages over the
//! same step range, give or take `margin`.

use hy_types::{
    EarlyStoppingParam, MetricPoint, OptimizationType, StudyConfig, TrialLog,
};
use rayon::prelude::*;
use tracing::{debug, error};

use crate::decision::StopDecision;
use crate::service::EarlyStopper;

#[derive(Debug, Clone, Copy, Default)]
pub struct MedianStopping;

impl EarlyStopper for MedianStopping {
    fn name(&self) -> &'static str {
        "medianstopping"
    }

    fn evaluate(
        &self,
        study: &StudyConfig,
        param: &EarlyStoppingParam,
        completed: &[TrialLog],
        running: &[TrialLog],
    ) -> Vec<StopDecision> {
        median_stopping(study, param, completed, running)
    }
}

/// Best numeric value of `series` for the direction; `None` when it has none.
fn best_value(direction: OptimizationType, series: &[MetricPoint]) -> Option<f64> {
    let values = series.iter().filter_map(MetricPoint::numeric);
    match direction {
        OptimizationType::Maximize => values.reduce(f64::max),
        OptimizationType::Minimize => values.reduce(f64::min),
        OptimizationType::Unknown => None,
    }
}

/// Mean of the numeric values at indices `[burn_in, min(end, len))`.
/// Non-numeric values count in neither the sum nor the divisor.
fn running_average(series: &[MetricPoint], burn_in: usize, end: usize) -> Option<f64> {
    let end = end.min(series.len());
    if burn_in >= end {
        return None;
    }
    let (sum, n) = series[burn_in..end]
        .iter()
        .filter_map(MetricPoint::numeric)
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Element at index `len / 2` of the sorted values. Even-length inputs are
/// not averaged.
fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    Some(values[values.len() / 2])
}

/// Evaluate every running trial against the completed ones.
pub fn median_stopping(
    study: &StudyConfig,
    param: &EarlyStoppingParam,
    completed: &[TrialLog],
    running: &[TrialLog],
) -> Vec<StopDecision> {
    let direction = study.optimization_type;
    if direction == OptimizationType::Unknown {
        error!(
            study = %study.name,
            "optimization type unknown; skipping early stopping"
        );
        return Vec::new();
    }
    let metric = param.eval_metric(study);

    let baseline: Vec<&[MetricPoint]> = completed
        .iter()
        .filter_map(|log| {
            let series = log.observation.series(metric);
            if best_value(direction, series).is_none() {
                error!(
                    study = %study.name,
                    trial = %log.trial_id,
                    metric,
                    "completed trial has no usable values; excluded from baseline"
                );
                return None;
            }
            Some(series)
        })
        .collect();

    if baseline.is_empty() {
        debug!(study = %study.name, "no completed trials to compare against");
        return Vec::new();
    }

    running
        .par_iter()
        .filter_map(|log| evaluate_running(direction, param, metric, &baseline, log))
        .collect()
}

fn evaluate_running(
    direction: OptimizationType,
    param: &EarlyStoppingParam,
    metric: &str,
    completed: &[&[MetricPoint]],
    log: &TrialLog,
) -> Option<StopDecision> {
    let series = log.observation.series(metric);
    let step = series.len();
    if step < param.least_step || step <= param.burn_in {
        return None;
    }

    let own_average = running_average(series, param.burn_in, step)?;
    let best = best_value(direction, series)?;
    let baseline = median(
        completed
            .iter()
            .filter_map(|other| running_average(other, param.burn_in, step))
            .collect(),
    )?;

    let stop = match direction {
        OptimizationType::Maximize => best < baseline - param.margin,
        OptimizationType::Minimize => best > baseline + param.margin,
        OptimizationType::Unknown => false,
    };

    debug!(
        trial = %log.trial_id,
        step,
        best,
        running_average = own_average,
        baseline,
        stop,
        "median stopping evaluated"
    );

    stop.then(|| StopDecision {
        trial_id: log.trial_id,
        eval_metric: metric.to_string(),
        best_value: best,
        running_average: own_average,
        baseline,
    })
}
