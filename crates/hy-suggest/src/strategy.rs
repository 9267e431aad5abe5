//! The strategy trait and the request handed to strategies.

use hy_types::{AlgorithmParameter, ConfigError, HyResult, ParameterAssignment, ParameterConfig, Trial};

/// One proposed trial: an assignment for every study parameter, in
/// declaration order.
pub type AssignmentSet = Vec<ParameterAssignment>;

/// Everything a strategy may look at when proposing new assignments.
#[derive(Debug, Clone, Copy)]
pub struct SuggestionRequest<'a> {
    pub study_id: &'a str,
    /// Key of the per-request state (grid cursor).
    pub param_id: &'a str,
    /// Number of sets wanted; `0` has strategy-specific meaning.
    pub request_count: i32,
    pub parameters: &'a [ParameterConfig],
    pub prior_trials: &'a [Trial],
    pub settings: &'a [AlgorithmParameter],
}

impl SuggestionRequest<'_> {
    pub fn count(&self) -> Result<usize, ConfigError> {
        usize::try_from(self.request_count).map_err(|_| ConfigError::NegativeRequestCount {
            count: self.request_count,
        })
    }
}

/// Common trait for all suggestion strategies.
pub trait Suggester: Send + Sync {
    /// Algorithm id the strategy is registered under.
    fn name(&self) -> &'static str;

    /// Propose new assignment sets.
    fn suggest(&self, request: &SuggestionRequest<'_>) -> HyResult<Vec<AssignmentSet>>;
}

/// Proposes nothing. Placeholder for strategies that live outside this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSuggester;

impl Suggester for NoopSuggester {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn suggest(&self, request: &SuggestionRequest<'_>) -> HyResult<Vec<AssignmentSet>> {
        request.count()?;
        Ok(Vec::new())
    }
}

/// Render a double without binary noise: 0.005 + 0.165 prints as 0.17.
pub(crate) fn format_double(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return value.to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let scale = 10f64.powi(12 - magnitude);
    let tidy = (value * scale).round() / scale;
    if tidy.is_finite() {
        tidy.to_string()
    } else {
        value.to_string()
    }
}

/// Point at fraction `t` of `[min, max]`. Weighting the bounds rather than
/// scaling `max - min` stays finite when the span itself overflows.
pub(crate) fn interpolate(min: f64, max: f64, t: f64) -> f64 {
    if t <= 0.0 {
        return min;
    }
    if t >= 1.0 {
        return max;
    }
    (min * (1.0 - t) + max * t).clamp(min, max)
}

/// [`format_double`], unless rounding moves the value outside `[min, max]`;
/// then the exact value is printed.
pub(crate) fn format_bounded(value: f64, min: f64, max: f64) -> String {
    let tidy = format_double(value);
    match tidy.parse::<f64>() {
        Ok(v) if (min..=max).contains(&v) => tidy,
        _ => value.to_string(),
    }
}
