//! Exhaustive grid search with progressive, exactly-once issuance.

use hy_types::{
    AlgorithmParameter, ConfigError, Domain, HyResult, ParameterAssignment, ParameterConfig,
};
use std::sync::Arc;
use tracing::info;

use crate::cursor::CursorStore;
use crate::strategy::{
    format_bounded, interpolate, AssignmentSet, Suggester, SuggestionRequest,
};

/// Resolution applied to every numeric parameter without an override.
const DEFAULT_GRID: &str = "DefaultGrid";

/// Grid search over the Cartesian product of per-parameter point lists.
///
/// Points are addressed row-major in parameter declaration order (the last
/// parameter varies fastest). Which points have been handed out is tracked
/// per param id in the [`CursorStore`].
pub struct GridSuggester {
    cursors: Arc<dyn CursorStore>,
}

impl GridSuggester {
    pub fn new(cursors: Arc<dyn CursorStore>) -> Self {
        Self { cursors }
    }

    /// Point list of every parameter, in declaration order.
    pub fn axes(
        parameters: &[ParameterConfig],
        settings: &[AlgorithmParameter],
    ) -> Result<Vec<Vec<String>>, ConfigError> {
        parameters
            .iter()
            .map(|param| {
                let axis = match param.domain()? {
                    Domain::Double { min, max } => {
                        double_points(min, max, resolution(param, settings)?)
                    }
                    Domain::Int { min, max } => int_points(min, max, resolution(param, settings)?),
                    Domain::Values(values) => values.to_vec(),
                };
                Ok::<_, ConfigError>(axis)
            })
            .collect()
    }

    /// Number of points in the full grid.
    pub fn grid_size(axes: &[Vec<String>]) -> Result<usize, ConfigError> {
        axes.iter().try_fold(1usize, |total, axis| {
            total
                .checked_mul(axis.len())
                .ok_or_else(|| ConfigError::InvalidAlgorithmParameter {
                    name: DEFAULT_GRID.to_string(),
                    value: axis.len().to_string(),
                    message: "grid is too large to enumerate".to_string(),
                })
        })
    }

    /// The assignment set at row-major `index`.
    fn point(parameters: &[ParameterConfig], axes: &[Vec<String>], index: usize) -> AssignmentSet {
        let mut remainder = index;
        let mut values = vec![String::new(); axes.len()];
        for (slot, axis) in values.iter_mut().zip(axes).rev() {
            *slot = axis[remainder % axis.len()].clone();
            remainder /= axis.len();
        }
        parameters
            .iter()
            .zip(values)
            .map(|(param, value)| ParameterAssignment::new(param.name.clone(), value))
            .collect()
    }
}

/// Per-parameter override, else `DefaultGrid`.
fn resolution(param: &ParameterConfig, settings: &[AlgorithmParameter]) -> Result<usize, ConfigError> {
    let (name, raw) = match AlgorithmParameter::find(settings, &param.name) {
        Some(raw) => (param.name.as_str(), raw),
        None => match AlgorithmParameter::find(settings, DEFAULT_GRID) {
            Some(raw) => (DEFAULT_GRID, raw),
            None => {
                return Err(ConfigError::InvalidAlgorithmParameter {
                    name: DEFAULT_GRID.to_string(),
                    value: String::new(),
                    message: format!("no grid resolution for parameter {}", param.name),
                })
            }
        },
    };
    match raw.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(ConfigError::InvalidAlgorithmParameter {
            name: name.to_string(),
            value: raw.to_string(),
            message: "grid resolution must be a positive integer".to_string(),
        }),
    }
}

fn double_points(min: f64, max: f64, resolution: usize) -> Vec<String> {
    if resolution == 1 {
        return vec![format_bounded(min, min, max)];
    }
    let last = (resolution - 1) as f64;
    (0..resolution)
        .map(|i| format_bounded(interpolate(min, max, i as f64 / last), min, max))
        .collect()
}

/// Evenly spaced integers. The resolution is capped at the number of
/// integers in range so every point is distinct.
fn int_points(min: i64, max: i64, resolution: usize) -> Vec<String> {
    let span = max as i128 - min as i128;
    let resolution = (resolution as i128).min(span + 1);
    if resolution == 1 {
        return vec![min.to_string()];
    }
    (0..resolution)
        .map(|i| (min as i128 + span * i / (resolution - 1)).to_string())
        .collect()
}

impl Suggester for GridSuggester {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn suggest(&self, request: &SuggestionRequest<'_>) -> HyResult<Vec<AssignmentSet>> {
        let count = request.count()?;
        let axes = Self::axes(request.parameters, request.settings)?;
        let total = Self::grid_size(&axes)?;

        let wanted = if count == 0 { None } else { Some(count) };
        let claimed = self.cursors.claim(request.param_id, total, wanted);

        info!(
            study = request.study_id,
            param_id = request.param_id,
            from = claimed.start,
            to = claimed.end,
            total,
            "grid points issued"
        );

        Ok(claimed
            .map(|index| Self::point(request.parameters, &axes, index))
            .collect())
    }
}
