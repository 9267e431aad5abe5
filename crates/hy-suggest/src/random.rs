//! Independent random sampling across the search space.

use hy_types::{
    AlgorithmParameter, ConfigError, Domain, HyResult, ParameterAssignment, ParameterConfig,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::strategy::{
    format_double, interpolate, AssignmentSet, Suggester, SuggestionRequest,
};

/// Algorithm parameter that makes sampling reproducible.
const RANDOM_STATE: &str = "random_state";

/// Uniform sampling; draws are independent across parameters and sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSuggester;

impl RandomSuggester {
    /// Seeded from `random_state` when given, offset by the number of prior
    /// trials so successive calls continue rather than repeat the stream.
    fn rng(request: &SuggestionRequest<'_>) -> Result<ChaCha8Rng, ConfigError> {
        match AlgorithmParameter::find(request.settings, RANDOM_STATE) {
            Some(raw) => {
                let seed: u64 =
                    raw.trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidAlgorithmParameter {
                            name: RANDOM_STATE.to_string(),
                            value: raw.to_string(),
                            message: "expected an unsigned integer".to_string(),
                        })?;
                Ok(ChaCha8Rng::seed_from_u64(
                    seed.wrapping_add(request.prior_trials.len() as u64),
                ))
            }
            None => Ok(ChaCha8Rng::from_rng(&mut rand::rng())),
        }
    }

    fn sample_one(
        domains: &[(&ParameterConfig, Domain<'_>)],
        rng: &mut impl Rng,
    ) -> AssignmentSet {
        domains
            .iter()
            .map(|(param, domain)| {
                let value = match domain {
                    Domain::Double { min, max } => format_sample(sample_double(*min, *max, rng)),
                    Domain::Int { min, max } => rng.random_range(*min..=*max).to_string(),
                    Domain::Values(values) => values[rng.random_range(0..values.len())].clone(),
                };
                ParameterAssignment::new(param.name.clone(), value)
            })
            .collect()
    }
}

/// Uniform in `[min, max]`. A span too wide for `f64` is sampled by
/// interpolating between the bounds instead.
fn sample_double(min: f64, max: f64, rng: &mut impl Rng) -> f64 {
    if (max - min).is_finite() {
        rng.random_range(min..=max)
    } else {
        interpolate(min, max, rng.random::<f64>())
    }
}

/// Random doubles keep full precision so they never round past a bound.
fn format_sample(value: f64) -> String {
    let tidy = format_double(value);
    match tidy.parse::<f64>() {
        Ok(v) if v == value => tidy,
        _ => value.to_string(),
    }
}

impl Suggester for RandomSuggester {
    fn name(&self) -> &'static str {
        "random"
    }

    fn suggest(&self, request: &SuggestionRequest<'_>) -> HyResult<Vec<AssignmentSet>> {
        let count = request.count()?;
        let domains = request
            .parameters
            .iter()
            .map(|p| p.domain().map(|d| (p, d)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut rng = Self::rng(request)?;
        let sets: Vec<AssignmentSet> = (0..count)
            .map(|_| Self::sample_one(&domains, &mut rng))
            .collect();

        debug!(
            study = request.study_id,
            requested = count,
            "random suggestions generated"
        );
        Ok(sets)
    }
}
