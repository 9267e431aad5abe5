//! Controller runtime configuration.

use hy_types::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Tuning knobs for the reconcile loop and its work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Requeue delay for experiments that are still running.
    pub poll_interval_ms: u64,
    /// Upper bound on a single reconcile pass.
    pub reconcile_timeout_ms: u64,
    /// Experiments reconciled at the same time.
    pub max_concurrent_reconciles: usize,
    /// First retry delay after a failed pass; doubles per consecutive failure.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Period of the full resync of non-terminal experiments.
    pub resync_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            reconcile_timeout_ms: 30_000,
            max_concurrent_reconciles: 4,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            resync_interval_ms: 30_000,
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `HALYARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        read(&lookup, "HALYARD_POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        read(&lookup, "HALYARD_RECONCILE_TIMEOUT_MS", &mut config.reconcile_timeout_ms)?;
        read(
            &lookup,
            "HALYARD_MAX_CONCURRENT_RECONCILES",
            &mut config.max_concurrent_reconciles,
        )?;
        read(&lookup, "HALYARD_BACKOFF_BASE_MS", &mut config.backoff_base_ms)?;
        read(&lookup, "HALYARD_BACKOFF_MAX_MS", &mut config.backoff_max_ms)?;
        read(&lookup, "HALYARD_RESYNC_INTERVAL_MS", &mut config.resync_interval_ms)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_concurrent_reconciles(mut self, n: usize) -> Self {
        self.max_concurrent_reconciles = n;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_reconciles == 0 {
            return Err(invalid(
                "max_concurrent_reconciles",
                "0",
                "at least one reconcile must be allowed",
            ));
        }
        if self.reconcile_timeout_ms == 0 {
            return Err(invalid("reconcile_timeout_ms", "0", "timeout must be positive"));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(invalid(
                "backoff_max_ms",
                &self.backoff_max_ms.to_string(),
                "must not be below backoff_base_ms",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    /// Delay before retry number `failures` (1-based): base × 2^(failures-1),
    /// capped at `backoff_max_ms`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

fn read<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| invalid(name, &raw, "not a non-negative integer"))?;
    }
    Ok(())
}

fn invalid(name: &str, value: &str, message: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        name: name.to_string(),
        value: value.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("HALYARD_POLL_INTERVAL_MS", "250"),
            ("HALYARD_MAX_CONCURRENT_RECONCILES", " 8 "),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.max_concurrent_reconciles, 8);
        assert_eq!(config.backoff_base_ms, ControllerConfig::default().backoff_base_ms);
    }

    #[test]
    fn malformed_environment_rejected() {
        let err = ControllerConfig::from_lookup(lookup(&[("HALYARD_BACKOFF_BASE_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { .. }));

        let err = ControllerConfig::from_lookup(lookup(&[(
            "HALYARD_MAX_CONCURRENT_RECONCILES",
            "0",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { .. }));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ControllerConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(5), Duration::from_millis(1_000));
        assert_eq!(config.backoff(60), Duration::from_millis(1_000));
    }
}
