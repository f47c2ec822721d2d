//! Configuration - Batch-Normalization Settings
//!
//! @version 0.1.0

use serde::{Deserialize, Serialize};

/// Settings shared by the batch-normalization operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchNormConfig {
    /// Validate shapes, devices and dtypes of every argument. Only honored
    /// in builds with debug assertions.
    pub debug_checks: bool,
    /// Epsilon used when a routine is not given one.
    pub default_eps: f64,
    /// Running-average decay used when a routine is not given one.
    pub default_decay: f64,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            debug_checks: cfg!(debug_assertions),
            default_eps: 2e-5,
            default_decay: 0.9,
        }
    }
}

impl BatchNormConfig {
    /// Sets whether arguments are validated.
    #[must_use]
    pub fn with_debug_checks(mut self, enabled: bool) -> Self {
        self.debug_checks = enabled;
        self
    }

    /// Sets the default epsilon.
    #[must_use]
    pub fn with_default_eps(mut self, eps: f64) -> Self {
        self.default_eps = eps;
        self
    }

    /// Sets the default decay.
    #[must_use]
    pub fn with_default_decay(mut self, decay: f64) -> Self {
        self.default_decay = decay;
        self
    }

    /// Returns true if argument validation runs in this build.
    #[must_use]
    pub fn checks_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug_checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BatchNormConfig::default();
        assert_eq!(config.default_eps, 2e-5);
        assert_eq!(config.default_decay, 0.9);
        assert_eq!(config.debug_checks, cfg!(debug_assertions));
    }

    #[test]
    fn test_partial_json() {
        let config: BatchNormConfig = serde_json::from_str(r#"{"default_decay": 0.99}"#).unwrap();
        assert_eq!(config.default_decay, 0.99);
        assert_eq!(config.default_eps, 2e-5);

        let round: BatchNormConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(round, config);
    }

    #[test]
    fn test_builders() {
        let config = BatchNormConfig::default()
            .with_debug_checks(false)
            .with_default_eps(1e-3);
        assert!(!config.checks_enabled());
        assert_eq!(config.default_eps, 1e-3);
    }
}
