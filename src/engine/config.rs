use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerResult, ValidationError};
use crate::gates::GateMonitorConfig;
use crate::subscription::RegistryConfig;

/// Broker configuration.
///
/// Every field has a default, so a partial JSON document is enough.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Deadline for pass-through queries.
    pub query_timeout_ms: u64,
    /// Deadline for update execution.
    pub update_timeout_ms: u64,
    pub registry: RegistryConfig,
    pub gates: GateMonitorConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 5_000,
            update_timeout_ms: 5_000,
            registry: RegistryConfig::default(),
            gates: GateMonitorConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> BrokerResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects zero timeouts and capacities.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let checks = [
            ("query_timeout_ms", self.query_timeout_ms),
            ("update_timeout_ms", self.update_timeout_ms),
            ("registry.default_check_timeout_ms", self.registry.default_check_timeout_ms),
            ("registry.stream_capacity", self.registry.stream_capacity as u64),
            ("gates.ping_interval_ms", self.gates.ping_interval_ms),
            ("gates.ping_timeout_ms", self.gates.ping_timeout_ms),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{field} must be greater than zero"),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub(crate) fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_takes_defaults() {
        let cfg = BrokerConfig::from_json_str(r#"{"query_timeout_ms": 250, "gates": {"ping_interval_ms": 100}}"#).unwrap();
        assert_eq!(cfg.query_timeout_ms, 250);
        assert_eq!(cfg.update_timeout_ms, 5_000);
        assert_eq!(cfg.gates.ping_interval_ms, 100);
        assert_eq!(cfg.gates.ping_timeout_ms, 1_000);
        assert_eq!(cfg.registry, RegistryConfig::default());
    }

    #[test]
    fn empty_object_is_default() {
        assert_eq!(BrokerConfig::from_json_str("{}").unwrap(), BrokerConfig::default());
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = BrokerConfig::from_json_str(r#"{"registry": {"stream_capacity": 0}}"#).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("registry.stream_capacity"));
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let err = BrokerConfig::from_json_str("{ not json").unwrap_err();
        assert!(err.is_validation());
    }
}
