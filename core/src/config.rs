use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Engine tuning configuration.
///
/// All knobs have conservative defaults; a host can load overrides from a
/// TOML file or construct the struct directly.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// How far back the temporal detector looks for correlated events.
    #[serde(default = "default_correlation_window_ms")]
    pub correlation_window_ms: i64,

    /// Minimum confidence for a temporal edge to be recorded, and the
    /// default edge-following threshold for chain traversal.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Scores above this publish `anomaly:detected`.
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,

    /// Depth bound for chain traversal.
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,

    /// Nodes older than `newest_timestamp - retention_window_ms` are
    /// eligible for eviction.
    #[serde(default = "default_retention_window_ms")]
    pub retention_window_ms: i64,

    /// Graph size that triggers opportunistic eviction during ingest.
    #[serde(default = "default_node_high_water")]
    pub node_high_water: usize,

    /// LRU bound on materialized chains kept for pattern extraction.
    #[serde(default = "default_active_chains_cap")]
    pub active_chains_cap: usize,

    /// Soft cap on stored patterns; least-recently-seen are dropped.
    #[serde(default = "default_pattern_cap")]
    pub pattern_cap: usize,

    /// TTL for cached query results.
    #[serde(default = "default_query_cache_ttl_ms")]
    pub query_cache_ttl_ms: i64,

    /// LRU bound on cached query results.
    #[serde(default = "default_query_cache_cap")]
    pub query_cache_cap: usize,

    /// Default query deadline, overridable per call.
    #[serde(default = "default_query_timeout_ms")]
    pub query_default_timeout_ms: u64,

    /// Expected inter-arrival time per (service, event type) when no
    /// override has been registered.
    #[serde(default = "default_expected_interval_ms")]
    pub expected_interval_ms: i64,

    /// Expected number of incoming causes per node, for the causality-shape
    /// anomaly component.
    #[serde(default = "default_expected_causes")]
    pub expected_causes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            correlation_window_ms: default_correlation_window_ms(),
            confidence_threshold: default_confidence_threshold(),
            anomaly_threshold: default_anomaly_threshold(),
            max_chain_depth: default_max_chain_depth(),
            retention_window_ms: default_retention_window_ms(),
            node_high_water: default_node_high_water(),
            active_chains_cap: default_active_chains_cap(),
            pattern_cap: default_pattern_cap(),
            query_cache_ttl_ms: default_query_cache_ttl_ms(),
            query_cache_cap: default_query_cache_cap(),
            query_default_timeout_ms: default_query_timeout_ms(),
            expected_interval_ms: default_expected_interval_ms(),
            expected_causes: default_expected_causes(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: EngineConfig =
            toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file is missing or malformed.
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to load config from {:?}: {}. Using defaults.",
                    path.as_ref(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Validate the configuration for obvious misconfiguration.
    pub fn validate(&self) -> Result<()> {
        if self.correlation_window_ms <= 0 {
            anyhow::bail!("correlation_window_ms must be positive");
        }

        if !(self.confidence_threshold > 0.0 && self.confidence_threshold <= 1.0) {
            anyhow::bail!("confidence_threshold must be in (0, 1]");
        }

        if !(self.anomaly_threshold > 0.0 && self.anomaly_threshold <= 1.0) {
            anyhow::bail!("anomaly_threshold must be in (0, 1]");
        }

        if self.max_chain_depth == 0 {
            anyhow::bail!("max_chain_depth must be greater than 0");
        }

        if self.retention_window_ms <= 0 {
            anyhow::bail!("retention_window_ms must be positive");
        }

        if self.active_chains_cap == 0 || self.pattern_cap == 0 || self.query_cache_cap == 0 {
            anyhow::bail!("LRU caps must be greater than 0");
        }

        if self.query_cache_ttl_ms <= 0 {
            anyhow::bail!("query_cache_ttl_ms must be positive");
        }

        if self.expected_interval_ms <= 0 {
            anyhow::bail!("expected_interval_ms must be positive");
        }

        if self.expected_causes == 0 {
            anyhow::bail!("expected_causes must be greater than 0");
        }

        Ok(())
    }
}

impl FromStr for EngineConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(s).context("Failed to parse config")?;
        Ok(config)
    }
}

// Default providers ---------------------------------------------------------

fn default_correlation_window_ms() -> i64 {
    5_000
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_anomaly_threshold() -> f64 {
    0.9
}

fn default_max_chain_depth() -> usize {
    100
}

fn default_retention_window_ms() -> i64 {
    3_600_000
}

fn default_node_high_water() -> usize {
    100_000
}

fn default_active_chains_cap() -> usize {
    1_024
}

fn default_pattern_cap() -> usize {
    10_000
}

fn default_query_cache_ttl_ms() -> i64 {
    60_000
}

fn default_query_cache_cap() -> usize {
    4_096
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_expected_interval_ms() -> i64 {
    1_000
}

fn default_expected_causes() -> usize {
    1
}

// Tests ---------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.correlation_window_ms, 5_000);
        assert_eq!(config.confidence_threshold, 0.7);
        assert_eq!(config.anomaly_threshold, 0.9);
        assert_eq!(config.max_chain_depth, 100);
        assert_eq!(config.retention_window_ms, 3_600_000);
        assert_eq!(config.query_cache_cap, 4_096);
    }

    #[test]
    fn test_validate_valid_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = EngineConfig::default();
        config.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        config.confidence_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let mut config = EngineConfig::default();
        config.pattern_cap = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            correlation_window_ms = 2500
            confidence_threshold = 0.5
            node_high_water = 500
        "#;

        let config = EngineConfig::from_str(toml_str).unwrap();
        assert_eq!(config.correlation_window_ms, 2_500);
        assert_eq!(config.confidence_threshold, 0.5);
        assert_eq!(config.node_high_water, 500);
        // Unspecified knobs keep their defaults.
        assert_eq!(config.pattern_cap, 10_000);
    }
}
