//! TOML configuration for the coordination engine.

use std::path::Path;
use std::time::Duration;

use quay_placement::{AffinityPolicy, ErrorLimiterConfig};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Per-phase timeout tuning.
    pub timeouts: TimeoutsSection,
    /// Node failure suppression.
    pub error_limiter: ErrorLimiterSection,
    /// Write affinity.
    pub affinity: AffinitySection,
    /// Fan-out and transfer tuning.
    pub tuning: TuningSection,
}

/// `[timeouts]` section. All values in milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    /// TCP-level connect bound.
    pub connect_ms: Option<u64>,
    /// Interim/final status wait per node.
    pub node_ms: Option<u64>,
    /// Per-chunk read on an in-progress response stream.
    pub recoverable_node_ms: Option<u64>,
    /// Grace period for commit stragglers once quorum is reached.
    pub post_quorum_ms: Option<u64>,
}

/// `[error_limiter]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ErrorLimiterSection {
    /// Errors tolerated before a node is suppressed.
    pub suppression_limit: Option<u32>,
    /// Seconds a suppressed node stays out of rotation.
    pub suppression_interval_secs: Option<u64>,
}

/// `[affinity]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AffinitySection {
    /// Region whose nodes are preferred for writes. Unset disables affinity.
    pub write_affinity_region: Option<u32>,
    /// How many local nodes to promote. Defaults to the replica count.
    pub write_affinity_node_count: Option<usize>,
}

/// `[tuning]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TuningSection {
    /// Candidate cap as a multiple of the replica count.
    pub handoff_multiplier: Option<usize>,
    /// Client-body read size for PUT.
    pub client_chunk_size: Option<usize>,
}

impl ProxyConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective connect timeout (default 500 ms).
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms.unwrap_or(500))
    }

    /// Effective node timeout (default 3 s).
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.node_ms.unwrap_or(3_000))
    }

    /// Effective per-chunk read timeout (defaults to the node timeout).
    pub fn recoverable_node_timeout(&self) -> Duration {
        self.timeouts
            .recoverable_node_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.node_timeout())
    }

    /// Effective post-quorum straggler grace (default 500 ms).
    pub fn post_quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.post_quorum_ms.unwrap_or(500))
    }

    /// Effective error-limiter tuning.
    pub fn error_limiter(&self) -> ErrorLimiterConfig {
        let defaults = ErrorLimiterConfig::default();
        ErrorLimiterConfig {
            suppression_limit: self
                .error_limiter
                .suppression_limit
                .unwrap_or(defaults.suppression_limit),
            suppression_interval: self
                .error_limiter
                .suppression_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.suppression_interval),
        }
    }

    /// Write-affinity policy, when a region is configured.
    pub fn write_affinity(&self, replica_count: usize) -> Option<AffinityPolicy> {
        let region = self.affinity.write_affinity_region?;
        let count = self
            .affinity
            .write_affinity_node_count
            .unwrap_or(replica_count);
        Some(AffinityPolicy::for_region(region, count))
    }

    /// Effective candidate-cap multiplier (default 2x replicas).
    pub fn handoff_multiplier(&self) -> usize {
        self.tuning.handoff_multiplier.unwrap_or(2).max(1)
    }

    /// Effective client-body chunk size (default 64 KB).
    pub fn client_chunk_size(&self) -> usize {
        self.tuning.client_chunk_size.unwrap_or(65_536).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[timeouts]
connect_ms = 250
node_ms = 2000
recoverable_node_ms = 1000
post_quorum_ms = 100

[error_limiter]
suppression_limit = 5
suppression_interval_secs = 120

[affinity]
write_affinity_region = 2
write_affinity_node_count = 3

[tuning]
handoff_multiplier = 3
client_chunk_size = 8192
"#;
        let config = ProxyConfig::from_toml(toml).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(250));
        assert_eq!(config.node_timeout(), Duration::from_millis(2_000));
        assert_eq!(
            config.recoverable_node_timeout(),
            Duration::from_millis(1_000)
        );
        assert_eq!(config.post_quorum_timeout(), Duration::from_millis(100));
        assert_eq!(config.error_limiter().suppression_limit, 5);
        assert_eq!(
            config.error_limiter().suppression_interval,
            Duration::from_secs(120)
        );
        assert!(config.write_affinity(3).is_some());
        assert_eq!(config.handoff_multiplier(), 3);
        assert_eq!(config.client_chunk_size(), 8_192);
    }

    #[test]
    fn test_empty_config_gets_defaults() {
        let config = ProxyConfig::from_toml("").unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(500));
        assert_eq!(config.node_timeout(), Duration::from_secs(3));
        assert_eq!(config.recoverable_node_timeout(), config.node_timeout());
        assert_eq!(config.error_limiter().suppression_limit, 10);
        assert!(config.write_affinity(3).is_none(), "affinity off by default");
        assert_eq!(config.handoff_multiplier(), 2);
        assert_eq!(config.client_chunk_size(), 65_536);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
[timeouts]
node_ms = 10000
"#;
        let config = ProxyConfig::from_toml(toml).unwrap();
        assert_eq!(config.node_timeout(), Duration::from_secs(10));
        // Recoverable follows the node timeout when unset.
        assert_eq!(config.recoverable_node_timeout(), Duration::from_secs(10));
        assert_eq!(config.connect_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_affinity_count_defaults_to_replicas() {
        let toml = r#"
[affinity]
write_affinity_region = 1
"#;
        let config = ProxyConfig::from_toml(toml).unwrap();
        let policy = config.write_affinity(3).unwrap();
        assert_eq!(policy.desired_local_count, 3);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quay.toml");
        std::fs::write(
            &path,
            r#"
[timeouts]
connect_ms = 100
"#,
        )
        .unwrap();
        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(100));
    }
}
