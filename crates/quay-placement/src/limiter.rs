//! Per-node failure accounting with time-boxed suppression.
//!
//! Every backend failure increments the failing node's counter; once the
//! counter exceeds the limit the node is suppressed (skipped by
//! [`NodeIter`](crate::NodeIter)) until the suppression window elapses.
//! Explicit, instance-scoped state — never a process global.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use quay_types::{Node, NodeKey};
use tracing::{info, warn};

/// Failure classification fed to [`ErrorLimiter::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// TCP connect failed or timed out.
    Connect,
    /// No interim status before the node timeout.
    Expect,
    /// Send/receive failed mid-transfer.
    Transfer,
    /// No final status before the node timeout.
    FinalStatus,
    /// Backend answered a formal error status.
    Status,
    /// Backend reported its storage device unreachable. One-shot full
    /// suppression: the node is pulled from rotation immediately.
    DeviceUnavailable,
}

/// Tuning for the limiter.
#[derive(Debug, Clone, Copy)]
pub struct ErrorLimiterConfig {
    /// Errors tolerated before a node is suppressed.
    pub suppression_limit: u32,
    /// How long a suppressed node stays out of rotation.
    pub suppression_interval: Duration,
}

impl Default for ErrorLimiterConfig {
    fn default() -> Self {
        Self {
            suppression_limit: 10,
            suppression_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct ErrorRecord {
    count: u32,
    last_error: Instant,
}

/// Per-node failure counters.
///
/// Counters are keyed by `(ip, port, device)` and updated under a single
/// short-lived lock; there is no cross-node coordination. A counter resets
/// only once its suppression window has elapsed.
pub struct ErrorLimiter {
    config: ErrorLimiterConfig,
    records: Mutex<HashMap<NodeKey, ErrorRecord>>,
}

impl ErrorLimiter {
    /// Create a limiter with the given tuning.
    pub fn new(config: ErrorLimiterConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure against a node.
    ///
    /// [`ErrorKind::DeviceUnavailable`] jumps the counter straight past the
    /// limit; every other kind increments by one.
    pub fn record(&self, node: &Node, kind: ErrorKind) {
        let mut records = self.records.lock().expect("limiter lock poisoned");
        let record = records.entry(node.key()).or_insert(ErrorRecord {
            count: 0,
            last_error: Instant::now(),
        });

        if kind == ErrorKind::DeviceUnavailable {
            record.count = self.config.suppression_limit + 1;
        } else {
            record.count += 1;
        }
        record.last_error = Instant::now();

        if record.count > self.config.suppression_limit {
            warn!(node = %node, ?kind, count = record.count, "node suppressed");
        }
    }

    /// Whether a node is currently suppressed.
    ///
    /// An expired suppression window clears the record entirely.
    pub fn is_suppressed(&self, node: &Node) -> bool {
        let mut records = self.records.lock().expect("limiter lock poisoned");
        let key = node.key();
        match records.get(&key) {
            Some(record) if record.count > self.config.suppression_limit => {
                if record.last_error.elapsed() >= self.config.suppression_interval {
                    records.remove(&key);
                    info!(node = %node, "suppression window elapsed, node restored");
                    false
                } else {
                    true
                }
            }
            _ => false,
        }
    }

    /// Current error count for a node (0 if untracked).
    pub fn error_count(&self, node: &Node) -> u32 {
        let records = self.records.lock().expect("limiter lock poisoned");
        records.get(&node.key()).map(|r| r.count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: usize) -> Node {
        Node {
            ip: format!("10.0.0.{i}"),
            port: 6200,
            device: "sda1".to_string(),
            region: 1,
            zone: 1,
            index: i,
        }
    }

    fn limiter(limit: u32, interval: Duration) -> ErrorLimiter {
        ErrorLimiter::new(ErrorLimiterConfig {
            suppression_limit: limit,
            suppression_interval: interval,
        })
    }

    #[test]
    fn test_below_limit_not_suppressed() {
        let limiter = limiter(3, Duration::from_secs(60));
        let n = node(1);
        for _ in 0..3 {
            limiter.record(&n, ErrorKind::Connect);
        }
        assert!(!limiter.is_suppressed(&n));
        assert_eq!(limiter.error_count(&n), 3);
    }

    #[test]
    fn test_over_limit_suppressed() {
        let limiter = limiter(3, Duration::from_secs(60));
        let n = node(1);
        for _ in 0..4 {
            limiter.record(&n, ErrorKind::Transfer);
        }
        assert!(limiter.is_suppressed(&n));
    }

    #[test]
    fn test_device_unavailable_is_one_shot() {
        let limiter = limiter(10, Duration::from_secs(60));
        let n = node(1);
        limiter.record(&n, ErrorKind::DeviceUnavailable);
        assert!(limiter.is_suppressed(&n), "single device error must suppress");
        assert_eq!(limiter.error_count(&n), 11);
    }

    #[test]
    fn test_counters_are_per_node() {
        let limiter = limiter(1, Duration::from_secs(60));
        let a = node(1);
        let b = node(2);
        limiter.record(&a, ErrorKind::Connect);
        limiter.record(&a, ErrorKind::Connect);
        assert!(limiter.is_suppressed(&a));
        assert!(!limiter.is_suppressed(&b));
    }

    #[test]
    fn test_suppression_window_elapses_and_resets() {
        let limiter = limiter(0, Duration::from_millis(10));
        let n = node(1);
        limiter.record(&n, ErrorKind::Connect);
        assert!(limiter.is_suppressed(&n));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!limiter.is_suppressed(&n));
        // The record was cleared, not merely unsuppressed.
        assert_eq!(limiter.error_count(&n), 0);
    }

    #[test]
    fn test_count_persists_while_window_open() {
        let limiter = limiter(5, Duration::from_secs(60));
        let n = node(1);
        limiter.record(&n, ErrorKind::Connect);
        assert!(!limiter.is_suppressed(&n));
        assert_eq!(limiter.error_count(&n), 1, "count must not reset early");
    }
}
