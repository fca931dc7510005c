//! Shared types for the Quay request-coordination layer.
//!
//! This crate defines the types every other Quay crate speaks in:
//! backend node descriptions ([`Node`], [`NodeKey`]), object timestamps
//! ([`Timestamp`]), backend status codes ([`Status`]), storage policies
//! ([`StoragePolicy`]) with their quorum arithmetic, and the backend
//! wire-header names ([`headers`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod headers;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A backend storage node as described by the placement ring.
///
/// Owned by the ring collaborator; Quay components hold clones but never
/// mutate one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// IP address or hostname.
    pub ip: String,
    /// Backend port.
    pub port: u16,
    /// Storage device name on the node (e.g. `"sda1"`).
    pub device: String,
    /// Geographic region, used by write-affinity predicates.
    pub region: u32,
    /// Zone within the region.
    pub zone: u32,
    /// Position in the ring's node table.
    pub index: usize,
}

impl Node {
    /// Stable per-device key used for error limiting and logging.
    pub fn key(&self) -> NodeKey {
        NodeKey(format!("{}:{}/{}", self.ip, self.port, self.device))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.device)
    }
}

/// Key identifying one `(ip, port, device)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(String);

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// An object timestamp with microsecond resolution.
///
/// Rendered in the backend wire format `"{seconds:010}.{micros:06}"`, which
/// sorts lexicographically in time order. Comparison is numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    micros: u64,
}

impl Timestamp {
    /// Build from whole microseconds since the epoch.
    pub fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    /// Build from whole seconds since the epoch.
    pub fn from_secs(secs: u64) -> Self {
        Self {
            micros: secs * 1_000_000,
        }
    }

    /// Microseconds since the epoch.
    pub fn as_micros(&self) -> u64 {
        self.micros
    }

    /// Whole seconds since the epoch (truncating).
    pub fn as_secs(&self) -> u64 {
        self.micros / 1_000_000
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:010}.{:06}",
            self.micros / 1_000_000,
            self.micros % 1_000_000
        )
    }
}

/// Error parsing a wire-format timestamp.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid timestamp: {0:?}")]
pub struct TimestampParseError(pub String);

impl FromStr for Timestamp {
    type Err = TimestampParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (secs_part, frac_part) = match s.split_once('.') {
            Some((a, b)) => (a, b),
            None => (s, ""),
        };
        let secs: u64 = secs_part
            .parse()
            .map_err(|_| TimestampParseError(s.to_string()))?;
        // Fractional part is microseconds, right-padded to 6 digits.
        let micros: u64 = if frac_part.is_empty() {
            0
        } else {
            let mut frac = frac_part.to_string();
            if frac.len() > 6 || !frac.chars().all(|c| c.is_ascii_digit()) {
                frac.truncate(6);
                if !frac.chars().all(|c| c.is_ascii_digit()) {
                    return Err(TimestampParseError(s.to_string()));
                }
            }
            while frac.len() < 6 {
                frac.push('0');
            }
            frac.parse()
                .map_err(|_| TimestampParseError(s.to_string()))?
        };
        let total = secs
            .checked_mul(1_000_000)
            .and_then(|m| m.checked_add(micros))
            .ok_or_else(|| TimestampParseError(s.to_string()))?;
        Ok(Self { micros: total })
    }
}

// ---------------------------------------------------------------------------
// Backend statuses
// ---------------------------------------------------------------------------

/// An HTTP-like backend status code.
///
/// Transport-level HTTP parsing lives outside Quay; the coordination layer
/// only needs the numeric code and its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Status(pub u16);

impl Status {
    pub const CONTINUE: Status = Status(100);
    pub const OK: Status = Status(200);
    pub const CREATED: Status = Status(201);
    pub const ACCEPTED: Status = Status(202);
    pub const NO_CONTENT: Status = Status(204);
    pub const PARTIAL_CONTENT: Status = Status(206);
    pub const NOT_MODIFIED: Status = Status(304);
    pub const BAD_REQUEST: Status = Status(400);
    pub const NOT_FOUND: Status = Status(404);
    pub const REQUEST_TIMEOUT: Status = Status(408);
    pub const CONFLICT: Status = Status(409);
    pub const LENGTH_REQUIRED: Status = Status(411);
    pub const PRECONDITION_FAILED: Status = Status(412);
    pub const RANGE_NOT_SATISFIABLE: Status = Status(416);
    pub const UNPROCESSABLE_ENTITY: Status = Status(422);
    pub const CLIENT_CLOSED_REQUEST: Status = Status(499);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);
    pub const INSUFFICIENT_STORAGE: Status = Status(507);
    pub const SERVICE_UNAVAILABLE: Status = Status(503);

    /// 1xx interim status.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    /// 2xx success.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    /// 4xx client error.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.0)
    }

    /// 5xx server error.
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.0)
    }

    /// Quorum equivalence class for this status.
    ///
    /// All 2xx statuses count as one class; every other status is its own
    /// class (409 in particular must stay distinct so conflict detection can
    /// take precedence over a success majority).
    pub fn quorum_class(&self) -> u16 {
        if self.is_success() { 200 } else { self.0 }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Storage policies
// ---------------------------------------------------------------------------

/// Storage policy: whole-object replication or erasure-coded fragmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoragePolicy {
    /// Whole-object replication with `replicas` full copies.
    Replicated {
        /// Number of full copies.
        replicas: usize,
    },
    /// Erasure coding: each object segment is split into `ndata` data
    /// fragments plus `nparity` parity fragments.
    ErasureCoded {
        /// Data fragments per segment.
        ndata: usize,
        /// Parity fragments per segment.
        nparity: usize,
        /// Bytes of object data per segment.
        segment_size: usize,
    },
}

impl StoragePolicy {
    /// Number of backend nodes a single object maps to.
    pub fn replica_count(&self) -> usize {
        match self {
            StoragePolicy::Replicated { replicas } => *replicas,
            StoragePolicy::ErasureCoded { ndata, nparity, .. } => ndata + nparity,
        }
    }

    /// Minimum agreeing responses needed to decide an outcome.
    ///
    /// Replicated policies need a strict majority. Erasure-coded policies
    /// need enough fragments for a durable read: `ndata + 1`, capped at the
    /// total fragment count so tiny schemes stay satisfiable.
    pub fn quorum_size(&self) -> usize {
        match self {
            StoragePolicy::Replicated { replicas } => majority_quorum(*replicas),
            StoragePolicy::ErasureCoded { ndata, nparity, .. } => {
                (ndata + 1).min(ndata + nparity)
            }
        }
    }

    /// Upper bound on candidates (primaries + handoffs) contacted for one
    /// request. Empirically 2x the replica count; kept configurable via
    /// [`StoragePolicy::node_cap_with`].
    pub fn node_cap(&self) -> usize {
        self.node_cap_with(2)
    }

    /// Candidate cap with an explicit handoff-exhaustion multiplier.
    pub fn node_cap_with(&self, multiplier: usize) -> usize {
        self.replica_count() * multiplier.max(1)
    }

    /// True for erasure-coded policies.
    pub fn is_ec(&self) -> bool {
        matches!(self, StoragePolicy::ErasureCoded { .. })
    }
}

/// Strict-majority quorum: `floor(n / 2) + 1`.
pub fn majority_quorum(replicas: usize) -> usize {
    replicas / 2 + 1
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
