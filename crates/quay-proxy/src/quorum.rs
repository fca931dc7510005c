//! Status-class quorum resolution for replicated operations and the
//! erasure-coded commit phase.
//!
//! Outcomes are grouped by status-equivalence class (all 2xx fold into one
//! class, everything else stands alone) and the request is decided the
//! instant any class reaches quorum. A 409 carrying a backend timestamp at
//! or past the request's own timestamp marks the request superseded: the
//! answer becomes 202 regardless of what other nodes said.

use quay_types::{Status, Timestamp};
use tracing::debug;

use crate::outcome::BackendOutcome;

/// How the resolver settled the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A status class reached quorum. `winner` indexes the earliest-arriving
    /// outcome of that class; its status/headers answer the client verbatim.
    Decided { status: Status, winner: usize },
    /// A backend holds a newer write; answer 202 accepted-but-superseded.
    Superseded,
    /// Candidates exhausted without quorum: 404 when a majority of answered
    /// nodes said not-found, 503 otherwise.
    Fallback { status: Status },
}

impl Decision {
    /// The client-facing status for this decision.
    pub fn status(&self) -> Status {
        match self {
            Decision::Decided { status, .. } => *status,
            Decision::Superseded => Status::ACCEPTED,
            Decision::Fallback { status } => *status,
        }
    }
}

/// Aggregates per-node outcomes into one decision.
pub struct QuorumResolver {
    quorum: usize,
    request_timestamp: Option<Timestamp>,
    outcomes: Vec<BackendOutcome>,
    superseded: bool,
}

impl QuorumResolver {
    /// A resolver deciding at `quorum` agreeing outcomes.
    ///
    /// `request_timestamp` enables conflict supersession; pass `None` for
    /// operations without a meaningful own-timestamp comparison.
    pub fn new(quorum: usize, request_timestamp: Option<Timestamp>) -> Self {
        Self {
            quorum: quorum.max(1),
            request_timestamp,
            outcomes: Vec::new(),
            superseded: false,
        }
    }

    /// Outcomes collected so far.
    pub fn answered(&self) -> usize {
        self.outcomes.len()
    }

    /// Feed one outcome; returns the decision the moment one exists.
    pub fn add(&mut self, outcome: BackendOutcome) -> Option<Decision> {
        if outcome.status == Status::CONFLICT {
            if let (Some(backend_ts), Some(request_ts)) =
                (outcome.timestamp, self.request_timestamp)
            {
                if backend_ts >= request_ts {
                    debug!(
                        node = %outcome.node,
                        backend_ts = %backend_ts,
                        request_ts = %request_ts,
                        "conflict with newer backend timestamp, request superseded"
                    );
                    self.superseded = true;
                }
            }
        }

        let class = outcome.status.quorum_class();
        self.outcomes.push(outcome);

        let count = self
            .outcomes
            .iter()
            .filter(|o| o.status.quorum_class() == class)
            .count();
        if count >= self.quorum {
            return Some(self.decide(class));
        }
        None
    }

    /// Decide after candidates are exhausted, quorum or not.
    pub fn finish(&self) -> Decision {
        if self.superseded {
            return Decision::Superseded;
        }
        // A class may have reached quorum without the caller acting on it.
        for outcome in &self.outcomes {
            let class = outcome.status.quorum_class();
            let count = self
                .outcomes
                .iter()
                .filter(|o| o.status.quorum_class() == class)
                .count();
            if count >= self.quorum {
                return self.decide(class);
            }
        }

        let not_found = self
            .outcomes
            .iter()
            .filter(|o| o.status == Status::NOT_FOUND)
            .count();
        let status = if not_found * 2 > self.outcomes.len() {
            Status::NOT_FOUND
        } else {
            Status::SERVICE_UNAVAILABLE
        };
        Decision::Fallback { status }
    }

    /// Remove and return an outcome by index (from a prior decision).
    pub fn take(&mut self, index: usize) -> BackendOutcome {
        self.outcomes.remove(index)
    }

    fn decide(&self, class: u16) -> Decision {
        if self.superseded {
            return Decision::Superseded;
        }
        let winner = self
            .outcomes
            .iter()
            .position(|o| o.status.quorum_class() == class)
            .expect("winning class has at least one member");
        Decision::Decided {
            status: self.outcomes[winner].status,
            winner,
        }
    }
}
