//! The ordered candidate-node sequence for one request.
//!
//! Primaries first, then handoffs, bounded by the policy's candidate cap.
//! Write affinity may pull a limited number of local nodes to the front;
//! error-limited nodes are skipped unless that would starve the request of
//! quorum, in which case they are offered as a last resort.

use std::collections::VecDeque;
use std::sync::Arc;

use quay_types::Node;
use tracing::debug;

use crate::limiter::ErrorLimiter;

/// Write-affinity policy: a locality predicate plus how many matching nodes
/// to move to the front of the sequence.
#[derive(Clone)]
pub struct AffinityPolicy {
    /// Returns true for nodes considered local.
    pub is_local: Arc<dyn Fn(&Node) -> bool + Send + Sync>,
    /// How many local nodes to promote.
    pub desired_local_count: usize,
}

impl AffinityPolicy {
    /// Affinity for a single region.
    pub fn for_region(region: u32, desired_local_count: usize) -> Self {
        Self {
            is_local: Arc::new(move |n: &Node| n.region == region),
            desired_local_count,
        }
    }
}

/// Bounded, affinity-aware, suppression-filtered candidate sequence.
///
/// Yields every primary and handoff node at most once. Order is primaries
/// then handoffs, except that up to `desired_local_count` affinity-matching
/// nodes move to the front; the relative order of all other nodes is
/// preserved. The sequence never exceeds the cap.
pub struct NodeIter {
    nodes: VecDeque<Node>,
    primary_count: usize,
}

impl NodeIter {
    /// Build the candidate sequence.
    ///
    /// * `primaries` — the ring's primary node list.
    /// * `handoffs` — the ring's handoff sequence (pulled lazily, truncated
    ///   by `cap`).
    /// * `limiter` — consulted once per node at construction time.
    /// * `affinity` — optional local-first reordering.
    /// * `cap` — overall bound on candidates (policy-derived).
    /// * `min_candidates` — usually the quorum size; suppressed nodes are
    ///   re-offered if filtering would leave fewer than this.
    pub fn new(
        primaries: Vec<Node>,
        handoffs: impl Iterator<Item = Node>,
        limiter: &ErrorLimiter,
        affinity: Option<&AffinityPolicy>,
        cap: usize,
        min_candidates: usize,
    ) -> Self {
        let primary_count = primaries.len().min(cap);

        let mut candidates: Vec<Node> = primaries;
        candidates.truncate(cap);
        if candidates.len() < cap {
            candidates.extend(handoffs.take(cap - candidates.len()));
        }

        if let Some(policy) = affinity {
            candidates = local_first(candidates, policy);
        }

        // Suppression filter with last-resort fallback.
        let mut available = Vec::with_capacity(candidates.len());
        let mut suppressed = Vec::new();
        for node in candidates {
            if limiter.is_suppressed(&node) {
                suppressed.push(node);
            } else {
                available.push(node);
            }
        }
        if !suppressed.is_empty() {
            debug!(
                skipped = suppressed.len(),
                remaining = available.len(),
                "error-limited nodes skipped"
            );
            if available.len() < min_candidates {
                // Not enough healthy candidates for quorum; offer the
                // suppressed ones at the tail rather than starving the
                // request.
                available.append(&mut suppressed);
            }
        }

        Self {
            nodes: available.into(),
            primary_count,
        }
    }

    /// Sequence over primaries and handoffs with no affinity or filtering.
    pub fn unfiltered(primaries: Vec<Node>, handoffs: impl Iterator<Item = Node>, cap: usize) -> Self {
        let limiter = ErrorLimiter::new(Default::default());
        Self::new(primaries, handoffs, &limiter, None, cap, 0)
    }

    /// Number of primary nodes that entered the sequence.
    pub fn primary_count(&self) -> usize {
        self.primary_count
    }

    /// Candidates remaining.
    pub fn remaining(&self) -> usize {
        self.nodes.len()
    }
}

impl Iterator for NodeIter {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        self.nodes.pop_front()
    }
}

/// Stable local-first reordering: up to `desired_local_count` nodes matching
/// the predicate move to the front; everything else keeps its relative order.
fn local_first(candidates: Vec<Node>, policy: &AffinityPolicy) -> Vec<Node> {
    let mut locals = Vec::new();
    let mut rest = Vec::with_capacity(candidates.len());

    for node in candidates {
        if locals.len() < policy.desired_local_count && (policy.is_local)(&node) {
            locals.push(node);
        } else {
            rest.push(node);
        }
    }

    locals.extend(rest);
    locals
}
