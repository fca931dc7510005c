//! Erasure-coded fragment search bookkeeping.
//!
//! GET/HEAD on an erasure-coded object is a search: backend outcomes are
//! sorted into buckets keyed by `(etag, timestamp)`, and a bucket becomes
//! readable once it holds `ndata` unique fragment indices with at least one
//! durable mark. The newest readable bucket wins; duplicates of an index
//! never count twice.
//!
//! The reconstructor only does the bookkeeping; connecting, streaming, and
//! decoding live in the controller.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use bytes::BytesMut;
use quay_backend::BackendError;
use quay_types::{Node, Status, Timestamp};
use serde::Serialize;
use tokio::time::timeout;
use tracing::debug;

use crate::outcome::BackendOutcome;

/// What the reconstructor did with one fed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// A new unique fragment index entered a bucket.
    Added,
    /// The bucket already holds this index; discarded without counting.
    DuplicateIndex,
    /// The node has no fragment at all.
    NotFound,
    /// The node reported the requested range unsatisfiable.
    RangeUnsatisfiable,
    /// Anything else: missing coordination fields or a non-2xx status.
    Ignored,
}

/// Fragments of one `(etag, timestamp)` version of an object.
pub struct FragmentBucket {
    /// Whole-object etag this bucket collects fragments of.
    pub etag: String,
    /// Version timestamp.
    pub timestamp: Timestamp,
    durable: bool,
    indices: BTreeSet<u8>,
    outcomes: Vec<BackendOutcome>,
}

impl FragmentBucket {
    fn new(etag: String, timestamp: Timestamp) -> Self {
        Self {
            etag,
            timestamp,
            durable: false,
            indices: BTreeSet::new(),
            outcomes: Vec::new(),
        }
    }

    /// Unique fragment indices collected.
    pub fn unique_fragments(&self) -> usize {
        self.indices.len()
    }

    /// Whether any fragment carries a durable mark at this timestamp.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Enough unique fragments and a durable mark.
    pub fn is_readable(&self, ndata: usize) -> bool {
        self.indices.len() >= ndata && self.durable
    }

    /// Split into exactly `ndata` decode sources plus the unused spares.
    ///
    /// Durable-confirmed fragments are preferred; the selection is ordered
    /// by fragment index.
    pub fn into_selection(self, ndata: usize) -> (Vec<BackendOutcome>, Vec<BackendOutcome>) {
        let mut outcomes = self.outcomes;
        // Durable first, stable within each group.
        outcomes.sort_by_key(|o| !o.durable);
        let mut spares = outcomes.split_off(ndata.min(outcomes.len()));
        let mut selected = outcomes;
        selected.sort_by_key(|o| o.frag_index);
        spares.sort_by_key(|o| o.frag_index);
        (selected, spares)
    }
}

/// One version's entry in the fragment-preference hint sent with widened
/// search requests, serialized as the header's JSON list element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferenceHint {
    /// Version timestamp, wire format.
    pub timestamp: String,
    /// Fragment indices already held for this version.
    pub exclude: Vec<u8>,
}

/// The bucket map plus the counters that drive the fallback statuses.
pub struct FragmentReconstructor {
    ndata: usize,
    buckets: HashMap<(String, Timestamp), FragmentBucket>,
    answered: usize,
    not_found: usize,
    unsatisfiable: usize,
}

impl FragmentReconstructor {
    /// A reconstructor needing `ndata` unique fragments per version.
    pub fn new(ndata: usize) -> Self {
        Self {
            ndata: ndata.max(1),
            buckets: HashMap::new(),
            answered: 0,
            not_found: 0,
            unsatisfiable: 0,
        }
    }

    /// Sort one outcome into its bucket.
    ///
    /// Non-useful outcomes have their session closed here; added outcomes
    /// keep theirs open for the decode phase.
    pub fn feed(&mut self, mut outcome: BackendOutcome) -> Feed {
        self.answered += 1;

        if outcome.status == Status::NOT_FOUND {
            self.not_found += 1;
            outcome.close();
            return Feed::NotFound;
        }
        if outcome.status == Status::RANGE_NOT_SATISFIABLE {
            self.unsatisfiable += 1;
            outcome.close();
            return Feed::RangeUnsatisfiable;
        }
        if !outcome.status.is_success() {
            outcome.close();
            return Feed::Ignored;
        }

        let (Some(etag), Some(timestamp), Some(index)) = (
            outcome.logical_etag().map(str::to_string),
            outcome.timestamp,
            outcome.frag_index,
        ) else {
            debug!(node = %outcome.node, "fragment reply missing coordination fields");
            outcome.close();
            return Feed::Ignored;
        };

        let bucket = self
            .buckets
            .entry((etag.clone(), timestamp))
            .or_insert_with(|| FragmentBucket::new(etag, timestamp));
        if !bucket.indices.insert(index) {
            outcome.close();
            return Feed::DuplicateIndex;
        }
        bucket.durable |= outcome.durable;
        bucket.outcomes.push(outcome);
        Feed::Added
    }

    /// Preference hints for further fragment requests: one entry per
    /// version under collection, durable versions first, then newest, each
    /// excluding the indices already held.
    pub fn preference_hints(&self) -> Vec<PreferenceHint> {
        let mut buckets: Vec<&FragmentBucket> = self.buckets.values().collect();
        buckets.sort_by(|a, b| {
            b.durable
                .cmp(&a.durable)
                .then(b.timestamp.cmp(&a.timestamp))
        });
        buckets
            .into_iter()
            .map(|b| PreferenceHint {
                timestamp: b.timestamp.to_string(),
                exclude: b.indices.iter().copied().collect(),
            })
            .collect()
    }

    /// `ndata` nodes agreeing the range cannot be satisfied.
    pub fn range_agreed_unsatisfiable(&self) -> bool {
        self.unsatisfiable >= self.ndata
    }

    /// Remove and return the newest readable bucket, abandoning every
    /// other bucket (their sessions are closed).
    pub fn take_readable(&mut self) -> Option<FragmentBucket> {
        let key = self
            .buckets
            .iter()
            .filter(|(_, b)| b.is_readable(self.ndata))
            .max_by_key(|((_, ts), _)| *ts)
            .map(|(k, _)| k.clone())?;
        let winner = self.buckets.remove(&key).expect("key just observed");
        for (_, mut bucket) in self.buckets.drain() {
            for outcome in &mut bucket.outcomes {
                outcome.close();
            }
        }
        Some(winner)
    }

    /// Status when candidates run out with nothing readable: 404 when every
    /// answer was not-found, 503 otherwise.
    pub fn exhausted_status(&self) -> Status {
        if self.answered > 0 && self.not_found == self.answered {
            Status::NOT_FOUND
        } else {
            Status::SERVICE_UNAVAILABLE
        }
    }

    /// Release every session still held.
    pub fn close_all(&mut self) {
        for bucket in self.buckets.values_mut() {
            for outcome in &mut bucket.outcomes {
                outcome.close();
            }
        }
    }
}

/// One selected fragment's buffered byte stream.
///
/// Reads are slice-at-a-time with a per-chunk recoverable timeout; a
/// timeout abandons only this source, never the whole request.
pub struct FragmentSource {
    outcome: BackendOutcome,
    buf: BytesMut,
}

impl FragmentSource {
    /// Wrap a bucket outcome whose session is still open.
    pub fn new(outcome: BackendOutcome) -> Self {
        Self {
            outcome,
            buf: BytesMut::new(),
        }
    }

    /// Fragment position of this source.
    pub fn frag_index(&self) -> u8 {
        self.outcome.frag_index.unwrap_or(0)
    }

    /// The node streaming this fragment.
    pub fn node(&self) -> &Node {
        &self.outcome.node
    }

    /// Read exactly `len` bytes of the fragment stream.
    ///
    /// Each underlying chunk read is bounded by `per_chunk`; elapse maps to
    /// [`BackendError::ChunkReadTimeout`]. A stream ending early is a
    /// receive error.
    pub async fn read_slice(
        &mut self,
        len: usize,
        per_chunk: Duration,
    ) -> Result<Vec<u8>, BackendError> {
        while self.buf.len() < len {
            let session = self.outcome.session.as_mut().ok_or(BackendError::Closed)?;
            let chunk = match timeout(per_chunk, session.read_chunk()).await {
                Ok(result) => result?,
                Err(_) => return Err(BackendError::ChunkReadTimeout),
            };
            match chunk {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => {
                    return Err(BackendError::Recv(format!(
                        "fragment stream ended {} bytes short",
                        len - self.buf.len()
                    )));
                }
            }
        }
        Ok(self.buf.split_to(len).to_vec())
    }

    /// Read and drop `len` bytes (catching up a replacement source).
    pub async fn discard(&mut self, len: usize, per_chunk: Duration) -> Result<(), BackendError> {
        if len > 0 {
            self.read_slice(len, per_chunk).await?;
        }
        Ok(())
    }

    /// Abandon the stream.
    pub fn close(mut self) {
        self.outcome.close();
    }
}
