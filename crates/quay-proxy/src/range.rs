//! Client byte ranges and their fragment-coordinate translation.
//!
//! An erasure-coded object is stored as per-node fragment archives: segment
//! `i` contributes one fragment-sized slice at the same offset in every
//! archive. A client byte range therefore maps to a contiguous range of
//! whole segments, which maps to a contiguous byte range in fragment
//! coordinates sent to the backends.

use quay_erasure::fragment_size;

/// Synthesized body for a range the backends agree cannot be satisfied.
pub const UNSATISFIABLE_BODY: &[u8] = b"Requested range not satisfiable";

/// An inclusive client byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// Parse a `bytes=start-end` header.
///
/// Only the simple single-range form is handled; suffix ranges, multiple
/// ranges, and malformed values return `None` and the request is served
/// whole, per HTTP semantics.
pub fn parse_range(header: &str) -> Option<ByteRange> {
    let spec = header.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    Some(ByteRange { start, end })
}

/// The segment span covering a client range, plus its fragment-coordinate
/// byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSpan {
    /// First logical segment touched.
    pub first_segment: u64,
    /// Last logical segment touched (as requested; the object may end
    /// earlier).
    pub last_segment: u64,
    /// Start offset in each fragment archive.
    pub frag_start: u64,
    /// Inclusive end offset in each fragment archive.
    pub frag_end: u64,
}

/// Translate a client range into fragment coordinates.
pub fn to_fragment_span(range: ByteRange, segment_size: usize, ndata: usize) -> FragmentSpan {
    let segment_size = segment_size as u64;
    let slice = fragment_size(segment_size as usize, ndata) as u64;
    let first_segment = range.start / segment_size;
    let last_segment = range.end / segment_size;
    FragmentSpan {
        first_segment,
        last_segment,
        frag_start: first_segment * slice,
        frag_end: (last_segment + 1) * slice - 1,
    }
}

impl FragmentSpan {
    /// The backend `Range` header value for this span.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.frag_start, self.frag_end)
    }
}
