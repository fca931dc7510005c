//! Reed-Solomon segment/fragment codec for erasure-coded storage policies.
//!
//! A logical object is cut into fixed-size segments; each segment is encoded
//! into `ndata` data fragments plus `nparity` parity fragments, one per
//! backend node. Any `ndata` distinct fragments of a segment reconstruct it
//! byte-identically.
//!
//! Padding is handled automatically to satisfy `reed-solomon-simd`'s
//! even-size requirement.

mod decoder;
mod encoder;
mod error;

pub use decoder::decode_segment;
pub use encoder::{Fragment, FragmentEncoder};
pub use error::ErasureError;

/// Size of one fragment of a full segment.
///
/// `ceil(segment_size / ndata)`, rounded up to even (required by
/// `reed-solomon-simd`). The final segment of an object is shorter and its
/// fragments are computed with the same formula over the remainder.
pub fn fragment_size(segment_size: usize, ndata: usize) -> usize {
    round_up_even(segment_size.div_ceil(ndata))
}

pub(crate) fn round_up_even(n: usize) -> usize {
    if n % 2 == 0 { n } else { n + 1 }
}
