//! Error types for the segment/fragment codec.

/// Errors from erasure encoding or decoding.
#[derive(Debug, thiserror::Error)]
pub enum ErasureError {
    /// The Reed-Solomon library returned an error (length mismatch,
    /// corruption, bad parameters).
    #[error("reed-solomon error: {0}")]
    ReedSolomon(#[from] reed_solomon_simd::Error),

    /// Not enough fragments were provided for decoding.
    #[error("not enough fragments: need {needed}, got {got}")]
    NotEnoughFragments {
        /// Minimum fragments required (ndata).
        needed: usize,
        /// Fragments actually provided.
        got: usize,
    },

    /// Fragments of one segment must all be the same length.
    #[error("fragment length mismatch: expected {expected}, got {got}")]
    LengthMismatch {
        /// Length of the first fragment.
        expected: usize,
        /// Offending fragment's length.
        got: usize,
    },

    /// The input segment was empty.
    #[error("cannot encode empty segment")]
    EmptySegment,
}
