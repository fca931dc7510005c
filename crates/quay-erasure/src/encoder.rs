//! Segment encoder: one segment in, `ndata + nparity` fragments out.

use bytes::Bytes;
use tracing::debug;

use crate::error::ErasureError;
use crate::round_up_even;

/// One erasure-coded fragment of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Position in the coding scheme (0..ndata for data, ndata..ndata+nparity
    /// for parity).
    pub index: u8,
    /// The raw fragment bytes.
    pub data: Bytes,
}

/// Reed-Solomon segment encoder.
///
/// Splits segment data into `ndata` data fragments and generates `nparity`
/// parity fragments. All fragments are the same size; segments not evenly
/// divisible by `ndata` are zero-padded, and fragment sizes are rounded up
/// to even as `reed-solomon-simd` requires.
pub struct FragmentEncoder {
    ndata: usize,
    nparity: usize,
}

impl FragmentEncoder {
    /// Create an encoder for an `ndata + nparity` scheme.
    pub fn new(ndata: usize, nparity: usize) -> Self {
        Self { ndata, nparity }
    }

    /// Encode one segment into `ndata + nparity` fragments.
    ///
    /// Fragment `i` of every segment of an object goes to the same node, so
    /// the concatenation of a node's per-segment fragments forms its stored
    /// fragment archive. The unpadded `segment.len()` must be recorded for
    /// decoding.
    pub fn encode(&self, segment: &[u8]) -> Result<Vec<Fragment>, ErasureError> {
        if segment.is_empty() {
            return Err(ErasureError::EmptySegment);
        }

        let fragment_size = round_up_even(segment.len().div_ceil(self.ndata));

        // Pad the segment to exactly ndata * fragment_size.
        let padded_len = self.ndata * fragment_size;
        let mut padded = Vec::with_capacity(padded_len);
        padded.extend_from_slice(segment);
        padded.resize(padded_len, 0);

        let originals: Vec<&[u8]> = padded.chunks_exact(fragment_size).collect();
        debug_assert_eq!(originals.len(), self.ndata);

        let recovery = if self.nparity == 0 {
            Vec::new()
        } else {
            reed_solomon_simd::encode(self.ndata, self.nparity, &originals)?
        };

        let mut fragments = Vec::with_capacity(self.ndata + self.nparity);
        for (i, original) in originals.iter().enumerate() {
            fragments.push(Fragment {
                index: i as u8,
                data: Bytes::copy_from_slice(original),
            });
        }
        for (i, rec) in recovery.iter().enumerate() {
            fragments.push(Fragment {
                index: (self.ndata + i) as u8,
                data: Bytes::copy_from_slice(rec),
            });
        }

        debug!(
            ndata = self.ndata,
            nparity = self.nparity,
            segment_size = segment.len(),
            fragment_size,
            "encoded segment into fragments"
        );

        Ok(fragments)
    }
}
