//! Segment decoder: any `ndata` distinct fragments back into the segment.

use tracing::debug;

use crate::error::ErasureError;

/// Decode one segment from a subset of its fragments.
///
/// # Arguments
///
/// * `ndata` / `nparity` — the coding scheme used at encode time
/// * `fragments` — at least `ndata` fragments as `(index, data)` pairs
/// * `segment_size` — the original unpadded segment length
///
/// # Errors
///
/// [`ErasureError::NotEnoughFragments`] when fewer than `ndata` fragments
/// are given, [`ErasureError::LengthMismatch`] when fragment lengths differ,
/// or [`ErasureError::ReedSolomon`] when reconstruction fails. All of these
/// are fatal to the read; the caller does not retry a failed decode.
pub fn decode_segment(
    ndata: usize,
    nparity: usize,
    fragments: &[(u8, Vec<u8>)],
    segment_size: usize,
) -> Result<Vec<u8>, ErasureError> {
    if fragments.len() < ndata {
        return Err(ErasureError::NotEnoughFragments {
            needed: ndata,
            got: fragments.len(),
        });
    }

    let fragment_size = fragments[0].1.len();
    for (_, data) in fragments {
        if data.len() != fragment_size {
            return Err(ErasureError::LengthMismatch {
                expected: fragment_size,
                got: data.len(),
            });
        }
    }

    // Split into originals (index < ndata) and recovery fragments.
    let mut originals: Vec<(usize, &[u8])> = Vec::new();
    let mut recovery: Vec<(usize, &[u8])> = Vec::new();
    for (index, data) in fragments {
        let idx = *index as usize;
        if idx < ndata {
            originals.push((idx, data.as_slice()));
        } else {
            recovery.push((idx - ndata, data.as_slice()));
        }
    }

    debug!(
        ndata,
        nparity,
        originals = originals.len(),
        recovery = recovery.len(),
        segment_size,
        "decoding segment from fragments"
    );

    let mut result = vec![0u8; ndata * fragment_size];

    if originals.len() >= ndata {
        // All data fragments present: plain concatenation.
        for (idx, data) in &originals {
            let start = idx * fragment_size;
            result[start..start + fragment_size].copy_from_slice(data);
        }
        result.truncate(segment_size);
        return Ok(result);
    }

    // Recover the missing data fragments.
    let restored = reed_solomon_simd::decode(ndata, nparity, originals.clone(), recovery)?;

    for (idx, data) in &originals {
        let start = idx * fragment_size;
        result[start..start + fragment_size].copy_from_slice(data);
    }
    for (idx, data) in &restored {
        let start = idx * fragment_size;
        result[start..start + fragment_size].copy_from_slice(data);
    }

    result.truncate(segment_size);
    Ok(result)
}
