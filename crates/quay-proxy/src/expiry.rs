//! Object-expiration header handling.
//!
//! Clients schedule expiry with an absolute `X-Delete-At` (epoch seconds)
//! or a relative `X-Delete-After` (seconds from now, converted here). The
//! backend requests additionally carry the bookkeeping headers naming the
//! expirer partition responsible for the scheduled deletion.

use std::collections::BTreeMap;

use quay_placement::Ring;
use quay_types::{Timestamp, headers};

use crate::error::ProxyError;

/// Expiry container granularity: scheduled deletions are grouped by day.
pub const EXPIRY_CONTAINER_DIVISOR: u64 = 86_400;

/// Normalize the expiration headers in place.
///
/// `X-Delete-After` is converted to `X-Delete-At` relative to `now`.
/// Returns the absolute delete-at time when expiry is scheduled.
///
/// # Errors
///
/// Non-integer values and times at or before `now` are client errors (400).
pub fn normalize(
    headers: &mut BTreeMap<String, String>,
    now: Timestamp,
) -> Result<Option<u64>, ProxyError> {
    if let Some(value) = take(headers, headers::DELETE_AFTER) {
        let delta: u64 = value.trim().parse().map_err(|_| ProxyError::InvalidHeader {
            name: "X-Delete-After",
            reason: format!("not a non-negative integer: {value:?}"),
        })?;
        headers.insert(
            headers::DELETE_AT.to_string(),
            (now.as_secs() + delta).to_string(),
        );
    }

    let Some(value) = get(headers, headers::DELETE_AT).map(str::to_string) else {
        return Ok(None);
    };
    let delete_at: u64 = value.trim().parse().map_err(|_| ProxyError::InvalidHeader {
        name: "X-Delete-At",
        reason: format!("not a non-negative integer: {value:?}"),
    })?;
    if delete_at <= now.as_secs() {
        return Err(ProxyError::InvalidHeader {
            name: "X-Delete-At",
            reason: "time is in the past".to_string(),
        });
    }
    Ok(Some(delete_at))
}

/// The expirer bookkeeping headers for a scheduled deletion.
///
/// The expiry container groups deletions by [`EXPIRY_CONTAINER_DIVISOR`];
/// when an expirer ring is available, the responsible host, device, and
/// partition are included as well.
pub fn bookkeeping_headers(
    delete_at: u64,
    expirer_ring: Option<&dyn Ring>,
) -> Vec<(String, String)> {
    let container = (delete_at / EXPIRY_CONTAINER_DIVISOR) * EXPIRY_CONTAINER_DIVISOR;
    let mut out = vec![(
        headers::DELETE_AT_CONTAINER.to_string(),
        container.to_string(),
    )];

    if let Some(ring) = expirer_ring {
        let partition = ring.partition(&format!("/.expiry/{container}"));
        if let Some(node) = ring.primary_nodes(partition).into_iter().next() {
            out.push((
                headers::DELETE_AT_HOST.to_string(),
                format!("{}:{}", node.ip, node.port),
            ));
            out.push((headers::DELETE_AT_DEVICE.to_string(), node.device));
            out.push((
                headers::DELETE_AT_PARTITION.to_string(),
                partition.to_string(),
            ));
        }
    }
    out
}

fn get<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn take(headers: &mut BTreeMap<String, String>, name: &str) -> Option<String> {
    let key = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case(name))
        .cloned()?;
    headers.remove(&key)
}
