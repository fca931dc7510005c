//! Conditional-header evaluation against the logical object etag.
//!
//! Comparisons use the whole-object etag: for erasure-coded objects that is
//! a stored system attribute, never a fragment archive's own transfer
//! checksum. A request may name an alternate reply attribute to compare
//! against via `X-Backend-Etag-Is-At`.

use std::collections::BTreeMap;

use quay_types::headers;

use crate::error::ProxyError;

/// Outcome of evaluating the read conditionals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalResult {
    /// Serve the object.
    Proceed,
    /// `If-None-Match` matched on a read: 304.
    NotModified,
    /// `If-Match` did not match: 412.
    PreconditionFailed,
}

/// The etag conditional comparisons run against.
///
/// Order: the attribute named by the request's `X-Backend-Etag-Is-At`, then
/// the erasure-coded whole-object attribute, then the plain etag.
pub fn comparison_etag<'a>(
    request_headers: &BTreeMap<String, String>,
    reply_headers: &'a BTreeMap<String, String>,
) -> Option<&'a str> {
    if let Some(at) = lookup(request_headers, headers::ETAG_IS_AT) {
        if let Some(value) = lookup(reply_headers, at) {
            return Some(value);
        }
    }
    lookup(reply_headers, headers::EC_ETAG).or_else(|| lookup(reply_headers, headers::ETAG))
}

/// Evaluate `If-Match`/`If-None-Match` for GET/HEAD.
pub fn check_read_conditionals(
    request_headers: &BTreeMap<String, String>,
    reply_headers: &BTreeMap<String, String>,
) -> ConditionalResult {
    let etag = comparison_etag(request_headers, reply_headers);

    if let Some(condition) = lookup(request_headers, headers::IF_MATCH) {
        if !etag_matches(condition, etag) {
            return ConditionalResult::PreconditionFailed;
        }
    }
    if let Some(condition) = lookup(request_headers, headers::IF_NONE_MATCH) {
        if etag_matches(condition, etag) {
            return ConditionalResult::NotModified;
        }
    }
    ConditionalResult::Proceed
}

/// PUT accepts only `If-None-Match: *` (object-must-not-exist).
pub fn validate_put_conditionals(
    request_headers: &BTreeMap<String, String>,
) -> Result<(), ProxyError> {
    if let Some(value) = lookup(request_headers, headers::IF_NONE_MATCH) {
        if value.trim() != "*" {
            return Err(ProxyError::InvalidHeader {
                name: "If-None-Match",
                reason: "only * is supported on PUT".to_string(),
            });
        }
    }
    if lookup(request_headers, headers::IF_MATCH).is_some() {
        return Err(ProxyError::InvalidHeader {
            name: "If-Match",
            reason: "not supported on PUT".to_string(),
        });
    }
    Ok(())
}

/// Does a comma-separated condition list match the etag? `*` matches any
/// existing etag; quotes are stripped before comparison.
fn etag_matches(condition: &str, etag: Option<&str>) -> bool {
    condition.split(',').map(str::trim).any(|candidate| {
        if candidate == "*" {
            return etag.is_some();
        }
        let candidate = candidate.trim_matches('"');
        etag.map(|e| e.trim_matches('"') == candidate).unwrap_or(false)
    })
}

fn lookup<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
