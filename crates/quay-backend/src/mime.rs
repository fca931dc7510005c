//! Fixed-shape multipart envelope for PUT bodies.
//!
//! When footers or multi-phase commit are negotiated, the PUT body becomes
//! a sequence of named sections under one declared boundary:
//!
//! 1. `object body` — the raw object bytes
//! 2. `object metadata` — a JSON footer document
//! 3. `put commit` — erasure-coded only, sent after footer acknowledgment
//!
//! The shape is fixed, so this is an explicit section writer/reader rather
//! than a general streaming MIME parser.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use quay_types::headers;
use rand::Rng;

/// Section name of the raw object bytes.
pub const DOC_OBJECT_BODY: &str = "object body";
/// Section name of the JSON footer document.
pub const DOC_OBJECT_METADATA: &str = "object metadata";
/// Section name of the commit marker.
pub const DOC_PUT_COMMIT: &str = "put commit";

/// A parsed envelope section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    /// The `X-Document` section name.
    pub doc: String,
    /// Section headers other than `X-Document`.
    pub headers: BTreeMap<String, String>,
    /// Raw section payload.
    pub body: Vec<u8>,
}

/// Generate a fresh boundary token.
pub fn random_boundary() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).expect("hex digit")
        })
        .collect()
}

/// Incremental writer for the fixed-shape envelope.
///
/// Sections open with `part_head` (after which raw payload bytes may be
/// streamed) and the envelope ends with `terminator`.
#[derive(Debug, Clone)]
pub struct MimeWriter {
    boundary: String,
    parts_opened: usize,
}

impl MimeWriter {
    /// Create a writer with the declared boundary token.
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts_opened: 0,
        }
    }

    /// The declared boundary token.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Open a section: boundary line, `X-Document`, extra headers, blank
    /// line. Payload bytes follow verbatim.
    pub fn part_head(&mut self, doc: &str, extra: &[(String, String)]) -> Bytes {
        let mut buf = BytesMut::new();
        if self.parts_opened > 0 {
            // Close the previous section's payload.
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        buf.extend_from_slice(format!("{}: {}\r\n", headers::DOCUMENT, doc).as_bytes());
        for (name, value) in extra {
            buf.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        self.parts_opened += 1;
        buf.freeze()
    }

    /// A complete section in one buffer.
    pub fn part(&mut self, doc: &str, extra: &[(String, String)], body: &[u8]) -> Bytes {
        let mut buf = BytesMut::from(&self.part_head(doc, extra)[..]);
        buf.extend_from_slice(body);
        buf.freeze()
    }

    /// The closing boundary line.
    pub fn terminator(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        if self.parts_opened > 0 {
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(format!("--{}--", self.boundary).as_bytes());
        buf.freeze()
    }
}

/// Error splitting an envelope back into sections.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MimeError {
    /// The body does not start with the declared boundary.
    #[error("missing opening boundary")]
    MissingBoundary,
    /// A section is missing its blank-line header terminator.
    #[error("malformed section header block")]
    MalformedHeaders,
    /// A section has no `X-Document` name.
    #[error("section missing X-Document header")]
    MissingDocument,
}

/// Split an envelope into its sections.
///
/// Used by the mock backend and by tests asserting the PUT body layout;
/// real backends do their own parsing.
pub fn parse_mime(body: &[u8], boundary: &str) -> Result<Vec<MimePart>, MimeError> {
    let delim = format!("--{boundary}");
    let text_delim = delim.as_bytes();

    // Sections are separated by "\r\n--boundary"; the first begins at the
    // opening delimiter.
    let mut parts = Vec::new();
    let mut pos = find(body, text_delim, 0).ok_or(MimeError::MissingBoundary)?;

    loop {
        pos += text_delim.len();
        if body[pos..].starts_with(b"--") {
            break; // closing delimiter
        }
        // Skip the CRLF after the boundary line.
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }

        let header_end = find(body, b"\r\n\r\n", pos).ok_or(MimeError::MalformedHeaders)?;
        let header_block =
            std::str::from_utf8(&body[pos..header_end]).map_err(|_| MimeError::MalformedHeaders)?;

        let mut doc = None;
        let mut headers = BTreeMap::new();
        for line in header_block.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or(MimeError::MalformedHeaders)?;
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case(crate::mime::X_DOCUMENT) {
                doc = Some(value.to_string());
            } else {
                headers.insert(name.to_string(), value.to_string());
            }
        }

        let body_start = header_end + 4;
        let next = find(body, format!("\r\n--{boundary}").as_bytes(), body_start);
        let (body_end, next_pos) = match next {
            Some(i) => (i, i + 2),
            None => (body.len(), body.len()),
        };

        parts.push(MimePart {
            doc: doc.ok_or(MimeError::MissingDocument)?,
            headers,
            body: body[body_start..body_end].to_vec(),
        });

        if next_pos >= body.len() {
            break;
        }
        pos = next_pos;
    }

    Ok(parts)
}

const X_DOCUMENT: &str = headers::DOCUMENT;

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_is_hex_and_fresh() {
        let a = random_boundary();
        let b = random_boundary();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_round_trip_two_parts() {
        let mut w = MimeWriter::new("bnd");
        let mut body = Vec::new();
        body.extend_from_slice(&w.part(DOC_OBJECT_BODY, &[], b"hello object"));
        body.extend_from_slice(&w.part(
            DOC_OBJECT_METADATA,
            &[("Content-Type".to_string(), "application/json".to_string())],
            br#"{"Etag":"abc"}"#,
        ));
        body.extend_from_slice(&w.terminator());

        let parts = parse_mime(&body, "bnd").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].doc, DOC_OBJECT_BODY);
        assert_eq!(parts[0].body, b"hello object");
        assert_eq!(parts[1].doc, DOC_OBJECT_METADATA);
        assert_eq!(
            parts[1].headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(parts[1].body, br#"{"Etag":"abc"}"#);
    }

    #[test]
    fn test_streamed_part_equivalent_to_whole_part() {
        // part_head + raw payload must parse the same as part().
        let mut w1 = MimeWriter::new("bnd");
        let mut streamed = Vec::new();
        streamed.extend_from_slice(&w1.part_head(DOC_OBJECT_BODY, &[]));
        streamed.extend_from_slice(b"chunk-one");
        streamed.extend_from_slice(b"chunk-two");
        streamed.extend_from_slice(&w1.terminator());

        let parts = parse_mime(&streamed, "bnd").unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].body, b"chunk-onechunk-two");
    }

    #[test]
    fn test_three_part_commit_layout() {
        let mut w = MimeWriter::new("b0");
        let mut body = Vec::new();
        body.extend_from_slice(&w.part(DOC_OBJECT_BODY, &[], b"frag"));
        body.extend_from_slice(&w.part(DOC_OBJECT_METADATA, &[], b"{}"));
        body.extend_from_slice(&w.part(DOC_PUT_COMMIT, &[], b""));
        body.extend_from_slice(&w.terminator());

        let docs: Vec<String> = parse_mime(&body, "b0")
            .unwrap()
            .into_iter()
            .map(|p| p.doc)
            .collect();
        assert_eq!(docs, vec![DOC_OBJECT_BODY, DOC_OBJECT_METADATA, DOC_PUT_COMMIT]);
    }

    #[test]
    fn test_empty_payload_part() {
        let mut w = MimeWriter::new("x");
        let mut body = Vec::new();
        body.extend_from_slice(&w.part(DOC_PUT_COMMIT, &[], b""));
        body.extend_from_slice(&w.terminator());
        let parts = parse_mime(&body, "x").unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].body.is_empty());
    }

    #[test]
    fn test_missing_boundary_rejected() {
        assert_eq!(
            parse_mime(b"no envelope here", "b"),
            Err(MimeError::MissingBoundary)
        );
    }

    #[test]
    fn test_binary_payload_preserved() {
        let payload: Vec<u8> = (0..=255).collect();
        let mut w = MimeWriter::new("bin");
        let mut body = Vec::new();
        body.extend_from_slice(&w.part(DOC_OBJECT_BODY, &[], &payload));
        body.extend_from_slice(&w.terminator());
        let parts = parse_mime(&body, "bin").unwrap();
        assert_eq!(parts[0].body, payload);
    }
}
