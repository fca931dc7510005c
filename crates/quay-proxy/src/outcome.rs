//! One backend node's answer to one fanned-out request.

use std::collections::BTreeMap;
use std::fmt;

use quay_backend::{BackendReply, Session};
use quay_types::{Node, Status, Timestamp, headers};

/// A completed backend exchange, as consumed by the quorum resolver and the
/// fragment reconstructor.
///
/// Fragment index, durability, and timestamp are pre-extracted from the
/// reply headers; the raw headers stay available for verbatim copying into
/// the client response. For GET, the live session rides along so the winner's
/// body can still be streamed.
pub struct BackendOutcome {
    /// The node that answered.
    pub node: Node,
    /// Final status.
    pub status: Status,
    /// Reply headers, verbatim.
    pub headers: BTreeMap<String, String>,
    /// Fragment position, for erasure-coded replies.
    pub frag_index: Option<u8>,
    /// Whether the fragment is durable at its own timestamp.
    pub durable: bool,
    /// The backend's timestamp for the object, if reported.
    pub timestamp: Option<Timestamp>,
    /// Open read session, kept only for GET outcomes.
    pub session: Option<Box<dyn Session>>,
}

impl BackendOutcome {
    /// Build an outcome from a reply, extracting the coordination fields.
    pub fn from_reply(node: Node, reply: BackendReply, session: Option<Box<dyn Session>>) -> Self {
        let frag_index = reply
            .get_header(headers::EC_FRAG_INDEX)
            .and_then(|v| v.trim().parse().ok());
        let timestamp = reply.backend_timestamp();
        let durable = match (reply.durable_timestamp(), timestamp) {
            (Some(durable), Some(ts)) => durable >= ts,
            (Some(_), None) => true,
            (None, _) => false,
        };
        Self {
            node,
            status: reply.status,
            headers: reply.headers,
            frag_index,
            durable,
            timestamp,
            session,
        }
    }

    /// Case-insensitive reply-header lookup.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The logical whole-object etag: the erasure-coded system attribute
    /// when present, the plain etag otherwise.
    pub fn logical_etag(&self) -> Option<&str> {
        self.get_header(headers::EC_ETAG)
            .or_else(|| self.get_header(headers::ETAG))
    }

    /// Release the read session, if any.
    pub fn close(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close();
        }
        self.session = None;
    }
}

impl fmt::Debug for BackendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendOutcome")
            .field("node", &self.node)
            .field("status", &self.status)
            .field("frag_index", &self.frag_index)
            .field("durable", &self.durable)
            .field("timestamp", &self.timestamp)
            .field("session", &self.session.is_some())
            .finish()
    }
}
