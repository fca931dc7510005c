//! Backend request and reply types.
//!
//! Plain data carried over whatever transport hosts the HTTP exchange.
//! Header lookup is case-insensitive, matching HTTP semantics, without
//! pulling a full HTTP stack into the coordination layer.

use std::collections::BTreeMap;

use quay_types::{Status, Timestamp, headers};

/// Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Put,
    Get,
    Head,
    Delete,
}

impl Method {
    /// Wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Put => "PUT",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
        }
    }
}

/// One backend request: method, object path, headers.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Request verb.
    pub method: Method,
    /// Object path (`/device/partition/account/container/object` shape is
    /// the transport's concern; Quay passes the logical object path).
    pub path: String,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Whether a request body follows (drives the interim-continue
    /// expectation).
    pub has_body: bool,
}

impl BackendRequest {
    /// Start a request for a verb and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            has_body: false,
        }
    }

    /// Set a header (builder style).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the object timestamp header.
    pub fn timestamp(self, ts: Timestamp) -> Self {
        self.header(headers::TIMESTAMP, ts.to_string())
    }

    /// Mark that a request body will be streamed.
    pub fn with_body(mut self) -> Self {
        self.has_body = true;
        self
    }

    /// Case-insensitive header lookup.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }
}

/// A backend node's reply: final status plus headers.
#[derive(Debug, Clone)]
pub struct BackendReply {
    /// Final status code.
    pub status: Status,
    /// Reply headers.
    pub headers: BTreeMap<String, String>,
}

impl BackendReply {
    /// Build a reply with no headers.
    pub fn new(status: Status) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }

    /// Parsed `X-Backend-Timestamp`, if present and well-formed.
    pub fn backend_timestamp(&self) -> Option<Timestamp> {
        self.get_header(headers::BACKEND_TIMESTAMP)?.parse().ok()
    }

    /// Parsed `X-Backend-Durable-Timestamp`, if present and well-formed.
    pub fn durable_timestamp(&self) -> Option<Timestamp> {
        self.get_header(headers::BACKEND_DURABLE_TIMESTAMP)?
            .parse()
            .ok()
    }
}

fn lookup<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
