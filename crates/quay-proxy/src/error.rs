//! Coordination-layer error taxonomy and client-status mapping.

use quay_types::Status;

/// Request-fatal errors.
///
/// Single-node failures never appear here; they are recovered locally by
/// dropping the node and moving to the next candidate. These variants are
/// what remains when the request as a whole cannot succeed, and each maps
/// to one client-facing status.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// PUT without a declared content length or chunked framing.
    #[error("content length required")]
    LengthRequired,

    /// A malformed conditional or expiration header.
    #[error("invalid {name} header: {reason}")]
    InvalidHeader {
        name: &'static str,
        reason: String,
    },

    /// The computed content digest does not match the client-declared etag.
    #[error("etag mismatch: computed {computed}, declared {declared}")]
    EtagMismatch { computed: String, declared: String },

    /// The client went away mid-transfer.
    #[error("client disconnected during transfer")]
    ClientDisconnect,

    /// Reading the client body exceeded the read timeout.
    #[error("timed out reading client body")]
    ClientReadTimeout,

    /// The client body source failed for any other reason.
    #[error("client body read failed: {0}")]
    ClientBody(String),

    /// Fragment reconstruction failed; fatal, never retried.
    #[error("fragment decode failed: {0}")]
    Decode(#[from] quay_erasure::ErasureError),

    /// Too few backend successes to reach quorum or readability.
    #[error("not enough backend successes")]
    ServiceUnavailable,

    /// Anything else; surfaces as a 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// The status this error surfaces as.
    pub fn client_status(&self) -> Status {
        match self {
            ProxyError::LengthRequired => Status::LENGTH_REQUIRED,
            ProxyError::InvalidHeader { .. } => Status::BAD_REQUEST,
            ProxyError::EtagMismatch { .. } => Status::UNPROCESSABLE_ENTITY,
            ProxyError::ClientDisconnect => Status::CLIENT_CLOSED_REQUEST,
            ProxyError::ClientReadTimeout => Status::REQUEST_TIMEOUT,
            ProxyError::ClientBody(_) => Status::INTERNAL_SERVER_ERROR,
            ProxyError::Decode(_) => Status::INTERNAL_SERVER_ERROR,
            ProxyError::ServiceUnavailable => Status::SERVICE_UNAVAILABLE,
            ProxyError::Internal(_) => Status::INTERNAL_SERVER_ERROR,
        }
    }
}
