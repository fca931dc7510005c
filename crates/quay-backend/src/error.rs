//! Backend connection error taxonomy.

/// Errors from one backend node's connection.
///
/// All of these are recoverable at the request level: the failing node is
/// dropped and error-limited while the candidate iterator moves on. They
/// only become fatal when too few nodes remain to reach quorum or
/// readability.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// TCP-level connect refused or failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Connect did not complete within `connect_timeout`.
    #[error("timed out connecting")]
    ConnectTimeout,

    /// No interim status arrived within `node_timeout`.
    #[error("timed out waiting for continue")]
    ExpectTimeout,

    /// Sending request body bytes failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading from the backend failed.
    #[error("receive failed: {0}")]
    Recv(String),

    /// No final status arrived within `node_timeout`.
    #[error("timed out awaiting final status")]
    FinalStatusTimeout,

    /// A response-body chunk read exceeded `recoverable_node_timeout`.
    #[error("timed out reading response chunk")]
    ChunkReadTimeout,

    /// The backend closed the connection mid-exchange.
    #[error("connection closed by backend")]
    Closed,
}
