//! The backend transport seam.
//!
//! Controllers and putters depend on these traits instead of a concrete
//! HTTP client, so the coordination engine is testable against the scripted
//! [`mock`](crate::mock) connector. Timeouts are the caller's concern: each
//! phase wraps the await in its own `tokio::time::timeout` (connect /
//! node / recoverable-chunk), mapping elapse to the matching
//! [`BackendError`](crate::BackendError) variant.

use bytes::Bytes;
use quay_types::Node;

use crate::error::BackendError;
use crate::request::{BackendReply, BackendRequest};

/// What the backend said in response to the request headers.
#[derive(Debug, Clone)]
pub enum Interim {
    /// 100-continue: proceed with the body (or the next commit phase).
    Continue,
    /// A final status arrived instead; it is the node's answer and any
    /// remaining transfer is skipped.
    Final(BackendReply),
}

/// Opens one backend exchange per request per node.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `node` and send the request head.
    ///
    /// Resolution of the interim/final status happens on the returned
    /// session; this only establishes the exchange.
    async fn connect(
        &self,
        node: &Node,
        request: &BackendRequest,
    ) -> Result<Box<dyn Session>, BackendError>;
}

/// One in-flight backend exchange.
///
/// Implementations release the underlying connection on [`Session::close`]
/// and on drop; the coordination layer closes every session on every exit
/// path.
#[async_trait::async_trait]
pub trait Session: Send {
    /// Wait for the next interim signal (100-continue or an early final
    /// status). Called once before the body and, for multi-phase commit,
    /// again after the footer part.
    async fn await_interim(&mut self) -> Result<Interim, BackendError>;

    /// Stream one chunk of request body.
    async fn send(&mut self, chunk: Bytes) -> Result<(), BackendError>;

    /// Signal end of the request body and wait for the final status.
    async fn finish(&mut self) -> Result<BackendReply, BackendError>;

    /// Read the next chunk of the response body. `None` at end of body.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, BackendError>;

    /// Abort the exchange and release the connection.
    fn close(&mut self);
}
