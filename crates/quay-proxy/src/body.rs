//! The client-body source abstraction for PUT.
//!
//! The transport hosting the client connection lives outside Quay; the
//! controllers consume the request body through [`ClientBody`], a single
//! sequential reader whose failures classify as timeout, disconnect, or
//! other. Each classification maps to a distinct client-facing status.

use async_trait::async_trait;
use bytes::Bytes;

/// Why a client-body read failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientBodyError {
    /// The read exceeded the client read timeout.
    #[error("client read timed out")]
    Timeout,
    /// The client closed the connection.
    #[error("client disconnected")]
    Disconnect,
    /// Any other failure.
    #[error("client read failed: {0}")]
    Other(String),
}

/// Size-bounded sequential reads of the client's request body.
#[async_trait]
pub trait ClientBody: Send {
    /// Read up to `max` bytes. `Ok(None)` signals end of body.
    async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>, ClientBodyError>;
}

/// In-memory client body, with optional injected failure.
///
/// Used by tests and by callers that already buffered the body.
pub struct BytesBody {
    data: Bytes,
    offset: usize,
    fail_at: Option<(usize, ClientBodyError)>,
}

impl BytesBody {
    /// A body that yields `data` and then ends.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
            fail_at: None,
        }
    }

    /// Fail with `error` once `offset` bytes have been read.
    pub fn failing_at(mut self, offset: usize, error: ClientBodyError) -> Self {
        self.fail_at = Some((offset, error));
        self
    }
}

#[async_trait]
impl ClientBody for BytesBody {
    async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>, ClientBodyError> {
        if let Some((at, error)) = &self.fail_at {
            if self.offset >= *at {
                return Err(error.clone());
            }
        }
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        let end = (self.offset + max.max(1)).min(self.data.len());
        let chunk = self.data.slice(self.offset..end);
        self.offset = end;
        Ok(Some(chunk))
    }
}
