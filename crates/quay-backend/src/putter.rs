//! The per-node write state machine.
//!
//! One [`Putter`] drives one backend connection through
//! `INIT → CONNECTING → EXPECT_WAIT → TRANSFERRING → AWAITING_FINAL → DONE`,
//! with any state able to fall into `FAILED`. A putter is created for one
//! request and never reused; the controller closes it on every exit path.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use quay_types::Node;
use tokio::time::timeout;
use tracing::debug;

use crate::error::BackendError;
use crate::mime::{DOC_OBJECT_BODY, DOC_OBJECT_METADATA, DOC_PUT_COMMIT, MimeWriter};
use crate::request::{BackendReply, BackendRequest};
use crate::transport::{Connector, Interim, Session};

/// Where the putter is in its per-request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutterPhase {
    Init,
    Connecting,
    ExpectWait,
    Transferring,
    AwaitingFinal,
    Done,
    Failed,
}

/// One node's write session for one request.
pub struct Putter {
    node: Node,
    session: Box<dyn Session>,
    phase: PutterPhase,
    node_timeout: Duration,
    /// Envelope writer when footers/commit are negotiated; `None` sends the
    /// raw body unmodified.
    mime: Option<MimeWriter>,
    body_opened: bool,
    terminated: bool,
    bytes_sent: u64,
    /// Final status delivered during EXPECT_WAIT; treated as the node's
    /// answer, transfer skipped.
    early_reply: Option<BackendReply>,
}

impl Putter {
    /// Open a connection and resolve the interim-continue expectation.
    ///
    /// Returns a putter ready for [`Putter::send_chunk`], or a putter whose
    /// [`Putter::answered_early`] reply is already known. Errors map to the
    /// phase they occurred in (connect vs expect).
    pub async fn connect(
        connector: &dyn Connector,
        node: Node,
        request: &BackendRequest,
        connect_timeout: Duration,
        node_timeout: Duration,
        mime: Option<MimeWriter>,
    ) -> Result<Putter, BackendError> {
        let session = match timeout(connect_timeout, connector.connect(&node, request)).await {
            Ok(result) => result?,
            Err(_) => return Err(BackendError::ConnectTimeout),
        };

        let mut putter = Putter {
            node,
            session,
            phase: PutterPhase::Connecting,
            node_timeout,
            mime,
            body_opened: false,
            terminated: false,
            bytes_sent: 0,
            early_reply: None,
        };

        if request.has_body {
            putter.phase = PutterPhase::ExpectWait;
            match timeout(node_timeout, putter.session.await_interim()).await {
                Ok(Ok(Interim::Continue)) => {
                    putter.phase = PutterPhase::Transferring;
                }
                Ok(Ok(Interim::Final(reply))) => {
                    debug!(node = %putter.node, status = %reply.status,
                           "final status during expect, skipping transfer");
                    putter.early_reply = Some(reply);
                    putter.phase = PutterPhase::Done;
                }
                Ok(Err(e)) => {
                    putter.session.close();
                    return Err(e);
                }
                Err(_) => {
                    putter.session.close();
                    return Err(BackendError::ExpectTimeout);
                }
            }
        } else {
            putter.phase = PutterPhase::Transferring;
        }

        Ok(putter)
    }

    /// The node this putter writes to.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> PutterPhase {
        self.phase
    }

    /// Object-body bytes handed to this session so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// The final status delivered during EXPECT_WAIT, if any.
    pub fn answered_early(&self) -> Option<&BackendReply> {
        self.early_reply.as_ref()
    }

    /// Stream one chunk of object body.
    ///
    /// No-op when the node already answered; the chunk still counts as
    /// consumed from the client's perspective.
    pub async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), BackendError> {
        if self.early_reply.is_some() {
            return Ok(());
        }
        self.open_body().await?;
        let len = chunk.len() as u64;
        self.session.send(chunk).await?;
        self.bytes_sent += len;
        Ok(())
    }

    /// Send the footer document (section 2 of the envelope).
    ///
    /// The footer map always includes the object etag and container-update
    /// override fields; the caller's footers-callback has already run.
    pub async fn send_footers(
        &mut self,
        footers: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        if self.early_reply.is_some() {
            return Ok(());
        }
        if self.mime.is_none() {
            return Err(BackendError::Send(
                "footers require a multipart envelope".to_string(),
            ));
        }
        // Zero-byte object: the body section still leads the envelope.
        self.open_body().await?;
        let json = serde_json::to_vec(footers).map_err(|e| BackendError::Send(e.to_string()))?;
        let part = self
            .mime
            .as_mut()
            .expect("checked")
            .part(DOC_OBJECT_METADATA, &[], &json);
        self.session.send(part).await?;
        Ok(())
    }

    /// Wait for this node to acknowledge the footer document (erasure-coded
    /// PUT only).
    ///
    /// Returns whether the node acknowledged. A final status here is taken
    /// as the node's answer; it does not count as an acknowledgment and the
    /// node must not receive a commit marker.
    pub async fn await_footer_ack(&mut self) -> Result<bool, BackendError> {
        if self.early_reply.is_some() {
            return Ok(false);
        }
        match timeout(self.node_timeout, self.session.await_interim()).await {
            Ok(Ok(Interim::Continue)) => Ok(true),
            Ok(Ok(Interim::Final(reply))) => {
                debug!(node = %self.node, status = %reply.status,
                       "final status instead of footer ack");
                self.early_reply = Some(reply);
                self.phase = PutterPhase::Done;
                Ok(false)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::FinalStatusTimeout),
        }
    }

    /// Send the commit marker (erasure-coded PUT only).
    ///
    /// The caller must first collect a quorum of [`Putter::await_footer_ack`]
    /// acknowledgments across all contacted nodes; a marker sent earlier
    /// could make a fragment of a failing write durable.
    pub async fn send_commit(&mut self) -> Result<(), BackendError> {
        if self.early_reply.is_some() {
            return Ok(());
        }
        if self.mime.is_none() {
            return Err(BackendError::Send(
                "commit requires a multipart envelope".to_string(),
            ));
        }
        let part = self.mime.as_mut().expect("checked").part(DOC_PUT_COMMIT, &[], b"");
        self.session.send(part).await?;
        Ok(())
    }

    /// Finish the body and wait up to `wait` for the node's final status.
    ///
    /// `wait` is `node_timeout` normally, or `post_quorum_timeout` once the
    /// request has already been decided and this node is a straggler.
    pub async fn await_response(&mut self, wait: Duration) -> Result<BackendReply, BackendError> {
        if let Some(reply) = self.early_reply.clone() {
            self.phase = PutterPhase::Done;
            return Ok(reply);
        }

        if self.mime.is_some() && !self.terminated {
            let term = self.mime.as_mut().expect("checked").terminator();
            self.session.send(term).await?;
            self.terminated = true;
        }

        self.phase = PutterPhase::AwaitingFinal;
        match timeout(wait, self.session.finish()).await {
            Ok(Ok(reply)) => {
                self.phase = PutterPhase::Done;
                Ok(reply)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::FinalStatusTimeout),
        }
    }

    /// Open the envelope's body section if one is in use.
    async fn open_body(&mut self) -> Result<(), BackendError> {
        if self.mime.is_some() && !self.body_opened {
            let head = self
                .mime
                .as_mut()
                .expect("checked")
                .part_head(DOC_OBJECT_BODY, &[]);
            self.session.send(head).await?;
            self.body_opened = true;
        }
        Ok(())
    }

    /// Mark the putter failed and release its connection.
    pub fn fail(&mut self) {
        self.phase = PutterPhase::Failed;
        self.session.close();
    }

    /// Release the connection without changing the recorded outcome.
    pub fn close(&mut self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use quay_types::Status;

    use crate::mock::{MockConnector, MockScript};
    use crate::request::Method;

    use super::*;

    fn node() -> Node {
        Node {
            ip: "10.0.0.1".to_string(),
            port: 6200,
            device: "sda1".to_string(),
            region: 1,
            zone: 1,
            index: 0,
        }
    }

    fn put_request() -> BackendRequest {
        BackendRequest::new(Method::Put, "/a/c/o").with_body()
    }

    const CONNECT: Duration = Duration::from_millis(100);
    const NODE: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_put_without_envelope_sends_raw_body() {
        let connector = MockConnector::new();
        connector.script(&node(), MockScript::put(Status::CREATED));

        let mut putter = Putter::connect(&connector, node(), &put_request(), CONNECT, NODE, None)
            .await
            .unwrap();
        assert_eq!(putter.phase(), PutterPhase::Transferring);

        putter.send_chunk(Bytes::from_static(b"hello ")).await.unwrap();
        putter.send_chunk(Bytes::from_static(b"world")).await.unwrap();
        let reply = putter.await_response(NODE).await.unwrap();
        assert_eq!(reply.status, Status::CREATED);
        assert_eq!(putter.bytes_sent(), 11);

        let captured = connector.captured();
        assert_eq!(captured[0].body, b"hello world");
    }

    #[tokio::test]
    async fn test_put_with_envelope_wraps_body_and_footers() {
        let connector = MockConnector::new();
        connector.script(&node(), MockScript::put(Status::CREATED));

        let mime = MimeWriter::new("bnd");
        let mut putter =
            Putter::connect(&connector, node(), &put_request(), CONNECT, NODE, Some(mime))
                .await
                .unwrap();

        putter.send_chunk(Bytes::from_static(b"payload")).await.unwrap();
        let mut footers = BTreeMap::new();
        footers.insert("Etag".to_string(), "abc123".to_string());
        putter.send_footers(&footers).await.unwrap();
        putter.await_response(NODE).await.unwrap();

        let captured = connector.captured();
        let parts = crate::mime::parse_mime(&captured[0].body, "bnd").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].doc, DOC_OBJECT_BODY);
        assert_eq!(parts[0].body, b"payload");
        assert_eq!(parts[1].doc, DOC_OBJECT_METADATA);
        let meta: BTreeMap<String, String> = serde_json::from_slice(&parts[1].body).unwrap();
        assert_eq!(meta.get("Etag").map(String::as_str), Some("abc123"));
    }

    #[tokio::test]
    async fn test_early_final_status_skips_transfer() {
        let connector = MockConnector::new();
        connector.script(&node(), MockScript::put(Status::CREATED).expect_final(Status::CONFLICT));

        let mut putter = Putter::connect(&connector, node(), &put_request(), CONNECT, NODE, None)
            .await
            .unwrap();
        assert_eq!(putter.phase(), PutterPhase::Done);
        assert_eq!(
            putter.answered_early().map(|r| r.status),
            Some(Status::CONFLICT)
        );

        // Chunks are swallowed, and the early reply is the answer.
        putter.send_chunk(Bytes::from_static(b"ignored")).await.unwrap();
        let reply = putter.await_response(NODE).await.unwrap();
        assert_eq!(reply.status, Status::CONFLICT);
        assert_eq!(putter.bytes_sent(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_connect_error() {
        let connector = MockConnector::new();
        connector.script(&node(), MockScript::put(Status::CREATED).refuse_connect());

        let result = Putter::connect(&connector, node(), &put_request(), CONNECT, NODE, None).await;
        assert!(matches!(result, Err(BackendError::Connect(_))));
    }

    #[tokio::test]
    async fn test_expect_timeout() {
        let connector = MockConnector::new();
        connector.script(
            &node(),
            MockScript::put(Status::CREATED).stall_interim(Duration::from_secs(5)),
        );

        let result = Putter::connect(&connector, node(), &put_request(), CONNECT, NODE, None).await;
        assert!(matches!(result, Err(BackendError::ExpectTimeout)));
    }

    #[tokio::test]
    async fn test_commit_marker_after_footer_ack() {
        let connector = MockConnector::new();
        connector.script(&node(), MockScript::put(Status::CREATED));

        let mime = MimeWriter::new("ec");
        let mut putter =
            Putter::connect(&connector, node(), &put_request(), CONNECT, NODE, Some(mime))
                .await
                .unwrap();
        putter.send_chunk(Bytes::from_static(b"frag")).await.unwrap();
        putter.send_footers(&BTreeMap::new()).await.unwrap();
        assert!(putter.await_footer_ack().await.unwrap());
        putter.send_commit().await.unwrap();
        let reply = putter.await_response(NODE).await.unwrap();
        assert_eq!(reply.status, Status::CREATED);

        let captured = connector.captured();
        let docs: Vec<String> = crate::mime::parse_mime(&captured[0].body, "ec")
            .unwrap()
            .into_iter()
            .map(|p| p.doc)
            .collect();
        assert_eq!(docs, vec![DOC_OBJECT_BODY, DOC_OBJECT_METADATA, DOC_PUT_COMMIT]);
    }

    #[tokio::test]
    async fn test_final_status_instead_of_footer_ack_is_not_acknowledged() {
        let connector = MockConnector::new();
        connector.script(
            &node(),
            MockScript::put(Status::CREATED).commit_final(Status::SERVICE_UNAVAILABLE),
        );

        let mime = MimeWriter::new("na");
        let mut putter =
            Putter::connect(&connector, node(), &put_request(), CONNECT, NODE, Some(mime))
                .await
                .unwrap();
        putter.send_chunk(Bytes::from_static(b"frag")).await.unwrap();
        putter.send_footers(&BTreeMap::new()).await.unwrap();

        assert!(!putter.await_footer_ack().await.unwrap());
        assert_eq!(
            putter.answered_early().map(|r| r.status),
            Some(Status::SERVICE_UNAVAILABLE)
        );
        // The recorded answer makes the commit a no-op; nothing else is sent.
        putter.send_commit().await.unwrap();
        let reply = putter.await_response(NODE).await.unwrap();
        assert_eq!(reply.status, Status::SERVICE_UNAVAILABLE);
        putter.close();

        let captured = connector.captured();
        let body = String::from_utf8_lossy(&captured[0].body);
        assert!(!body.contains(DOC_PUT_COMMIT));
    }

    #[tokio::test]
    async fn test_zero_byte_object_with_footers_still_has_body_part() {
        let connector = MockConnector::new();
        connector.script(&node(), MockScript::put(Status::CREATED));

        let mime = MimeWriter::new("z");
        let mut putter =
            Putter::connect(&connector, node(), &put_request(), CONNECT, NODE, Some(mime))
                .await
                .unwrap();
        putter.send_footers(&BTreeMap::new()).await.unwrap();
        putter.await_response(NODE).await.unwrap();

        let captured = connector.captured();
        let parts = crate::mime::parse_mime(&captured[0].body, "z").unwrap();
        assert_eq!(parts[0].doc, DOC_OBJECT_BODY);
        assert!(parts[0].body.is_empty());
        assert_eq!(parts[1].doc, DOC_OBJECT_METADATA);
    }
}
