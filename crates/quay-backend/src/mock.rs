//! Scripted in-memory backend for tests.
//!
//! Each node gets a queue of [`MockScript`]s describing how its next
//! exchange behaves: interim signals, final status, reply headers, response
//! body, and injected stalls or failures. Every byte the coordination layer
//! sends is captured for assertions on the wire layout.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use quay_types::{Node, NodeKey, Status};

use crate::error::BackendError;
use crate::request::{BackendReply, BackendRequest};
use crate::transport::{Connector, Interim, Session};

/// Scripted behavior for one backend exchange.
#[derive(Debug, Clone)]
pub struct MockScript {
    final_status: Status,
    reply_headers: BTreeMap<String, String>,
    body: Bytes,
    chunk_size: usize,
    refuse_connect: bool,
    connect_stall: Option<Duration>,
    /// Early final status returned instead of 100-continue.
    expect_final: Option<Status>,
    interim_stall: Option<Duration>,
    /// Final status returned instead of the footer acknowledgment.
    commit_final: Option<Status>,
    commit_stall: Option<Duration>,
    final_stall: Option<Duration>,
    /// Fail sends after this many captured bytes.
    fail_send_after: Option<u64>,
    /// Stall the body chunk at this index.
    stall_chunk_at: Option<(usize, Duration)>,
}

impl MockScript {
    /// A write exchange: continue, accept the body, answer `status`.
    pub fn put(status: Status) -> Self {
        Self {
            final_status: status,
            reply_headers: BTreeMap::new(),
            body: Bytes::new(),
            chunk_size: 4096,
            refuse_connect: false,
            connect_stall: None,
            expect_final: None,
            interim_stall: None,
            commit_final: None,
            commit_stall: None,
            final_stall: None,
            fail_send_after: None,
            stall_chunk_at: None,
        }
    }

    /// A read exchange: answer `status` and stream `body`.
    pub fn get(status: Status, body: impl Into<Bytes>) -> Self {
        let mut script = Self::put(status);
        script.body = body.into();
        script
    }

    /// Add a reply header.
    pub fn reply_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.reply_headers.insert(name.into(), value.into());
        self
    }

    /// Stream the response body in chunks of `size`.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Refuse the connection outright.
    pub fn refuse_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Delay connection establishment.
    pub fn stall_connect(mut self, d: Duration) -> Self {
        self.connect_stall = Some(d);
        self
    }

    /// Answer the expect phase with a final status instead of continue.
    pub fn expect_final(mut self, status: Status) -> Self {
        self.expect_final = Some(status);
        self
    }

    /// Delay the first interim signal.
    pub fn stall_interim(mut self, d: Duration) -> Self {
        self.interim_stall = Some(d);
        self
    }

    /// Answer the footer-acknowledgment phase with a final status.
    pub fn commit_final(mut self, status: Status) -> Self {
        self.commit_final = Some(status);
        self
    }

    /// Delay the footer acknowledgment.
    pub fn stall_commit_ack(mut self, d: Duration) -> Self {
        self.commit_stall = Some(d);
        self
    }

    /// Delay the final status.
    pub fn stall_final(mut self, d: Duration) -> Self {
        self.final_stall = Some(d);
        self
    }

    /// Fail body sends once this many bytes have been accepted.
    pub fn fail_send_after(mut self, bytes: u64) -> Self {
        self.fail_send_after = Some(bytes);
        self
    }

    /// Stall the response-body chunk at `index` for `d`.
    pub fn stall_chunk_at(mut self, index: usize, d: Duration) -> Self {
        self.stall_chunk_at = Some((index, d));
        self
    }

    fn reply(&self) -> BackendReply {
        BackendReply {
            status: self.final_status,
            headers: self.reply_headers.clone(),
        }
    }

    fn reply_with(&self, status: Status) -> BackendReply {
        BackendReply {
            status,
            headers: self.reply_headers.clone(),
        }
    }
}

/// One captured exchange: the request head plus every body byte sent.
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    /// Target node.
    pub node: Node,
    /// Request head as handed to the connector.
    pub request: BackendRequest,
    /// Raw request body bytes (envelope included when one was used).
    pub body: Vec<u8>,
}

#[derive(Default)]
struct Shared {
    scripts: HashMap<NodeKey, VecDeque<MockScript>>,
    captured: Vec<CapturedExchange>,
}

/// Scripted connector handing out [`MockSession`]s.
#[derive(Clone, Default)]
pub struct MockConnector {
    shared: Arc<Mutex<Shared>>,
}

impl MockConnector {
    /// Create an empty connector; unscripted nodes refuse connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for a node. Scripts are consumed in FIFO order.
    pub fn script(&self, node: &Node, script: MockScript) {
        let mut shared = self.shared.lock().expect("mock lock poisoned");
        shared.scripts.entry(node.key()).or_default().push_back(script);
    }

    /// All captured exchanges so far, in completion order.
    pub fn captured(&self) -> Vec<CapturedExchange> {
        self.shared.lock().expect("mock lock poisoned").captured.clone()
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        node: &Node,
        request: &BackendRequest,
    ) -> Result<Box<dyn Session>, BackendError> {
        let script = {
            let mut shared = self.shared.lock().expect("mock lock poisoned");
            shared
                .scripts
                .get_mut(&node.key())
                .and_then(|q| q.pop_front())
        };
        let Some(script) = script else {
            return Err(BackendError::Connect(format!("no script for {node}")));
        };

        if let Some(d) = script.connect_stall {
            tokio::time::sleep(d).await;
        }
        if script.refuse_connect {
            return Err(BackendError::Connect("connection refused".to_string()));
        }

        Ok(Box::new(MockSession {
            shared: Arc::clone(&self.shared),
            node: node.clone(),
            request: request.clone(),
            script,
            sent: Vec::new(),
            interim_calls: 0,
            read_offset: 0,
            chunk_index: 0,
            captured: false,
            closed: false,
        }))
    }
}

/// Session produced by [`MockConnector`].
pub struct MockSession {
    shared: Arc<Mutex<Shared>>,
    node: Node,
    request: BackendRequest,
    script: MockScript,
    sent: Vec<u8>,
    interim_calls: u32,
    read_offset: usize,
    chunk_index: usize,
    captured: bool,
    closed: bool,
}

impl MockSession {
    fn capture(&mut self) {
        if self.captured {
            return;
        }
        self.captured = true;
        let mut shared = self.shared.lock().expect("mock lock poisoned");
        shared.captured.push(CapturedExchange {
            node: self.node.clone(),
            request: self.request.clone(),
            body: std::mem::take(&mut self.sent),
        });
    }
}

#[async_trait::async_trait]
impl Session for MockSession {
    async fn await_interim(&mut self) -> Result<Interim, BackendError> {
        self.interim_calls += 1;
        if self.interim_calls == 1 {
            if let Some(d) = self.script.interim_stall {
                tokio::time::sleep(d).await;
            }
            match self.script.expect_final {
                Some(status) => Ok(Interim::Final(self.script.reply_with(status))),
                None => Ok(Interim::Continue),
            }
        } else {
            if let Some(d) = self.script.commit_stall {
                tokio::time::sleep(d).await;
            }
            match self.script.commit_final {
                Some(status) => Ok(Interim::Final(self.script.reply_with(status))),
                None => Ok(Interim::Continue),
            }
        }
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        if let Some(limit) = self.script.fail_send_after {
            if self.sent.len() as u64 + chunk.len() as u64 > limit {
                return Err(BackendError::Send("broken pipe".to_string()));
            }
        }
        self.sent.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<BackendReply, BackendError> {
        if let Some(d) = self.script.final_stall {
            tokio::time::sleep(d).await;
        }
        self.capture();
        Ok(self.script.reply())
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>, BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        if self.read_offset >= self.script.body.len() {
            return Ok(None);
        }
        if let Some((index, d)) = self.script.stall_chunk_at {
            if self.chunk_index == index {
                tokio::time::sleep(d).await;
            }
        }
        let end = (self.read_offset + self.script.chunk_size).min(self.script.body.len());
        let chunk = self.script.body.slice(self.read_offset..end);
        self.read_offset = end;
        self.chunk_index += 1;
        Ok(Some(chunk))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.capture();
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.close();
    }
}
