//! Per-verb orchestration: the controllers that turn one client request
//! into many backend exchanges and one response.
//!
//! Two strategy variants share the same toolkit: [`ReplicatedController`]
//! fans whole copies out and resolves them by quorum; [`EcController`] adds
//! fragment encoding, the multi-phase durable commit for PUT, and the
//! fragment search/decode for GET. [`controller_for`] picks the variant from
//! the storage policy, once per request.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use quay_backend::{
    BackendError, BackendReply, BackendRequest, Connector, Method, MimeWriter, Putter, Session,
    random_boundary,
};
use quay_erasure::{Fragment, FragmentEncoder, decode_segment, fragment_size};
use quay_placement::{AffinityPolicy, ErrorKind, ErrorLimiter, NodeIter, Ring};
use quay_types::{Node, Status, StoragePolicy, Timestamp, headers};
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::body::{ClientBody, ClientBodyError};
use crate::conditional::{self, ConditionalResult};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::expiry;
use crate::outcome::BackendOutcome;
use crate::quorum::{Decision, QuorumResolver};
use crate::range::{self, ByteRange};
use crate::reconstruct::{
    Feed, FragmentBucket, FragmentReconstructor, FragmentSource, PreferenceHint,
};

/// Mutates the footer map before it is sent (e.g. container-update
/// overrides computed by an outer layer).
pub type FootersCallback = dyn Fn(&mut BTreeMap<String, String>) + Send + Sync;

/// One client request as seen by the coordination layer.
#[derive(Debug, Clone)]
pub struct ObjectRequest {
    /// Logical object path (`/account/container/object`).
    pub path: String,
    /// Client request headers.
    pub headers: BTreeMap<String, String>,
    /// The operation's timestamp.
    pub timestamp: Timestamp,
    /// Short hex id tagging every log line for this request.
    pub trace_id: String,
}

impl ObjectRequest {
    /// A request with a fresh trace id and no headers.
    pub fn new(path: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            path: path.into(),
            headers: BTreeMap::new(),
            timestamp,
            trace_id: new_trace_id(),
        }
    }

    /// Set a header (builder style).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Generate a request trace id.
pub fn new_trace_id() -> String {
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).expect("hex digit")
        })
        .collect()
}

/// The single client-facing response a request resolves to.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    /// Final status.
    pub status: Status,
    /// Response headers; copied verbatim from one representative backend
    /// outcome, never merged across nodes.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: Bytes,
}

impl ClientResponse {
    /// A bodyless, headerless response.
    pub fn empty(status: Status) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    fn with_headers(status: Status, headers: BTreeMap<String, String>) -> Self {
        Self {
            status,
            headers,
            body: Bytes::new(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Per-verb strategy interface, selected once per request from the storage
/// policy.
#[async_trait]
pub trait ObjectController: Send + Sync {
    /// Store an object.
    async fn put(
        &self,
        req: &ObjectRequest,
        body: &mut dyn ClientBody,
        footers: Option<&FootersCallback>,
    ) -> ClientResponse;

    /// Fetch an object.
    async fn get(&self, req: &ObjectRequest) -> ClientResponse;

    /// Fetch an object's metadata.
    async fn head(&self, req: &ObjectRequest) -> ClientResponse;

    /// Delete an object.
    async fn delete(&self, req: &ObjectRequest) -> ClientResponse;
}

/// Build the controller variant for a storage policy.
pub fn controller_for(
    policy: StoragePolicy,
    policy_index: u32,
    ring: Arc<dyn Ring>,
    connector: Arc<dyn Connector>,
    limiter: Arc<ErrorLimiter>,
    config: ProxyConfig,
) -> Box<dyn ObjectController> {
    let engine = Engine {
        policy,
        policy_index,
        ring,
        connector,
        limiter,
        config,
    };
    if policy.is_ec() {
        Box::new(EcController { engine })
    } else {
        Box::new(ReplicatedController { engine })
    }
}

// ---------------------------------------------------------------------------
// Shared engine
// ---------------------------------------------------------------------------

/// State and helpers shared by both controller variants.
#[derive(Clone)]
struct Engine {
    policy: StoragePolicy,
    policy_index: u32,
    ring: Arc<dyn Ring>,
    connector: Arc<dyn Connector>,
    limiter: Arc<ErrorLimiter>,
    config: ProxyConfig,
}

/// Validated, normalized PUT inputs.
struct PutPrelude {
    /// Client headers with expiry converted and bookkeeping attached.
    headers: BTreeMap<String, String>,
    /// Declared content length, `None` under chunked framing.
    declared_length: Option<u64>,
    /// Client-declared etag to verify the received body against.
    declared_etag: Option<String>,
}

impl Engine {
    /// The ordered candidate list for one request.
    fn candidates(&self, path: &str, affinity: Option<&AffinityPolicy>) -> Vec<Node> {
        let partition = self.ring.partition(path);
        let primaries = self.ring.primary_nodes(partition);
        let handoffs = self.ring.handoff_nodes(partition);
        let cap = self.policy.node_cap_with(self.config.handoff_multiplier());
        NodeIter::new(
            primaries,
            handoffs,
            &self.limiter,
            affinity,
            cap,
            self.policy.quorum_size(),
        )
        .collect()
    }

    /// A backend request carrying the client headers plus the coordination
    /// headers every exchange needs.
    fn request_template(
        &self,
        method: Method,
        req: &ObjectRequest,
        client_headers: &BTreeMap<String, String>,
    ) -> BackendRequest {
        let mut request = BackendRequest::new(method, &req.path);
        request.headers = client_headers.clone();
        request
            .timestamp(req.timestamp)
            .header(headers::STORAGE_POLICY_INDEX, self.policy_index.to_string())
    }

    /// Record one node failure: error-limit it and log once.
    fn record_failure(&self, req: &ObjectRequest, node: &Node, error: &BackendError) {
        let kind = match error {
            BackendError::Connect(_) | BackendError::ConnectTimeout => ErrorKind::Connect,
            BackendError::ExpectTimeout => ErrorKind::Expect,
            BackendError::Send(_)
            | BackendError::Recv(_)
            | BackendError::Closed
            | BackendError::ChunkReadTimeout => ErrorKind::Transfer,
            BackendError::FinalStatusTimeout => ErrorKind::FinalStatus,
        };
        self.limiter.record(node, kind);
        warn!(
            trace = %req.trace_id,
            path = %req.path,
            node = %node,
            error = %error,
            "backend node failed"
        );
    }

    /// A backend reporting its device unreachable is suppressed outright
    /// and never surfaced to the client.
    fn record_device_unavailable(&self, req: &ObjectRequest, node: &Node) {
        self.limiter.record(node, ErrorKind::DeviceUnavailable);
        warn!(
            trace = %req.trace_id,
            path = %req.path,
            node = %node,
            "backend device unavailable, node suppressed"
        );
    }

    /// Validate and normalize a PUT before any backend is contacted.
    fn put_prelude(&self, req: &ObjectRequest) -> Result<PutPrelude, ProxyError> {
        let declared_length = match req.get_header(headers::CONTENT_LENGTH) {
            Some(value) => Some(value.trim().parse().map_err(|_| ProxyError::InvalidHeader {
                name: "Content-Length",
                reason: format!("not a non-negative integer: {value:?}"),
            })?),
            None => {
                let chunked = req
                    .get_header(headers::TRANSFER_ENCODING)
                    .map(|v| v.to_ascii_lowercase().contains("chunked"))
                    .unwrap_or(false);
                if !chunked {
                    return Err(ProxyError::LengthRequired);
                }
                None
            }
        };

        conditional::validate_put_conditionals(&req.headers)?;

        let mut headers = req.headers.clone();
        if let Some(delete_at) = expiry::normalize(&mut headers, req.timestamp)? {
            for (name, value) in expiry::bookkeeping_headers(delete_at, Some(self.ring.as_ref()))
            {
                headers.insert(name, value);
            }
        }

        let declared_etag = req
            .get_header(headers::ETAG)
            .map(|v| v.trim_matches('"').to_string());

        Ok(PutPrelude {
            headers,
            declared_length,
            declared_etag,
        })
    }

    /// Fan a bodyless request out to the candidates and resolve by quorum.
    async fn quorum_fan_out(&self, req: &ObjectRequest, method: Method) -> ClientResponse {
        let quorum = self.policy.quorum_size();
        let mut resolver = QuorumResolver::new(quorum, Some(req.timestamp));
        let mut candidates = self.candidates(&req.path, None).into_iter();
        let template = self.request_template(method, req, &req.headers);
        let connect_t = self.config.connect_timeout();
        let node_t = self.config.node_timeout();

        let mut join = JoinSet::new();
        let mut active = 0;
        let mut spawn_next = |join: &mut JoinSet<_>, active: &mut usize| {
            if let Some(node) = candidates.next() {
                let connector = Arc::clone(&self.connector);
                let request = template.clone();
                join.spawn(async move {
                    simple_exchange(connector, node, request, connect_t, node_t).await
                });
                *active += 1;
            }
        };
        for _ in 0..self.policy.replica_count() {
            spawn_next(&mut join, &mut active);
        }

        let mut decision = None;
        while active > 0 {
            let Some(joined) = join.join_next().await else {
                break;
            };
            active -= 1;
            let Ok((node, result)) = joined else { continue };
            match result {
                Ok(reply) if reply.status == Status::INSUFFICIENT_STORAGE => {
                    self.record_device_unavailable(req, &node);
                    spawn_next(&mut join, &mut active);
                }
                Ok(reply) => {
                    if let Some(d) = resolver.add(BackendOutcome::from_reply(node, reply, None)) {
                        decision = Some(d);
                        break;
                    }
                }
                Err(error) => {
                    self.record_failure(req, &node, &error);
                    spawn_next(&mut join, &mut active);
                }
            }
        }
        join.abort_all();

        let decision = decision.unwrap_or_else(|| resolver.finish());
        respond(decision, resolver)
    }

    /// Await every putter's final status and resolve by quorum.
    ///
    /// Once a decision lands, stragglers get only the post-quorum grace and
    /// their eventual result is ignored.
    async fn collect_put_responses(
        &self,
        req: &ObjectRequest,
        putters: Vec<Putter>,
        quorum: usize,
    ) -> ClientResponse {
        let mut resolver = QuorumResolver::new(quorum, Some(req.timestamp));
        let node_t = self.config.node_timeout();

        let mut join = JoinSet::new();
        for mut putter in putters {
            join.spawn(async move {
                let node = putter.node().clone();
                let result = putter.await_response(node_t).await;
                match &result {
                    Ok(_) => putter.close(),
                    Err(_) => putter.fail(),
                }
                (node, result)
            });
        }

        let mut decision = None;
        while let Some(joined) = join.join_next().await {
            let Ok((node, result)) = joined else { continue };
            match result {
                Ok(reply) if reply.status == Status::INSUFFICIENT_STORAGE => {
                    self.record_device_unavailable(req, &node);
                }
                Ok(reply) => {
                    if let Some(d) = resolver.add(BackendOutcome::from_reply(node, reply, None)) {
                        decision = Some(d);
                        break;
                    }
                }
                Err(error) => self.record_failure(req, &node, &error),
            }
        }

        let decision = match decision {
            Some(d) => {
                let grace = self.config.post_quorum_timeout();
                let _ = timeout(grace, async {
                    while join.join_next().await.is_some() {}
                })
                .await;
                join.abort_all();
                d
            }
            None => resolver.finish(),
        };
        respond(decision, resolver)
    }
}

/// Turn a decision into the client response.
fn respond(decision: Decision, mut resolver: QuorumResolver) -> ClientResponse {
    match decision {
        Decision::Superseded => ClientResponse::empty(Status::ACCEPTED),
        Decision::Decided { status, winner } => {
            let mut outcome = resolver.take(winner);
            outcome.close();
            ClientResponse {
                status,
                headers: outcome.headers,
                body: Bytes::new(),
            }
        }
        Decision::Fallback { status } => ClientResponse::empty(status),
    }
}

/// Open an exchange, await the final status, release the connection.
async fn simple_exchange(
    connector: Arc<dyn Connector>,
    node: Node,
    request: BackendRequest,
    connect_t: Duration,
    node_t: Duration,
) -> (Node, Result<BackendReply, BackendError>) {
    let result = async {
        let mut session = match timeout(connect_t, connector.connect(&node, &request)).await {
            Ok(r) => r?,
            Err(_) => return Err(BackendError::ConnectTimeout),
        };
        let reply = match timeout(node_t, session.finish()).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                session.close();
                return Err(e);
            }
            Err(_) => {
                session.close();
                return Err(BackendError::FinalStatusTimeout);
            }
        };
        session.close();
        Ok(reply)
    }
    .await;
    (node, result)
}

/// Open an exchange and keep the session for body streaming.
async fn open_exchange(
    connector: Arc<dyn Connector>,
    node: Node,
    request: BackendRequest,
    connect_t: Duration,
    node_t: Duration,
) -> (
    Node,
    Result<(BackendReply, Box<dyn Session>), BackendError>,
) {
    let result = async {
        let mut session = match timeout(connect_t, connector.connect(&node, &request)).await {
            Ok(r) => r?,
            Err(_) => return Err(BackendError::ConnectTimeout),
        };
        match timeout(node_t, session.finish()).await {
            Ok(Ok(reply)) => Ok((reply, session)),
            Ok(Err(e)) => {
                session.close();
                Err(e)
            }
            Err(_) => {
                session.close();
                Err(BackendError::FinalStatusTimeout)
            }
        }
    }
    .await;
    (node, result)
}

/// Drain a response body with a per-chunk recoverable timeout.
async fn read_full_body(
    session: &mut Box<dyn Session>,
    per_chunk: Duration,
) -> Result<Bytes, BackendError> {
    let mut buf = BytesMut::new();
    loop {
        match timeout(per_chunk, session.read_chunk()).await {
            Ok(Ok(Some(chunk))) => buf.extend_from_slice(&chunk),
            Ok(Ok(None)) => return Ok(buf.freeze()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BackendError::ChunkReadTimeout),
        }
    }
}

/// The fragment-preference header value for the versions collected so far,
/// or `None` before anything useful has been heard.
fn preference_header(recon: &FragmentReconstructor) -> Option<String> {
    let hints = recon.preference_hints();
    if hints.is_empty() {
        return None;
    }
    serde_json::to_string(&hints).ok()
}

/// The 416 response with its synthesized body.
fn unsatisfiable_response() -> ClientResponse {
    let body = Bytes::from_static(range::UNSATISFIABLE_BODY);
    let mut headers = BTreeMap::new();
    headers.insert(headers::CONTENT_LENGTH.to_string(), body.len().to_string());
    ClientResponse {
        status: Status::RANGE_NOT_SATISFIABLE,
        headers,
        body,
    }
}

/// The response for a request-fatal error.
fn error_response(req: &ObjectRequest, error: ProxyError) -> ClientResponse {
    warn!(
        trace = %req.trace_id,
        path = %req.path,
        error = %error,
        "request failed"
    );
    ClientResponse::empty(error.client_status())
}

/// Map a client-body read failure to its request-fatal error.
fn client_body_error(error: ClientBodyError) -> ProxyError {
    match error {
        ClientBodyError::Timeout => ProxyError::ClientReadTimeout,
        ClientBodyError::Disconnect => ProxyError::ClientDisconnect,
        ClientBodyError::Other(message) => ProxyError::ClientBody(message),
    }
}

fn fail_all(putters: &mut Vec<Putter>) {
    for putter in putters.iter_mut() {
        putter.fail();
    }
    putters.clear();
}

// ---------------------------------------------------------------------------
// Replicated controller
// ---------------------------------------------------------------------------

/// Whole-copy fan-out with quorum resolution.
pub struct ReplicatedController {
    engine: Engine,
}

impl ReplicatedController {
    async fn put_inner(
        &self,
        req: &ObjectRequest,
        body: &mut dyn ClientBody,
        footers_cb: Option<&FootersCallback>,
    ) -> Result<ClientResponse, ProxyError> {
        let engine = &self.engine;
        let prelude = engine.put_prelude(req)?;
        let quorum = engine.policy.quorum_size();
        let wanted = engine.policy.replica_count();
        let use_envelope = footers_cb.is_some();
        let connect_t = engine.config.connect_timeout();
        let node_t = engine.config.node_timeout();

        let affinity = engine.config.write_affinity(wanted);
        let mut candidates = engine
            .candidates(&req.path, affinity.as_ref())
            .into_iter();

        let mut putters: Vec<Putter> = Vec::new();
        while putters.len() < wanted {
            let Some(node) = candidates.next() else { break };
            let boundary = use_envelope.then(random_boundary);
            let mut request = engine
                .request_template(Method::Put, req, &prelude.headers)
                .with_body();
            if let Some(boundary) = &boundary {
                request = request
                    .header(headers::MULTIPART_BOUNDARY, boundary.clone())
                    .header(headers::METADATA_FOOTER, "yes");
            }
            let mime = boundary.map(MimeWriter::new);
            match Putter::connect(
                engine.connector.as_ref(),
                node.clone(),
                &request,
                connect_t,
                node_t,
                mime,
            )
            .await
            {
                Ok(mut putter) => {
                    if putter.answered_early().map(|r| r.status)
                        == Some(Status::INSUFFICIENT_STORAGE)
                    {
                        engine.record_device_unavailable(req, &node);
                        putter.fail();
                        continue;
                    }
                    putters.push(putter);
                }
                Err(error) => engine.record_failure(req, &node, &error),
            }
        }
        if putters.len() < quorum {
            fail_all(&mut putters);
            return Err(ProxyError::ServiceUnavailable);
        }

        // Single sequential reader; every chunk fans out to every open
        // connection before the next read.
        let chunk_size = engine.config.client_chunk_size();
        let mut hasher = blake3::Hasher::new();
        let mut total: u64 = 0;
        loop {
            let chunk = match body.read_chunk(chunk_size).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(error) => {
                    fail_all(&mut putters);
                    return Err(client_body_error(error));
                }
            };
            hasher.update(&chunk);
            total += chunk.len() as u64;
            self.send_to_all(req, &mut putters, chunk, quorum).await?;
        }

        let computed = hasher.finalize().to_hex().to_string();
        if let Some(declared) = &prelude.declared_etag {
            if declared != &computed {
                fail_all(&mut putters);
                return Err(ProxyError::EtagMismatch {
                    computed,
                    declared: declared.clone(),
                });
            }
        }

        if use_envelope {
            let mut footers = BTreeMap::new();
            footers.insert(headers::ETAG.to_string(), computed.clone());
            footers.insert(
                headers::CONTAINER_UPDATE_OVERRIDE_ETAG.to_string(),
                computed.clone(),
            );
            footers.insert(
                headers::CONTAINER_UPDATE_OVERRIDE_SIZE.to_string(),
                total.to_string(),
            );
            if let Some(cb) = footers_cb {
                cb(&mut footers);
            }
            let mut i = 0;
            while i < putters.len() {
                match putters[i].send_footers(&footers).await {
                    Ok(()) => i += 1,
                    Err(error) => {
                        let node = putters[i].node().clone();
                        engine.record_failure(req, &node, &error);
                        putters[i].fail();
                        putters.remove(i);
                    }
                }
            }
            if putters.len() < quorum {
                fail_all(&mut putters);
                return Err(ProxyError::ServiceUnavailable);
            }
        }

        let mut response = engine.collect_put_responses(req, putters, quorum).await;
        if response.status.is_success() {
            response
                .headers
                .insert(headers::ETAG.to_string(), computed);
        }
        Ok(response)
    }

    async fn send_to_all(
        &self,
        req: &ObjectRequest,
        putters: &mut Vec<Putter>,
        chunk: Bytes,
        quorum: usize,
    ) -> Result<(), ProxyError> {
        let mut i = 0;
        while i < putters.len() {
            match putters[i].send_chunk(chunk.clone()).await {
                Ok(()) => i += 1,
                Err(error) => {
                    let node = putters[i].node().clone();
                    self.engine.record_failure(req, &node, &error);
                    putters[i].fail();
                    putters.remove(i);
                }
            }
        }
        if putters.len() < quorum {
            fail_all(putters);
            return Err(ProxyError::ServiceUnavailable);
        }
        Ok(())
    }

    /// First good response in candidate order; 404s keep the search going.
    async fn read_inner(&self, req: &ObjectRequest, want_body: bool) -> ClientResponse {
        let engine = &self.engine;
        let method = if want_body { Method::Get } else { Method::Head };
        let template = engine.request_template(method, req, &req.headers);
        let connect_t = engine.config.connect_timeout();
        let node_t = engine.config.node_timeout();
        let per_chunk = engine.config.recoverable_node_timeout();

        let mut answered = 0usize;
        let mut not_found = 0usize;
        for node in engine.candidates(&req.path, None) {
            let (node, result) = open_exchange(
                Arc::clone(&engine.connector),
                node,
                template.clone(),
                connect_t,
                node_t,
            )
            .await;
            let (reply, mut session) = match result {
                Ok(ok) => ok,
                Err(error) => {
                    engine.record_failure(req, &node, &error);
                    continue;
                }
            };

            if reply.status == Status::INSUFFICIENT_STORAGE {
                engine.record_device_unavailable(req, &node);
                session.close();
                continue;
            }
            if reply.status.is_server_error() {
                answered += 1;
                engine.limiter.record(&node, ErrorKind::Status);
                session.close();
                continue;
            }
            if reply.status == Status::NOT_FOUND {
                answered += 1;
                not_found += 1;
                session.close();
                continue;
            }

            if reply.status.is_success() {
                match conditional::check_read_conditionals(&req.headers, &reply.headers) {
                    ConditionalResult::Proceed => {}
                    ConditionalResult::NotModified => {
                        session.close();
                        return ClientResponse::with_headers(Status::NOT_MODIFIED, reply.headers);
                    }
                    ConditionalResult::PreconditionFailed => {
                        session.close();
                        return ClientResponse::with_headers(
                            Status::PRECONDITION_FAILED,
                            reply.headers,
                        );
                    }
                }
                if !want_body {
                    session.close();
                    return ClientResponse::with_headers(reply.status, reply.headers);
                }
                match read_full_body(&mut session, per_chunk).await {
                    Ok(body) => {
                        session.close();
                        return ClientResponse {
                            status: reply.status,
                            headers: reply.headers,
                            body,
                        };
                    }
                    Err(error) => {
                        engine.record_failure(req, &node, &error);
                        session.close();
                        continue;
                    }
                }
            }

            // Any other formal client-error answer (e.g. 416) is this
            // object's answer; copy it through verbatim.
            let mut body = Bytes::new();
            if want_body {
                if let Ok(b) = read_full_body(&mut session, per_chunk).await {
                    body = b;
                }
            }
            session.close();
            return ClientResponse {
                status: reply.status,
                headers: reply.headers,
                body,
            };
        }

        let status = if answered > 0 && not_found * 2 > answered {
            Status::NOT_FOUND
        } else {
            Status::SERVICE_UNAVAILABLE
        };
        ClientResponse::empty(status)
    }
}

#[async_trait]
impl ObjectController for ReplicatedController {
    async fn put(
        &self,
        req: &ObjectRequest,
        body: &mut dyn ClientBody,
        footers: Option<&FootersCallback>,
    ) -> ClientResponse {
        match self.put_inner(req, body, footers).await {
            Ok(response) => response,
            Err(error) => error_response(req, error),
        }
    }

    async fn get(&self, req: &ObjectRequest) -> ClientResponse {
        self.read_inner(req, true).await
    }

    async fn head(&self, req: &ObjectRequest) -> ClientResponse {
        self.read_inner(req, false).await
    }

    async fn delete(&self, req: &ObjectRequest) -> ClientResponse {
        self.engine.quorum_fan_out(req, Method::Delete).await
    }
}

// ---------------------------------------------------------------------------
// Erasure-coded controller
// ---------------------------------------------------------------------------

/// Fragment fan-out: multi-phase durable commit for PUT, fragment search
/// and streaming decode for GET.
pub struct EcController {
    engine: Engine,
}

/// One node's write slot for an erasure-coded PUT.
struct EcSlot {
    putter: Putter,
    frag_index: u8,
    /// Digest of the fragment archive streamed to this node.
    hasher: blake3::Hasher,
}

impl EcController {
    fn scheme(&self) -> (usize, usize, usize) {
        match self.engine.policy {
            StoragePolicy::ErasureCoded {
                ndata,
                nparity,
                segment_size,
            } => (ndata, nparity, segment_size),
            StoragePolicy::Replicated { .. } => unreachable!("EC controller with replicated policy"),
        }
    }

    async fn put_inner(
        &self,
        req: &ObjectRequest,
        body: &mut dyn ClientBody,
        footers_cb: Option<&FootersCallback>,
    ) -> Result<ClientResponse, ProxyError> {
        let engine = &self.engine;
        let (ndata, nparity, segment_size) = self.scheme();
        let prelude = engine.put_prelude(req)?;
        let quorum = engine.policy.quorum_size();
        let wanted = ndata + nparity;
        let connect_t = engine.config.connect_timeout();
        let node_t = engine.config.node_timeout();

        let affinity = engine.config.write_affinity(wanted);
        let mut candidates = engine
            .candidates(&req.path, affinity.as_ref())
            .into_iter();

        let mut slots: Vec<EcSlot> = Vec::new();
        while slots.len() < wanted {
            let Some(node) = candidates.next() else { break };
            let boundary = random_boundary();
            let mut request = engine
                .request_template(Method::Put, req, &prelude.headers)
                .with_body()
                .header(headers::MULTIPART_BOUNDARY, boundary.clone())
                .header(headers::METADATA_FOOTER, "yes")
                .header(headers::MULTIPHASE_COMMIT, "yes");
            if let Some(size) = prelude.declared_length {
                request = request.header(
                    headers::BACKEND_CONTENT_LENGTH,
                    fragment_archive_len(size, segment_size, ndata).to_string(),
                );
            }
            match Putter::connect(
                engine.connector.as_ref(),
                node.clone(),
                &request,
                connect_t,
                node_t,
                Some(MimeWriter::new(boundary)),
            )
            .await
            {
                Ok(mut putter) => {
                    if putter.answered_early().map(|r| r.status)
                        == Some(Status::INSUFFICIENT_STORAGE)
                    {
                        engine.record_device_unavailable(req, &node);
                        putter.fail();
                        continue;
                    }
                    let frag_index = slots.len() as u8;
                    slots.push(EcSlot {
                        putter,
                        frag_index,
                        hasher: blake3::Hasher::new(),
                    });
                }
                Err(error) => engine.record_failure(req, &node, &error),
            }
        }
        if slots.len() < quorum {
            self.fail_slots(&mut slots);
            return Err(ProxyError::ServiceUnavailable);
        }

        // Cut the sequential client stream into segments; each segment
        // encodes into one fragment per slot.
        let encoder = FragmentEncoder::new(ndata, nparity);
        let chunk_size = engine.config.client_chunk_size();
        let mut whole = blake3::Hasher::new();
        let mut seg_buf = BytesMut::new();
        let mut total: u64 = 0;
        loop {
            let chunk = match body.read_chunk(chunk_size).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(error) => {
                    self.fail_slots(&mut slots);
                    return Err(client_body_error(error));
                }
            };
            whole.update(&chunk);
            total += chunk.len() as u64;
            seg_buf.extend_from_slice(&chunk);
            while seg_buf.len() >= segment_size {
                let segment = seg_buf.split_to(segment_size);
                self.send_segment(req, &encoder, &mut slots, &segment, quorum)
                    .await?;
            }
        }
        if !seg_buf.is_empty() {
            let segment = seg_buf.split();
            self.send_segment(req, &encoder, &mut slots, &segment, quorum)
                .await?;
        }

        let computed = whole.finalize().to_hex().to_string();
        if let Some(declared) = &prelude.declared_etag {
            if declared != &computed {
                self.fail_slots(&mut slots);
                return Err(ProxyError::EtagMismatch {
                    computed,
                    declared: declared.clone(),
                });
            }
        }

        // Footer documents are per node: the fragment archive checksum and
        // index differ, the whole-object attributes do not.
        let mut i = 0;
        while i < slots.len() {
            let mut footers = BTreeMap::new();
            footers.insert(
                headers::ETAG.to_string(),
                slots[i].hasher.finalize().to_hex().to_string(),
            );
            footers.insert(headers::EC_ETAG.to_string(), computed.clone());
            footers.insert(headers::EC_CONTENT_LENGTH.to_string(), total.to_string());
            footers.insert(
                headers::EC_SEGMENT_SIZE.to_string(),
                segment_size.to_string(),
            );
            footers.insert(
                headers::EC_FRAG_INDEX.to_string(),
                slots[i].frag_index.to_string(),
            );
            footers.insert(
                headers::CONTAINER_UPDATE_OVERRIDE_ETAG.to_string(),
                computed.clone(),
            );
            footers.insert(
                headers::CONTAINER_UPDATE_OVERRIDE_SIZE.to_string(),
                total.to_string(),
            );
            if let Some(cb) = footers_cb {
                cb(&mut footers);
            }
            match slots[i].putter.send_footers(&footers).await {
                Ok(()) => i += 1,
                Err(error) => {
                    let node = slots[i].putter.node().clone();
                    engine.record_failure(req, &node, &error);
                    slots[i].putter.fail();
                    slots.remove(i);
                }
            }
        }
        if slots.len() < quorum {
            self.fail_slots(&mut slots);
            return Err(ProxyError::ServiceUnavailable);
        }

        // No commit marker goes out until a quorum of nodes has
        // acknowledged its footer document. A node answering with a final
        // status here keeps that answer for resolution but is never told to
        // commit.
        let mut acked: Vec<bool> = Vec::with_capacity(slots.len());
        let mut i = 0;
        while i < slots.len() {
            match slots[i].putter.await_footer_ack().await {
                Ok(ack) => {
                    acked.push(ack);
                    i += 1;
                }
                Err(error) => {
                    let node = slots[i].putter.node().clone();
                    engine.record_failure(req, &node, &error);
                    slots[i].putter.fail();
                    slots.remove(i);
                }
            }
        }
        if acked.iter().filter(|a| **a).count() < quorum {
            self.fail_slots(&mut slots);
            return Err(ProxyError::ServiceUnavailable);
        }

        let mut i = 0;
        while i < slots.len() {
            if !acked[i] {
                i += 1;
                continue;
            }
            match slots[i].putter.send_commit().await {
                Ok(()) => i += 1,
                Err(error) => {
                    let node = slots[i].putter.node().clone();
                    engine.record_failure(req, &node, &error);
                    slots[i].putter.fail();
                    slots.remove(i);
                    acked.remove(i);
                }
            }
        }
        if acked.iter().filter(|a| **a).count() < quorum {
            self.fail_slots(&mut slots);
            return Err(ProxyError::ServiceUnavailable);
        }

        let putters = slots.into_iter().map(|s| s.putter).collect();
        let mut response = engine.collect_put_responses(req, putters, quorum).await;
        if response.status.is_success() {
            response
                .headers
                .insert(headers::ETAG.to_string(), computed);
        }
        Ok(response)
    }

    async fn send_segment(
        &self,
        req: &ObjectRequest,
        encoder: &FragmentEncoder,
        slots: &mut Vec<EcSlot>,
        segment: &[u8],
        quorum: usize,
    ) -> Result<(), ProxyError> {
        let fragments = encoder
            .encode(segment)
            .map_err(|e| ProxyError::Internal(e.to_string()))?;
        let mut i = 0;
        while i < slots.len() {
            let data = fragment_for(&fragments, slots[i].frag_index)?;
            slots[i].hasher.update(&data);
            match slots[i].putter.send_chunk(data).await {
                Ok(()) => i += 1,
                Err(error) => {
                    let node = slots[i].putter.node().clone();
                    self.engine.record_failure(req, &node, &error);
                    slots[i].putter.fail();
                    slots.remove(i);
                }
            }
        }
        if slots.len() < quorum {
            self.fail_slots(slots);
            return Err(ProxyError::ServiceUnavailable);
        }
        Ok(())
    }

    fn fail_slots(&self, slots: &mut Vec<EcSlot>) {
        for slot in slots.iter_mut() {
            slot.putter.fail();
        }
        slots.clear();
    }

    /// Fragment search, then streaming reconstruction.
    async fn read_inner(
        &self,
        req: &ObjectRequest,
        want_body: bool,
    ) -> Result<ClientResponse, ProxyError> {
        let engine = &self.engine;
        let (ndata, nparity, segment_size) = self.scheme();
        let connect_t = engine.config.connect_timeout();
        let node_t = engine.config.node_timeout();

        let client_range = if want_body {
            req.get_header(headers::RANGE).and_then(range::parse_range)
        } else {
            None
        };

        let method = if want_body { Method::Get } else { Method::Head };
        let mut template = engine.request_template(method, req, &req.headers);
        // The backend sees fragment coordinates, never the client's range.
        if let Some(key) = template
            .headers
            .keys()
            .find(|k| k.eq_ignore_ascii_case(headers::RANGE))
            .cloned()
        {
            template.headers.remove(&key);
        }
        if let Some(r) = client_range {
            let span = range::to_fragment_span(r, segment_size, ndata);
            template
                .headers
                .insert(headers::RANGE.to_string(), span.header_value());
        }

        // Search phase: fan out and bucket fragments by version.
        let mut recon = FragmentReconstructor::new(ndata);
        let mut candidates = engine.candidates(&req.path, None).into_iter();
        let mut join = JoinSet::new();
        let mut active = 0;
        let mut spawn_next = |join: &mut JoinSet<_>,
                              active: &mut usize,
                              candidates: &mut std::vec::IntoIter<Node>,
                              hints: Option<String>| {
            if let Some(node) = candidates.next() {
                let connector = Arc::clone(&engine.connector);
                let mut request = template.clone();
                if let Some(hints) = hints {
                    request = request.header(headers::FRAGMENT_PREFERENCES, hints);
                }
                join.spawn(async move {
                    open_exchange(connector, node, request, connect_t, node_t).await
                });
                *active += 1;
            }
        };
        for _ in 0..(ndata + nparity) {
            spawn_next(&mut join, &mut active, &mut candidates, None);
        }

        let mut winner: Option<FragmentBucket> = None;
        while active > 0 {
            let Some(joined) = join.join_next().await else {
                break;
            };
            active -= 1;
            let Ok((node, result)) = joined else { continue };
            match result {
                Ok((reply, mut session)) => {
                    if reply.status == Status::INSUFFICIENT_STORAGE {
                        engine.record_device_unavailable(req, &node);
                        session.close();
                        let hints = preference_header(&recon);
                        spawn_next(&mut join, &mut active, &mut candidates, hints);
                        continue;
                    }
                    let keep_session = want_body && reply.status.is_success();
                    let session = if keep_session {
                        Some(session)
                    } else {
                        session.close();
                        None
                    };
                    let feed = recon.feed(BackendOutcome::from_reply(node, reply, session));
                    if recon.range_agreed_unsatisfiable() {
                        break;
                    }
                    if feed == Feed::Added {
                        if let Some(bucket) = recon.take_readable() {
                            winner = Some(bucket);
                            break;
                        }
                    }
                    // Not readable yet: keep searching further candidates
                    // (missing indices, or a durable mark for the version),
                    // telling them which versions and indices are held.
                    let hints = preference_header(&recon);
                    spawn_next(&mut join, &mut active, &mut candidates, hints);
                }
                Err(error) => {
                    engine.record_failure(req, &node, &error);
                    let hints = preference_header(&recon);
                    spawn_next(&mut join, &mut active, &mut candidates, hints);
                }
            }
        }
        join.abort_all();

        if recon.range_agreed_unsatisfiable() {
            recon.close_all();
            return Ok(unsatisfiable_response());
        }
        let Some(bucket) = winner.or_else(|| recon.take_readable()) else {
            let status = recon.exhausted_status();
            recon.close_all();
            debug!(
                trace = %req.trace_id,
                path = %req.path,
                status = %status,
                "no readable fragment bucket"
            );
            return Ok(ClientResponse::empty(status));
        };

        let etag = bucket.etag.clone();
        let version = bucket.timestamp;
        let (mut selected, mut spares) = bucket.into_selection(ndata);

        let representative = &selected[0];
        match conditional::check_read_conditionals(&req.headers, &representative.headers) {
            ConditionalResult::Proceed => {}
            ConditionalResult::NotModified => {
                let headers = representative.headers.clone();
                close_outcomes(&mut selected, &mut spares);
                return Ok(ClientResponse::with_headers(Status::NOT_MODIFIED, headers));
            }
            ConditionalResult::PreconditionFailed => {
                let headers = representative.headers.clone();
                close_outcomes(&mut selected, &mut spares);
                return Ok(ClientResponse::with_headers(
                    Status::PRECONDITION_FAILED,
                    headers,
                ));
            }
        }

        let size: u64 = representative
            .get_header(headers::EC_CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| {
                ProxyError::Internal("fragment reply missing whole-object length".to_string())
            })?;
        let mut response_headers = representative.headers.clone();
        set_header(&mut response_headers, headers::ETAG, &etag);

        if !want_body {
            set_header(
                &mut response_headers,
                headers::CONTENT_LENGTH,
                &size.to_string(),
            );
            close_outcomes(&mut selected, &mut spares);
            return Ok(ClientResponse::with_headers(Status::OK, response_headers));
        }

        if let Some(r) = client_range {
            if r.start >= size {
                close_outcomes(&mut selected, &mut spares);
                return Ok(unsatisfiable_response());
            }
        }

        let produced = if size == 0 {
            close_outcomes(&mut selected, &mut spares);
            Bytes::new()
        } else {
            self.decode_stream(
                req,
                &template,
                &mut candidates,
                selected,
                spares,
                &etag,
                version,
                size,
                client_range,
            )
            .await?
        };

        let (status, body) = match client_range {
            None => (Status::OK, produced),
            Some(r) => {
                let first_segment = r.start / segment_size as u64;
                let offset = (r.start - first_segment * segment_size as u64) as usize;
                let end = r.end.min(size - 1);
                let count = (end - r.start + 1) as usize;
                set_header(
                    &mut response_headers,
                    headers::CONTENT_RANGE,
                    &format!("bytes {}-{}/{}", r.start, end, size),
                );
                (
                    Status::PARTIAL_CONTENT,
                    produced.slice(offset..offset + count),
                )
            }
        };
        set_header(
            &mut response_headers,
            headers::CONTENT_LENGTH,
            &body.len().to_string(),
        );
        Ok(ClientResponse {
            status,
            headers: response_headers,
            body,
        })
    }

    /// Decode the winning bucket segment by segment.
    ///
    /// A slow or failing source is abandoned and replaced (spare fragment
    /// from the bucket, or a fresh candidate holding an unused index);
    /// bytes already decoded are kept.
    #[allow(clippy::too_many_arguments)]
    async fn decode_stream(
        &self,
        req: &ObjectRequest,
        template: &BackendRequest,
        candidates: &mut std::vec::IntoIter<Node>,
        selected: Vec<BackendOutcome>,
        mut spares: Vec<BackendOutcome>,
        etag: &str,
        version: Timestamp,
        size: u64,
        client_range: Option<ByteRange>,
    ) -> Result<Bytes, ProxyError> {
        let (ndata, nparity, segment_size) = self.scheme();
        let per_chunk = self.engine.config.recoverable_node_timeout();

        let mut sources: Vec<FragmentSource> =
            selected.into_iter().map(FragmentSource::new).collect();

        let total_segments = size.div_ceil(segment_size as u64);
        let (first_segment, last_requested) = match client_range {
            Some(r) => (r.start / segment_size as u64, r.end / segment_size as u64),
            None => (0, total_segments - 1),
        };
        let last_segment = last_requested.min(total_segments - 1);

        // Fragment-stream bytes consumed so far; replacements must skip
        // this many before joining.
        let mut consumed = 0usize;
        let mut produced = BytesMut::new();

        for seg in first_segment..=last_segment {
            let seg_start = seg * segment_size as u64;
            let seg_len = ((size - seg_start).min(segment_size as u64)) as usize;
            let slice_len = fragment_size(seg_len, ndata);

            let mut pairs: Vec<(u8, Vec<u8>)> = Vec::with_capacity(ndata);
            let mut i = 0;
            while i < sources.len() {
                match sources[i].read_slice(slice_len, per_chunk).await {
                    Ok(data) => {
                        pairs.push((sources[i].frag_index(), data));
                        i += 1;
                    }
                    Err(error) => {
                        let node = sources[i].node().clone();
                        self.engine.record_failure(req, &node, &error);
                        sources.remove(i).close();

                        let used: BTreeSet<u8> = sources
                            .iter()
                            .map(|s| s.frag_index())
                            .chain(pairs.iter().map(|(idx, _)| *idx))
                            .collect();
                        match self
                            .replacement_source(
                                req, template, candidates, &mut spares, etag, version, &used,
                                consumed, per_chunk,
                            )
                            .await
                        {
                            Some(source) => sources.insert(i, source),
                            None => {
                                for source in sources {
                                    source.close();
                                }
                                for mut spare in spares {
                                    spare.close();
                                }
                                return Err(ProxyError::ServiceUnavailable);
                            }
                        }
                    }
                }
            }
            consumed += slice_len;

            let segment = decode_segment(ndata, nparity, &pairs, seg_len)?;
            produced.extend_from_slice(&segment);
        }

        for source in sources {
            source.close();
        }
        for mut spare in spares {
            spare.close();
        }
        Ok(produced.freeze())
    }

    /// Find a fragment source for an index not yet in the decode set.
    ///
    /// Spare fragments already fetched come first; then fresh candidates,
    /// accepted only when they hold the winning version.
    #[allow(clippy::too_many_arguments)]
    async fn replacement_source(
        &self,
        req: &ObjectRequest,
        template: &BackendRequest,
        candidates: &mut std::vec::IntoIter<Node>,
        spares: &mut Vec<BackendOutcome>,
        etag: &str,
        version: Timestamp,
        used: &BTreeSet<u8>,
        consumed: usize,
        per_chunk: Duration,
    ) -> Option<FragmentSource> {
        loop {
            // The spares borrow must end before the catch-up read awaits.
            let found = spares.iter().position(|o| {
                o.session.is_some()
                    && o.frag_index
                        .map(|index| !used.contains(&index))
                        .unwrap_or(false)
            });
            let Some(position) = found else { break };
            let mut source = FragmentSource::new(spares.remove(position));
            match source.discard(consumed, per_chunk).await {
                Ok(()) => return Some(source),
                Err(error) => {
                    let node = source.node().clone();
                    self.engine.record_failure(req, &node, &error);
                    source.close();
                }
            }
        }

        let hint = serde_json::to_string(&[PreferenceHint {
            timestamp: version.to_string(),
            exclude: used.iter().copied().collect(),
        }])
        .ok();
        let connect_t = self.engine.config.connect_timeout();
        let node_t = self.engine.config.node_timeout();
        while let Some(node) = candidates.next() {
            let mut request = template.clone();
            if let Some(hint) = hint.clone() {
                request = request.header(headers::FRAGMENT_PREFERENCES, hint);
            }
            let (node, result) = open_exchange(
                Arc::clone(&self.engine.connector),
                node,
                request,
                connect_t,
                node_t,
            )
            .await;
            match result {
                Ok((reply, session)) => {
                    let mut outcome = BackendOutcome::from_reply(node, reply, Some(session));
                    let usable = outcome.status.is_success()
                        && outcome.logical_etag() == Some(etag)
                        && outcome.timestamp == Some(version)
                        && outcome
                            .frag_index
                            .map(|index| !used.contains(&index))
                            .unwrap_or(false);
                    if !usable {
                        outcome.close();
                        continue;
                    }
                    let mut source = FragmentSource::new(outcome);
                    match source.discard(consumed, per_chunk).await {
                        Ok(()) => return Some(source),
                        Err(error) => {
                            let node = source.node().clone();
                            self.engine.record_failure(req, &node, &error);
                            source.close();
                        }
                    }
                }
                Err(error) => self.engine.record_failure(req, &node, &error),
            }
        }
        None
    }
}

#[async_trait]
impl ObjectController for EcController {
    async fn put(
        &self,
        req: &ObjectRequest,
        body: &mut dyn ClientBody,
        footers: Option<&FootersCallback>,
    ) -> ClientResponse {
        match self.put_inner(req, body, footers).await {
            Ok(response) => response,
            Err(error) => error_response(req, error),
        }
    }

    async fn get(&self, req: &ObjectRequest) -> ClientResponse {
        match self.read_inner(req, true).await {
            Ok(response) => response,
            Err(error) => error_response(req, error),
        }
    }

    async fn head(&self, req: &ObjectRequest) -> ClientResponse {
        match self.read_inner(req, false).await {
            Ok(response) => response,
            Err(error) => error_response(req, error),
        }
    }

    async fn delete(&self, req: &ObjectRequest) -> ClientResponse {
        self.engine.quorum_fan_out(req, Method::Delete).await
    }
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

/// Total bytes of one fragment archive for an object of `size` bytes.
pub fn fragment_archive_len(size: u64, segment_size: usize, ndata: usize) -> u64 {
    if size == 0 {
        return 0;
    }
    let full = size / segment_size as u64;
    let remainder = (size % segment_size as u64) as usize;
    let mut len = full * fragment_size(segment_size, ndata) as u64;
    if remainder > 0 {
        len += fragment_size(remainder, ndata) as u64;
    }
    len
}

fn fragment_for(fragments: &[Fragment], index: u8) -> Result<Bytes, ProxyError> {
    fragments
        .iter()
        .find(|f| f.index == index)
        .map(|f| f.data.clone())
        .ok_or_else(|| ProxyError::Internal(format!("encoder produced no fragment {index}")))
}

fn close_outcomes(selected: &mut [BackendOutcome], spares: &mut [BackendOutcome]) {
    for outcome in selected.iter_mut().chain(spares.iter_mut()) {
        outcome.close();
    }
}

fn set_header(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    if let Some(key) = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case(name))
        .cloned()
    {
        headers.remove(&key);
    }
    headers.insert(name.to_string(), value.to_string());
}
