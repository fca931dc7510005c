//! Shared fixtures: a scripted cluster and erasure-coding arithmetic.

use std::sync::Arc;

use bytes::Bytes;
use quay_backend::mock::{MockConnector, MockScript};
use quay_erasure::FragmentEncoder;
use quay_placement::{ErrorLimiter, Ring, StaticRing};
use quay_types::{Node, Status, StoragePolicy, Timestamp, headers};

use crate::config::{ProxyConfig, TimeoutsSection};
use crate::controller::{ObjectController, ObjectRequest, controller_for};

pub const PATH: &str = "/acct/photos/cat.jpg";

pub fn nodes(n: usize) -> Vec<Node> {
    (0..n)
        .map(|i| Node {
            ip: format!("10.0.0.{i}"),
            port: 6200,
            device: format!("sd{i}"),
            region: 1,
            zone: (i % 4) as u32,
            index: i,
        })
        .collect()
}

/// Millisecond-scale timeouts so stall-injection tests finish quickly.
pub fn fast_config() -> ProxyConfig {
    ProxyConfig {
        timeouts: TimeoutsSection {
            connect_ms: Some(100),
            node_ms: Some(300),
            recoverable_node_ms: Some(100),
            post_quorum_ms: Some(20),
        },
        ..Default::default()
    }
}

/// A controller wired to a static ring and a scripted connector.
pub struct Cluster {
    pub connector: MockConnector,
    pub ring: StaticRing,
    pub limiter: Arc<ErrorLimiter>,
    pub controller: Box<dyn ObjectController>,
}

impl Cluster {
    pub fn new(policy: StoragePolicy, node_count: usize) -> Self {
        let config = fast_config();
        let ring = StaticRing::new(nodes(node_count), policy.replica_count());
        let connector = MockConnector::new();
        let limiter = Arc::new(ErrorLimiter::new(config.error_limiter()));
        let controller = controller_for(
            policy,
            0,
            Arc::new(ring.clone()),
            Arc::new(connector.clone()),
            Arc::clone(&limiter),
            config,
        );
        Self {
            connector,
            ring,
            limiter,
            controller,
        }
    }

    /// Candidate order for [`PATH`]: primaries, then every handoff.
    pub fn candidates(&self) -> Vec<Node> {
        let partition = self.ring.partition(PATH);
        let mut out = self.ring.primary_nodes(partition);
        out.extend(self.ring.handoff_nodes(partition));
        out
    }

    pub fn request(&self) -> ObjectRequest {
        ObjectRequest::new(PATH, Timestamp::from_secs(1_700_000_000))
    }
}

pub fn blake_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Per-node fragment archives: index `i` holds the concatenation of
/// fragment `i` of every segment.
pub fn ec_archives(body: &[u8], ndata: usize, nparity: usize, segment_size: usize) -> Vec<Vec<u8>> {
    let encoder = FragmentEncoder::new(ndata, nparity);
    let mut archives = vec![Vec::new(); ndata + nparity];
    for segment in body.chunks(segment_size) {
        for fragment in encoder.encode(segment).unwrap() {
            archives[fragment.index as usize].extend_from_slice(&fragment.data);
        }
    }
    archives
}

/// A scripted fragment GET reply carrying the coordination headers.
pub fn frag_reply(
    archive: impl Into<Bytes>,
    index: u8,
    etag: &str,
    ts: Timestamp,
    total_len: usize,
    durable: bool,
) -> MockScript {
    let mut script = MockScript::get(Status::OK, archive)
        .reply_header(headers::EC_FRAG_INDEX, index.to_string())
        .reply_header(headers::EC_ETAG, etag)
        .reply_header(headers::EC_CONTENT_LENGTH, total_len.to_string())
        .reply_header(headers::BACKEND_TIMESTAMP, ts.to_string());
    if durable {
        script = script.reply_header(headers::BACKEND_DURABLE_TIMESTAMP, ts.to_string());
    }
    script
}
