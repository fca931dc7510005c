//! Erasure-coded controller behavior: multi-phase PUT, fragment search,
//! streaming reconstruction.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use quay_backend::mime::{DOC_OBJECT_BODY, DOC_OBJECT_METADATA, DOC_PUT_COMMIT};
use quay_backend::mock::MockScript;
use quay_backend::parse_mime;
use quay_types::{Status, StoragePolicy, Timestamp, headers};

use crate::body::BytesBody;
use crate::controller::fragment_archive_len;
use crate::range::UNSATISFIABLE_BODY;

use super::helpers::{Cluster, blake_hex, ec_archives, frag_reply};

const POLICY: StoragePolicy = StoragePolicy::ErasureCoded {
    ndata: 2,
    nparity: 2,
    segment_size: 8,
};

const BODY: &[u8] = b"abcdefgh12345678tail";

fn version() -> Timestamp {
    Timestamp::from_secs(1_699_000_000)
}

#[tokio::test]
async fn test_ec_put_fragments_footers_and_commit() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    for node in &c[..4] {
        cluster.connector.script(node, MockScript::put(Status::CREATED));
    }

    let req = cluster
        .request()
        .header(headers::CONTENT_LENGTH, BODY.len().to_string());
    let mut body = BytesBody::new(BODY);
    let resp = cluster.controller.put(&req, &mut body, None).await;

    assert_eq!(resp.status, Status::CREATED);
    let whole_etag = blake_hex(BODY);
    assert_eq!(resp.get_header(headers::ETAG), Some(whole_etag.as_str()));

    let archives = ec_archives(BODY, 2, 2, 8);
    let captured = cluster.connector.captured();
    assert_eq!(captured.len(), 4);
    for exchange in &captured {
        assert_eq!(
            exchange.request.get_header(headers::MULTIPHASE_COMMIT),
            Some("yes")
        );
        assert_eq!(
            exchange.request.get_header(headers::BACKEND_CONTENT_LENGTH),
            Some(fragment_archive_len(BODY.len() as u64, 8, 2).to_string().as_str())
        );

        let boundary = exchange
            .request
            .get_header(headers::MULTIPART_BOUNDARY)
            .unwrap()
            .to_string();
        let parts = parse_mime(&exchange.body, &boundary).unwrap();
        let docs: Vec<&str> = parts.iter().map(|p| p.doc.as_str()).collect();
        assert_eq!(docs, vec![DOC_OBJECT_BODY, DOC_OBJECT_METADATA, DOC_PUT_COMMIT]);

        let footers: BTreeMap<String, String> = serde_json::from_slice(&parts[1].body).unwrap();
        let index: usize = footers.get(headers::EC_FRAG_INDEX).unwrap().parse().unwrap();
        assert_eq!(parts[0].body, archives[index], "fragment archive for index {index}");
        assert_eq!(footers.get(headers::EC_ETAG), Some(&whole_etag));
        assert_eq!(
            footers.get(headers::EC_CONTENT_LENGTH),
            Some(&BODY.len().to_string())
        );
        assert_eq!(footers.get(headers::EC_SEGMENT_SIZE), Some(&"8".to_string()));
        // The per-node transfer etag covers the fragment archive, not the
        // object.
        assert_eq!(footers.get(headers::ETAG), Some(&blake_hex(&archives[index])));
    }
}

#[tokio::test]
async fn test_ec_put_below_quorum_is_unavailable() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    // Two reachable writers; the commit quorum is ndata + 1 = 3.
    cluster.connector.script(&c[0], MockScript::put(Status::CREATED));
    cluster.connector.script(&c[1], MockScript::put(Status::CREATED));

    let req = cluster
        .request()
        .header(headers::CONTENT_LENGTH, BODY.len().to_string());
    let mut body = BytesBody::new(BODY);
    let resp = cluster.controller.put(&req, &mut body, None).await;
    assert_eq!(resp.status, Status::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_ec_put_survives_one_failed_writer() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    cluster
        .connector
        .script(&c[0], MockScript::put(Status::CREATED).fail_send_after(0));
    for node in &c[1..4] {
        cluster.connector.script(node, MockScript::put(Status::CREATED));
    }

    let req = cluster
        .request()
        .header(headers::CONTENT_LENGTH, BODY.len().to_string());
    let mut body = BytesBody::new(BODY);
    let resp = cluster.controller.put(&req, &mut body, None).await;

    assert_eq!(resp.status, Status::CREATED, "three writers still make quorum");
}

#[tokio::test]
async fn test_ec_put_commit_held_until_footer_ack_quorum() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    // Only the first writer acknowledges its footers; the rest answer the
    // acknowledgment phase with a final 503.
    cluster.connector.script(&c[0], MockScript::put(Status::CREATED));
    for node in &c[1..4] {
        cluster.connector.script(
            node,
            MockScript::put(Status::CREATED).commit_final(Status::SERVICE_UNAVAILABLE),
        );
    }

    let req = cluster
        .request()
        .header(headers::CONTENT_LENGTH, BODY.len().to_string());
    let mut body = BytesBody::new(BODY);
    let resp = cluster.controller.put(&req, &mut body, None).await;
    assert_eq!(resp.status, Status::SERVICE_UNAVAILABLE);

    // Below the acknowledgment quorum nothing may become durable: no node,
    // the acknowledging one included, sees a commit marker.
    let captured = cluster.connector.captured();
    assert!(!captured.is_empty());
    for exchange in &captured {
        let body = String::from_utf8_lossy(&exchange.body);
        assert!(
            !body.contains(DOC_PUT_COMMIT),
            "commit marker reached {}",
            exchange.node
        );
    }
}

#[tokio::test]
async fn test_ec_get_reconstructs_object() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    let etag = blake_hex(BODY);
    let archives = ec_archives(BODY, 2, 2, 8);
    for (i, node) in c[..4].iter().enumerate() {
        cluster.connector.script(
            node,
            frag_reply(archives[i].clone(), i as u8, &etag, version(), BODY.len(), true),
        );
    }

    let resp = cluster.controller.get(&cluster.request()).await;
    assert_eq!(resp.status, Status::OK);
    assert_eq!(resp.body, BODY);
    assert_eq!(resp.get_header(headers::ETAG), Some(etag.as_str()));
    assert_eq!(
        resp.get_header(headers::CONTENT_LENGTH),
        Some(BODY.len().to_string().as_str())
    );
}

#[tokio::test]
async fn test_ec_get_runs_on_spawned_task() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    let etag = blake_hex(BODY);
    let archives = ec_archives(BODY, 2, 2, 8);
    for (i, node) in c[..4].iter().enumerate() {
        cluster.connector.script(
            node,
            frag_reply(archives[i].clone(), i as u8, &etag, version(), BODY.len(), true),
        );
    }

    // Request handling runs on spawned worker tasks; the controller
    // futures have to move across threads.
    let handle = tokio::spawn(async move { cluster.controller.get(&cluster.request()).await });
    let resp = handle.await.unwrap();
    assert_eq!(resp.status, Status::OK);
    assert_eq!(resp.body, BODY);
}

#[tokio::test]
async fn test_ec_get_widened_search_carries_fragment_preferences() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    let etag = blake_hex(BODY);
    let archives = ec_archives(BODY, 2, 2, 8);
    // The first wave only ever produces fragment index 0; the search has
    // to widen past the primaries for a second index.
    for node in &c[..4] {
        cluster.connector.script(
            node,
            frag_reply(archives[0].clone(), 0, &etag, version(), BODY.len(), true),
        );
    }
    cluster.connector.script(
        &c[4],
        frag_reply(archives[1].clone(), 1, &etag, version(), BODY.len(), true),
    );

    let resp = cluster.controller.get(&cluster.request()).await;
    assert_eq!(resp.status, Status::OK);
    assert_eq!(resp.body, BODY);

    let captured = cluster.connector.captured();
    let first = captured.iter().find(|e| e.node == c[0]).unwrap();
    assert_eq!(
        first.request.get_header(headers::FRAGMENT_PREFERENCES),
        None,
        "first wave goes out before anything is known"
    );
    let widened = captured.iter().find(|e| e.node == c[4]).unwrap();
    let hints: Vec<BTreeMap<String, serde_json::Value>> = serde_json::from_str(
        widened
            .request
            .get_header(headers::FRAGMENT_PREFERENCES)
            .unwrap(),
    )
    .unwrap();
    assert_eq!(hints.len(), 1);
    assert_eq!(hints[0]["timestamp"], version().to_string());
    assert_eq!(hints[0]["exclude"], serde_json::json!([0]));
}

#[tokio::test]
async fn test_ec_get_decodes_from_parity_only() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    let etag = blake_hex(BODY);
    let archives = ec_archives(BODY, 2, 2, 8);
    // Both data fragments are gone; parity indices 2 and 3 must suffice.
    cluster.connector.script(&c[0], MockScript::get(Status::NOT_FOUND, ""));
    cluster.connector.script(&c[1], MockScript::get(Status::NOT_FOUND, ""));
    cluster.connector.script(
        &c[2],
        frag_reply(archives[2].clone(), 2, &etag, version(), BODY.len(), true),
    );
    cluster.connector.script(
        &c[3],
        frag_reply(archives[3].clone(), 3, &etag, version(), BODY.len(), true),
    );

    let resp = cluster.controller.get(&cluster.request()).await;
    assert_eq!(resp.status, Status::OK);
    assert_eq!(resp.body, BODY);
}

#[tokio::test]
async fn test_ec_get_all_not_found() {
    let cluster = Cluster::new(POLICY, 8);
    // Every candidate, handoffs included, has nothing.
    for node in &cluster.candidates() {
        cluster.connector.script(node, MockScript::get(Status::NOT_FOUND, ""));
    }
    let resp = cluster.controller.get(&cluster.request()).await;
    assert_eq!(resp.status, Status::NOT_FOUND);
}

#[tokio::test]
async fn test_ec_get_without_durable_mark_is_unavailable() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    let etag = blake_hex(BODY);
    let archives = ec_archives(BODY, 2, 2, 8);
    for (i, node) in c[..4].iter().enumerate() {
        cluster.connector.script(
            node,
            frag_reply(archives[i].clone(), i as u8, &etag, version(), BODY.len(), false),
        );
    }

    let resp = cluster.controller.get(&cluster.request()).await;
    assert_eq!(
        resp.status,
        Status::SERVICE_UNAVAILABLE,
        "enough fragments but none marked durable"
    );
}

#[tokio::test]
async fn test_ec_get_newest_readable_version_wins() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    let old_body = b"old object contents!";
    let new_body = b"new object contents!";
    let old_etag = blake_hex(old_body);
    let new_etag = blake_hex(new_body);
    let old_archives = ec_archives(old_body, 2, 2, 8);
    let new_archives = ec_archives(new_body, 2, 2, 8);
    let old_ts = Timestamp::from_secs(1_698_000_000);
    let new_ts = Timestamp::from_secs(1_699_000_000);

    // The stale version has a single surviving fragment and never becomes
    // readable; the newer version does.
    cluster.connector.script(
        &c[0],
        frag_reply(old_archives[0].clone(), 0, &old_etag, old_ts, old_body.len(), true),
    );
    for (slot, i) in [(1usize, 0u8), (2, 1), (3, 2)] {
        cluster.connector.script(
            &c[slot],
            frag_reply(
                new_archives[i as usize].clone(),
                i,
                &new_etag,
                new_ts,
                new_body.len(),
                true,
            ),
        );
    }

    let resp = cluster.controller.get(&cluster.request()).await;
    assert_eq!(resp.status, Status::OK);
    assert_eq!(resp.body, &new_body[..]);
    assert_eq!(resp.get_header(headers::ETAG), Some(new_etag.as_str()));
}

#[tokio::test]
async fn test_ec_get_range_translates_to_fragment_coordinates() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    let etag = blake_hex(BODY);
    let archives = ec_archives(BODY, 2, 2, 8);
    for (i, node) in c[..4].iter().enumerate() {
        cluster.connector.script(
            node,
            frag_reply(archives[i].clone(), i as u8, &etag, version(), BODY.len(), true),
        );
    }

    // Bytes 6..=9 cross the first segment boundary.
    let req = cluster.request().header(headers::RANGE, "bytes=6-9");
    let resp = cluster.controller.get(&req).await;

    assert_eq!(resp.status, Status::PARTIAL_CONTENT);
    assert_eq!(resp.body, &BODY[6..=9]);
    assert_eq!(
        resp.get_header(headers::CONTENT_RANGE),
        Some("bytes 6-9/20")
    );
    assert_eq!(resp.get_header(headers::CONTENT_LENGTH), Some("4"));

    // Segments 0-1 at 4-byte slices: the backends saw fragment coordinates.
    let captured = cluster.connector.captured();
    assert!(!captured.is_empty());
    for exchange in &captured {
        assert_eq!(exchange.request.get_header(headers::RANGE), Some("bytes=0-7"));
    }
}

#[tokio::test]
async fn test_ec_get_range_in_tail_segment() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    let etag = blake_hex(BODY);
    let archives = ec_archives(BODY, 2, 2, 8);
    // The backends honor the fragment range: segment 2's slices start at
    // archive offset 8 (two full segments at 4 bytes each).
    for (i, node) in c[..4].iter().enumerate() {
        cluster.connector.script(
            node,
            frag_reply(
                Bytes::copy_from_slice(&archives[i][8..]),
                i as u8,
                &etag,
                version(),
                BODY.len(),
                true,
            ),
        );
    }

    let req = cluster.request().header(headers::RANGE, "bytes=16-19");
    let resp = cluster.controller.get(&req).await;

    assert_eq!(resp.status, Status::PARTIAL_CONTENT);
    assert_eq!(resp.body, &BODY[16..20]);
    assert_eq!(
        resp.get_header(headers::CONTENT_RANGE),
        Some("bytes 16-19/20")
    );
}

#[tokio::test]
async fn test_ec_get_range_agreement_unsatisfiable() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    for node in &c[..4] {
        cluster
            .connector
            .script(node, MockScript::get(Status::RANGE_NOT_SATISFIABLE, ""));
    }

    let req = cluster.request().header(headers::RANGE, "bytes=1000-2000");
    let resp = cluster.controller.get(&req).await;

    assert_eq!(resp.status, Status::RANGE_NOT_SATISFIABLE);
    assert_eq!(resp.body, UNSATISFIABLE_BODY);
    assert_eq!(
        resp.get_header(headers::CONTENT_LENGTH),
        Some(UNSATISFIABLE_BODY.len().to_string().as_str())
    );
}

#[tokio::test]
async fn test_ec_get_slow_source_replaced_mid_stream() {
    // ndata=2, nparity=0: both primaries are always selected, so the stall
    // deterministically hits a decode source and the replacement must come
    // from a handoff carrying the abandoned index.
    let policy = StoragePolicy::ErasureCoded {
        ndata: 2,
        nparity: 0,
        segment_size: 8,
    };
    let cluster = Cluster::new(policy, 4);
    let c = cluster.candidates();
    let etag = blake_hex(BODY);
    let archives = ec_archives(BODY, 2, 0, 8);

    cluster.connector.script(
        &c[0],
        frag_reply(archives[0].clone(), 0, &etag, version(), BODY.len(), true)
            .chunk_size(4)
            .stall_chunk_at(0, Duration::from_secs(5)),
    );
    cluster.connector.script(
        &c[1],
        frag_reply(archives[1].clone(), 1, &etag, version(), BODY.len(), true),
    );
    // Both handoffs offer the stalled fragment index at the same version.
    for node in &c[2..4] {
        cluster.connector.script(
            node,
            frag_reply(archives[0].clone(), 0, &etag, version(), BODY.len(), true),
        );
    }

    let resp = cluster.controller.get(&cluster.request()).await;
    assert_eq!(resp.status, Status::OK);
    assert_eq!(resp.body, BODY, "stalled source abandoned, stream resumed");
    assert_eq!(cluster.limiter.error_count(&c[0]), 1);

    // Every poll past the first wave names the version being collected.
    let captured = cluster.connector.captured();
    let handoff_polls: Vec<_> = captured
        .iter()
        .filter(|e| e.node == c[2] || e.node == c[3])
        .collect();
    assert!(!handoff_polls.is_empty());
    for exchange in handoff_polls {
        let hint = exchange
            .request
            .get_header(headers::FRAGMENT_PREFERENCES)
            .unwrap();
        assert!(hint.contains(&version().to_string()));
    }
}

#[tokio::test]
async fn test_ec_head_reports_whole_object() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    let etag = blake_hex(BODY);
    let archives = ec_archives(BODY, 2, 2, 8);
    for (i, node) in c[..4].iter().enumerate() {
        cluster.connector.script(
            node,
            frag_reply(archives[i].clone(), i as u8, &etag, version(), BODY.len(), true),
        );
    }

    let resp = cluster.controller.head(&cluster.request()).await;
    assert_eq!(resp.status, Status::OK);
    assert!(resp.body.is_empty());
    assert_eq!(resp.get_header(headers::ETAG), Some(etag.as_str()));
    assert_eq!(resp.get_header(headers::CONTENT_LENGTH), Some("20"));
}

#[tokio::test]
async fn test_ec_delete_resolves_by_quorum() {
    let cluster = Cluster::new(POLICY, 8);
    let c = cluster.candidates();
    for node in &c[..4] {
        cluster.connector.script(node, MockScript::put(Status::NO_CONTENT));
    }
    let resp = cluster.controller.delete(&cluster.request()).await;
    assert_eq!(resp.status, Status::NO_CONTENT);
}
