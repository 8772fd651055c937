//! Gossip convergence, in memory and over loopback TCP.

mod common;

use std::collections::BTreeMap;

use dnsmesh::gossip::{GossipState, KvRecord, KvRecords, KvState};

use common::*;

fn record(key: &str, value: &str, version: u64) -> KvRecords {
    KvRecords::from([(key.to_string(), KvRecord::data(value, version))])
}

#[test]
fn full_exchange_converges_to_newest_version() {
    let p1 = KvState::new();
    let p2 = KvState::new();
    p1.merge(&record("k", "A", 5));
    p2.merge(&record("k", "B", 7));

    p1.merge(&p2.records());
    p2.merge(&p1.records());

    assert_eq!(p1.snapshot().values["k"], "B");
    assert_eq!(p2.snapshot().values["k"], "B");
}

#[test]
fn delivery_order_does_not_matter() {
    let updates = [record("k", "v1", 10), record("k", "v2", 20)];

    let forward = KvState::new();
    for update in &updates {
        forward.merge(update);
    }
    let backward = KvState::new();
    for update in updates.iter().rev() {
        backward.merge(update);
    }

    assert_eq!(forward.get("k"), Some("v2".to_string()));
    assert_eq!(backward.get("k"), Some("v2".to_string()));
}

#[tokio::test]
async fn peers_converge_over_tcp() {
    let (_t1, p1) = start_mesh("p1", &[]).await;
    p1.state().merge(&record("k", "A", 5));

    let (_t2, p2) = start_mesh("p2", &[p1.local_addr().to_string()]).await;
    p2.state().merge(&record("k", "B", 7));

    assert!(eventually(|| p1.get("k").as_deref() == Some("B")).await);
    assert!(eventually(|| p2.get("k").as_deref() == Some("B")).await);
    assert_eq!(p1.peers().len(), 1);
    assert_eq!(p1.peers()[0].node, "p2");
}

#[tokio::test]
async fn changes_forwarded_through_intermediate_peer() {
    let (_t1, p1) = start_mesh("p1", &[]).await;
    let (_t2, p2) = start_mesh("p2", &[p1.local_addr().to_string()]).await;
    let (_t3, p3) = start_mesh("p3", &[p2.local_addr().to_string()]).await;
    assert!(eventually(|| p2.peers().len() == 2).await);

    p1.update_values(
        &[],
        &BTreeMap::from([("dns/local/A/api.local".to_string(), "10.0.0.1".to_string())]),
    )
    .unwrap();
    assert!(eventually(|| p3.get("dns/local/A/api.local").is_some()).await);

    p3.update_values(&["dns/local/A/api.local".to_string()], &BTreeMap::new())
        .unwrap();
    assert!(eventually(|| p1.get("dns/local/A/api.local").is_none()).await);
    assert!(p1.snapshot().values.is_empty());
}

#[tokio::test]
async fn stopped_peer_leaves_mesh() {
    let (_t1, p1) = start_mesh("p1", &[]).await;
    let (t2, p2) = start_mesh("p2", &[p1.local_addr().to_string()]).await;
    assert!(eventually(|| p1.peers().len() == 1).await);

    t2.trigger();
    p2.wait_stopped().await;
    assert!(eventually(|| p1.peers().is_empty()).await);
}
