//! Network-level behaviour: lookup convergence and termination, durability
//! under churn, routing order and record authenticity.

use std::sync::Arc;
use std::time::Duration;

use patternmesh::{
    Contact, DhtConfig, DhtNode, Keypair, LookupError, NodeId, SimNetwork, SimTransport,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

async fn spawn_network(
    net: &Arc<SimNetwork>,
    n: usize,
    config: DhtConfig,
) -> Vec<DhtNode<SimTransport>> {
    let mut nodes = Vec::with_capacity(n);
    for _ in 0..n {
        nodes.push(net.spawn_node(config.clone()).await.expect("spawn failed"));
    }
    let seed = nodes[0].contact();
    for node in nodes.iter().skip(1) {
        node.bootstrap(vec![seed.clone()]).await.expect("bootstrap failed");
    }
    nodes
}

fn with_first_byte(first: u8, last: u8) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[0] = first;
    bytes[31] = last;
    NodeId::from_bytes(bytes)
}

/// `key` with one bit flipped at byte `index`.
fn near(key: &NodeId, index: usize, mask: u8) -> NodeId {
    let mut bytes = *key.as_bytes();
    bytes[index] ^= mask;
    NodeId::from_bytes(bytes)
}

#[tokio::test]
async fn lookups_converge_within_logarithmic_rounds() {
    let n = 128;
    let net = SimNetwork::new();
    let nodes = spawn_network(&net, n, DhtConfig::default()).await;
    let bound = 2 * (n as f64).log2().ceil() as usize;

    let mut keys = Vec::new();
    for i in 0..8 {
        let creator = Keypair::generate();
        let report = nodes[i * 13 % n]
            .publish(format!("pattern-{i}").into_bytes(), &creator)
            .await
            .expect("publish failed");
        keys.push(report.key);
    }

    for (i, key) in keys.iter().enumerate() {
        let reader = &nodes[(i * 31 + 7) % n];
        let (record, stats) = timeout(TEST_TIMEOUT, reader.lookup_with_deadline(*key, TEST_TIMEOUT))
            .await
            .expect("lookup timed out")
            .expect("lookup failed");
        assert_eq!(record.key, *key);
        assert!(
            stats.rounds <= bound,
            "lookup took {} rounds, bound is {bound}",
            stats.rounds
        );
    }
    net.shutdown().await;
}

#[tokio::test]
async fn record_survives_three_quarters_of_holders_leaving() {
    let net = SimNetwork::new();
    let nodes = spawn_network(&net, 60, DhtConfig::default()).await;
    let publisher = &nodes[5];
    let creator = Keypair::generate();

    let report = publisher
        .publish(b"pattern:durable".to_vec(), &creator)
        .await
        .expect("publish failed");
    assert_eq!(report.acks, 20);

    let mut holders = Vec::new();
    let mut readers = Vec::new();
    for node in &nodes {
        if node.telemetry().await.stored_records == 1 {
            holders.push(node.clone());
        } else {
            readers.push(node.clone());
        }
    }
    assert!(holders.len() >= 20);

    // Take the publisher and 15 of the 20 replica holders down.
    let mut offline = vec![publisher.node_id()];
    offline.extend(
        holders
            .iter()
            .map(|h| h.node_id())
            .filter(|id| *id != publisher.node_id())
            .take(15),
    );
    for id in &offline {
        net.set_offline(id, true).await;
    }

    for reader in readers.iter().take(5) {
        let record = timeout(TEST_TIMEOUT, reader.lookup(report.key))
            .await
            .expect("lookup timed out")
            .expect("record lost");
        assert_eq!(record.payload, b"pattern:durable");
    }
    net.shutdown().await;
}

#[tokio::test]
async fn lookup_queries_closest_known_contact_first() {
    let net = SimNetwork::new();
    let config = DhtConfig {
        alpha: 1,
        ..DhtConfig::default()
    };
    let a = net
        .spawn_node_with_id(with_first_byte(0b0000_0000, 0), config.clone())
        .await
        .unwrap();
    let b = net
        .spawn_node_with_id(with_first_byte(0b0010_0000, 0), config.clone())
        .await
        .unwrap();
    let c = net
        .spawn_node_with_id(with_first_byte(0b1110_0000, 0), config)
        .await
        .unwrap();

    let key = with_first_byte(0b0010_0000, 5);
    let creator = Keypair::generate();
    // B knows nobody yet, so the record stays with B alone.
    let _ = b
        .publish_at(key, b"meta".to_vec(), vec![b.contact().addr], &creator)
        .await;

    c.observe_contact(a.contact()).await;
    c.observe_contact(b.contact()).await;
    net.clear_log().await;

    let (record, stats) = c
        .lookup_with_deadline(key, TEST_TIMEOUT)
        .await
        .expect("lookup failed");
    assert_eq!(record.payload, b"meta");
    assert_eq!(stats.rounds, 1);

    let first = net
        .requests()
        .await
        .into_iter()
        .find(|r| r.from == c.node_id() && r.kind == "find_value")
        .expect("no find_value sent");
    assert_eq!(first.to, b.node_id());
    net.shutdown().await;
}

#[tokio::test]
async fn lookup_reaches_holder_through_intermediate() {
    let net = SimNetwork::new();
    let config = DhtConfig {
        alpha: 1,
        ..DhtConfig::default()
    };
    let a = net
        .spawn_node_with_id(with_first_byte(0b0000_0000, 0), config.clone())
        .await
        .unwrap();
    let b = net
        .spawn_node_with_id(with_first_byte(0b0010_0000, 0), config.clone())
        .await
        .unwrap();
    let c = net
        .spawn_node_with_id(with_first_byte(0b1110_0000, 0), config)
        .await
        .unwrap();

    // A is alone when it publishes, so only A holds the record.
    let key = with_first_byte(0b0000_0000, 5);
    let creator = Keypair::generate();
    let _ = a
        .publish_at(key, b"meta".to_vec(), vec![a.contact().addr], &creator)
        .await;

    b.observe_contact(a.contact()).await;
    c.observe_contact(b.contact()).await;
    net.clear_log().await;

    let (record, stats) = c
        .lookup_with_deadline(key, TEST_TIMEOUT)
        .await
        .expect("lookup failed");
    assert_eq!(record.payload, b"meta");
    assert!(record.verify().is_ok());
    assert_eq!(stats.rounds, 2);

    let hops: Vec<NodeId> = net
        .requests()
        .await
        .into_iter()
        .filter(|r| r.from == c.node_id() && r.kind == "find_value")
        .map(|r| r.to)
        .collect();
    assert_eq!(hops, vec![b.node_id(), a.node_id()]);
    net.shutdown().await;
}

#[tokio::test]
async fn answered_round_without_progress_ends_lookup() {
    let net = SimNetwork::new();
    let reader = net
        .spawn_node(DhtConfig {
            alpha: 1,
            ..DhtConfig::default()
        })
        .await
        .unwrap();
    for _ in 0..10 {
        let peer = net.spawn_node(DhtConfig::default()).await.unwrap();
        reader.observe_contact(peer.contact()).await;
    }
    net.clear_log().await;

    let result = reader.lookup(NodeId::random()).await;
    assert!(matches!(result, Err(LookupError::NotFound)));

    let sent = net
        .requests()
        .await
        .into_iter()
        .filter(|r| r.from == reader.node_id() && r.kind == "find_value")
        .count();
    assert_eq!(sent, 1);
    net.shutdown().await;
}

#[tokio::test]
async fn tampered_record_is_discarded_during_lookup() {
    let net = SimNetwork::new();
    let payload = b"pattern:authentic".to_vec();
    let key = NodeId::hash_content(&payload);

    let publisher = net.spawn_node(DhtConfig::default()).await.unwrap();
    let corrupt = net
        .spawn_node_with_id(near(&key, 31, 0x01), DhtConfig::default())
        .await
        .unwrap();
    let honest = net
        .spawn_node_with_id(near(&key, 0, 0x80), DhtConfig::default())
        .await
        .unwrap();
    let reader = net
        .spawn_node_with_id(near(&key, 0, 0x40), DhtConfig {
            alpha: 1,
            ..DhtConfig::default()
        })
        .await
        .unwrap();

    publisher.observe_contact(corrupt.contact()).await;
    publisher.observe_contact(honest.contact()).await;
    let creator = Keypair::generate();
    let report = publisher.publish(payload.clone(), &creator).await.expect("publish failed");
    assert_eq!(report.acks, 2);

    net.set_corrupting(&corrupt.node_id(), true).await;
    reader.observe_contact(corrupt.contact()).await;
    reader.observe_contact(honest.contact()).await;

    let (record, stats) = reader
        .lookup_with_deadline(key, TEST_TIMEOUT)
        .await
        .expect("honest copy not found");
    assert_eq!(record.payload, payload);
    assert!(record.verify().is_ok());
    assert_eq!((stats.rounds, stats.queried), (2, 2));

    // With the honest holder gone only the forged copy is left.
    let late_reader = net.spawn_node(DhtConfig::default()).await.unwrap();
    late_reader.observe_contact(corrupt.contact()).await;
    net.set_offline(&honest.node_id(), true).await;
    let result = late_reader.lookup(key).await;
    assert!(matches!(result, Err(LookupError::NotFound)));
    net.shutdown().await;
}

#[tokio::test]
async fn lookup_on_empty_routing_table_is_unreachable() {
    let net = SimNetwork::new();
    let node = net.spawn_node(DhtConfig::default()).await.unwrap();
    let ghost = Contact::new(NodeId::random(), "sim://ghost");

    assert!(matches!(
        node.lookup(NodeId::random()).await,
        Err(LookupError::Unreachable)
    ));
    node.observe_contact(ghost).await;
    assert!(matches!(
        node.find_node(NodeId::random()).await,
        Err(LookupError::Unreachable)
    ));
    net.shutdown().await;
}
