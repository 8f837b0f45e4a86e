//! In-process network for running many DHT nodes inside one runtime.
//!
//! Every request is encoded and decoded with the wire codec on the way in
//! and on the way out, so the simulation exercises the same framing limits a
//! real transport would. Per-node faults (offline, corrupting) and global
//! latency and loss can be changed while nodes are running.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::config::DhtConfig;
use crate::dht::DhtNode;
use crate::identity::{Contact, Key, NodeId};
use crate::messages::{DhtRequest, DhtResponse, decode_bounded, encode};
use crate::protocols::{DhtRpc, FindValueResponse};
use crate::record::Record;

/// One delivered (or attempted) request, for assertions on traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimRequest {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: &'static str,
}

#[derive(Default)]
struct Faults {
    offline: HashSet<NodeId>,
    corrupting: HashSet<NodeId>,
    latency: Duration,
    loss_rate: f64,
}

#[derive(Default)]
pub struct SimNetwork {
    nodes: RwLock<HashMap<NodeId, DhtNode<SimTransport>>>,
    faults: RwLock<Faults>,
    log: Mutex<Vec<SimRequest>>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn address_for(id: &NodeId) -> String {
        format!("sim://{}", id.short())
    }

    pub async fn spawn_node(self: &Arc<Self>, config: DhtConfig) -> Result<DhtNode<SimTransport>> {
        self.spawn_node_with_id(NodeId::random(), config).await
    }

    pub async fn spawn_node_with_id(
        self: &Arc<Self>,
        id: NodeId,
        config: DhtConfig,
    ) -> Result<DhtNode<SimTransport>> {
        let contact = Contact::new(id, Self::address_for(&id));
        let transport = SimTransport {
            net: Arc::downgrade(self),
            self_contact: contact.clone(),
        };
        let node = DhtNode::new(contact, transport, config)?;

        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&id) {
            node.quit().await;
            bail!("node {} already exists", id.short());
        }
        nodes.insert(id, node.clone());
        Ok(node)
    }

    pub async fn node(&self, id: &NodeId) -> Option<DhtNode<SimTransport>> {
        self.nodes.read().await.get(id).cloned()
    }

    /// Whichever node currently listens at `addr`.
    async fn node_at(&self, addr: &str) -> Option<DhtNode<SimTransport>> {
        self.nodes
            .read()
            .await
            .values()
            .find(|node| node.contact().addr == addr)
            .cloned()
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().await.keys().copied().collect()
    }

    /// An offline node neither answers nor reaches anyone.
    pub async fn set_offline(&self, id: &NodeId, offline: bool) {
        let mut faults = self.faults.write().await;
        if offline {
            faults.offline.insert(*id);
        } else {
            faults.offline.remove(id);
        }
    }

    /// A corrupting node flips a payload byte in every record it serves.
    pub async fn set_corrupting(&self, id: &NodeId, corrupting: bool) {
        let mut faults = self.faults.write().await;
        if corrupting {
            faults.corrupting.insert(*id);
        } else {
            faults.corrupting.remove(id);
        }
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.faults.write().await.latency = latency;
    }

    /// Probability in `[0, 1]` that a request is dropped.
    pub async fn set_loss_rate(&self, rate: f64) {
        self.faults.write().await.loss_rate = rate.clamp(0.0, 1.0);
    }

    pub async fn requests(&self) -> Vec<SimRequest> {
        self.log.lock().await.clone()
    }

    pub async fn clear_log(&self) {
        self.log.lock().await.clear();
    }

    /// Stop every node's actor and forget them.
    pub async fn shutdown(&self) {
        let nodes: Vec<_> = self.nodes.write().await.drain().map(|(_, n)| n).collect();
        for node in nodes {
            node.quit().await;
        }
    }

    async fn deliver(&self, from: &Contact, to: &Contact, request: DhtRequest) -> Result<DhtResponse> {
        self.log.lock().await.push(SimRequest {
            from: from.node_id,
            to: to.node_id,
            kind: request.kind(),
        });

        let (latency, loss_rate, reachable, corrupting) = {
            let faults = self.faults.read().await;
            (
                faults.latency,
                faults.loss_rate,
                !faults.offline.contains(&to.node_id) && !faults.offline.contains(&from.node_id),
                faults.corrupting.contains(&to.node_id),
            )
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !reachable {
            bail!("{} is unreachable", to.addr);
        }
        if loss_rate > 0.0 && rand::random::<f64>() < loss_rate {
            bail!("request to {} dropped", to.addr);
        }

        let node = self
            .node_at(&to.addr)
            .await
            .ok_or_else(|| anyhow!("no node listening at {}", to.addr))?;

        let frame = encode(&request).context("encode request")?;
        let request: DhtRequest = decode_bounded(&frame).context("decode request")?;
        let mut response = node.handle_request(request).await;

        if corrupting && let DhtResponse::Value(record) = &mut response {
            match record.payload.first_mut() {
                Some(byte) => *byte ^= 0xFF,
                None => record.payload.push(0),
            }
        }

        let frame = encode(&response).context("encode response")?;
        decode_bounded(&frame).context("decode response")
    }
}

/// [`DhtRpc`] bound to one simulated node.
pub struct SimTransport {
    net: Weak<SimNetwork>,
    self_contact: Contact,
}

impl SimTransport {
    async fn call(&self, to: &Contact, request: DhtRequest) -> Result<DhtResponse> {
        let net = self.net.upgrade().context("simulated network dropped")?;
        match net.deliver(&self.self_contact, to, request).await? {
            DhtResponse::Error { message } => Err(anyhow!("remote error: {message}")),
            response => Ok(response),
        }
    }

    fn sender(&self) -> Contact {
        self.self_contact.clone()
    }
}

#[async_trait]
impl DhtRpc for SimTransport {
    async fn ping(&self, to: &Contact) -> Result<()> {
        match self.call(to, DhtRequest::Ping { from: self.sender() }).await? {
            DhtResponse::Pong { from } if from.node_id == to.node_id => Ok(()),
            DhtResponse::Pong { from } => bail!(
                "{} answered a ping for {}",
                from.node_id.short(),
                to.node_id.short()
            ),
            other => bail!("unexpected response to ping: {other:?}"),
        }
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let request = DhtRequest::FindNode {
            from: self.sender(),
            target,
        };
        match self.call(to, request).await? {
            DhtResponse::Nodes(contacts) => Ok(contacts),
            other => bail!("unexpected response to find_node: {other:?}"),
        }
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueResponse> {
        let request = DhtRequest::FindValue {
            from: self.sender(),
            key,
        };
        match self.call(to, request).await? {
            DhtResponse::Value(record) => Ok(FindValueResponse::Found(record)),
            DhtResponse::Nodes(contacts) => Ok(FindValueResponse::Closer(contacts)),
            other => bail!("unexpected response to find_value: {other:?}"),
        }
    }

    async fn store(&self, to: &Contact, record: Record) -> Result<bool> {
        let request = DhtRequest::Store {
            from: self.sender(),
            record,
        };
        match self.call(to, request).await? {
            DhtResponse::Stored => Ok(true),
            DhtResponse::StoreRejected { .. } => Ok(false),
            other => bail!("unexpected response to store: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_peer_is_unreachable_but_logged() {
        let net = SimNetwork::new();
        let a = net.spawn_node(DhtConfig::default()).await.unwrap();
        let b = net.spawn_node(DhtConfig::default()).await.unwrap();

        assert!(a.network().ping(&b.contact()).await.is_ok());
        net.set_offline(&b.node_id(), true).await;
        assert!(a.network().ping(&b.contact()).await.is_err());

        let log = net.requests().await;
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|r| r.kind == "ping" && r.to == b.node_id()));
        net.shutdown().await;
    }

    #[tokio::test]
    async fn pong_from_another_node_fails_the_ping() {
        let net = SimNetwork::new();
        let a = net.spawn_node(DhtConfig::default()).await.unwrap();
        let b = net.spawn_node(DhtConfig::default()).await.unwrap();

        // A stale contact whose address now belongs to b.
        let stale = Contact::new(NodeId::random(), b.contact().addr);
        let err = a.network().ping(&stale).await.unwrap_err();
        assert!(err.to_string().contains("answered a ping"));
        assert!(a.network().ping(&b.contact()).await.is_ok());
        net.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_id_is_refused() {
        let net = SimNetwork::new();
        let id = NodeId::random();
        net.spawn_node_with_id(id, DhtConfig::default()).await.unwrap();
        assert!(net.spawn_node_with_id(id, DhtConfig::default()).await.is_err());
        net.shutdown().await;
    }

    #[tokio::test]
    async fn full_loss_drops_everything() {
        let net = SimNetwork::new();
        let a = net.spawn_node(DhtConfig::default()).await.unwrap();
        let b = net.spawn_node(DhtConfig::default()).await.unwrap();
        net.set_loss_rate(1.0).await;
        assert!(a.network().find_node(&b.contact(), NodeId::random()).await.is_err());
        net.shutdown().await;
    }
}
