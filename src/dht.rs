//! # DHT Node
//!
//! [`DhtNode`] is a cheap, cloneable handle. All mutable state (routing table,
//! record store, churn monitor, republish schedules) is owned by a single
//! actor task and reached only through its command channel.
//!
//! The actor never awaits the network. Liveness pings for full buckets are
//! spawned and report back with `ApplyPingResult`; lookups run on the
//! caller's task and talk to the actor for seeds and observations.
//!
//! ## Background tasks
//!
//! | Task | Period | Work |
//! |------|--------|------|
//! | bucket refresh | `bucket_refresh_interval` | random-target FIND_NODE per stale bucket |
//! | republish | `escalated_republish_interval` | republish due records, sweep expired |
//!
//! Both stop once the actor has shut down.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::churn::{ChurnMonitor, ChurnVerdict, refresh_targets};
use crate::config::DhtConfig;
use crate::error::{BootstrapError, LookupError, PublishError, StoreError};
use crate::identity::{Contact, Key, Keypair, NodeId, now_ms};
use crate::messages::{DhtRequest, DhtResponse};
use crate::protocols::DhtRpc;
use crate::record::Record;
use crate::replication::{ReplicaHealth, RepublishJob, ReplicationManager};
use crate::routing::{ObserveOutcome, PendingPing, RoutingInsertionLimiter, RoutingTable};
use crate::store::{LocalRecordStore, PutOutcome};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Result of a successful publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishReport {
    pub key: Key,
    /// Peers that acknowledged the STORE.
    pub acks: usize,
    /// Peers the STORE was sent to.
    pub targets: usize,
}

impl PublishReport {
    /// Fewer acknowledgements than targets; republish will retry.
    pub fn is_partial(&self) -> bool {
        self.acks < self.targets
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub routing_contacts: usize,
    pub stored_records: usize,
    pub published_records: usize,
    pub unhealthy_records: usize,
    pub escalated_records: usize,
    pub failing_contacts: usize,
}

pub struct DhtNode<N: DhtRpc> {
    pub(crate) cmd_tx: mpsc::Sender<Command>,
    pub(crate) id: NodeId,
    pub(crate) self_contact: Contact,
    pub(crate) network: Arc<N>,
    pub(crate) config: Arc<DhtConfig>,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            self_contact: self.self_contact.clone(),
            network: self.network.clone(),
            config: self.config.clone(),
        }
    }
}

pub(crate) enum Command {
    // State updates
    Observe(Contact),
    ObserveLearned(Vec<Contact>, NodeId),
    RequestFailed(NodeId),
    ApplyPingResult(PendingPing, bool),

    // Queries
    Closest(NodeId, usize, oneshot::Sender<Vec<Contact>>),
    LookupContact(NodeId, oneshot::Sender<Option<Contact>>),
    GetLocal(Key, oneshot::Sender<Option<Record>>),
    StoreLocal(Record, Option<Keypair>, oneshot::Sender<Result<PutOutcome, StoreError>>),
    GetTelemetry(oneshot::Sender<TelemetrySnapshot>),

    // Inbound RPC
    HandleRequest(DhtRequest, oneshot::Sender<DhtResponse>),

    // Maintenance
    RefreshTargets(Duration, oneshot::Sender<Vec<(usize, NodeId)>>),
    MarkBucketRefreshed(usize),
    RepublishJobs(bool, oneshot::Sender<Vec<RepublishJob>>),
    ReportReplication(Key, usize, oneshot::Sender<ReplicaHealth>),
    SweepExpired(oneshot::Sender<usize>),

    Quit,
}

struct DhtNodeActor<N: DhtRpc> {
    id: NodeId,
    self_contact: Contact,
    routing: RoutingTable,
    store: LocalRecordStore,
    churn: ChurnMonitor,
    replication: ReplicationManager,
    routing_limiter: RoutingInsertionLimiter,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    config: Arc<DhtConfig>,
}

impl<N: DhtRpc> DhtNode<N> {
    /// Start the actor and background maintenance for a node reachable at
    /// `self_contact`. Must be called from within a Tokio runtime.
    pub fn new(self_contact: Contact, network: N, config: DhtConfig) -> Result<Self> {
        config.validate().context("invalid dht configuration")?;
        let capacity = NonZeroUsize::new(config.store_capacity)
            .context("store capacity must be non-zero")?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let network = Arc::new(network);
        let config = Arc::new(config);
        let id = self_contact.node_id;

        let actor = DhtNodeActor {
            id,
            self_contact: self_contact.clone(),
            routing: RoutingTable::new(id, config.k),
            store: LocalRecordStore::new(id, capacity, config.record_ttl, config.store_quota.clone()),
            churn: ChurnMonitor::new(config.churn_failure_threshold),
            replication: ReplicationManager::new(&config),
            routing_limiter: RoutingInsertionLimiter::new(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            config: config.clone(),
        };
        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            id,
            self_contact,
            network,
            config,
        };
        node.spawn_periodic_bucket_refresh();
        node.spawn_periodic_republish();
        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn contact(&self) -> Contact {
        self.self_contact.clone()
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Record that `contact` is alive (it sent us something or answered).
    pub async fn observe_contact(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::Observe(contact)).await;
    }

    /// Look up a contact by id in the routing table.
    pub async fn lookup_contact(&self, id: &NodeId) -> Option<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::LookupContact(*id, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Up to `count` routing table contacts closest to `target`.
    pub async fn closest_contacts(&self, target: NodeId, count: usize) -> Vec<Contact> {
        self.closest_known(target, count).await.unwrap_or_default()
    }

    pub(crate) async fn closest_known(
        &self,
        target: NodeId,
        count: usize,
    ) -> Result<Vec<Contact>, LookupError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Closest(target, count, tx))
            .await
            .map_err(|_| LookupError::Shutdown)?;
        rx.await.map_err(|_| LookupError::Shutdown)
    }

    /// `contact` answered; `learned` are contacts it told us about.
    pub(crate) async fn note_response(&self, contact: Contact, learned: Vec<Contact>) {
        let from = contact.node_id;
        let _ = self.cmd_tx.send(Command::Observe(contact)).await;
        if !learned.is_empty() {
            let _ = self.cmd_tx.send(Command::ObserveLearned(learned, from)).await;
        }
    }

    pub(crate) async fn note_failure(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::RequestFailed(id)).await;
    }

    pub(crate) async fn get_local(&self, key: Key) -> Result<Option<Record>, LookupError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetLocal(key, tx))
            .await
            .map_err(|_| LookupError::Shutdown)?;
        rx.await.map_err(|_| LookupError::Shutdown)
    }

    pub(crate) async fn store_local(
        &self,
        record: Record,
        publisher: Option<Keypair>,
    ) -> Result<PutOutcome, PublishError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::StoreLocal(record, publisher, tx))
            .await
            .map_err(|_| PublishError::Shutdown)?;
        match rx.await.map_err(|_| PublishError::Shutdown)? {
            Ok(outcome) => Ok(outcome),
            Err(StoreError::Invalid(e)) => Err(PublishError::InvalidRecord(e)),
            Err(e) => Err(PublishError::Rejected(e)),
        }
    }

    pub(crate) async fn republish_jobs(&self, force: bool) -> Option<Vec<RepublishJob>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::RepublishJobs(force, tx)).await.ok()?;
        rx.await.ok()
    }

    pub(crate) async fn report_replication(&self, key: Key, acks: usize) -> Option<ReplicaHealth> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ReportReplication(key, acks, tx))
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Drop expired records now. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::SweepExpired(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Answer an inbound request. Transports call this for every request
    /// addressed to this node.
    pub async fn handle_request(&self, request: DhtRequest) -> DhtResponse {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HandleRequest(request, tx)).await.is_err() {
            return DhtResponse::Error {
                message: "node shut down".into(),
            };
        }
        rx.await.unwrap_or_else(|_| DhtResponse::Error {
            message: "node shut down".into(),
        })
    }

    pub async fn telemetry(&self) -> TelemetrySnapshot {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetTelemetry(tx)).await.is_err() {
            return TelemetrySnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Join the network through `seeds`.
    ///
    /// Every seed is pinged; the ones that answer enter the routing table and
    /// a lookup for our own id fills the neighbourhood. Fails only when no
    /// seed answers at all.
    pub async fn bootstrap(&self, seeds: Vec<Contact>) -> Result<(), BootstrapError> {
        let seeds: Vec<Contact> = seeds.into_iter().filter(|c| c.node_id != self.id).collect();
        if seeds.is_empty() {
            return Err(BootstrapError::NoSeeds);
        }
        let attempted = seeds.len();

        let mut join_set = JoinSet::new();
        for seed in seeds {
            let net = self.network.clone();
            let timeout = self.config.ping_timeout;
            join_set.spawn(async move {
                let alive = matches!(tokio::time::timeout(timeout, net.ping(&seed)).await, Ok(Ok(())));
                (seed, alive)
            });
        }

        let mut reachable = 0;
        while let Some(joined) = join_set.join_next().await {
            let Ok((seed, alive)) = joined else {
                continue;
            };
            if alive {
                reachable += 1;
                self.observe_contact(seed).await;
            } else {
                debug!(seed = %seed.node_id.short(), addr = %seed.addr, "bootstrap seed did not answer");
                self.note_failure(seed.node_id).await;
            }
        }

        if reachable == 0 {
            warn!(attempted, "bootstrap failed: no seed reachable");
            return Err(BootstrapError::Failed { attempted });
        }

        match self.find_node(self.id).await {
            Ok(neighbours) => {
                info!(
                    seeds = reachable,
                    neighbours = neighbours.len(),
                    "bootstrap complete"
                );
            }
            Err(LookupError::Shutdown) => return Err(BootstrapError::Shutdown),
            Err(e) => debug!(error = %e, "self lookup after bootstrap found nothing"),
        }
        Ok(())
    }

    /// Publish `payload` under its content hash, listing this node as the
    /// provider.
    pub async fn publish(&self, payload: Vec<u8>, creator: &Keypair) -> Result<PublishReport, PublishError> {
        let key = NodeId::hash_content(&payload);
        let providers = vec![self.self_contact.addr.clone()];
        self.publish_at(key, payload, providers, creator).await
    }

    /// Publish under an explicit key with explicit provider addresses.
    pub async fn publish_at(
        &self,
        key: Key,
        payload: Vec<u8>,
        providers: Vec<String>,
        creator: &Keypair,
    ) -> Result<PublishReport, PublishError> {
        let record = Record::new(key, payload, providers, creator)?;
        self.publish_inner(record, Some(creator.clone())).await
    }

    /// Push an already signed record. It is republished as a held record.
    pub async fn publish_record(&self, record: Record) -> Result<PublishReport, PublishError> {
        self.publish_inner(record, None).await
    }

    async fn publish_inner(
        &self,
        record: Record,
        publisher: Option<Keypair>,
    ) -> Result<PublishReport, PublishError> {
        let key = record.key;
        let outcome = self.store_local(record.clone(), publisher).await?;
        trace!(key = %key.short(), ?outcome, "record stored locally");

        let (acks, targets) = match self.replicate(&record).await {
            Ok(counts) => counts,
            Err(LookupError::Shutdown) => return Err(PublishError::Shutdown),
            Err(_) => (0, 0),
        };
        let _ = self.report_replication(key, acks).await;

        if acks == 0 {
            warn!(key = %key.short(), targets, "publish reached no peer, kept locally for republish");
            return Err(PublishError::NoReachablePeers);
        }
        let report = PublishReport { key, acks, targets };
        if report.is_partial() {
            warn!(key = %key.short(), acks, targets, "partial replication");
        } else {
            debug!(key = %key.short(), acks, "record published");
        }
        Ok(report)
    }

    fn spawn_periodic_bucket_refresh(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.bucket_refresh_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = node.cmd_tx.closed() => break,
                }

                let (tx, rx) = oneshot::channel();
                let threshold = node.config.bucket_stale_threshold;
                if node.cmd_tx.send(Command::RefreshTargets(threshold, tx)).await.is_err() {
                    break;
                }
                let targets = match rx.await {
                    Ok(targets) => targets,
                    Err(_) => break,
                };
                if targets.is_empty() {
                    continue;
                }

                debug!(count = targets.len(), "refreshing stale routing buckets");
                for (bucket_idx, target) in targets {
                    if let Err(e) = node.find_node(target).await {
                        debug!(bucket = bucket_idx, error = %e, "bucket refresh lookup failed");
                    }
                    let _ = node.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
                }
            }
        });
    }

    /// Stop the actor. Background tasks exit on their next wake.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<N: DhtRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Observe(contact) => {
                    self.handle_observe(contact);
                }
                Command::ObserveLearned(contacts, from) => {
                    self.handle_observe_learned(contacts, &from);
                }
                Command::RequestFailed(id) => {
                    self.handle_request_failed(&id);
                }
                Command::ApplyPingResult(pending, alive) => {
                    trace!(
                        oldest = %pending.oldest.node_id.short(),
                        newcomer = %pending.newcomer.node_id.short(),
                        alive,
                        "bucket ping resolved"
                    );
                    self.routing.apply_ping_result(pending, alive);
                }
                Command::Closest(target, count, reply) => {
                    let _ = reply.send(self.routing.closest(&target, count));
                }
                Command::LookupContact(id, reply) => {
                    let _ = reply.send(self.routing.get(&id).cloned());
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.store.get(&key, now_ms()));
                }
                Command::StoreLocal(record, publisher, reply) => {
                    let key = record.key;
                    let result = self.store.put(record, now_ms());
                    if result.is_ok()
                        && let Some(keypair) = publisher
                    {
                        self.replication.track_published(key, keypair, Instant::now());
                    }
                    let _ = reply.send(result);
                }
                Command::GetTelemetry(reply) => {
                    let snapshot = TelemetrySnapshot {
                        routing_contacts: self.routing.len(),
                        stored_records: self.store.len(),
                        published_records: self.replication.published_count(),
                        unhealthy_records: self.replication.unhealthy_count(),
                        escalated_records: self.replication.escalated_count(),
                        failing_contacts: self.churn.failing_count(),
                    };
                    let _ = reply.send(snapshot);
                }
                Command::HandleRequest(request, reply) => {
                    let response = self.handle_request(request);
                    let _ = reply.send(response);
                }
                Command::RefreshTargets(threshold, reply) => {
                    let _ = reply.send(refresh_targets(&self.routing, threshold));
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.routing.mark_bucket_refreshed(idx);
                }
                Command::RepublishJobs(force, reply) => {
                    let records = self.store.records();
                    let jobs = self.replication.due_jobs(records, Instant::now(), force);
                    let _ = reply.send(jobs);
                }
                Command::ReportReplication(key, acks, reply) => {
                    let _ = reply.send(self.replication.report(key, acks, Instant::now()));
                }
                Command::SweepExpired(reply) => {
                    let removed = self.store.sweep_expired(now_ms());
                    let store = &self.store;
                    self.replication.retain(|key| store.contains(key));
                    let _ = reply.send(removed);
                }
                Command::Quit => {
                    debug!(node = %self.id.short(), "dht actor stopping");
                    break;
                }
            }
        }
    }

    fn handle_observe(&mut self, contact: Contact) {
        if contact.node_id == self.id {
            return;
        }
        self.churn.record_success(&contact.node_id);
        self.insert_contact_into_routing(contact);
    }

    /// Contacts heard about second-hand draw from the reporting peer's budget.
    fn handle_observe_learned(&mut self, contacts: Vec<Contact>, from: &NodeId) {
        for contact in contacts {
            if contact.node_id == self.id || self.routing.contains(&contact.node_id) {
                continue;
            }
            if !self.routing_limiter.allow_insertion(from) {
                trace!(peer = %from.short(), "routing insertion rate limited");
                break;
            }
            self.insert_contact_into_routing(contact);
        }
    }

    fn insert_contact_into_routing(&mut self, contact: Contact) {
        if let ObserveOutcome::PingOldest(pending) = self.routing.observe(contact) {
            let network = self.network.clone();
            let tx = self.cmd_tx.clone();
            let timeout = self.config.ping_timeout;
            tokio::spawn(async move {
                let alive = matches!(
                    tokio::time::timeout(timeout, network.ping(&pending.oldest)).await,
                    Ok(Ok(()))
                );
                let _ = tx.send(Command::ApplyPingResult(pending, alive)).await;
            });
        }
    }

    fn handle_request_failed(&mut self, id: &NodeId) {
        if let ChurnVerdict::Demote = self.churn.record_failure(id)
            && self.routing.demote(id)
        {
            debug!(peer = %id.short(), "demoted unresponsive contact");
        }
    }

    fn closest_for_peer(&self, target: &NodeId, requester: &NodeId) -> Vec<Contact> {
        let mut contacts = self.routing.closest(target, self.config.k + 1);
        contacts.retain(|c| &c.node_id != requester);
        contacts.truncate(self.config.k);
        contacts
    }

    fn handle_request(&mut self, request: DhtRequest) -> DhtResponse {
        let from = request.sender().clone();
        trace!(peer = %from.node_id.short(), kind = request.kind(), "inbound request");
        if from.node_id == self.id {
            return DhtResponse::Error {
                message: "request from own id".into(),
            };
        }
        if !from.validate_structure() {
            return DhtResponse::Error {
                message: "malformed sender contact".into(),
            };
        }
        self.handle_observe(from.clone());

        match request {
            DhtRequest::Ping { .. } => DhtResponse::Pong {
                from: self.self_contact.clone(),
            },
            DhtRequest::FindNode { target, .. } => {
                DhtResponse::Nodes(self.closest_for_peer(&target, &from.node_id))
            }
            DhtRequest::FindValue { key, .. } => match self.store.get(&key, now_ms()) {
                Some(record) => DhtResponse::Value(Box::new(record)),
                None => DhtResponse::Nodes(self.closest_for_peer(&key, &from.node_id)),
            },
            DhtRequest::Store { record, .. } => self.handle_store(&from, record),
        }
    }

    fn handle_store(&mut self, from: &Contact, record: Record) -> DhtResponse {
        let key = record.key;
        if !self
            .routing
            .is_responsible(&key, self.config.responsibility_slack)
        {
            debug!(peer = %from.node_id.short(), key = %key.short(), "store rejected: outside responsibility range");
            return DhtResponse::StoreRejected {
                reason: StoreError::NotResponsible.to_string(),
            };
        }

        match self.store.put_from_peer(record, from.node_id, now_ms()) {
            Ok(outcome) => {
                trace!(peer = %from.node_id.short(), key = %key.short(), ?outcome, "stored record");
                self.replication.note_stored(key, Instant::now());
                DhtResponse::Stored
            }
            Err(e) => {
                debug!(peer = %from.node_id.short(), key = %key.short(), error = %e, "store rejected");
                DhtResponse::StoreRejected {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ID_BYTES;
    use crate::sim::SimNetwork;

    fn id(first: u8) -> NodeId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = first;
        NodeId::from_bytes(bytes)
    }

    fn small_config() -> DhtConfig {
        DhtConfig {
            k: 4,
            alpha: 2,
            ..DhtConfig::default()
        }
    }

    #[tokio::test]
    async fn inbound_request_observes_sender() {
        let net = SimNetwork::new();
        let a = net.spawn_node(small_config()).await.unwrap();
        let b = net.spawn_node(small_config()).await.unwrap();

        let response = b.handle_request(DhtRequest::Ping { from: a.contact() }).await;
        assert!(matches!(response, DhtResponse::Pong { from } if from.node_id == b.node_id()));
        assert!(b.lookup_contact(&a.node_id()).await.is_some());
        assert_eq!(b.telemetry().await.routing_contacts, 1);
        net.shutdown().await;
    }

    #[tokio::test]
    async fn find_node_reply_excludes_requester() {
        let net = SimNetwork::new();
        let server = net.spawn_node(small_config()).await.unwrap();
        let asker = net.spawn_node(small_config()).await.unwrap();
        let other = net.spawn_node(small_config()).await.unwrap();
        server.observe_contact(other.contact()).await;

        let response = server
            .handle_request(DhtRequest::FindNode {
                from: asker.contact(),
                target: asker.node_id(),
            })
            .await;
        let DhtResponse::Nodes(nodes) = response else {
            panic!("expected nodes");
        };
        let ids: Vec<NodeId> = nodes.iter().map(|c| c.node_id).collect();
        assert_eq!(ids, vec![other.node_id()]);
        net.shutdown().await;
    }

    #[tokio::test]
    async fn find_value_serves_stored_record() {
        let net = SimNetwork::new();
        let holder = net.spawn_node(small_config()).await.unwrap();
        let asker = net.spawn_node(small_config()).await.unwrap();
        let kp = Keypair::generate();
        let record = Record::new(NodeId::hash_content(b"x"), b"x".to_vec(), vec![], &kp).unwrap();

        let stored = holder
            .handle_request(DhtRequest::Store {
                from: asker.contact(),
                record: record.clone(),
            })
            .await;
        assert!(matches!(stored, DhtResponse::Stored));

        let response = holder
            .handle_request(DhtRequest::FindValue {
                from: asker.contact(),
                key: record.key,
            })
            .await;
        let DhtResponse::Value(found) = response else {
            panic!("expected value");
        };
        assert_eq!(*found, record);
        net.shutdown().await;
    }

    #[tokio::test]
    async fn store_outside_responsibility_is_rejected() {
        let net = SimNetwork::new();
        let config = DhtConfig {
            k: 1,
            responsibility_slack: 1,
            ..DhtConfig::default()
        };
        let far = net.spawn_node_with_id(id(0x80), config).await.unwrap();
        let kp = Keypair::generate();
        let record = Record::new(id(0x00), b"meta".to_vec(), vec![], &kp).unwrap();

        // The sender is itself closer to the key than `far`.
        let response = far
            .handle_request(DhtRequest::Store {
                from: Contact::new(id(0x01), "sim://near"),
                record,
            })
            .await;
        let DhtResponse::StoreRejected { reason } = response else {
            panic!("expected rejection");
        };
        assert!(reason.contains("responsibility"));
        assert_eq!(far.telemetry().await.stored_records, 0);
        net.shutdown().await;
    }

    #[tokio::test]
    async fn forged_store_is_rejected() {
        let net = SimNetwork::new();
        let holder = net.spawn_node(small_config()).await.unwrap();
        let kp = Keypair::generate();
        let mut record = Record::new(NodeId::hash_content(b"y"), b"y".to_vec(), vec![], &kp).unwrap();
        record.payload = b"z".to_vec();

        let response = holder
            .handle_request(DhtRequest::Store {
                from: Contact::new(NodeId::random(), "sim://forger"),
                record,
            })
            .await;
        assert!(matches!(response, DhtResponse::StoreRejected { .. }));
        net.shutdown().await;
    }

    #[tokio::test]
    async fn bootstrap_without_seeds_fails() {
        let net = SimNetwork::new();
        let node = net.spawn_node(small_config()).await.unwrap();
        assert!(matches!(
            node.bootstrap(Vec::new()).await,
            Err(BootstrapError::NoSeeds)
        ));

        let ghost = Contact::new(NodeId::random(), "sim://ghost");
        assert!(matches!(
            node.bootstrap(vec![ghost]).await,
            Err(BootstrapError::Failed { attempted: 1 })
        ));
        net.shutdown().await;
    }

    #[tokio::test]
    async fn publish_alone_keeps_record_locally() {
        let net = SimNetwork::new();
        let node = net.spawn_node(small_config()).await.unwrap();
        let kp = Keypair::generate();

        let result = node.publish(b"lonely".to_vec(), &kp).await;
        assert!(matches!(result, Err(PublishError::NoReachablePeers)));

        let key = NodeId::hash_content(b"lonely");
        let record = node.lookup(key).await.unwrap();
        assert_eq!(record.provider_addresses, vec![node.contact().addr]);
        assert_eq!(node.telemetry().await.published_records, 1);
        net.shutdown().await;
    }

    #[tokio::test]
    async fn quit_stops_the_actor() {
        let net = SimNetwork::new();
        let node = net.spawn_node(small_config()).await.unwrap();
        node.quit().await;
        node.cmd_tx.closed().await;

        assert!(matches!(
            node.lookup(NodeId::random()).await,
            Err(LookupError::Shutdown)
        ));
        let kp = Keypair::generate();
        assert!(matches!(
            node.publish(b"late".to_vec(), &kp).await,
            Err(PublishError::Shutdown)
        ));
    }
}
