//! # Iterative Lookup
//!
//! FIND_NODE and FIND_VALUE share one round loop:
//!
//! 1. Seed the candidate set with the α closest known contacts. The rest of the
//!    routing table's K closest are held in reserve and backfill the set
//!    whenever a candidate fails.
//! 2. Each round queries up to α unqueried candidates, closest first, each
//!    request bounded by the per-request timeout.
//! 3. FIND_VALUE returns as soon as a verified record for the key arrives.
//! 4. Replies are merged (deduplicated by id). Failed candidates, and peers
//!    that served a record failing verification, are dropped and replaced
//!    from the reserve.
//! 5. A round that got at least one answer but brought no candidate closer
//!    than the closest live one known before it ends the lookup. A round in
//!    which every request failed does not.
//!
//! Every request runs on its own spawned task. The task reports the outcome
//! to the node actor itself, so replies that arrive after the caller gave up
//! still refresh the routing table.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::dht::DhtNode;
use crate::error::LookupError;
use crate::identity::{Contact, Distance, Key, NodeId, distance, now_ms};
use crate::protocols::{DhtRpc, FindValueResponse};
use crate::record::Record;

/// Counters describing one finished lookup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub rounds: usize,
    pub queried: usize,
    pub responded: usize,
}

#[derive(Clone, Debug)]
struct Candidate {
    contact: Contact,
    distance: Distance,
    seq: u64,
}

/// Per-call bookkeeping for one iterative lookup. Lives on the caller's stack.
#[derive(Debug)]
pub struct LookupState {
    target: NodeId,
    self_id: NodeId,
    alpha: usize,
    k: usize,
    /// Sorted by `(distance, seq)`.
    candidates: Vec<Candidate>,
    reserve: VecDeque<Contact>,
    seen: HashSet<NodeId>,
    queried: HashSet<NodeId>,
    failed: HashSet<NodeId>,
    /// Candidates with a lower seq were known before the current round.
    round_start: u64,
    next_seq: u64,
    rounds: usize,
    responded: usize,
}

impl LookupState {
    /// `seeds` should be ordered closest first; the first α become
    /// candidates and the remainder is kept as reserve.
    pub fn new(target: NodeId, self_id: NodeId, alpha: usize, k: usize, seeds: Vec<Contact>) -> Self {
        let mut state = Self {
            target,
            self_id,
            alpha: alpha.max(1),
            k: k.max(1),
            candidates: Vec::new(),
            reserve: VecDeque::new(),
            seen: HashSet::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
            round_start: 0,
            next_seq: 0,
            rounds: 0,
            responded: 0,
        };
        for contact in seeds {
            if state.candidates.len() < state.alpha {
                state.insert(contact);
            } else if contact.node_id != self_id {
                state.reserve.push_back(contact);
            }
        }
        state.round_start = state.next_seq;
        state
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    fn insert(&mut self, contact: Contact) -> bool {
        if contact.node_id == self.self_id
            || !contact.validate_structure()
            || !self.seen.insert(contact.node_id)
        {
            return false;
        }
        let candidate = Candidate {
            distance: distance(&contact.node_id, &self.target),
            contact,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let pos = self
            .candidates
            .partition_point(|c| (c.distance, c.seq) < (candidate.distance, candidate.seq));
        self.candidates.insert(pos, candidate);
        true
    }

    /// Up to α unqueried candidates, closest first, marked as queried.
    pub fn next_batch(&mut self) -> Vec<Contact> {
        let batch: Vec<Contact> = self
            .candidates
            .iter()
            .filter(|c| !self.queried.contains(&c.contact.node_id))
            .take(self.alpha)
            .map(|c| c.contact.clone())
            .collect();
        self.begin_round(&batch);
        batch
    }

    fn begin_round(&mut self, batch: &[Contact]) {
        if batch.is_empty() {
            return;
        }
        self.rounds += 1;
        for contact in batch {
            self.queried.insert(contact.node_id);
        }
    }

    /// Merge a reply. Returns how many previously unseen contacts it added.
    pub fn record_response(&mut self, contacts: Vec<Contact>) -> usize {
        self.responded += 1;
        let added = contacts.into_iter().filter(|c| self.insert(c.clone())).count();
        self.truncate();
        added
    }

    /// Drop an unresponsive candidate and pull the next reserve contact in.
    pub fn record_failure(&mut self, id: &NodeId) {
        self.drop_candidate(id);
    }

    /// The peer answered, but with a record that failed verification.
    pub fn record_rejected(&mut self, id: &NodeId) {
        self.responded += 1;
        self.drop_candidate(id);
    }

    fn drop_candidate(&mut self, id: &NodeId) {
        self.failed.insert(*id);
        self.candidates.retain(|c| &c.contact.node_id != id);
        while let Some(contact) = self.reserve.pop_front() {
            if self.insert(contact) {
                break;
            }
        }
    }

    fn truncate(&mut self) {
        // Headroom past K absorbs failures without going back to the reserve.
        if self.candidates.len() > self.k * 2 {
            self.candidates.truncate(self.k * 2);
        }
    }

    /// Close a round; true when it added a candidate closer than every
    /// surviving candidate known before the round.
    pub fn end_round(&mut self) -> bool {
        let start = self.round_start;
        let before = self.candidates.iter().find(|c| c.seq < start).map(|c| c.distance);
        let added = self.candidates.iter().find(|c| c.seq >= start).map(|c| c.distance);
        self.round_start = self.next_seq;
        match (added, before) {
            (Some(added), Some(before)) => added < before,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// The K closest contacts that have not failed.
    pub fn closest(&self) -> Vec<Contact> {
        self.candidates
            .iter()
            .take(self.k)
            .map(|c| c.contact.clone())
            .collect()
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            rounds: self.rounds,
            queried: self.queried.len(),
            responded: self.responded,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LookupMode {
    FindNode,
    FindValue,
}

enum QueryReply {
    Nodes(Vec<Contact>),
    Value(Box<Record>),
}

struct QueryResult {
    contact: Contact,
    reply: anyhow::Result<QueryReply>,
}

enum RoundOutcome {
    Found(Record),
    Settled { any_success: bool },
}

pub(crate) enum LookupOutcome {
    Found(Record, LookupStats),
    Exhausted(Vec<Contact>, LookupStats),
}

/// One request to one peer. Reports back to the actor before returning.
async fn query_peer<N: DhtRpc>(
    node: DhtNode<N>,
    contact: Contact,
    target: NodeId,
    mode: LookupMode,
) -> QueryResult {
    let timeout = node.config.request_timeout;
    let net = node.network.clone();
    let reply = match mode {
        LookupMode::FindNode => tokio::time::timeout(timeout, net.find_node(&contact, target))
            .await
            .map_err(|_| anyhow!("request timed out"))
            .and_then(|r| r.map(QueryReply::Nodes)),
        LookupMode::FindValue => tokio::time::timeout(timeout, net.find_value(&contact, target))
            .await
            .map_err(|_| anyhow!("request timed out"))
            .and_then(|r| {
                r.map(|resp| match resp {
                    FindValueResponse::Found(record) => QueryReply::Value(record),
                    FindValueResponse::Closer(nodes) => QueryReply::Nodes(nodes),
                })
            }),
    };

    match &reply {
        Ok(QueryReply::Nodes(nodes)) => {
            node.note_response(contact.clone(), nodes.clone()).await;
        }
        Ok(QueryReply::Value(_)) => {
            node.note_response(contact.clone(), Vec::new()).await;
        }
        Err(e) => {
            trace!(peer = %contact.node_id.short(), error = %e, "lookup request failed");
            node.note_failure(contact.node_id).await;
        }
    }
    QueryResult { contact, reply }
}

impl<N: DhtRpc> DhtNode<N> {
    async fn run_round(
        &self,
        batch: Vec<Contact>,
        mode: LookupMode,
        state: &mut LookupState,
    ) -> RoundOutcome {
        let target = state.target();
        let mut join_set = JoinSet::new();
        for contact in batch {
            let handle = tokio::spawn(query_peer(self.clone(), contact, target, mode));
            join_set.spawn(handle);
        }

        let mut any_success = false;
        while let Some(joined) = join_set.join_next().await {
            let Ok(Ok(result)) = joined else {
                continue;
            };
            match result.reply {
                Ok(QueryReply::Value(record)) => {
                    if self.accept_found(&record, &target, &result.contact) {
                        // Dropping the set detaches the remaining requests.
                        return RoundOutcome::Found(*record);
                    }
                    state.record_rejected(&result.contact.node_id);
                }
                Ok(QueryReply::Nodes(nodes)) => {
                    any_success = true;
                    state.record_response(nodes);
                }
                Err(_) => state.record_failure(&result.contact.node_id),
            }
        }
        RoundOutcome::Settled { any_success }
    }

    fn accept_found(&self, record: &Record, key: &Key, from: &Contact) -> bool {
        if &record.key != key {
            debug!(peer = %from.node_id.short(), "discarding record for a different key");
            return false;
        }
        let valid = record
            .verify()
            .and_then(|_| record.check_freshness(now_ms(), self.config.record_ttl));
        if let Err(e) = valid {
            debug!(peer = %from.node_id.short(), key = %key.short(), error = %e, "discarding invalid record");
            return false;
        }
        true
    }

    pub(crate) async fn iterative_lookup(
        &self,
        target: NodeId,
        mode: LookupMode,
        extra_seeds: Vec<Contact>,
    ) -> Result<LookupOutcome, LookupError> {
        let k = self.config.k;
        let mut seeds = self.closest_known(target, k).await?;
        for seed in extra_seeds {
            if !seeds.iter().any(|c| c.node_id == seed.node_id) {
                seeds.push(seed);
            }
        }
        seeds.sort_by_cached_key(|c| distance(&c.node_id, &target));

        let mut state = LookupState::new(target, self.id, self.config.alpha, k, seeds);

        loop {
            if state.rounds() >= self.config.max_lookup_rounds {
                warn!(
                    target = %target.short(),
                    rounds = state.rounds(),
                    "iterative lookup exceeded max rounds"
                );
                break;
            }

            let batch = state.next_batch();
            if batch.is_empty() {
                break;
            }
            let any_success = match self.run_round(batch, mode, &mut state).await {
                RoundOutcome::Found(record) => return Ok(LookupOutcome::Found(record, state.stats())),
                RoundOutcome::Settled { any_success } => any_success,
            };
            if !state.end_round() && any_success {
                break;
            }
        }

        let stats = state.stats();
        debug!(
            target = %target.short(),
            rounds = stats.rounds,
            queried = stats.queried,
            responded = stats.responded,
            "iterative lookup converged"
        );
        Ok(LookupOutcome::Exhausted(state.closest(), stats))
    }

    /// The K closest live nodes to `target` found by an iterative FIND_NODE.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Contact>, LookupError> {
        match self.iterative_lookup(target, LookupMode::FindNode, Vec::new()).await? {
            LookupOutcome::Exhausted(closest, stats) if stats.responded > 0 => Ok(closest),
            LookupOutcome::Exhausted(..) => Err(LookupError::Unreachable),
            LookupOutcome::Found(..) => Err(LookupError::NotFound),
        }
    }

    /// Find the record for `key`, bounded by the configured lookup deadline.
    pub async fn lookup(&self, key: Key) -> Result<Record, LookupError> {
        self.lookup_with_deadline(key, self.config.lookup_deadline)
            .await
            .map(|(record, _)| record)
    }

    /// Local store first, then an iterative FIND_VALUE bounded by `deadline`.
    pub async fn lookup_with_deadline(
        &self,
        key: Key,
        deadline: Duration,
    ) -> Result<(Record, LookupStats), LookupError> {
        if let Some(record) = self.get_local(key).await? {
            return Ok((record, LookupStats::default()));
        }

        let outcome = tokio::time::timeout(
            deadline,
            self.iterative_lookup(key, LookupMode::FindValue, Vec::new()),
        )
        .await
        .map_err(|_| LookupError::Timeout(deadline))??;

        match outcome {
            LookupOutcome::Found(record, stats) => {
                debug!(key = %key.short(), rounds = stats.rounds, "record found");
                Ok((record, stats))
            }
            LookupOutcome::Exhausted(_, stats) if stats.responded == 0 => {
                Err(LookupError::Unreachable)
            }
            LookupOutcome::Exhausted(..) => Err(LookupError::NotFound),
        }
    }

    /// FIND_NODE for the record's key, then STORE to the K closest in
    /// parallel. Returns `(acks, targets)`.
    pub(crate) async fn replicate(&self, record: &Record) -> Result<(usize, usize), LookupError> {
        let closest = match self.find_node(record.key).await {
            Ok(closest) => closest,
            Err(LookupError::Unreachable) => return Ok((0, 0)),
            Err(e) => return Err(e),
        };

        let targets = closest.len();
        let mut join_set = JoinSet::new();
        for contact in closest.into_iter().take(self.config.k) {
            let this = self.clone();
            let record = record.clone();
            join_set.spawn(async move { this.send_store(&contact, record).await });
        }

        let mut acks = 0;
        while let Some(joined) = join_set.join_next().await {
            if let Ok(true) = joined {
                acks += 1;
            }
        }
        Ok((acks, targets))
    }

    async fn send_store(&self, contact: &Contact, record: Record) -> bool {
        let result = tokio::time::timeout(
            self.config.store_timeout,
            self.network.store(contact, record),
        )
        .await;

        match result {
            Ok(Ok(accepted)) => {
                self.note_response(contact.clone(), Vec::new()).await;
                if !accepted {
                    trace!(peer = %contact.node_id.short(), "store refused");
                }
                accepted
            }
            Ok(Err(_)) | Err(_) => {
                self.note_failure(contact.node_id).await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ID_BYTES;

    fn id(first: u8) -> NodeId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = first;
        NodeId::from_bytes(bytes)
    }

    fn contact(first: u8) -> Contact {
        Contact::new(id(first), format!("sim://{first}"))
    }

    #[test]
    fn seeds_alpha_and_keeps_reserve() {
        let target = id(0);
        let seeds = vec![contact(1), contact(2), contact(3), contact(4)];
        let mut state = LookupState::new(target, id(0xFF), 2, 20, seeds);

        let batch: Vec<NodeId> = state.next_batch().iter().map(|c| c.node_id).collect();
        assert_eq!(batch, vec![id(1), id(2)]);
        assert!(state.next_batch().is_empty());

        state.record_failure(&id(1));
        let batch: Vec<NodeId> = state.next_batch().iter().map(|c| c.node_id).collect();
        assert_eq!(batch, vec![id(3)]);
    }

    #[test]
    fn merge_orders_by_distance_and_dedupes() {
        let target = id(0);
        let mut state = LookupState::new(target, id(0xFF), 3, 20, vec![contact(0x40)]);
        state.next_batch();

        let added = state.record_response(vec![contact(0x10), contact(0x08), contact(0x40), contact(0xFF)]);
        assert_eq!(added, 2);

        let order: Vec<NodeId> = state.closest().iter().map(|c| c.node_id).collect();
        assert_eq!(order, vec![id(0x08), id(0x10), id(0x40)]);
        assert!(state.end_round());
        assert!(!state.end_round());
    }

    #[test]
    fn answered_round_without_closer_contact_converges() {
        let target = id(0);
        let mut state = LookupState::new(target, id(0xFF), 1, 20, vec![contact(0x01), contact(0x02)]);
        assert_eq!(state.next_batch().len(), 1);
        state.record_response(vec![contact(0x40)]);
        assert!(!state.end_round());
        assert_eq!(state.stats().queried, 1);
    }

    #[test]
    fn failure_of_closest_does_not_mask_progress() {
        let target = id(0);
        let mut state = LookupState::new(target, id(0xFF), 2, 20, vec![contact(0x02), contact(0x10)]);
        state.next_batch();
        state.record_failure(&id(0x02));
        state.record_response(vec![contact(0x04)]);
        assert!(state.end_round());
    }

    #[test]
    fn rejected_value_backfills_from_reserve() {
        let target = id(0);
        let mut state = LookupState::new(target, id(0xFF), 1, 20, vec![contact(0x01), contact(0x80)]);
        state.next_batch();
        state.record_rejected(&id(0x01));
        let batch: Vec<NodeId> = state.next_batch().iter().map(|c| c.node_id).collect();
        assert_eq!(batch, vec![id(0x80)]);
        assert_eq!(state.stats().responded, 1);
    }

    #[test]
    fn own_id_is_never_a_candidate() {
        let me = id(0x01);
        let mut state = LookupState::new(id(0), me, 3, 20, vec![contact(0x01), contact(0x02)]);
        state.record_response(vec![contact(0x01)]);
        let ids: Vec<NodeId> = state.closest().iter().map(|c| c.node_id).collect();
        assert_eq!(ids, vec![id(0x02)]);
    }
}
