//! # Routing Table
//!
//! 256 k-buckets indexed by shared prefix length with the local id. Each
//! bucket keeps contacts ordered oldest first, freshest last.
//!
//! A full bucket never drops a live contact for a newcomer. Instead
//! [`RoutingTable::observe`] hands back a [`PendingPing`]; the caller pings the
//! oldest contact off the actor task and reports the outcome through
//! [`RoutingTable::apply_ping_result`]. While that ping is outstanding every
//! other newcomer for the bucket is discarded, so a flood of fresh ids costs
//! one ping per bucket rather than one per id.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::identity::{Contact, ID_BITS, ID_BYTES, NodeId, distance, shared_prefix_len};

/// Second-hand contacts accepted per responding peer per window.
const ROUTING_INSERTION_PER_PEER_LIMIT: usize = 50;

const ROUTING_INSERTION_RATE_WINDOW: Duration = Duration::from_secs(60);

const MAX_ROUTING_INSERTION_TRACKED_PEERS: usize = 1_000;

#[derive(Debug, Clone)]
pub struct KBucket {
    contacts: Vec<Contact>,
    last_refresh: Instant,
    ping_in_flight: bool,
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

/// What [`RoutingTable::observe`] did with a contact.
#[derive(Debug)]
pub enum ObserveOutcome {
    Inserted,
    /// Already known; moved to the tail with its latest address.
    Refreshed,
    /// Own id or structurally invalid.
    Ignored,
    /// Bucket full and its oldest contact is already being pinged.
    Discarded,
    /// Bucket full; ping `oldest` and report back.
    PingOldest(PendingPing),
}

#[derive(Clone, Debug)]
pub struct PendingPing {
    pub bucket_index: usize,
    pub oldest: Contact,
    pub newcomer: Contact,
}

impl KBucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
            ping_in_flight: false,
        }
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.node_id == id)
    }

    fn move_to_tail(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Some(pos) => {
                let existing = self.contacts.remove(pos);
                self.contacts.push(existing);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        self.position(id).map(|pos| self.contacts.remove(pos))
    }
}

/// Bucket a contact belongs in, or `None` for the local id itself.
pub fn bucket_index(self_id: &NodeId, other: &NodeId) -> Option<usize> {
    let idx = shared_prefix_len(self_id, other);
    (idx < ID_BITS).then_some(idx)
}

/// Random id sharing exactly `bucket_idx` leading bits with `self_id`.
pub fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    debug_assert!(bucket_idx < ID_BITS);
    let mut distance = [0u8; ID_BYTES];
    if getrandom::getrandom(&mut distance).is_err() {
        distance = *NodeId::hash_content(&bucket_idx.to_be_bytes()).as_bytes();
    }

    // Zero the shared prefix, then force the first differing bit.
    let byte_idx = bucket_idx / 8;
    let bit = 0x80u8 >> (bucket_idx % 8);
    distance[..byte_idx].fill(0);
    distance[byte_idx] = bit | (distance[byte_idx] & (bit - 1));

    let mut target = *self_id.as_bytes();
    for (t, d) in target.iter_mut().zip(distance) {
        *t ^= d;
    }
    NodeId::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| KBucket::new()).collect();
        Self {
            self_id,
            k,
            buckets,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn bucket(&self, idx: usize) -> Option<&KBucket> {
        self.buckets.get(idx)
    }

    /// Total contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        let idx = bucket_index(&self.self_id, id)?;
        self.buckets[idx].contacts.iter().find(|c| &c.node_id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn observe(&mut self, contact: Contact) -> ObserveOutcome {
        let Some(idx) = bucket_index(&self.self_id, &contact.node_id) else {
            return ObserveOutcome::Ignored;
        };
        if !contact.validate_structure() {
            return ObserveOutcome::Ignored;
        }

        let k = self.k;
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.position(&contact.node_id) {
            let mut updated = contact;
            updated.touch();
            bucket.contacts.remove(pos);
            bucket.contacts.push(updated);
            bucket.mark_refreshed();
            return ObserveOutcome::Refreshed;
        }

        if bucket.contacts.len() < k {
            let mut fresh = contact;
            fresh.touch();
            bucket.contacts.push(fresh);
            bucket.mark_refreshed();
            return ObserveOutcome::Inserted;
        }

        if bucket.ping_in_flight {
            return ObserveOutcome::Discarded;
        }
        let Some(oldest) = bucket.contacts.first().cloned() else {
            return ObserveOutcome::Discarded;
        };
        bucket.ping_in_flight = true;
        ObserveOutcome::PingOldest(PendingPing {
            bucket_index: idx,
            oldest,
            newcomer: contact,
        })
    }

    /// Resolve a ping started by [`observe`](Self::observe).
    pub fn apply_ping_result(&mut self, pending: PendingPing, oldest_alive: bool) {
        let k = self.k;
        if oldest_alive {
            self.refresh(&pending.oldest.node_id);
        }
        let Some(bucket) = self.buckets.get_mut(pending.bucket_index) else {
            return;
        };
        bucket.ping_in_flight = false;
        if oldest_alive {
            return;
        }

        bucket.remove(&pending.oldest.node_id);
        if bucket.position(&pending.newcomer.node_id).is_none() && bucket.contacts.len() < k {
            let mut newcomer = pending.newcomer;
            newcomer.touch();
            bucket.contacts.push(newcomer);
            bucket.mark_refreshed();
        }
    }

    /// Up to `count` known contacts, nearest to `target` first.
    ///
    /// Buckets are visited in the order that guarantees each group is
    /// strictly farther from `target` than the ones before it: the target's
    /// own bucket, then every deeper bucket, then shallower buckets one by
    /// one. Scanning stops at the first group boundary with enough contacts.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }
        let start = shared_prefix_len(&self.self_id, target);
        let mut out: Vec<Contact> = Vec::with_capacity(count);

        if start < ID_BITS {
            out.extend(self.buckets[start].contacts.iter().cloned());
        }
        if out.len() < count {
            for bucket in self.buckets.iter().skip(start + 1) {
                out.extend(bucket.contacts.iter().cloned());
            }
        }
        let mut idx = start.min(ID_BITS);
        while out.len() < count && idx > 0 {
            idx -= 1;
            out.extend(self.buckets[idx].contacts.iter().cloned());
        }

        out.sort_by_cached_key(|c| distance(&c.node_id, target));
        out.truncate(count);
        out
    }

    /// Count of known contacts strictly closer to `key` than this node.
    pub fn closer_than_self(&self, key: &NodeId, limit: usize) -> usize {
        let own = distance(&self.self_id, key);
        self.closest(key, limit)
            .iter()
            .filter(|c| distance(&c.node_id, key) < own)
            .count()
    }

    /// Soft responsibility check for inbound STOREs.
    pub fn is_responsible(&self, key: &NodeId, slack: usize) -> bool {
        let limit = slack.saturating_mul(self.k);
        self.closer_than_self(key, limit) < limit
    }

    /// Move a failing contact to the head of its bucket so it is the next
    /// ping-and-replace candidate.
    pub fn demote(&mut self, id: &NodeId) -> bool {
        let Some(idx) = bucket_index(&self.self_id, id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        match bucket.position(id) {
            Some(0) => true,
            Some(pos) => {
                let contact = bucket.contacts.remove(pos);
                bucket.contacts.insert(0, contact);
                true
            }
            None => false,
        }
    }

    /// Mark a contact as recently heard from without changing its address.
    pub fn refresh(&mut self, id: &NodeId) -> bool {
        let Some(idx) = bucket_index(&self.self_id, id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        if bucket.move_to_tail(id) {
            if let Some(last) = bucket.contacts.last_mut() {
                last.touch();
            }
            true
        } else {
            false
        }
    }

    pub fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RoutingInsertionBucket {
    tokens: f64,
    last_update: Instant,
}

impl RoutingInsertionBucket {
    fn new() -> Self {
        Self {
            tokens: ROUTING_INSERTION_PER_PEER_LIMIT as f64,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        let rate = ROUTING_INSERTION_PER_PEER_LIMIT as f64
            / ROUTING_INSERTION_RATE_WINDOW.as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(ROUTING_INSERTION_PER_PEER_LIMIT as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token bucket per responding peer for contacts it tells us about.
///
/// A contact that answers us directly is always observed; contacts it merely
/// lists in a FIND_NODE reply draw from its budget.
pub struct RoutingInsertionLimiter {
    buckets: LruCache<NodeId, RoutingInsertionBucket>,
}

impl Default for RoutingInsertionLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingInsertionLimiter {
    pub fn new() -> Self {
        Self {
            buckets: LruCache::new(
                NonZeroUsize::new(MAX_ROUTING_INSERTION_TRACKED_PEERS)
                    .expect("MAX_ROUTING_INSERTION_TRACKED_PEERS must be non-zero"),
            ),
        }
    }

    pub fn allow_insertion(&mut self, from_peer: &NodeId) -> bool {
        self.buckets
            .get_or_insert_mut(*from_peer, RoutingInsertionBucket::new)
            .try_consume()
    }
}
