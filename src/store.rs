//! # Local Record Store
//!
//! Bounded map from key to the best known [`Record`] for that key.
//!
//! Every write is signature-checked. When two versions of a record meet, the
//! conflict rule picks a single winner so replicas converge no matter the
//! order in which STOREs arrive:
//!
//! | existing | incoming | result |
//! |---|---|---|
//! | identical | - | unchanged |
//! | expired | any valid | replaced |
//! | same creator | newer | replaced |
//! | any creator | same timestamp | higher digest wins |
//! | otherwise | - | existing kept |
//!
//! Records written on behalf of remote peers count against that peer's
//! quota, as in the per-peer storage stats below.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use crate::error::StoreError;
use crate::identity::{Key, NodeId};
use crate::record::Record;

/// Upper bound on peers with tracked storage stats.
const MAX_TRACKED_PEERS: usize = 10_000;

/// Limits applied to STOREs from a single remote peer.
#[derive(Clone, Debug)]
pub struct StoreQuota {
    pub max_entries_per_peer: usize,
    pub max_bytes_per_peer: usize,
    pub max_requests_per_window: usize,
    pub window: Duration,
}

impl Default for StoreQuota {
    fn default() -> Self {
        Self {
            max_entries_per_peer: 100,
            max_bytes_per_peer: 1024 * 1024,
            max_requests_per_window: 20,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Replaced,
    /// The exact same record was already stored.
    Unchanged,
}

#[derive(Clone, Debug)]
struct StoredRecord {
    record: Record,
    stored_by: NodeId,
    size: usize,
}

#[derive(Debug, Clone, Default)]
struct PeerStorageStats {
    bytes_stored: usize,
    entry_count: usize,
    store_requests: VecDeque<Instant>,
}

impl PeerStorageStats {
    fn can_store(&self, size: usize, quota: &StoreQuota) -> bool {
        self.bytes_stored + size <= quota.max_bytes_per_peer
            && self.entry_count < quota.max_entries_per_peer
    }

    fn is_rate_limited(&mut self, quota: &StoreQuota) -> bool {
        let now = Instant::now();
        while let Some(front) = self.store_requests.front() {
            if now.duration_since(*front) > quota.window {
                self.store_requests.pop_front();
            } else {
                break;
            }
        }
        self.store_requests.len() >= quota.max_requests_per_window
    }

    fn record_store(&mut self, size: usize) {
        self.bytes_stored = self.bytes_stored.saturating_add(size);
        self.entry_count = self.entry_count.saturating_add(1);
        self.store_requests.push_back(Instant::now());
    }

    fn record_evict(&mut self, size: usize) {
        self.bytes_stored = self.bytes_stored.saturating_sub(size);
        self.entry_count = self.entry_count.saturating_sub(1);
    }
}

pub struct LocalRecordStore {
    local_id: NodeId,
    cache: LruCache<Key, StoredRecord>,
    peer_stats: LruCache<NodeId, PeerStorageStats>,
    ttl: Duration,
    quota: StoreQuota,
}

impl LocalRecordStore {
    pub fn new(local_id: NodeId, capacity: NonZeroUsize, ttl: Duration, quota: StoreQuota) -> Self {
        let peer_stats_cap =
            NonZeroUsize::new(MAX_TRACKED_PEERS).expect("peer stats capacity must be non-zero");
        Self {
            local_id,
            cache: LruCache::new(capacity),
            peer_stats: LruCache::new(peer_stats_cap),
            ttl,
            quota,
        }
    }

    /// Store a record produced or accepted by this node itself.
    pub fn put(&mut self, record: Record, now_ms: u64) -> Result<PutOutcome, StoreError> {
        self.put_inner(record, self.local_id, now_ms)
    }

    /// Store a record received in a STORE from `from`, charging its quota.
    pub fn put_from_peer(
        &mut self,
        record: Record,
        from: NodeId,
        now_ms: u64,
    ) -> Result<PutOutcome, StoreError> {
        if from == self.local_id {
            return self.put_inner(record, from, now_ms);
        }

        let size = record.size_hint();
        let stats = self.peer_stats.get_or_insert_mut(from, PeerStorageStats::default);
        if stats.is_rate_limited(&self.quota) {
            debug!(peer = %from.short(), "store rejected: rate limited");
            return Err(StoreError::RateLimited);
        }
        if !stats.can_store(size, &self.quota) {
            debug!(
                peer = %from.short(),
                bytes_stored = stats.bytes_stored,
                entry_count = stats.entry_count,
                "store rejected: quota exceeded"
            );
            return Err(StoreError::QuotaExceeded);
        }
        self.put_inner(record, from, now_ms)
    }

    fn put_inner(
        &mut self,
        record: Record,
        stored_by: NodeId,
        now_ms: u64,
    ) -> Result<PutOutcome, StoreError> {
        record.verify()?;
        record.check_freshness(now_ms, self.ttl)?;

        let outcome = match self.cache.peek(&record.key) {
            None => PutOutcome::Inserted,
            Some(existing) => {
                let existing = &existing.record;
                if *existing == record {
                    return Ok(PutOutcome::Unchanged);
                }
                if !existing.is_expired(now_ms, self.ttl) {
                    supersedes(existing, &record)?;
                }
                PutOutcome::Replaced
            }
        };

        let size = record.size_hint();
        let key = record.key;
        let entry = StoredRecord {
            record,
            stored_by,
            size,
        };
        if let Some((evicted_key, evicted)) = self.cache.push(key, entry) {
            self.release(&evicted);
            if evicted_key != key {
                debug!(key = %evicted_key.short(), "store full, evicted least recently used record");
            }
        }
        if stored_by != self.local_id {
            self.peer_stats
                .get_or_insert_mut(stored_by, PeerStorageStats::default)
                .record_store(size);
        }
        Ok(outcome)
    }

    /// Live record for `key`. Expired entries are dropped on access.
    pub fn get(&mut self, key: &Key, now_ms: u64) -> Option<Record> {
        let expired = match self.cache.get(key) {
            None => return None,
            Some(entry) => entry.record.is_expired(now_ms, self.ttl),
        };
        if expired {
            if let Some(entry) = self.cache.pop(key) {
                self.release(&entry);
            }
            return None;
        }
        self.cache.peek(key).map(|entry| entry.record.clone())
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.cache.contains(key)
    }

    /// Drop every record whose lifetime has ended. Returns how many went.
    pub fn sweep_expired(&mut self, now_ms: u64) -> usize {
        let expired: Vec<Key> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.record.is_expired(now_ms, self.ttl))
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            if let Some(entry) = self.cache.pop(key) {
                self.release(&entry);
            }
        }
        if !expired.is_empty() {
            debug!(expired_count = expired.len(), "removed expired records");
        }
        expired.len()
    }

    /// Snapshot of all stored records.
    pub fn records(&self) -> Vec<Record> {
        self.cache.iter().map(|(_, entry)| entry.record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn release(&mut self, entry: &StoredRecord) {
        if let Some(stats) = self.peer_stats.peek_mut(&entry.stored_by) {
            stats.record_evict(entry.size);
        }
    }
}

/// `Ok` when `incoming` should replace the live record `existing`.
fn supersedes(existing: &Record, incoming: &Record) -> Result<(), StoreError> {
    let same_creator = existing.creator_public_key == incoming.creator_public_key;
    if incoming.created_at == existing.created_at {
        if incoming.digest() > existing.digest() {
            return Ok(());
        }
    } else if same_creator && incoming.created_at > existing.created_at {
        return Ok(());
    }

    if same_creator {
        Err(StoreError::Stale)
    } else {
        Err(StoreError::ConflictingCreator)
    }
}
