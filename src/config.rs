//! Tunables for a [`DhtNode`](crate::dht::DhtNode).
//!
//! Defaults follow common Kademlia deployments: K=20, α=3, 24h record
//! lifetime, hourly republish.

use std::time::Duration;

use anyhow::{Result, bail};

use crate::store::StoreQuota;

/// Kademlia replication factor (bucket size).
pub const DEFAULT_K: usize = 20;

/// Kademlia concurrency factor (parallel queries per round).
pub const DEFAULT_ALPHA: usize = 3;

#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Bucket capacity and replication factor.
    pub k: usize,
    /// Parallel requests per lookup round.
    pub alpha: usize,
    /// Records older than this are dropped by every holder.
    pub record_ttl: Duration,
    /// Regular republish cadence.
    pub republish_interval: Duration,
    /// Republish cadence for records that keep failing to reach K/2 holders.
    pub escalated_republish_interval: Duration,
    /// Consecutive under-replicated cycles before escalating.
    pub unhealthy_cycles: u32,
    /// Timeout for a single FIND_NODE / FIND_VALUE request.
    pub request_timeout: Duration,
    /// Timeout for the liveness ping of a full bucket's oldest contact.
    pub ping_timeout: Duration,
    pub store_timeout: Duration,
    /// Overall bound for one `lookup` call.
    pub lookup_deadline: Duration,
    pub max_lookup_rounds: usize,
    /// How often the bucket refresh task wakes up.
    pub bucket_refresh_interval: Duration,
    /// A bucket untouched for this long gets a random-target lookup.
    pub bucket_stale_threshold: Duration,
    /// Maximum records kept in the local store.
    pub store_capacity: usize,
    /// Per-peer limits on inbound STOREs.
    pub store_quota: StoreQuota,
    /// Remote STOREs are accepted while fewer than `slack * k` known contacts
    /// are closer to the key than this node.
    pub responsibility_slack: usize,
    /// Consecutive failed requests before a contact is demoted in its bucket.
    pub churn_failure_threshold: u32,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            record_ttl: Duration::from_secs(24 * 60 * 60),
            republish_interval: Duration::from_secs(60 * 60),
            escalated_republish_interval: Duration::from_secs(15 * 60),
            unhealthy_cycles: 2,
            request_timeout: Duration::from_secs(3),
            ping_timeout: Duration::from_secs(2),
            store_timeout: Duration::from_secs(5),
            lookup_deadline: Duration::from_secs(10),
            max_lookup_rounds: 20,
            bucket_refresh_interval: Duration::from_secs(30 * 60),
            bucket_stale_threshold: Duration::from_secs(30 * 60),
            store_capacity: 100_000,
            store_quota: StoreQuota::default(),
            responsibility_slack: 2,
            churn_failure_threshold: 3,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            bail!("k must be at least 1");
        }
        if self.alpha == 0 {
            bail!("alpha must be at least 1");
        }
        if self.store_capacity == 0 {
            bail!("store_capacity must be at least 1");
        }
        if self.responsibility_slack == 0 {
            bail!("responsibility_slack must be at least 1");
        }
        if self.max_lookup_rounds == 0 {
            bail!("max_lookup_rounds must be at least 1");
        }
        if self.escalated_republish_interval > self.republish_interval {
            bail!("escalated republish interval must not exceed the regular interval");
        }
        if self.record_ttl.is_zero() || self.request_timeout.is_zero() {
            bail!("record_ttl and request_timeout must be non-zero");
        }
        Ok(())
    }

    /// Replica count below which a record is considered under-replicated.
    pub fn healthy_ack_threshold(&self) -> usize {
        self.k.div_ceil(2)
    }
}
