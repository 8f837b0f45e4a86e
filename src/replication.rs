//! # Replication and Republish
//!
//! Every record in the local store gets a republish schedule. Records this
//! node published are re-signed with a fresh timestamp on each cycle; records
//! merely held for others are re-sent unchanged and simply expire if their
//! creator stops refreshing them.
//!
//! A held record whose STORE arrives from elsewhere has its schedule pushed
//! back, so in a healthy network only one holder per interval does the work.
//!
//! After every republish the ack count is compared against K/2. A record that
//! stays under that for `unhealthy_cycles` cycles in a row moves to the
//! escalated interval until it recovers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::dht::DhtNode;
use crate::error::LookupError;
use crate::identity::{Key, Keypair};
use crate::protocols::DhtRpc;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaHealth {
    Healthy,
    /// Under-replicated for this many consecutive cycles.
    Degraded(u32),
    /// Republished on the escalated interval until healthy again.
    Escalated,
}

struct ReplicationEntry {
    publisher: Option<Keypair>,
    next_due: Instant,
    unhealthy_streak: u32,
    escalated: bool,
}

/// A record to push out this cycle, with the key to re-sign it if we own it.
pub struct RepublishJob {
    pub record: Record,
    pub keypair: Option<Keypair>,
}

pub struct ReplicationManager {
    entries: HashMap<Key, ReplicationEntry>,
    interval: Duration,
    escalated_interval: Duration,
    healthy_threshold: usize,
    unhealthy_cycles: u32,
}

impl ReplicationManager {
    pub fn new(config: &DhtConfig) -> Self {
        Self {
            entries: HashMap::new(),
            interval: config.republish_interval,
            escalated_interval: config.escalated_republish_interval,
            healthy_threshold: config.healthy_ack_threshold(),
            unhealthy_cycles: config.unhealthy_cycles.max(1),
        }
    }

    fn held(&self, now: Instant) -> ReplicationEntry {
        ReplicationEntry {
            publisher: None,
            next_due: now + self.interval,
            unhealthy_streak: 0,
            escalated: false,
        }
    }

    pub fn track_published(&mut self, key: Key, keypair: Keypair, now: Instant) {
        let fresh = self.held(now);
        let entry = self.entries.entry(key).or_insert(fresh);
        entry.publisher = Some(keypair);
        entry.next_due = now + self.interval;
    }

    /// A peer just stored this record here; push a held record's turn back.
    pub fn note_stored(&mut self, key: Key, now: Instant) {
        let fresh = self.held(now);
        let entry = self.entries.entry(key).or_insert(fresh);
        if entry.publisher.is_none() && !entry.escalated {
            entry.next_due = now + self.interval;
        }
    }

    /// Jobs for every stored record that is due (or all of them when forced).
    pub fn due_jobs(&mut self, records: Vec<Record>, now: Instant, force: bool) -> Vec<RepublishJob> {
        let mut jobs = Vec::new();
        for record in records {
            let fresh = self.held(now);
            let entry = self.entries.entry(record.key).or_insert(fresh);
            if force || entry.next_due <= now {
                jobs.push(RepublishJob {
                    keypair: entry.publisher.clone(),
                    record,
                });
            }
        }
        jobs
    }

    /// Record how many holders acknowledged the latest republish.
    pub fn report(&mut self, key: Key, acks: usize, now: Instant) -> ReplicaHealth {
        let fresh = self.held(now);
        let entry = self.entries.entry(key).or_insert(fresh);
        if acks < self.healthy_threshold {
            entry.unhealthy_streak = entry.unhealthy_streak.saturating_add(1);
            if entry.unhealthy_streak >= self.unhealthy_cycles {
                entry.escalated = true;
            }
        } else {
            entry.unhealthy_streak = 0;
            entry.escalated = false;
        }
        entry.next_due = now
            + if entry.escalated {
                self.escalated_interval
            } else {
                self.interval
            };

        if entry.escalated {
            ReplicaHealth::Escalated
        } else if entry.unhealthy_streak > 0 {
            ReplicaHealth::Degraded(entry.unhealthy_streak)
        } else {
            ReplicaHealth::Healthy
        }
    }

    /// Forget schedules for keys that are no longer stored.
    pub fn retain(&mut self, mut is_stored: impl FnMut(&Key) -> bool) {
        self.entries.retain(|key, _| is_stored(key));
    }

    pub fn published_count(&self) -> usize {
        self.entries.values().filter(|e| e.publisher.is_some()).count()
    }

    pub fn unhealthy_count(&self) -> usize {
        self.entries.values().filter(|e| e.unhealthy_streak > 0).count()
    }

    pub fn escalated_count(&self) -> usize {
        self.entries.values().filter(|e| e.escalated).count()
    }
}

/// Outcome of one republish cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RepublishReport {
    pub attempted: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub escalated: usize,
    pub expired: usize,
}

impl<N: DhtRpc> DhtNode<N> {
    /// Republish every stored record now, regardless of schedule.
    pub async fn republish_now(&self) -> RepublishReport {
        self.run_republish_cycle(true).await
    }

    pub(crate) async fn run_republish_cycle(&self, force: bool) -> RepublishReport {
        let mut report = RepublishReport::default();
        let Some(jobs) = self.republish_jobs(force).await else {
            return report;
        };

        for job in jobs {
            let record = match job.keypair {
                Some(keypair) => match job.record.resign(&keypair) {
                    Ok(fresh) => {
                        if let Err(e) = self.store_local(fresh.clone(), None).await {
                            warn!(key = %fresh.key.short(), error = %e, "re-signed record rejected locally");
                            continue;
                        }
                        fresh
                    }
                    Err(e) => {
                        warn!(key = %job.record.key.short(), error = %e, "failed to re-sign record");
                        continue;
                    }
                },
                None => job.record,
            };

            report.attempted += 1;
            let acks = match self.replicate(&record).await {
                Ok((acks, _)) => acks,
                Err(LookupError::Shutdown) => return report,
                Err(e) => {
                    debug!(key = %record.key.short(), error = %e, "republish lookup failed");
                    0
                }
            };

            match self.report_replication(record.key, acks).await {
                Some(ReplicaHealth::Healthy) => report.healthy += 1,
                Some(ReplicaHealth::Degraded(streak)) => {
                    report.degraded += 1;
                    warn!(key = %record.key.short(), acks, streak, "record under-replicated");
                }
                Some(ReplicaHealth::Escalated) => {
                    report.escalated += 1;
                    warn!(key = %record.key.short(), acks, "record persistently under-replicated, escalating republish");
                }
                None => return report,
            }
        }

        report.expired = self.sweep_expired().await;
        info!(
            attempted = report.attempted,
            healthy = report.healthy,
            degraded = report.degraded,
            escalated = report.escalated,
            expired = report.expired,
            "republish cycle finished"
        );
        report
    }

    /// Wake at the escalated interval; each wake republishes whatever is due.
    pub(crate) fn spawn_periodic_republish(&self) {
        let node = self.clone();
        let tick = self
            .config
            .escalated_republish_interval
            .min(self.config.republish_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = node.cmd_tx.closed() => break,
                }
                node.run_republish_cycle(false).await;
            }
        });
    }
}
