//! Error types surfaced to callers.
//!
//! Per-request transport failures never show up here; the lookup round logic
//! absorbs them. Only whole-operation outcomes are reported.

use std::time::Duration;

use thiserror::Error;

use crate::crypto::SignatureError;

/// Why a record failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("invalid record signature: {0}")]
    InvalidSignature(SignatureError),

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("provider address list is malformed or too long")]
    InvalidProviders,

    #[error("record timestamp is {drift_ms}ms in the future")]
    FutureTimestamp { drift_ms: u64 },

    #[error("record has expired")]
    Expired,
}

/// Why the local record store refused a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error(transparent)]
    Invalid(#[from] RecordError),

    #[error("a newer record for this key is already stored")]
    Stale,

    #[error("key is held by a record from a different creator")]
    ConflictingCreator,

    #[error("key is outside this node's responsibility range")]
    NotResponsible,

    #[error("peer exceeded its storage quota")]
    QuotaExceeded,

    #[error("peer is storing too quickly")]
    RateLimited,
}

impl StoreError {
    /// True when the record itself is bad, as opposed to a policy refusal.
    pub fn is_invalid_signature(&self) -> bool {
        matches!(self, StoreError::Invalid(RecordError::InvalidSignature(_)))
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("record rejected: {0}")]
    InvalidRecord(#[from] RecordError),

    /// The local store refused it, e.g. a newer record from the same creator.
    #[error("record refused by local store: {0}")]
    Rejected(StoreError),

    /// The record is kept locally and retried by the republish cycle.
    #[error("no peer acknowledged the store")]
    NoReachablePeers,

    #[error("dht node has shut down")]
    Shutdown,
}

#[derive(Debug, Error)]
pub enum LookupError {
    /// Peers answered but none holds a valid record for the key.
    #[error("no record found for key")]
    NotFound,

    /// No peer answered at all; try again later or with fresh seeds.
    #[error("network unreachable: no contact answered")]
    Unreachable,

    #[error("lookup exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("dht node has shut down")]
    Shutdown,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no seed contacts supplied")]
    NoSeeds,

    #[error("none of the {attempted} seed contacts answered")]
    Failed { attempted: usize },

    #[error("dht node has shut down")]
    Shutdown,
}
