//! Transport abstraction for DHT requests.
//!
//! The node never touches sockets. Everything it sends goes through a
//! [`DhtRpc`] implementation bound to the local contact, which fills in the
//! `from` field of each request. Timeouts are applied by the caller, so an
//! implementation may simply await the remote answer.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Contact, Key, NodeId};
use crate::record::Record;

/// Answer to a FIND_VALUE request.
#[derive(Clone, Debug)]
pub enum FindValueResponse {
    Found(Box<Record>),
    /// The peer has no record; these are its closest contacts to the key.
    Closer(Vec<Contact>),
}

#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Liveness check.
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// The peer's closest known contacts to `target`.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueResponse>;

    /// Ask a peer to hold `record`. `Ok(false)` means it answered but refused.
    async fn store(&self, to: &Contact, record: Record) -> Result<bool>;
}
