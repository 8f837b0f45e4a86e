//! # PatternMesh - Distributed Pattern Metadata Index
//!
//! PatternMesh is a Kademlia-style DHT that maps content hashes of patterns to
//! signed metadata records listing the peers that can serve them.
//!
//! - **Identity**: 256-bit node ids and record keys in one XOR metric space
//! - **Routing**: 256 k-buckets, least-recently-seen eviction guarded by a ping
//! - **Lookup**: iterative α-parallel FIND_NODE / FIND_VALUE
//! - **Records**: Ed25519-signed, size-bounded, expiring after a TTL
//! - **Replication**: STORE to the K closest, periodic republish with escalation
//!
//! ## Architecture
//!
//! Each node is a cheap-to-clone [`DhtNode`] handle in front of a private
//! actor that owns the routing table, record store and republish schedules.
//! Network I/O goes through the [`DhtRpc`] trait; the actor never awaits it.
//! [`SimNetwork`] runs any number of nodes in one process over the real wire
//! codec.
//!
//! ## Security Model
//!
//! - Records are verified on every STORE and every FIND_VALUE answer
//! - Conflicting writes from different creators cannot overwrite a live record
//! - Inbound STOREs are bounded per peer; learned contacts are rate limited
//! - Frames are decoded with a hard size limit
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Node ids, XOR distance, keypairs, contacts |
//! | `crypto` | Domain-separated Ed25519 signatures |
//! | `record` | Signed metadata records and their validation |
//! | `routing` | K-bucket routing table and insertion limiter |
//! | `store` | Bounded local record store with per-peer quotas |
//! | `lookup` | Iterative lookup engine and STORE fan-out |
//! | `replication` | Republish scheduling and replica health |
//! | `churn` | Failure tracking and stale bucket refresh |
//! | `dht` | Node handle and actor |
//! | `protocols` | Transport trait (`DhtRpc`) |
//! | `messages` | Wire types and bounded codec |
//! | `sim` | In-process simulated network |

mod churn;
mod config;
mod crypto;
mod dht;
mod error;
mod identity;
mod lookup;
mod messages;
mod protocols;
mod record;
mod replication;
mod routing;
mod sim;
mod store;

pub use churn::ChurnVerdict;
pub use config::{DEFAULT_ALPHA, DEFAULT_K, DhtConfig};
pub use crypto::SignatureError;
pub use dht::{DhtNode, PublishReport, TelemetrySnapshot};
pub use error::{BootstrapError, LookupError, PublishError, RecordError, StoreError};
pub use identity::{
    Contact, Distance, ID_BITS, Key, Keypair, NodeId, distance, now_ms, shared_prefix_len,
};
pub use lookup::{LookupState, LookupStats};
pub use messages::{DhtRequest, DhtResponse, MAX_MESSAGE_SIZE, decode_bounded, encode};
pub use protocols::{DhtRpc, FindValueResponse};
pub use record::{MAX_PAYLOAD_SIZE, MAX_PROVIDERS, Record};
pub use replication::{ReplicaHealth, RepublishReport};
pub use routing::{ObserveOutcome, RoutingTable};
pub use sim::{SimNetwork, SimRequest, SimTransport};
pub use store::{LocalRecordStore, PutOutcome, StoreQuota};
