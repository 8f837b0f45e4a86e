//! # Identity and XOR Metric
//!
//! This module defines the identifier space shared by nodes and record keys:
//!
//! - [`NodeId`]: 256-bit identifier (a node's id or a content key)
//! - [`Distance`]: XOR of two ids, ordered as an unsigned big-endian magnitude
//! - [`Keypair`]: Ed25519 signing keypair; a node's id is `BLAKE3(public_key)`
//! - [`Contact`]: another peer's presence as seen by this node
//!
//! ## Metric Properties
//!
//! - `distance(a, b) == distance(b, a)` and `distance(a, a) == 0`
//! - `shared_prefix_len(a, b) == distance(a, b).leading_zeros()`
//! - The bucket a contact lives in is `shared_prefix_len(self_id, contact.node_id)`
//!
//! Distance computation always walks all 32 bytes so its running time does not
//! depend on where two ids first differ.

use std::cmp::Ordering;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Width of the identifier space in bits.
pub const ID_BITS: usize = 256;

/// Width of the identifier space in bytes.
pub const ID_BYTES: usize = ID_BITS / 8;

/// Maximum length of a contact's network address string.
pub const MAX_ADDR_LEN: usize = 256;

/// Returns current time as milliseconds since Unix epoch.
/// Used for record timestamps.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

/// Content keys live in the same space as node ids.
pub type Key = NodeId;

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Derive a node id from a long-lived Ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    /// Content-address arbitrary bytes.
    pub fn hash_content(data: &[u8]) -> Key {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn distance(&self, other: &NodeId) -> Distance {
        distance(self, other)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes in hex; what log lines print.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; ID_BYTES] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_BYTES]> for NodeId {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// XOR distance between two ids.
///
/// The derived `Ord` compares bytes lexicographically, which is exactly the
/// order of the big-endian 256-bit magnitude.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_BYTES]);
    pub const MAX: Distance = Distance([0xFFu8; ID_BYTES]);

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_BYTES]
    }

    /// Number of leading zero bits, `0..=256`.
    pub fn leading_zeros(&self) -> usize {
        let mut total = 0u32;
        let mut still_zero = 1u32;
        for &byte in &self.0 {
            total += still_zero * byte.leading_zeros();
            still_zero &= (byte == 0) as u32;
        }
        total as usize
    }
}

impl std::fmt::Debug for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Distance({}..)", hex::encode(&self.0[..8]))
    }
}

/// XOR distance between `a` and `b`.
#[inline]
pub fn distance(a: &NodeId, b: &NodeId) -> Distance {
    let mut out = [0u8; ID_BYTES];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a.0[i] ^ b.0[i];
    }
    Distance(out)
}

/// Count of leading bits `a` and `b` have in common; 256 when equal.
#[inline]
pub fn shared_prefix_len(a: &NodeId, b: &NodeId) -> usize {
    distance(a, b).leading_zeros()
}

/// Order `a` and `b` by their distance to `target`.
#[inline]
pub fn distance_cmp(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    distance(target, a).cmp(&distance(target, b))
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from a persisted secret, keeping the node id stable
    /// across restarts.
    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// Another peer's presence: id, network address and when we last heard from it.
///
/// Contacts are copied into buckets and replaced on update, never shared.
/// `last_seen` is local knowledge and is not sent over the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    pub addr: String,
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
}

impl Contact {
    pub fn new(node_id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            node_id,
            addr: addr.into(),
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Bounds check for contacts received from the network.
    pub fn validate_structure(&self) -> bool {
        !self.addr.is_empty() && self.addr.len() <= MAX_ADDR_LEN
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}
