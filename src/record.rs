//! Signed pattern metadata records.
//!
//! A [`Record`] binds a key to a small payload and a list of provider
//! addresses, signed by its creator. Holders verify the signature before
//! storing or returning a record, so a forged record never propagates past the
//! first honest node that sees it.
//!
//! The signed bytes are a fixed-layout encoding rather than the wire encoding,
//! so the signature stays valid regardless of how the record travels.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{RECORD_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::error::RecordError;
use crate::identity::{Key, Keypair, NodeId};

/// Maximum payload size for a record.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Maximum number of provider addresses per record.
pub const MAX_PROVIDERS: usize = 16;

/// Maximum length of a single provider address.
pub const MAX_PROVIDER_ADDR_LEN: usize = 256;

/// Tolerated clock skew for records stamped by another node.
pub const MAX_CLOCK_SKEW_MS: u64 = 60_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Key,
    pub payload: Vec<u8>,
    pub provider_addresses: Vec<String>,
    pub creator_public_key: [u8; 32],
    pub signature: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl Record {
    /// Build and sign a record stamped with the current time.
    pub fn new(
        key: Key,
        payload: Vec<u8>,
        provider_addresses: Vec<String>,
        keypair: &Keypair,
    ) -> Result<Self, RecordError> {
        Self::new_at(
            key,
            payload,
            provider_addresses,
            keypair,
            crate::identity::now_ms(),
        )
    }

    pub fn new_at(
        key: Key,
        payload: Vec<u8>,
        provider_addresses: Vec<String>,
        keypair: &Keypair,
        created_at: u64,
    ) -> Result<Self, RecordError> {
        let mut record = Self {
            key,
            payload,
            provider_addresses,
            creator_public_key: keypair.public_key_bytes(),
            signature: Vec::new(),
            created_at,
        };
        record.validate_structure()?;
        record.signature = sign_with_domain(keypair, RECORD_SIGNATURE_DOMAIN, &record.signed_bytes());
        Ok(record)
    }

    /// Same content, fresh signature, timestamp strictly newer than ours.
    pub fn resign(&self, keypair: &Keypair) -> Result<Self, RecordError> {
        let created_at = crate::identity::now_ms().max(self.created_at.saturating_add(1));
        Self::new_at(
            self.key,
            self.payload.clone(),
            self.provider_addresses.clone(),
            keypair,
            created_at,
        )
    }

    /// Size and shape checks that do not need the signature.
    pub fn validate_structure(&self) -> Result<(), RecordError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RecordError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if self.provider_addresses.len() > MAX_PROVIDERS
            || self
                .provider_addresses
                .iter()
                .any(|a| a.is_empty() || a.len() > MAX_PROVIDER_ADDR_LEN)
        {
            return Err(RecordError::InvalidProviders);
        }
        Ok(())
    }

    /// Structure checks followed by strict signature verification.
    pub fn verify(&self) -> Result<(), RecordError> {
        self.validate_structure()?;
        verify_with_domain(
            &self.creator_public_key,
            RECORD_SIGNATURE_DOMAIN,
            &self.signed_bytes(),
            &self.signature,
        )
        .map_err(RecordError::InvalidSignature)
    }

    /// Reject records that are expired or stamped too far in the future.
    pub fn check_freshness(&self, now_ms: u64, ttl: Duration) -> Result<(), RecordError> {
        if self.created_at > now_ms.saturating_add(MAX_CLOCK_SKEW_MS) {
            return Err(RecordError::FutureTimestamp {
                drift_ms: self.created_at - now_ms,
            });
        }
        if self.is_expired(now_ms, ttl) {
            return Err(RecordError::Expired);
        }
        Ok(())
    }

    pub fn expires_at(&self, ttl: Duration) -> u64 {
        self.created_at.saturating_add(ttl.as_millis() as u64)
    }

    pub fn is_expired(&self, now_ms: u64, ttl: Duration) -> bool {
        self.expires_at(ttl) < now_ms
    }

    pub fn creator_id(&self) -> NodeId {
        NodeId::from_public_key(&self.creator_public_key)
    }

    /// BLAKE3 over the signed bytes; breaks timestamp ties between versions.
    pub fn digest(&self) -> [u8; 32] {
        *blake3::hash(&self.signed_bytes()).as_bytes()
    }

    /// Approximate in-memory footprint, used for per-peer quotas.
    pub fn size_hint(&self) -> usize {
        32 + 32
            + 8
            + self.payload.len()
            + self.signature.len()
            + self
                .provider_addresses
                .iter()
                .map(|a| a.len())
                .sum::<usize>()
    }

    /// Layout: key | creator key | created_at (BE) | len-prefixed payload |
    /// provider count | len-prefixed providers. Lengths are u32 BE.
    fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_hint() + 8 + 4 * self.provider_addresses.len());
        out.extend_from_slice(self.key.as_bytes());
        out.extend_from_slice(&self.creator_public_key);
        out.extend_from_slice(&self.created_at.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&(self.provider_addresses.len() as u32).to_be_bytes());
        for addr in &self.provider_addresses {
            out.extend_from_slice(&(addr.len() as u32).to_be_bytes());
            out.extend_from_slice(addr.as_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SignatureError;

    fn sample(kp: &Keypair) -> Record {
        Record::new(
            NodeId::hash_content(b"pattern"),
            b"pattern".to_vec(),
            vec!["10.0.0.1:7000".to_string()],
            kp,
        )
        .unwrap()
    }

    #[test]
    fn signed_record_verifies() {
        let kp = Keypair::generate();
        let record = sample(&kp);
        assert!(record.verify().is_ok());
        assert_eq!(record.creator_id(), kp.node_id());
    }

    #[test]
    fn tampering_breaks_signature() {
        let kp = Keypair::generate();

        let mut record = sample(&kp);
        record.payload.push(0);
        assert_eq!(
            record.verify(),
            Err(RecordError::InvalidSignature(SignatureError::VerificationFailed))
        );

        let mut record = sample(&kp);
        record.created_at += 1;
        assert!(record.verify().is_err());

        let mut record = sample(&kp);
        record.provider_addresses.push("10.0.0.9:7000".into());
        assert!(record.verify().is_err());

        let mut record = sample(&kp);
        record.creator_public_key = Keypair::generate().public_key_bytes();
        assert!(record.verify().is_err());
    }

    #[test]
    fn oversized_payload_is_rejected_at_creation() {
        let kp = Keypair::generate();
        let err = Record::new(NodeId::random(), vec![0u8; MAX_PAYLOAD_SIZE + 1], vec![], &kp)
            .unwrap_err();
        assert!(matches!(err, RecordError::PayloadTooLarge { .. }));
    }

    #[test]
    fn provider_list_limits() {
        let kp = Keypair::generate();
        let too_many = (0..=MAX_PROVIDERS).map(|i| format!("p{i}")).collect();
        assert_eq!(
            Record::new(NodeId::random(), vec![], too_many, &kp).unwrap_err(),
            RecordError::InvalidProviders
        );
        let too_long = vec!["x".repeat(MAX_PROVIDER_ADDR_LEN + 1)];
        assert_eq!(
            Record::new(NodeId::random(), vec![], too_long, &kp).unwrap_err(),
            RecordError::InvalidProviders
        );
    }

    #[test]
    fn freshness_window() {
        let kp = Keypair::generate();
        let ttl = Duration::from_secs(60);
        let record = Record::new_at(NodeId::random(), vec![1], vec![], &kp, 1_000_000).unwrap();

        assert!(record.check_freshness(1_000_000, ttl).is_ok());
        assert_eq!(
            record.check_freshness(1_000_000 + 60_001, ttl),
            Err(RecordError::Expired)
        );
        assert!(matches!(
            record.check_freshness(1_000_000 - MAX_CLOCK_SKEW_MS - 1, ttl),
            Err(RecordError::FutureTimestamp { .. })
        ));
    }

    #[test]
    fn resign_refreshes_timestamp_only() {
        let kp = Keypair::generate();
        let old = Record::new_at(NodeId::random(), vec![7], vec![], &kp, 5).unwrap();
        let fresh = old.resign(&kp).unwrap();
        assert!(fresh.created_at > old.created_at);
        assert_eq!(fresh.payload, old.payload);
        assert!(fresh.verify().is_ok());
        assert_ne!(fresh.digest(), old.digest());
    }
}
