//! # Signatures
//!
//! Domain-separated Ed25519 signing and verification for records.
//!
//! Each signed data type uses its own prefix, so a signature produced for one
//! purpose can never be replayed as a valid signature for another.

use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;

use crate::identity::Keypair;

/// Domain separation prefix for pattern record signatures.
pub const RECORD_SIGNATURE_DOMAIN: &[u8] = b"patternmesh-record-v1:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    /// Ed25519 signatures are exactly 64 bytes.
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("creator key is not a valid ed25519 point")]
    InvalidPublicKey,
}

fn domain_message(domain: &[u8], data: &[u8]) -> Vec<u8> {
    [domain, data].concat()
}

/// Sign `data` under `domain`, returning the 64-byte signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&domain_message(domain, data)).to_bytes().to_vec()
}

/// Verify a domain-separated signature made by `public_key`.
///
/// Strict verification: malleable signatures and small-order keys fail.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let bytes: &[u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    key.verify_strict(&domain_message(domain, data), &Signature::from_bytes(bytes))
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_separation_blocks_cross_domain_replay() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, RECORD_SIGNATURE_DOMAIN, b"payload");

        assert!(
            verify_with_domain(&kp.public_key_bytes(), RECORD_SIGNATURE_DOMAIN, b"payload", &sig)
                .is_ok()
        );
        assert_eq!(
            verify_with_domain(&kp.public_key_bytes(), b"other-domain:", b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_are_classified() {
        let kp = Keypair::generate();
        let pk = kp.public_key_bytes();
        assert_eq!(
            verify_with_domain(&pk, RECORD_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&pk, RECORD_SIGNATURE_DOMAIN, b"x", &[0u8; 12]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let sig = sign_with_domain(&signer, RECORD_SIGNATURE_DOMAIN, b"data");
        assert_eq!(
            verify_with_domain(&other.public_key_bytes(), RECORD_SIGNATURE_DOMAIN, b"data", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }
}
