//! # Wire Protocol Messages
//!
//! Request and response types exchanged between DHT nodes, and the bounded
//! bincode codec used to frame them.
//!
//! | Request | Success response |
//! |---------|------------------|
//! | `Ping` | `Pong` (responder's contact) |
//! | `FindNode` | `Nodes` |
//! | `FindValue` | `Value` or `Nodes` |
//! | `Store` | `Stored` or `StoreRejected` |
//!
//! Every request carries the sender's contact so the receiver can observe it.
//!
//! All decoding goes through [`decode_bounded`], which caps the buffer size
//! before allocating anything.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{Contact, Key, NodeId};
use crate::record::Record;

/// Largest frame accepted by [`decode_bounded`].
///
/// A `Nodes` reply with K contacts of maximum address length plus a
/// maximum-size record fits well inside this.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with the frame size limit enforced.
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping { from: Contact },
    FindNode { from: Contact, target: NodeId },
    FindValue { from: Contact, key: Key },
    Store { from: Contact, record: Record },
}

impl DhtRequest {
    pub fn sender(&self) -> &Contact {
        match self {
            DhtRequest::Ping { from }
            | DhtRequest::FindNode { from, .. }
            | DhtRequest::FindValue { from, .. }
            | DhtRequest::Store { from, .. } => from,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DhtRequest::Ping { .. } => "ping",
            DhtRequest::FindNode { .. } => "find_node",
            DhtRequest::FindValue { .. } => "find_value",
            DhtRequest::Store { .. } => "store",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong { from: Contact },
    Nodes(Vec<Contact>),
    Value(Box<Record>),
    Stored,
    StoreRejected { reason: String },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn contact() -> Contact {
        Contact::new(NodeId::from_bytes([1u8; 32]), "127.0.0.1:4433")
    }

    #[test]
    fn store_request_survives_codec_and_keeps_signature() {
        let kp = Keypair::generate();
        let record = Record::new(NodeId::hash_content(b"p"), b"p".to_vec(), vec!["a:1".into()], &kp)
            .unwrap();
        let request = DhtRequest::Store {
            from: contact(),
            record,
        };

        let bytes = encode(&request).unwrap();
        let decoded: DhtRequest = decode_bounded(&bytes).unwrap();
        assert_eq!(decoded.sender().node_id, contact().node_id);
        let DhtRequest::Store { record, .. } = decoded else {
            panic!("wrong variant");
        };
        assert!(record.verify().is_ok());
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(decode_bounded::<DhtRequest>(&garbage).is_err());

        let bytes = encode(&DhtRequest::Ping { from: contact() }).unwrap();
        assert!(decode_bounded::<DhtRequest>(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn oversized_frame_rejected() {
        let huge = DhtResponse::Nodes(
            (0..400)
                .map(|_| Contact::new(NodeId::random(), "x".repeat(200)))
                .collect(),
        );
        assert!(encode(&huge).is_err());

        // A length prefix claiming more than the limit fails before allocating.
        let mut bytes = encode(&DhtResponse::Error {
            message: String::new(),
        })
        .unwrap();
        let len_at = bytes.len() - 8;
        bytes[len_at..].copy_from_slice(&(MAX_MESSAGE_SIZE * 4).to_le_bytes());
        assert!(decode_bounded::<DhtResponse>(&bytes).is_err());
    }

    #[test]
    fn last_seen_is_not_on_the_wire() {
        let bytes = encode(&contact()).unwrap();
        // id + u64 length prefix + address
        assert_eq!(bytes.len(), 32 + 8 + "127.0.0.1:4433".len());
    }
}
