//! Inbound acceptance: authenticate the sender of a packed envelope, open opportunistic
//! packets, and suppress duplicates.

use std::collections::{HashSet, VecDeque};

use rand::RngCore;

use crate::destination::{AppNamespace, DestinationHash};
use crate::identity::{self, Identity, PublicKey, WireCryptoError};
use crate::message::{Envelope, EnvelopeError, MessageId};
use crate::protocol::Packet;

/// Number of recent message ids remembered for duplicate suppression.
pub const DEFAULT_SEEN_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("message addressed to {0}, not to us")]
    NotForUs(DestinationHash),
    #[error("claimed source {claimed} does not match sender key ({actual})")]
    SourceMismatch {
        claimed: DestinationHash,
        actual: DestinationHash,
    },
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Crypto(#[from] WireCryptoError),
}

/// Unpack `packed` sent by the holder of `sender_public` and check it is addressed to `local`
/// and that its source is the sender's own delivery destination.
pub fn accept_envelope(
    packed: &[u8],
    sender_public: &PublicKey,
    local: DestinationHash,
) -> Result<(Envelope, MessageId), AcceptError> {
    let (envelope, id) = Envelope::unpack(packed)?;
    if envelope.destination != local {
        return Err(AcceptError::NotForUs(envelope.destination));
    }
    let actual = DestinationHash::derive(sender_public, &AppNamespace::lxmf_delivery());
    if envelope.source != actual {
        return Err(AcceptError::SourceMismatch {
            claimed: envelope.source,
            actual,
        });
    }
    Ok((envelope, id))
}

/// Encrypt a packed envelope into a single opportunistic packet for `recipient_public`.
pub fn seal_opportunistic(
    identity: &Identity,
    destination: DestinationHash,
    recipient_public: &PublicKey,
    packed: &[u8],
) -> Result<Packet, WireCryptoError> {
    let key = identity::derive_packet_key(&identity.shared_secret(recipient_public));
    let nonce = rand::thread_rng().next_u64();
    let ciphertext = identity::encrypt_wire(&key, nonce, packed)?;
    Ok(Packet::Opportunistic {
        destination,
        sender_public: identity.public_key().clone(),
        nonce,
        ciphertext,
    })
}

/// Decrypt an opportunistic packet addressed to `local` and accept its envelope.
pub fn open_opportunistic(
    identity: &Identity,
    local: DestinationHash,
    destination: DestinationHash,
    sender_public: &PublicKey,
    nonce: u64,
    ciphertext: &[u8],
) -> Result<(Envelope, MessageId), AcceptError> {
    if destination != local {
        return Err(AcceptError::NotForUs(destination));
    }
    let key = identity::derive_packet_key(&identity.shared_secret(sender_public));
    let packed = identity::decrypt_wire(&key, nonce, ciphertext)?;
    accept_envelope(&packed, sender_public, local)
}

/// Bounded set of recently seen message ids; the oldest id is forgotten first.
pub struct SeenMessages {
    capacity: usize,
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Record `id`. Returns false when it was already seen.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for SeenMessages {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Fields;

    fn delivery_hash(id: &Identity) -> DestinationHash {
        DestinationHash::derive(id.public_key(), &AppNamespace::lxmf_delivery())
    }

    fn envelope(from: &Identity, to: &Identity) -> Envelope {
        Envelope {
            destination: delivery_hash(to),
            source: delivery_hash(from),
            timestamp_ms: 1,
            title: Vec::new(),
            content: b"ping".to_vec(),
            fields: Fields::new(),
        }
    }

    #[test]
    fn opportunistic_packet_opens_for_recipient() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (packed, id) = envelope(&alice, &bob).pack().unwrap();
        let packet =
            seal_opportunistic(&alice, delivery_hash(&bob), bob.public_key(), &packed).unwrap();
        let Packet::Opportunistic {
            destination,
            sender_public,
            nonce,
            ciphertext,
        } = packet
        else {
            panic!("expected Opportunistic");
        };
        let (env, opened_id) = open_opportunistic(
            &bob,
            delivery_hash(&bob),
            destination,
            &sender_public,
            nonce,
            &ciphertext,
        )
        .unwrap();
        assert_eq!(opened_id, id);
        assert_eq!(env.content, b"ping");
    }

    #[test]
    fn third_party_cannot_open() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let eve = Identity::generate();
        let (packed, _) = envelope(&alice, &bob).pack().unwrap();
        let Packet::Opportunistic {
            sender_public,
            nonce,
            ciphertext,
            ..
        } = seal_opportunistic(&alice, delivery_hash(&bob), bob.public_key(), &packed).unwrap()
        else {
            panic!("expected Opportunistic");
        };
        let err = open_opportunistic(
            &eve,
            delivery_hash(&eve),
            delivery_hash(&eve),
            &sender_public,
            nonce,
            &ciphertext,
        )
        .err()
        .unwrap();
        assert!(matches!(err, AcceptError::Crypto(_)));
    }

    #[test]
    fn forged_source_rejected() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mallory = Identity::generate();
        let (packed, _) = envelope(&alice, &bob).pack().unwrap();
        let err = accept_envelope(&packed, mallory.public_key(), delivery_hash(&bob))
            .err()
            .unwrap();
        assert!(matches!(err, AcceptError::SourceMismatch { .. }));
    }

    #[test]
    fn wrong_destination_rejected() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (packed, _) = envelope(&alice, &bob).pack().unwrap();
        let err = accept_envelope(&packed, alice.public_key(), delivery_hash(&alice))
            .err()
            .unwrap();
        assert!(matches!(err, AcceptError::NotForUs(_)));
    }

    #[test]
    fn seen_messages_evicts_oldest() {
        let mut seen = SeenMessages::new(2);
        let a = MessageId::from_bytes([1; 32]);
        let b = MessageId::from_bytes([2; 32]);
        let c = MessageId::from_bytes([3; 32]);
        assert!(seen.insert(a));
        assert!(!seen.insert(a));
        assert!(seen.insert(b));
        assert!(seen.insert(c));
        assert_eq!(seen.len(), 2);
        assert!(seen.insert(a));
        assert!(!seen.insert(c));
    }
}
