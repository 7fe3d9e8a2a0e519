//! Mesh wire protocol: packet types and version.

use serde::{Deserialize, Serialize};

use crate::destination::DestinationHash;
use crate::identity::PublicKey;
use crate::message::MessageId;

/// Current protocol version. Checked on announces and link handshakes.
pub const PROTOCOL_VERSION: u8 = 1;

/// All packet types. Discovery-socket packets and link frames share this enum; encoding is
/// bincode, framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    /// Advertise a delivery destination and where to reach it.
    Announce {
        protocol_version: u8,
        destination: DestinationHash,
        public_key: PublicKey,
        display_name: String,
        stamp_cost: Option<u8>,
        link_port: u16,
    },
    /// Ask the owner of `destination` to announce itself to the requester.
    PathRequest { destination: DestinationHash },
    /// Packed envelope encrypted for `destination` with the static-static packet key.
    Opportunistic {
        destination: DestinationHash,
        sender_public: PublicKey,
        nonce: u64,
        ciphertext: Vec<u8>,
    },
    /// Packed envelope carried over an encrypted link.
    Data { packed: Vec<u8> },
    /// Receipt for a delivered message.
    Proof { message_id: MessageId },
}
