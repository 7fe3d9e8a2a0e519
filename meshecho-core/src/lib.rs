//! Mesh echo bot core.
//! Host-driven: no I/O besides the identity file; the daemon feeds packets in and sends
//! packets and replies out.

pub mod announce;
pub mod delivery;
pub mod destination;
pub mod error;
pub mod handler;
pub mod identity;
pub mod inbox;
pub mod message;
pub mod path;
pub mod protocol;
pub mod wire;

pub use announce::{announce_packet, AnnounceSchedule};
pub use delivery::{
    DeliveryError, DeliveryHandle, DeliveryMethod, DeliveryOutcome, DeliveryReport,
    FailureReason, PeerStatus,
};
pub use destination::{AppNamespace, Destination, DestinationHash, NamespaceError};
pub use error::{EchoError, Result};
pub use handler::{EchoHandler, Reply, SkipReason};
pub use identity::{Identity, IdentityError, IdentityHash, IdentitySource, PublicKey};
pub use message::{Envelope, Fields, InboundMessage, MessageId, OutboundMessage};
pub use path::{AnnounceInfo, PathTable, PathUpdate};
pub use protocol::{Packet, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
