//! Delivery vocabulary shared by the handler and the transport: methods, handles, outcomes.

use std::time::Duration;

use crate::destination::DestinationHash;
use crate::message::MessageId;

/// How a message travels to its destination.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DeliveryMethod {
    /// Over an established (or newly established) link, acknowledged by a proof.
    Direct,
    /// Single encrypted packet without link setup.
    Opportunistic,
}

impl std::fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMethod::Direct => f.write_str("direct"),
            DeliveryMethod::Opportunistic => f.write_str("opportunistic"),
        }
    }
}

/// Returned by a successful submission. Identifies the outcome reported later.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DeliveryHandle {
    pub message_id: MessageId,
    pub destination: DestinationHash,
    pub method: DeliveryMethod,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FailureReason {
    /// No announce for the destination arrived before the path request timed out.
    NoPath,
    /// Link could not be established or broke while sending.
    Link(String),
    /// The packet could not be encrypted, framed or sent.
    Transmit(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::NoPath => f.write_str("no path to destination"),
            FailureReason::Link(e) => write!(f, "link error: {}", e),
            FailureReason::Transmit(e) => write!(f, "transmit error: {}", e),
        }
    }
}

/// Final state of one submitted message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(FailureReason),
    TimedOut,
}

/// Reported exactly once per handle.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub handle: DeliveryHandle,
    pub outcome: DeliveryOutcome,
    pub elapsed: Duration,
}

/// What the transport currently knows about a peer, consulted before replying.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct PeerStatus {
    /// Stamp cost from the peer's last announce, if any.
    pub stamp_cost: Option<u8>,
    /// A link to the peer is up and can carry a message right away.
    pub link_active: bool,
}

/// Submission was refused; nothing was queued.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("cannot pack outbound message: {0}")]
    Pack(#[from] crate::message::EnvelopeError),
    #[error("transport is shut down")]
    Closed,
}
