//! Echo handler: turn one inbound message into at most one reply.
//! Pure: no I/O, no shared state. The host submits the reply and logs the skip reasons.

use crate::delivery::{DeliveryMethod, PeerStatus};
use crate::destination::DestinationHash;
use crate::message::{InboundMessage, OutboundMessage};
use crate::wire::MAX_OPPORTUNISTIC_PAYLOAD;

/// Decision for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Send(OutboundMessage),
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The sender asks for more proof-of-work than we are willing to spend.
    StampCostTooHigh { cost: u8, max: u8 },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::StampCostTooHigh { cost, max } => write!(
                f,
                "stamp cost of {} is higher than max outbound stamp cost of {}",
                cost, max
            ),
        }
    }
}

/// Replies to every message with its own title, content and fields.
#[derive(Debug, Clone)]
pub struct EchoHandler {
    local: DestinationHash,
    max_outbound_stamp_cost: Option<u8>,
}

impl EchoHandler {
    pub fn new(local: DestinationHash, max_outbound_stamp_cost: Option<u8>) -> Self {
        Self {
            local,
            max_outbound_stamp_cost,
        }
    }

    pub fn local(&self) -> DestinationHash {
        self.local
    }

    /// Build the reply to `inbound` given what the transport knows about its sender.
    pub fn handle(&self, inbound: &InboundMessage, peer: PeerStatus) -> Reply {
        if let (Some(max), Some(cost)) = (self.max_outbound_stamp_cost, peer.stamp_cost) {
            if cost > max {
                return Reply::Skip(SkipReason::StampCostTooHigh { cost, max });
            }
        }
        let mut reply = OutboundMessage {
            destination: inbound.source,
            source: self.local,
            title: inbound.title.clone(),
            content: inbound.content.clone(),
            fields: inbound.fields.clone(),
            desired_method: DeliveryMethod::Direct,
        };
        reply.desired_method = choose_method(&reply, peer);
        Reply::Send(reply)
    }
}

/// Direct when a link is already up or the message needs one; otherwise a single packet
/// saves the link setup round trips.
fn choose_method(reply: &OutboundMessage, peer: PeerStatus) -> DeliveryMethod {
    if peer.link_active {
        return DeliveryMethod::Direct;
    }
    match reply.envelope().pack() {
        Ok((packed, _)) if packed.len() <= MAX_OPPORTUNISTIC_PAYLOAD => DeliveryMethod::Opportunistic,
        _ => DeliveryMethod::Direct,
    }
}
