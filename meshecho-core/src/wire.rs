//! Framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::Packet;

pub const LEN_SIZE: usize = 4;
/// Largest link frame.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB
/// Largest datagram on the discovery socket.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;
/// Largest packed envelope sent as a single opportunistic packet.
pub const MAX_OPPORTUNISTIC_PAYLOAD: usize = 1024;

/// Encode a packet into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(packet).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the packet and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let packet: Packet =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((packet, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{AppNamespace, DestinationHash};
    use crate::identity::Identity;
    use crate::message::MessageId;
    use crate::protocol::PROTOCOL_VERSION;

    fn sample_announce() -> Packet {
        let id = Identity::generate();
        Packet::Announce {
            protocol_version: PROTOCOL_VERSION,
            destination: DestinationHash::derive(id.public_key(), &AppNamespace::lxmf_delivery()),
            public_key: id.public_key().clone(),
            display_name: "Echo Bot".to_string(),
            stamp_cost: Some(8),
            link_port: 4243,
        }
    }

    #[test]
    fn announce_survives_framing() {
        let packet = sample_announce();
        let frame = encode_frame(&packet).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        match (&packet, &decoded) {
            (
                Packet::Announce {
                    destination: d1,
                    display_name: n1,
                    ..
                },
                Packet::Announce {
                    destination: d2,
                    display_name: n2,
                    ..
                },
            ) => {
                assert_eq!(d1, d2);
                assert_eq!(n1, n2);
            }
            _ => panic!("expected Announce"),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_announce()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(decode_frame(&bytes), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn back_to_back_frames() {
        let a = sample_announce();
        let b = Packet::Proof {
            message_id: MessageId::from_bytes([9; 32]),
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, Packet::Announce { .. }));
        assert!(matches!(m2, Packet::Proof { .. }));
    }
}
