//! LAN discovery: UDP multicast socket carrying announces, path requests, opportunistic
//! packets and their proofs.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use meshecho_core::inbox::{self, AcceptError};
use meshecho_core::wire::MAX_DATAGRAM_LEN;
use meshecho_core::{decode_frame, AnnounceInfo, DeliveryMethod, Packet};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::mesh::MeshInner;

pub(crate) fn bind_multicast(port: u16, group: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Receive datagrams until the socket fails. Malformed datagrams are dropped.
pub(crate) async fn run_discovery(mesh: Arc<MeshInner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (n, from) = match mesh.socket().recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!("discovery socket receive failed: {}", e);
                continue;
            }
        };
        match decode_frame(&buf[..n]) {
            Ok((packet, _)) => handle_packet(&mesh, packet, from).await,
            Err(e) => debug!(%from, "dropping datagram: {}", e),
        }
    }
}

async fn handle_packet(mesh: &MeshInner, packet: Packet, from: SocketAddr) {
    match packet {
        Packet::Announce {
            protocol_version,
            destination,
            public_key,
            display_name,
            stamp_cost,
            link_port,
        } => {
            let info = AnnounceInfo {
                protocol_version,
                destination,
                public_key,
                display_name,
                stamp_cost,
                link_port,
            };
            mesh.on_announce(info, from).await;
        }
        Packet::PathRequest { destination } => mesh.on_path_request(destination, from).await,
        Packet::Opportunistic {
            destination,
            sender_public,
            nonce,
            ciphertext,
        } => {
            let local = mesh.destination.hash();
            match inbox::open_opportunistic(
                &mesh.identity,
                local,
                destination,
                &sender_public,
                nonce,
                &ciphertext,
            ) {
                Ok((envelope, message_id)) => {
                    // Proven even when it is a duplicate: the sender may have missed our proof.
                    let proof = Packet::Proof { message_id };
                    if let Err(e) = mesh.send_packet(&proof, from).await {
                        debug!(%from, "proof send failed: {}", e);
                    }
                    mesh.accept_inbound(envelope, message_id, DeliveryMethod::Opportunistic)
                        .await;
                }
                Err(AcceptError::NotForUs(other)) => trace!(destination = %other, "not for us"),
                Err(e) => debug!(%from, "rejected opportunistic packet: {}", e),
            }
        }
        Packet::Proof { message_id } => mesh.resolve_proof(message_id).await,
        Packet::Data { .. } => debug!(%from, "data packet outside a link"),
    }
}
