//! Links: TCP connections with a key-exchange handshake and encrypted length-prefixed frames.
//!
//! Handshake: each side sends `version ‖ public_key ‖ salt`. The session key mixes the static
//! X25519 secret with both salts. Each side then sends a sealed confirmation under its first
//! nonce; a link is registered only after the peer's confirmation decrypts, which proves it
//! holds the private key it claimed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meshecho_core::identity::{
    decrypt_wire, derive_link_key, encrypt_wire, link_salt, LINK_SALT_LEN,
};
use meshecho_core::inbox;
use meshecho_core::path::PathEntry;
use meshecho_core::wire::{LEN_SIZE, MAX_FRAME_LEN};
use meshecho_core::{
    decode_frame, encode_frame, DeliveryMethod, DestinationHash, Identity, Packet, PublicKey,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::mesh::{LinkSender, MeshInner};

const HELLO_SIZE: usize = 1 + 32 + LINK_SALT_LEN; // version + public_key + salt
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const KEY_CONFIRMATION: &[u8] = b"meshecho-link-confirm";

/// Which end opened the link. Each direction uses its own nonce range under the session key.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// First nonce of this side's range; it seals the key confirmation.
    fn nonce_base(self) -> u64 {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1 << 63,
        }
    }

    fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// Authenticated peer and the key of this link.
struct LinkSession {
    peer_public: PublicKey,
    key: [u8; 32],
}

fn invalid_data(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

/// Accept inbound links until the listener fails.
pub(crate) async fn run_listener(mesh: Arc<MeshInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                let mesh = mesh.clone();
                tokio::spawn(async move {
                    match timed_handshake(&mut stream, &mesh.identity, Role::Responder).await {
                        Ok(session) => {
                            start_link(stream, addr, session, Role::Responder, &mesh).await;
                        }
                        Err(e) => debug!(%addr, "link handshake failed: {}", e),
                    }
                });
            }
            Err(e) => {
                warn!("link listener stopped: {}", e);
                return;
            }
        }
    }
}

/// Connect to the link address in `entry`; the peer must prove it holds the announced key.
pub(crate) async fn open_link(
    mesh: &Arc<MeshInner>,
    destination: DestinationHash,
    entry: &PathEntry,
) -> std::io::Result<LinkSender> {
    let mut stream = TcpStream::connect(entry.link_addr).await?;
    let session = timed_handshake(&mut stream, &mesh.identity, Role::Initiator).await?;
    if session.peer_public != entry.public_key {
        return Err(invalid_data("peer key does not match its announce"));
    }
    debug!(%destination, addr = %entry.link_addr, "link established");
    Ok(start_link(stream, entry.link_addr, session, Role::Initiator, mesh).await)
}

async fn timed_handshake<S>(
    stream: &mut S,
    identity: &Identity,
    role: Role,
) -> std::io::Result<LinkSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(stream, identity, role))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))?
}

async fn handshake<S>(stream: &mut S, identity: &Identity, role: Role) -> std::io::Result<LinkSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let salt = link_salt();
    let hello = hello_bytes(identity, &salt);
    let (peer_public, peer_salt) = match role {
        Role::Initiator => {
            stream.write_all(&hello).await?;
            stream.flush().await?;
            read_hello(stream).await?
        }
        Role::Responder => {
            let peer = read_hello(stream).await?;
            stream.write_all(&hello).await?;
            stream.flush().await?;
            peer
        }
    };
    let shared = identity.shared_secret(&peer_public);
    let key = match role {
        Role::Initiator => derive_link_key(&shared, &salt, &peer_salt),
        Role::Responder => derive_link_key(&shared, &peer_salt, &salt),
    };
    write_sealed(stream, &key, role.nonce_base(), KEY_CONFIRMATION).await?;
    let confirmation = read_sealed(stream, &key, role.peer().nonce_base()).await?;
    if confirmation != KEY_CONFIRMATION {
        return Err(invalid_data("bad key confirmation"));
    }
    Ok(LinkSession { peer_public, key })
}

async fn read_hello<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> std::io::Result<(PublicKey, [u8; LINK_SALT_LEN])> {
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    if buf[0] != PROTOCOL_VERSION {
        return Err(invalid_data("unsupported protocol version"));
    }
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[1..33]);
    let mut salt = [0u8; LINK_SALT_LEN];
    salt.copy_from_slice(&buf[33..]);
    Ok((PublicKey::from_bytes(public_key), salt))
}

fn hello_bytes(identity: &Identity, salt: &[u8; LINK_SALT_LEN]) -> [u8; HELLO_SIZE] {
    let mut out = [0u8; HELLO_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..33].copy_from_slice(identity.public_key().as_bytes());
    out[33..].copy_from_slice(salt);
    out
}

async fn write_sealed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &[u8; 32],
    nonce: u64,
    plain: &[u8],
) -> std::io::Result<()> {
    let cipher = encrypt_wire(key, nonce, plain).map_err(|e| invalid_data(&e.to_string()))?;
    let len = cipher.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&cipher).await?;
    writer.flush().await
}

async fn read_sealed<R: AsyncRead + Unpin>(
    reader: &mut R,
    key: &[u8; 32],
    nonce: u64,
) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(invalid_data("frame too large"));
    }
    let mut cipher = vec![0u8; len as usize];
    reader.read_exact(&mut cipher).await?;
    decrypt_wire(key, nonce, &cipher).map_err(|e| invalid_data(&e.to_string()))
}

async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &[u8; 32],
    nonce: u64,
    packet: &Packet,
) -> std::io::Result<()> {
    let plain = encode_frame(packet).map_err(|e| invalid_data(&e.to_string()))?;
    write_sealed(writer, key, nonce, &plain).await
}

async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    key: &[u8; 32],
    nonce: u64,
) -> std::io::Result<Packet> {
    let plain = read_sealed(reader, key, nonce).await?;
    let (packet, _) = decode_frame(&plain).map_err(|e| invalid_data(&e.to_string()))?;
    Ok(packet)
}

/// Register the link under the peer's delivery destination and run it on its own task.
async fn start_link(
    stream: TcpStream,
    addr: SocketAddr,
    session: LinkSession,
    role: Role,
    mesh: &Arc<MeshInner>,
) -> LinkSender {
    let peer = DestinationHash::derive(&session.peer_public, mesh.destination.namespace());
    let (tx, rx) = mpsc::unbounded_channel();
    mesh.register_link(peer, tx.clone()).await;
    info!(%peer, %addr, "link up");
    tokio::spawn(run_link(stream, peer, session, role, tx.clone(), rx, mesh.clone()));
    tx
}

async fn run_link(
    stream: TcpStream,
    peer: DestinationHash,
    session: LinkSession,
    role: Role,
    tx: LinkSender,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    mesh: Arc<MeshInner>,
) {
    let LinkSession { peer_public, key } = session;
    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        let mut nonce = role.nonce_base() + 1;
        while let Some(packet) = rx.recv().await {
            if let Err(e) = write_packet(&mut writer, &key, nonce, &packet).await {
                debug!(%peer, "link write failed: {}", e);
                break;
            }
            nonce += 1;
        }
    });

    let local = mesh.destination.hash();
    let mut read_nonce = role.peer().nonce_base() + 1;
    loop {
        let packet = match read_packet(&mut reader, &key, read_nonce).await {
            Ok(p) => p,
            Err(e) => {
                debug!(%peer, "link closed: {}", e);
                break;
            }
        };
        read_nonce += 1;
        match packet {
            Packet::Data { packed } => match inbox::accept_envelope(&packed, &peer_public, local) {
                Ok((envelope, message_id)) => {
                    let _ = tx.send(Packet::Proof { message_id });
                    mesh.accept_inbound(envelope, message_id, DeliveryMethod::Direct)
                        .await;
                }
                Err(e) => debug!(%peer, "rejected link message: {}", e),
            },
            Packet::Proof { message_id } => mesh.resolve_proof(message_id).await,
            other => debug!(%peer, "unexpected packet on link: {:?}", other),
        }
    }
    mesh.remove_link(&peer, &tx).await;
    writer_task.abort();
    info!(%peer, "link down");
}
