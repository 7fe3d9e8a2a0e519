//! LAN mesh transport: path table, links, pending proofs, and the out-of-band delivery pipeline.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshecho_core::inbox::{self, SeenMessages};
use meshecho_core::path::{AnnounceRejected, PathEntry};
use meshecho_core::wire::MAX_OPPORTUNISTIC_PAYLOAD;
use meshecho_core::{
    announce_packet, encode_frame, AnnounceInfo, DeliveryError, DeliveryHandle, DeliveryMethod,
    DeliveryOutcome, DeliveryReport, Destination, DestinationHash, Envelope, FailureReason,
    Identity, InboundMessage, MessageId, OutboundMessage, Packet, PathTable, PathUpdate,
    PeerStatus,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::bot::Transport;
use crate::config::Config;
use crate::{discovery, transport};

const PATH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct MeshSettings {
    pub discovery_port: u16,
    pub link_port: u16,
    pub multicast_group: Ipv4Addr,
    pub path_request_timeout: Duration,
    pub delivery_timeout: Duration,
    pub path_expiry: Duration,
}

impl MeshSettings {
    pub fn from_config(c: &Config) -> Self {
        Self {
            discovery_port: c.discovery_port,
            link_port: c.link_port,
            multicast_group: c.multicast_group,
            path_request_timeout: c.path_request_timeout(),
            delivery_timeout: c.delivery_timeout(),
            path_expiry: c.path_expiry(),
        }
    }
}

pub(crate) type LinkSender = mpsc::UnboundedSender<Packet>;

/// State shared by the discovery loop, the link tasks and the delivery tasks.
pub(crate) struct MeshInner {
    pub(crate) identity: Arc<Identity>,
    pub(crate) destination: Arc<Destination>,
    settings: MeshSettings,
    socket: UdpSocket,
    /// Where announces and path requests go (the multicast group in production).
    broadcast: SocketAddr,
    paths: Mutex<PathTable>,
    path_notify: Notify,
    links: Mutex<HashMap<DestinationHash, LinkSender>>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<()>>>,
    seen: Mutex<SeenMessages>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    reports_tx: mpsc::UnboundedSender<DeliveryReport>,
}

/// Receivers the transport reports to: one message per inbound delivery, one report per
/// submitted reply.
pub struct MeshChannels {
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
    pub reports: mpsc::UnboundedReceiver<DeliveryReport>,
}

#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

impl Mesh {
    /// Bind the discovery socket (joined to the multicast group) and the link listener, then
    /// start the discovery, listener and path-expiry tasks.
    pub async fn start(
        identity: Arc<Identity>,
        destination: Arc<Destination>,
        settings: MeshSettings,
    ) -> std::io::Result<(Mesh, MeshChannels)> {
        let socket = discovery::bind_multicast(settings.discovery_port, settings.multicast_group)?;
        let broadcast = SocketAddr::from((settings.multicast_group, settings.discovery_port));
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, settings.link_port)).await?;
        info!(
            discovery_port = settings.discovery_port,
            link_port = settings.link_port,
            group = %settings.multicast_group,
            "mesh transport listening"
        );
        Ok(Self::with_sockets(
            identity,
            destination,
            settings,
            socket,
            broadcast,
            listener,
        ))
    }

    /// Start on already bound sockets. The advertised link port is taken from `listener`.
    pub(crate) fn with_sockets(
        identity: Arc<Identity>,
        destination: Arc<Destination>,
        mut settings: MeshSettings,
        socket: UdpSocket,
        broadcast: SocketAddr,
        listener: TcpListener,
    ) -> (Mesh, MeshChannels) {
        if let Ok(addr) = listener.local_addr() {
            settings.link_port = addr.port();
        }
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let paths = PathTable::new(destination.hash(), destination.namespace().clone());
        let inner = Arc::new(MeshInner {
            identity,
            destination,
            settings,
            socket,
            broadcast,
            paths: Mutex::new(paths),
            path_notify: Notify::new(),
            links: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            seen: Mutex::new(SeenMessages::default()),
            inbound_tx,
            reports_tx,
        });
        tokio::spawn(discovery::run_discovery(inner.clone()));
        tokio::spawn(transport::run_listener(inner.clone(), listener));
        tokio::spawn(expire_paths(inner.clone()));
        (Mesh { inner }, MeshChannels { inbound, reports })
    }
}

#[async_trait]
impl Transport for Mesh {
    async fn announce(&self) -> std::io::Result<()> {
        let packet = announce_packet(&self.inner.destination, self.inner.settings.link_port);
        self.inner.send_packet(&packet, self.inner.broadcast).await
    }

    async fn resolve_peer(&self, destination: &DestinationHash) -> PeerStatus {
        if self.inner.resolve_path(*destination).await.is_none() {
            debug!(%destination, "no path to peer");
        }
        self.inner.peer_status(destination).await
    }

    async fn send(&self, message: OutboundMessage) -> Result<DeliveryHandle, DeliveryError> {
        if self.inner.reports_tx.is_closed() {
            return Err(DeliveryError::Closed);
        }
        let (packed, message_id) = message.envelope().pack()?;
        let handle = DeliveryHandle {
            message_id,
            destination: message.destination,
            method: message.desired_method,
        };
        let (proof_tx, proof_rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(message_id, proof_tx);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = inner.deliver(handle, packed, proof_rx).await;
            inner.pending.lock().await.remove(&message_id);
            let _ = inner.reports_tx.send(DeliveryReport {
                handle,
                outcome,
                elapsed: started.elapsed(),
            });
        });
        Ok(handle)
    }
}

impl MeshInner {
    pub(crate) async fn send_packet(&self, packet: &Packet, to: SocketAddr) -> std::io::Result<()> {
        let frame = encode_frame(packet)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&frame, to).await?;
        Ok(())
    }

    /// Stamp cost from the peer's last announce and whether a link to it is up.
    pub(crate) async fn peer_status(&self, destination: &DestinationHash) -> PeerStatus {
        let stamp_cost = self
            .paths
            .lock()
            .await
            .get(destination)
            .and_then(|e| e.stamp_cost);
        let link_active = self
            .links
            .lock()
            .await
            .get(destination)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false);
        PeerStatus {
            stamp_cost,
            link_active,
        }
    }

    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub(crate) async fn on_announce(&self, announce: AnnounceInfo, from: SocketAddr) {
        let destination = announce.destination;
        let display_name = announce.display_name.clone();
        let result = self
            .paths
            .lock()
            .await
            .on_announce(announce, from, std::time::Instant::now());
        match result {
            Ok(PathUpdate::New) => {
                info!(%destination, %from, "learned path to {:?}", display_name);
                self.path_notify.notify_waiters();
            }
            Ok(PathUpdate::Refreshed) => {
                trace!(%destination, "path refreshed");
                self.path_notify.notify_waiters();
            }
            Err(AnnounceRejected::OwnAnnounce) => {}
            Err(e) => debug!(%from, "ignoring announce: {}", e),
        }
    }

    /// Answer a path request for our destination with a unicast announce.
    pub(crate) async fn on_path_request(&self, destination: DestinationHash, from: SocketAddr) {
        if destination != self.destination.hash() {
            return;
        }
        debug!(%from, "answering path request");
        let packet = announce_packet(&self.destination, self.settings.link_port);
        if let Err(e) = self.send_packet(&packet, from).await {
            debug!(%from, "path response failed: {}", e);
        }
    }

    /// Hand an accepted envelope to the bot unless it was seen before.
    pub(crate) async fn accept_inbound(
        &self,
        envelope: Envelope,
        message_id: MessageId,
        method: DeliveryMethod,
    ) {
        if !self.seen.lock().await.insert(message_id) {
            debug!(%message_id, "duplicate message");
            return;
        }
        let message = InboundMessage::from_envelope(message_id, envelope, method);
        let _ = self.inbound_tx.send(message);
    }

    pub(crate) async fn resolve_proof(&self, message_id: MessageId) {
        if let Some(tx) = self.pending.lock().await.remove(&message_id) {
            let _ = tx.send(());
        } else {
            trace!(%message_id, "proof for unknown message");
        }
    }

    pub(crate) async fn register_link(&self, peer: DestinationHash, tx: LinkSender) {
        self.links.lock().await.insert(peer, tx);
    }

    /// Forget the link to `peer` if `tx` is still the registered one.
    pub(crate) async fn remove_link(&self, peer: &DestinationHash, tx: &LinkSender) {
        let mut links = self.links.lock().await;
        if links.get(peer).map(|t| t.same_channel(tx)).unwrap_or(false) {
            links.remove(peer);
        }
    }

    async fn deliver(
        self: &Arc<Self>,
        handle: DeliveryHandle,
        packed: Vec<u8>,
        proof_rx: oneshot::Receiver<()>,
    ) -> DeliveryOutcome {
        let entry = match self.resolve_path(handle.destination).await {
            Some(entry) => entry,
            None => return DeliveryOutcome::Failed(FailureReason::NoPath),
        };
        let method = match handle.method {
            DeliveryMethod::Opportunistic if packed.len() > MAX_OPPORTUNISTIC_PAYLOAD => {
                DeliveryMethod::Direct
            }
            m => m,
        };
        let sent = match method {
            DeliveryMethod::Opportunistic => {
                self.send_opportunistic(handle.destination, &entry, &packed)
                    .await
            }
            DeliveryMethod::Direct => self.send_direct(handle.destination, &entry, packed).await,
        };
        if let Err(reason) = sent {
            return DeliveryOutcome::Failed(reason);
        }
        match tokio::time::timeout(self.settings.delivery_timeout, proof_rx).await {
            Ok(Ok(())) => DeliveryOutcome::Delivered,
            Ok(Err(_)) | Err(_) => DeliveryOutcome::TimedOut,
        }
    }

    /// Known path, or broadcast a path request and wait for an announce until the timeout.
    async fn resolve_path(&self, destination: DestinationHash) -> Option<PathEntry> {
        if let Some(entry) = self.paths.lock().await.get(&destination).cloned() {
            return Some(entry);
        }
        debug!(%destination, "requesting path");
        if let Err(e) = self
            .send_packet(&Packet::PathRequest { destination }, self.broadcast)
            .await
        {
            debug!(%destination, "path request failed: {}", e);
        }
        let deadline = Instant::now() + self.settings.path_request_timeout;
        loop {
            let notified = self.path_notify.notified();
            if let Some(entry) = self.paths.lock().await.get(&destination).cloned() {
                return Some(entry);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.paths.lock().await.get(&destination).cloned();
            }
        }
    }

    async fn send_opportunistic(
        &self,
        destination: DestinationHash,
        entry: &PathEntry,
        packed: &[u8],
    ) -> Result<(), FailureReason> {
        let packet = inbox::seal_opportunistic(&self.identity, destination, &entry.public_key, packed)
            .map_err(|e| FailureReason::Transmit(e.to_string()))?;
        self.send_packet(&packet, entry.packet_addr)
            .await
            .map_err(|e| FailureReason::Transmit(e.to_string()))
    }

    async fn send_direct(
        self: &Arc<Self>,
        destination: DestinationHash,
        entry: &PathEntry,
        packed: Vec<u8>,
    ) -> Result<(), FailureReason> {
        let existing = self
            .links
            .lock()
            .await
            .get(&destination)
            .filter(|tx| !tx.is_closed())
            .cloned();
        let tx = match existing {
            Some(tx) => tx,
            None => transport::open_link(self, destination, entry)
                .await
                .map_err(|e| FailureReason::Link(e.to_string()))?,
        };
        tx.send(Packet::Data { packed })
            .map_err(|_| FailureReason::Link("link closed".to_string()))
    }
}

async fn expire_paths(mesh: Arc<MeshInner>) {
    let mut interval = tokio::time::interval(PATH_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let expired = mesh
            .paths
            .lock()
            .await
            .expire(std::time::Instant::now(), mesh.settings.path_expiry);
        for destination in expired {
            debug!(%destination, "path expired");
        }
    }
}
