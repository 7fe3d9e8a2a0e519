//! Path table: what announces have taught us about other delivery destinations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::destination::{AppNamespace, DestinationHash};
use crate::identity::PublicKey;
use crate::protocol::PROTOCOL_VERSION;

/// Default time after which an un-refreshed path is dropped.
pub const DEFAULT_PATH_EXPIRY: Duration = Duration::from_secs(3600);

/// Announce fields the path table cares about.
#[derive(Debug, Clone)]
pub struct AnnounceInfo {
    pub protocol_version: u8,
    pub destination: DestinationHash,
    pub public_key: PublicKey,
    pub display_name: String,
    pub stamp_cost: Option<u8>,
    pub link_port: u16,
}

#[derive(Debug, Clone)]
pub struct PathEntry {
    pub public_key: PublicKey,
    /// Discovery socket of the announcer (opportunistic packets, path requests).
    pub packet_addr: SocketAddr,
    /// TCP link listener.
    pub link_addr: SocketAddr,
    pub display_name: String,
    pub stamp_cost: Option<u8>,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PathUpdate {
    New,
    Refreshed,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum AnnounceRejected {
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("own announce")]
    OwnAnnounce,
    #[error("destination {0} does not match announced key")]
    HashMismatch(DestinationHash),
}

pub struct PathTable {
    local: DestinationHash,
    namespace: AppNamespace,
    entries: HashMap<DestinationHash, PathEntry>,
}

impl PathTable {
    pub fn new(local: DestinationHash, namespace: AppNamespace) -> Self {
        Self {
            local,
            namespace,
            entries: HashMap::new(),
        }
    }

    /// Validate an announce received from `from` and record the path it advertises.
    pub fn on_announce(
        &mut self,
        announce: AnnounceInfo,
        from: SocketAddr,
        now: Instant,
    ) -> Result<PathUpdate, AnnounceRejected> {
        if announce.protocol_version != PROTOCOL_VERSION {
            return Err(AnnounceRejected::Version(announce.protocol_version));
        }
        if announce.destination == self.local {
            return Err(AnnounceRejected::OwnAnnounce);
        }
        if DestinationHash::derive(&announce.public_key, &self.namespace) != announce.destination {
            return Err(AnnounceRejected::HashMismatch(announce.destination));
        }
        let entry = PathEntry {
            public_key: announce.public_key,
            packet_addr: from,
            link_addr: SocketAddr::new(from.ip(), announce.link_port),
            display_name: announce.display_name,
            stamp_cost: announce.stamp_cost,
            last_seen: now,
        };
        match self.entries.insert(announce.destination, entry) {
            Some(_) => Ok(PathUpdate::Refreshed),
            None => Ok(PathUpdate::New),
        }
    }

    pub fn get(&self, destination: &DestinationHash) -> Option<&PathEntry> {
        self.entries.get(destination)
    }

    pub fn has_path(&self, destination: &DestinationHash) -> bool {
        self.entries.contains_key(destination)
    }

    /// Drop entries older than `max_age`. Returns the removed destinations.
    pub fn expire(&mut self, now: Instant, max_age: Duration) -> Vec<DestinationHash> {
        let stale: Vec<DestinationHash> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) >= max_age)
            .map(|(d, _)| *d)
            .collect();
        for d in &stale {
            self.entries.remove(d);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
