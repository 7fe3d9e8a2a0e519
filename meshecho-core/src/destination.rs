//! Destinations: application namespaces and the stable addresses derived from an identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::{Identity, IdentityHash, PublicKey};

const NAME_HASH_LEN: usize = 10;

/// App name of message delivery endpoints.
pub const DELIVERY_APP: &str = "lxmf";
/// Aspects of message delivery endpoints.
pub const DELIVERY_ASPECTS: &[&str] = &["delivery"];

/// Application namespace of a destination: `app.aspect[.aspect...]`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AppNamespace {
    app: String,
    aspects: Vec<String>,
}

impl AppNamespace {
    pub fn new(app: &str, aspects: &[&str]) -> Result<Self, NamespaceError> {
        validate_component(app)?;
        if aspects.is_empty() {
            return Err(NamespaceError::NoAspects);
        }
        for aspect in aspects {
            validate_component(aspect)?;
        }
        Ok(Self {
            app: app.to_string(),
            aspects: aspects.iter().map(|a| a.to_string()).collect(),
        })
    }

    /// Namespace of message delivery endpoints.
    pub fn lxmf_delivery() -> Self {
        Self {
            app: DELIVERY_APP.to_string(),
            aspects: DELIVERY_ASPECTS.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// First 10 bytes of SHA-256 over the dotted name.
    pub fn name_hash(&self) -> [u8; NAME_HASH_LEN] {
        let digest = Sha256::digest(self.to_string().as_bytes());
        let mut out = [0u8; NAME_HASH_LEN];
        out.copy_from_slice(&digest[..NAME_HASH_LEN]);
        out
    }
}

impl std::fmt::Display for AppNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.app)?;
        for aspect in &self.aspects {
            write!(f, ".{}", aspect)?;
        }
        Ok(())
    }
}

fn validate_component(component: &str) -> Result<(), NamespaceError> {
    if component.is_empty() {
        return Err(NamespaceError::Empty);
    }
    if component.contains('.') {
        return Err(NamespaceError::Dot(component.to_string()));
    }
    if !component.chars().all(|c| c.is_ascii_graphic()) {
        return Err(NamespaceError::InvalidChar(component.to_string()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NamespaceError {
    #[error("namespace component is empty")]
    Empty,
    #[error("namespace needs at least one aspect")]
    NoAspects,
    #[error("namespace component {0:?} contains a dot")]
    Dot(String),
    #[error("namespace component {0:?} contains whitespace or non-ascii characters")]
    InvalidChar(String),
}

/// Network-visible address of a destination (16 bytes).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationHash([u8; 16]);

impl DestinationHash {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        DestinationHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Address of `namespace` under the identity owning `public_key`.
    pub fn derive(public_key: &PublicKey, namespace: &AppNamespace) -> Self {
        let identity_hash = IdentityHash::from_public_key(public_key);
        let mut hasher = Sha256::new();
        hasher.update(namespace.name_hash());
        hasher.update(identity_hash.as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        DestinationHash(out)
    }
}

impl std::fmt::Display for DestinationHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::str::FromStr for DestinationHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out)?;
        Ok(DestinationHash(out))
    }
}

/// This process's inbound endpoint. Immutable after registration.
#[derive(Debug, Clone)]
pub struct Destination {
    hash: DestinationHash,
    namespace: AppNamespace,
    public_key: PublicKey,
    display_name: String,
}

impl Destination {
    /// Bind `identity` to `namespace`. The display name is only carried in announces.
    pub fn register(identity: &Identity, namespace: AppNamespace, display_name: &str) -> Self {
        Self {
            hash: DestinationHash::derive(identity.public_key(), &namespace),
            namespace,
            public_key: identity.public_key().clone(),
            display_name: display_name.to_string(),
        }
    }

    pub fn hash(&self) -> DestinationHash {
        self.hash
    }

    pub fn namespace(&self) -> &AppNamespace {
        &self.namespace
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}
