//! Identity and crypto: X25519 keypair, identity hash, identity file, packet and link encryption.

use std::io::Write;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Size of the identity file: the raw X25519 private key.
pub const IDENTITY_FILE_LEN: usize = 32;

const LINK_KEY_CONTEXT: &[u8] = b"meshecho-link-v1";
const PACKET_KEY_CONTEXT: &[u8] = b"meshecho-packet-v1";

/// Public key (32 bytes, X25519). Carried in announces, handshakes and opportunistic packets.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Identity hash: first 16 bytes of SHA-256 over the public key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IdentityHash([u8; 16]);

impl IdentityHash {
    pub fn from_public_key(public: &PublicKey) -> Self {
        let digest = Sha256::digest(public.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        IdentityHash(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Where an identity came from at startup.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IdentitySource {
    Loaded,
    Created,
}

/// X25519 identity. The secret never leaves this type except through the identity file.
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
    hash: IdentityHash,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_private_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let hash = IdentityHash::from_public_key(&public);
        Self {
            secret,
            public,
            hash,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn hash(&self) -> IdentityHash {
        self.hash
    }

    /// X25519 shared secret with another public key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }

    /// Load the identity stored at `path`, or generate one and persist it there when the file
    /// does not exist. An existing file is never rewritten.
    pub fn load_or_create(path: &Path) -> Result<(Self, IdentitySource), IdentityError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let identity = Self::from_file_bytes(path, &bytes)?;
                Ok((identity, IdentitySource::Loaded))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.save(path)?;
                Ok((identity, IdentitySource::Created))
            }
            Err(e) => Err(IdentityError::Load {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    fn from_file_bytes(path: &Path, bytes: &[u8]) -> Result<Self, IdentityError> {
        let secret: [u8; IDENTITY_FILE_LEN] =
            bytes.try_into().map_err(|_| IdentityError::Load {
                path: path.to_path_buf(),
                reason: format!(
                    "expected {} bytes, found {}",
                    IDENTITY_FILE_LEN,
                    bytes.len()
                ),
            })?;
        Ok(Self::from_private_bytes(secret))
    }

    /// Write the private key to a new file (owner read/write only on unix).
    fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let persist_err = |source| IdentityError::Persist {
            path: path.to_path_buf(),
            source,
        };
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(persist_err)?;
        file.write_all(&self.secret.to_bytes()).map_err(persist_err)?;
        file.sync_all().map_err(persist_err)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("cannot load identity from {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("cannot persist identity to {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn derive_key(context: &[u8], shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(context);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Random value each side contributes to a link handshake.
pub const LINK_SALT_LEN: usize = 32;

/// Fresh handshake salt from the OS RNG.
pub fn link_salt() -> [u8; LINK_SALT_LEN] {
    let mut salt = [0u8; LINK_SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Session key for one TCP link: the pairwise secret mixed with both handshake salts, so every
/// link between the same two identities gets a fresh key.
pub fn derive_link_key(
    shared_secret: &[u8; 32],
    initiator_salt: &[u8; LINK_SALT_LEN],
    responder_salt: &[u8; LINK_SALT_LEN],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(LINK_KEY_CONTEXT);
    hasher.update(shared_secret);
    hasher.update(initiator_salt);
    hasher.update(responder_salt);
    hasher.finalize().into()
}

/// Key for single-packet (opportunistic) delivery between two identities.
pub fn derive_packet_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    derive_key(PACKET_KEY_CONTEXT, shared_secret)
}

/// Wire encryption: ChaCha20-Poly1305. Nonce is a 64-bit value; never reuse one under a key.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

fn nonce_bytes(nonce: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..12].copy_from_slice(&nonce.to_le_bytes());
    out
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hash_derivation() {
        let id = Identity::generate();
        assert_eq!(IdentityHash::from_public_key(id.public_key()), id.hash());
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_eq!(a.shared_secret(b.public_key()), b.shared_secret(a.public_key()));
    }

    #[test]
    fn link_and_packet_keys_differ() {
        let a = Identity::generate();
        let b = Identity::generate();
        let shared = a.shared_secret(b.public_key());
        let salt = [0u8; LINK_SALT_LEN];
        assert_ne!(derive_link_key(&shared, &salt, &salt), derive_packet_key(&shared));
    }

    #[test]
    fn link_key_changes_with_either_salt() {
        let a = Identity::generate();
        let b = Identity::generate();
        let shared = a.shared_secret(b.public_key());
        let first = derive_link_key(&shared, &[1; LINK_SALT_LEN], &[2; LINK_SALT_LEN]);
        assert_eq!(
            first,
            derive_link_key(&b.shared_secret(a.public_key()), &[1; LINK_SALT_LEN], &[2; LINK_SALT_LEN])
        );
        assert_ne!(first, derive_link_key(&shared, &[3; LINK_SALT_LEN], &[2; LINK_SALT_LEN]));
        assert_ne!(first, derive_link_key(&shared, &[1; LINK_SALT_LEN], &[3; LINK_SALT_LEN]));
        assert_ne!(first, derive_link_key(&shared, &[2; LINK_SALT_LEN], &[1; LINK_SALT_LEN]));
    }

    #[test]
    fn decrypt_with_wrong_nonce_fails() {
        let key = [7u8; 32];
        let cipher = encrypt_wire(&key, 1, b"ping").unwrap();
        assert!(matches!(
            decrypt_wire(&key, 2, &cipher),
            Err(WireCryptoError::Decrypt)
        ));
        assert_eq!(decrypt_wire(&key, 1, &cipher).unwrap(), b"ping");
    }

    #[test]
    fn fresh_path_creates_identity_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        let (id, source) = Identity::load_or_create(&path).unwrap();
        assert_eq!(source, IdentitySource::Created);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), IDENTITY_FILE_LEN);
        assert_eq!(Identity::from_private_bytes(bytes.try_into().unwrap()).hash(), id.hash());
    }

    #[test]
    fn second_load_yields_same_identity_and_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        let (first, _) = Identity::load_or_create(&path).unwrap();
        let before = std::fs::read(&path).unwrap();
        let (second, source) = Identity::load_or_create(&path).unwrap();
        assert_eq!(source, IdentitySource::Loaded);
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn corrupt_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        std::fs::write(&path, b"definitely not an identity").unwrap();
        let err = Identity::load_or_create(&path).err().unwrap();
        assert!(matches!(err, IdentityError::Load { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"definitely not an identity");
    }

    #[test]
    fn directory_path_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Identity::load_or_create(dir.path()).err().unwrap();
        assert!(matches!(err, IdentityError::Load { .. }));
    }

    #[test]
    fn unwritable_location_is_a_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("identity");
        let err = Identity::load_or_create(&path).err().unwrap();
        assert!(matches!(err, IdentityError::Persist { .. }));
    }
}
