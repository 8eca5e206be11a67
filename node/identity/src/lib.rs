// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Long-lived cryptographic identity of a grove node.
//!
//! A node is identified by an Ed25519 signing keypair generated on first
//! boot and persisted to `identity.json` (owner-only permissions). The node
//! ID is the text encoding of the verifying key; the overlay tunnel keypair
//! is derived deterministically from the signing seed, so a node keeps the
//! same tunnel key for its whole life.

mod errors;
mod node_id;

pub use errors::Error;
pub use node_id::NodeId;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use grove_utils::{gc_temp_files, set_user_perm, write_to_file};
use hkdf::Hkdf;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use x25519_dalek::{PublicKey, StaticSecret};

pub const IDENTITY_NAME: &str = "identity.json";

const TUNNEL_KDF_SALT: &[u8] = b"grove/tunnel-key/v1";
const TUNNEL_KDF_INFO: &[u8] = b"overlay scalar";

/// On-disk form of the identity. The private key never leaves the machine.
#[derive(Serialize, Deserialize)]
struct PersistentIdentity {
    node_id: String,
    public_key: String,
    private_key: String,
    created_at: DateTime<Utc>,
}

/// The node's signing identity plus the tunnel keypair derived from it.
pub struct Identity {
    node_id: NodeId,
    signing: SigningKey,
    created_at: DateTime<Utc>,
    path: PathBuf,
}

impl Identity {
    /// Load the identity from `dir`, generating and persisting a fresh one
    /// if no identity file exists yet. A corrupt or inconsistent file is an
    /// error; the file is never overwritten.
    pub fn init(dir: &Path) -> Result<Self, Error> {
        let file_path = dir.join(IDENTITY_NAME);
        gc_temp_files(dir).map_err(|e| Error::Access(dir.to_path_buf(), e.to_string()))?;
        if file_path.exists() {
            let identity = Self::load(&file_path)?;
            debug!("loaded identity {} from {:?}", identity.node_id, file_path);
            return Ok(identity);
        }

        let mut csprng = rand::rngs::OsRng;
        let signing = SigningKey::generate(&mut csprng);
        let node_id = NodeId::from_verifying_key(&signing.verifying_key());
        let created_at = Utc::now();
        let persistent = PersistentIdentity {
            node_id: node_id.to_string(),
            public_key: base64::encode(signing.verifying_key().as_bytes()),
            private_key: base64::encode(signing.to_bytes()),
            created_at,
        };
        let json = serde_json::to_vec_pretty(&persistent)
            .map_err(|e| Error::Access(file_path.clone(), e.to_string()))?;
        let written = write_to_file(&json, dir, IDENTITY_NAME)
            .map_err(|e| Error::Access(file_path.clone(), e.to_string()))?;
        set_user_perm(&written).map_err(|e| Error::Access(written.clone(), e.to_string()))?;
        info!("generated new identity {node_id}");
        Ok(Identity {
            node_id,
            signing,
            created_at,
            path: written,
        })
    }

    fn load(file_path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read(file_path)
            .map_err(|e| Error::Access(file_path.to_path_buf(), e.to_string()))?;
        let persistent: PersistentIdentity = serde_json::from_slice(&raw)
            .map_err(|e| Error::Corrupt(file_path.to_path_buf(), e.to_string()))?;

        let seed = decode_exact::<32>(&persistent.private_key)
            .ok_or_else(|| corrupt(file_path, "private key is not 32 bytes"))?;
        let signing = SigningKey::from_bytes(&seed);
        let node_id = NodeId::from_verifying_key(&signing.verifying_key());

        // The public key and node ID on disk must agree with the private
        // key; a mismatch means the key was rotated under us.
        let public = decode_exact::<32>(&persistent.public_key)
            .ok_or_else(|| corrupt(file_path, "public key is not 32 bytes"))?;
        if public != signing.verifying_key().to_bytes() {
            return Err(corrupt(file_path, "public key does not match private key"));
        }
        if persistent.node_id != node_id.as_str() {
            return Err(corrupt(file_path, "node id does not match public key"));
        }

        Ok(Identity {
            node_id,
            signing,
            created_at: persistent.created_at,
            path: file_path.to_path_buf(),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Seed bytes of the signing key, used to bind the gossip transport's
    /// peer identity to the node identity. Never leaves the process.
    pub fn transport_seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Verify `signature` over `message` against the verifying key encoded
    /// in `node_id`.
    pub fn verify(node_id: &NodeId, message: &[u8], signature: &[u8]) -> Result<(), Error> {
        let key = node_id.verifying_key()?;
        let sig = Signature::from_slice(signature).map_err(|_| Error::BadSignature)?;
        key.verify(message, &sig).map_err(|_| Error::BadSignature)
    }

    /// The overlay tunnel private key: HKDF of the signing seed, clamped
    /// per the curve25519 scalar convention. Pure function of the stored
    /// key, so a node's tunnel key never changes.
    pub fn tunnel_secret(&self) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(TUNNEL_KDF_SALT), &self.signing.to_bytes());
        let mut scalar = [0u8; 32];
        hk.expand(TUNNEL_KDF_INFO, &mut scalar)
            .expect("32 bytes is a valid hkdf output length");
        scalar[0] &= 248;
        scalar[31] &= 127;
        scalar[31] |= 64;
        scalar
    }

    /// The tunnel public key in the overlay's text encoding.
    pub fn tunnel_public(&self) -> String {
        let secret = StaticSecret::from(self.tunnel_secret());
        base64::encode(PublicKey::from(&secret).as_bytes())
    }
}

fn corrupt(path: &Path, reason: &str) -> Error {
    Error::Corrupt(path.to_path_buf(), reason.to_string())
}

fn decode_exact<const N: usize>(encoded: &str) -> Option<[u8; N]> {
    let bytes = base64::decode(encoded).ok()?;
    <[u8; N]>::try_from(bytes.as_slice()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_boots() {
        let dir = tempfile::tempdir().unwrap();
        let first = Identity::init(dir.path()).unwrap();
        let second = Identity::init(dir.path()).unwrap();
        assert_eq!(first.node_id(), second.node_id());
        assert_eq!(first.tunnel_secret(), second.tunnel_secret());
        assert_eq!(first.tunnel_public(), second.tunnel_public());
        assert_eq!(first.created_at(), second.created_at());
    }

    #[test]
    fn corrupt_file_aborts_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(IDENTITY_NAME);
        std::fs::write(&path, b"not json at all").unwrap();
        assert!(matches!(
            Identity::init(dir.path()),
            Err(Error::Corrupt(..))
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"not json at all");
    }

    #[test]
    fn tampered_public_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let original = Identity::init(dir.path()).unwrap();
        let path = dir.path().join(IDENTITY_NAME);
        let mut doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        doc["public_key"] = serde_json::json!(base64::encode([7u8; 32]));
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        assert!(matches!(
            Identity::init(dir.path()),
            Err(Error::Corrupt(..))
        ));
        drop(original);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::init(dir.path()).unwrap();
        let sig = identity.sign(b"advertisement");
        Identity::verify(identity.node_id(), b"advertisement", &sig).unwrap();
        assert!(Identity::verify(identity.node_id(), b"tampered", &sig).is_err());
    }

    #[test]
    fn tunnel_scalar_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::init(dir.path()).unwrap();
        let scalar = identity.tunnel_secret();
        assert_eq!(scalar[0] & 7, 0);
        assert_eq!(scalar[31] & 128, 0);
        assert_eq!(scalar[31] & 64, 64);
    }

    #[cfg(unix)]
    #[test]
    fn identity_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::init(dir.path()).unwrap();
        let mode = std::fs::metadata(identity.path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn stale_temp_file_is_collected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("identity.json.tmp"), b"partial").unwrap();
        Identity::init(dir.path()).unwrap();
        assert!(!dir.path().join("identity.json.tmp").exists());
    }
}
