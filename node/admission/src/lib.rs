// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Cluster admission: time-bounded join proofs derived from the shared
//! cluster secret.
//!
//! The secret itself never goes on the wire. Each node attaches a token to
//! its membership advertisement; verifiers recompute the HMAC from their own
//! copy of the secret. Replay defense is the ±5 minute validity window, so
//! no nonce bookkeeping is required.

mod errors;
mod secret;

pub use errors::Error;
pub use secret::ClusterSecret;

use chrono::{DateTime, Duration, Utc};
use grove_identity::NodeId;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A token is valid when its issue time is within this window of the
/// verifier's clock, in either direction.
pub const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

#[derive(Serialize, Deserialize)]
struct JoinProof {
    nonce: String,
    issued_at: i64,
    issuer: String,
    sig: String,
}

fn proof_mac(secret: &ClusterSecret, nonce: &[u8], issued_at: i64, issuer: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(nonce);
    mac.update(&issued_at.to_be_bytes());
    mac.update(issuer.as_bytes());
    mac
}

/// Issue a fresh join proof for this node. Called at boot before the first
/// membership advertisement and again whenever the advertisement is
/// refreshed with a new token.
pub fn issue_join_proof(secret: &ClusterSecret, issuer: &NodeId) -> String {
    issue_join_proof_at(secret, issuer, Utc::now())
}

pub fn issue_join_proof_at(secret: &ClusterSecret, issuer: &NodeId, now: DateTime<Utc>) -> String {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    let issued_at = now.timestamp();
    let sig = proof_mac(secret, &nonce, issued_at, issuer.as_str())
        .finalize()
        .into_bytes();
    let proof = JoinProof {
        nonce: hex::encode(nonce),
        issued_at,
        issuer: issuer.to_string(),
        sig: hex::encode(sig),
    };
    base64::encode(serde_json::to_vec(&proof).expect("join proof serializes"))
}

/// Verify a join proof presented by `claimed`. The validity window is
/// checked before the MAC so that a peer with a skewed clock is reported as
/// skewed even when its secret is also wrong.
pub fn verify_join_proof(
    secret: &ClusterSecret,
    token: &str,
    claimed: &NodeId,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let raw = base64::decode(token).map_err(|_| Error::Malformed)?;
    let proof: JoinProof = serde_json::from_slice(&raw).map_err(|_| Error::Malformed)?;
    let nonce = hex::decode(&proof.nonce).map_err(|_| Error::Malformed)?;
    let sig = hex::decode(&proof.sig).map_err(|_| Error::Malformed)?;
    if nonce.len() != 32 {
        return Err(Error::Malformed);
    }

    let issued = DateTime::<Utc>::from_timestamp(proof.issued_at, 0).ok_or(Error::Malformed)?;
    let age = now.signed_duration_since(issued);
    if age > Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(Error::Expired);
    }
    if age < Duration::seconds(-MAX_CLOCK_SKEW_SECS) {
        return Err(Error::Skew);
    }

    if proof.issuer != claimed.as_str() {
        return Err(Error::IdentityMismatch);
    }

    proof_mac(secret, &nonce, proof.issued_at, &proof.issuer)
        .verify_slice(&sig)
        .map_err(|_| Error::WrongSecret)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        use ed25519_dalek::SigningKey;
        let key = SigningKey::from_bytes(&[byte; 32]);
        NodeId::from_verifying_key(&key.verifying_key())
    }

    fn secret() -> ClusterSecret {
        ClusterSecret::decode(&base64::encode([42u8; 32])).unwrap()
    }

    #[test]
    fn issued_proofs_verify() {
        let s = secret();
        let id = node(1);
        let token = issue_join_proof(&s, &id);
        verify_join_proof(&s, &token, &id, Utc::now()).unwrap();
    }

    #[test]
    fn wrong_secret_is_a_signature_failure() {
        let id = node(1);
        let token = issue_join_proof(&secret(), &id);
        let other = ClusterSecret::decode(&base64::encode([43u8; 32])).unwrap();
        assert!(matches!(
            verify_join_proof(&other, &token, &id, Utc::now()),
            Err(Error::WrongSecret)
        ));
    }

    #[test]
    fn flipped_signature_bit_fails() {
        let s = secret();
        let id = node(1);
        let token = issue_join_proof(&s, &id);
        let raw = base64::decode(&token).unwrap();
        let mut proof: JoinProof = serde_json::from_slice(&raw).unwrap();
        let mut sig = hex::decode(&proof.sig).unwrap();
        sig[0] ^= 0x01;
        proof.sig = hex::encode(sig);
        let tampered = base64::encode(serde_json::to_vec(&proof).unwrap());
        assert!(matches!(
            verify_join_proof(&s, &tampered, &id, Utc::now()),
            Err(Error::WrongSecret)
        ));
    }

    #[test]
    fn outside_window_never_reports_signature() {
        let s = secret();
        let wrong = ClusterSecret::decode(&base64::encode([9u8; 32])).unwrap();
        let id = node(1);
        let now = Utc::now();

        let stale = issue_join_proof_at(&s, &id, now - Duration::seconds(MAX_CLOCK_SKEW_SECS + 30));
        assert!(matches!(
            verify_join_proof(&s, &stale, &id, now),
            Err(Error::Expired)
        ));
        // Even with the wrong secret, an out-of-window token reports its
        // window failure.
        assert!(matches!(
            verify_join_proof(&wrong, &stale, &id, now),
            Err(Error::Expired)
        ));

        let future = issue_join_proof_at(&s, &id, now + Duration::seconds(MAX_CLOCK_SKEW_SECS + 30));
        assert!(matches!(
            verify_join_proof(&s, &future, &id, now),
            Err(Error::Skew)
        ));
    }

    #[test]
    fn issuer_must_match_claimed_node() {
        let s = secret();
        let token = issue_join_proof(&s, &node(1));
        assert!(matches!(
            verify_join_proof(&s, &token, &node(2), Utc::now()),
            Err(Error::IdentityMismatch)
        ));
    }

    #[test]
    fn garbage_tokens_are_malformed() {
        let s = secret();
        for bad in ["", "????", &base64::encode(b"{\"nope\":1}")] {
            assert!(matches!(
                verify_join_proof(&s, bad, &node(1), Utc::now()),
                Err(Error::Malformed)
            ));
        }
    }
}
