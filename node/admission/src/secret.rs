// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::errors::Error;
use std::fmt;

/// Minimum decoded length of the admission secret.
pub const MIN_SECRET_LEN: usize = 32;

/// The shared cluster secret. Proves eligibility to join; only HMAC
/// signatures derived from it ever appear on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterSecret(Vec<u8>);

impl ClusterSecret {
    /// Decode the text form found in configuration or the cluster key file.
    /// Boot fails when the secret is absent or decodes short.
    pub fn decode(text: &str) -> Result<Self, Error> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::SecretMissing);
        }
        let bytes = base64::decode(trimmed).map_err(|_| Error::SecretUndecodable)?;
        if bytes.len() < MIN_SECRET_LEN {
            return Err(Error::SecretTooShort(MIN_SECRET_LEN));
        }
        Ok(ClusterSecret(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Never print secret material, even at trace level.
impl fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ClusterSecret({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_enforces_minimum_length() {
        assert!(matches!(
            ClusterSecret::decode(""),
            Err(Error::SecretMissing)
        ));
        assert!(matches!(
            ClusterSecret::decode("!!!not base64!!!"),
            Err(Error::SecretUndecodable)
        ));
        assert!(matches!(
            ClusterSecret::decode(&base64::encode([1u8; 16])),
            Err(Error::SecretTooShort(32))
        ));
        ClusterSecret::decode(&base64::encode([1u8; 32])).unwrap();
    }

    #[test]
    fn debug_never_reveals_bytes() {
        let secret = ClusterSecret::decode(&base64::encode([7u8; 48])).unwrap();
        assert_eq!(format!("{secret:?}"), "ClusterSecret(48 bytes)");
    }
}
