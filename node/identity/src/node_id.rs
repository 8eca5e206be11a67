// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::errors::Error;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a node: the URL-safe base64 form of its Ed25519
/// verifying key. Primary key of the member set and of every replicated
/// binding.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        NodeId(base64::encode_config(
            key.as_bytes(),
            base64::URL_SAFE_NO_PAD,
        ))
    }

    /// Parse a node ID from its text form, checking that it decodes to a
    /// valid verifying key.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let id = NodeId(text.to_string());
        id.verifying_key()?;
        Ok(id)
    }

    pub(crate) fn verifying_key(&self) -> Result<VerifyingKey, Error> {
        let bytes = base64::decode_config(&self.0, base64::URL_SAFE_NO_PAD)
            .map_err(|_| Error::BadNodeId)?;
        let arr = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| Error::BadNodeId)?;
        VerifyingKey::from_bytes(&arr).map_err(|_| Error::BadNodeId)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    /// Unchecked construction, for IDs that arrive from trusted local state
    /// (the replicated store, test fixtures). Wire-facing paths use
    /// [`NodeId::parse`].
    fn from(text: &str) -> Self {
        NodeId(text.to_string())
    }
}
