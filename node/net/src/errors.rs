// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid gossip address {0:?}")]
    Addr(String),
    #[error("gossip encrypt key is not a base64 32-byte key")]
    EncryptKey,
    #[error("gossip transport error: {0}")]
    Transport(String),
}
