// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("identity file at {0} is corrupt: {1}")]
    Corrupt(PathBuf, String),
    #[error("identity file at {0} is unreadable or unwritable: {1}")]
    Access(PathBuf, String),
    #[error("node id is not a valid encoded verifying key")]
    BadNodeId,
    #[error("signature verification failed")]
    BadSignature,
}
