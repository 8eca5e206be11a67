// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("token is malformed")]
    Malformed,
    #[error("token issued too far in the past")]
    Expired,
    #[error("token issued too far in the future")]
    Skew,
    #[error("token signature does not match the cluster secret")]
    WrongSecret,
    #[error("token issuer does not match the presenting node")]
    IdentityMismatch,
    #[error("cluster secret is missing")]
    SecretMissing,
    #[error("cluster secret is not valid base64")]
    SecretUndecodable,
    #[error("cluster secret decodes to fewer than {0} bytes")]
    SecretTooShort(usize),
}

impl Error {
    /// The `reason` field of `admission.reject` audit lines.
    pub fn audit_reason(&self) -> &'static str {
        match self {
            Error::Malformed => "malformed",
            Error::Expired => "expired",
            Error::Skew => "skew",
            // A proof that authenticates a different node does not
            // authenticate this one; both cases are signature failures to
            // the auditor.
            Error::WrongSecret | Error::IdentityMismatch => "signature",
            Error::SecretMissing | Error::SecretUndecodable | Error::SecretTooShort(_) => {
                "missing"
            }
        }
    }
}
