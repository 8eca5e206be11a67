// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::errors::Error;
use crate::types::LogEntry;
use grove_identity::NodeId;
use grove_utils::{gc_temp_files, set_dir_perm, write_to_file};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const HARD_STATE_NAME: &str = "hard_state.json";
const LOG_NAME: &str = "log.json";

/// Term and vote, persisted before any vote or append is answered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// Durable storage for the consensus log. The store holds a handful of
/// small keys, so the whole log is rewritten atomically on every append
/// rather than maintained as an append-only file with replay.
pub struct DurableLog {
    dir: PathBuf,
}

impl DurableLog {
    /// Open (or create) the log directory, restricted to the owner.
    pub fn open(dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(dir).map_err(|e| Error::Storage(e.to_string()))?;
        set_dir_perm(dir).map_err(|e| Error::Storage(e.to_string()))?;
        gc_temp_files(dir).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(DurableLog {
            dir: dir.to_path_buf(),
        })
    }

    pub fn load_hard_state(&self) -> Result<HardState, Error> {
        let path = self.dir.join(HARD_STATE_NAME);
        if !path.exists() {
            return Ok(HardState::default());
        }
        let raw = std::fs::read(&path).map_err(|e| Error::Storage(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| Error::Storage(e.to_string()))
    }

    pub fn save_hard_state(&self, state: &HardState) -> Result<(), Error> {
        let json = serde_json::to_vec(state).map_err(|e| Error::Storage(e.to_string()))?;
        write_to_file(&json, &self.dir, HARD_STATE_NAME)
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn load_entries(&self) -> Result<Vec<LogEntry>, Error> {
        let path = self.dir.join(LOG_NAME);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read(&path).map_err(|e| Error::Storage(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| Error::Storage(e.to_string()))
    }

    pub fn save_entries(&self, entries: &[LogEntry]) -> Result<(), Error> {
        let json = serde_json::to_vec(entries).map_err(|e| Error::Storage(e.to_string()))?;
        write_to_file(&json, &self.dir, LOG_NAME).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    /// True when this directory already holds consensus state from a prior
    /// boot; bootstrap must never run twice.
    pub fn has_state(&self) -> bool {
        self.dir.join(LOG_NAME).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Command;

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::open(dir.path()).unwrap();
        assert!(!log.has_state());
        assert_eq!(log.load_hard_state().unwrap(), HardState::default());

        let state = HardState {
            term: 4,
            voted_for: Some(NodeId::from("candidate")),
        };
        log.save_hard_state(&state).unwrap();
        let entries = vec![LogEntry {
            term: 4,
            index: 1,
            command: Command::Put {
                key: "secret/munge".into(),
                value: b"key-material".to_vec(),
            },
        }];
        log.save_entries(&entries).unwrap();

        let reopened = DurableLog::open(dir.path()).unwrap();
        assert!(reopened.has_state());
        assert_eq!(reopened.load_hard_state().unwrap(), state);
        assert_eq!(reopened.load_entries().unwrap(), entries);
    }

    #[cfg(unix)]
    #[test]
    fn log_directory_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("consensus");
        DurableLog::open(&sub).unwrap();
        let mode = std::fs::metadata(&sub).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
