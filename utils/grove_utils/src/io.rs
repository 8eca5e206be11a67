// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use log::trace;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix used for in-flight writes. A crash leaves the temp file behind;
/// [`gc_temp_files`] removes it on the next boot.
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("There is an issue with the file at {0}")]
    File(PathBuf),
    #[error("Could not parse toml: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Writes `message` to a file named `file_name` in `path`, creating the
/// directory chain as needed. The write goes through a temp file in the same
/// directory and is renamed into place, so readers never observe a partial
/// file. Returns the final file path.
pub fn write_to_file(message: &[u8], path: &Path, file_name: &str) -> Result<PathBuf, FileError> {
    fs::create_dir_all(path)?;
    let file_path = path.join(file_name);
    let tmp_path = path.join(format!("{file_name}{TMP_SUFFIX}"));
    let mut file = File::create(&tmp_path)?;
    file.write_all(message)?;
    file.sync_all()?;
    fs::rename(&tmp_path, &file_path)?;
    Ok(file_path)
}

/// Restrict permissions on a file containing key material to the owner.
#[cfg(unix)]
pub fn set_user_perm(file_path: &Path) -> Result<(), FileError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perm = fs::metadata(file_path)?.permissions();
    perm.set_mode(0o600);
    fs::set_permissions(file_path, perm)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_user_perm(_file_path: &Path) -> Result<(), FileError> {
    Ok(())
}

/// Restrict a directory holding private state to the owner.
#[cfg(unix)]
pub fn set_dir_perm(dir_path: &Path) -> Result<(), FileError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perm = fs::metadata(dir_path)?.permissions();
    perm.set_mode(0o700);
    fs::set_permissions(dir_path, perm)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_dir_perm(_dir_path: &Path) -> Result<(), FileError> {
    Ok(())
}

/// Removes temp files left behind by writes interrupted mid-flight.
pub fn gc_temp_files(path: &Path) -> Result<(), FileError> {
    if !path.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(TMP_SUFFIX) {
            trace!("removing stale temp file {:?}", entry.path());
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Read file as a `String`.
pub fn read_file_to_string(path: &Path) -> Result<String, FileError> {
    fs::read_to_string(path).map_err(|_| FileError::File(path.to_path_buf()))
}

/// Read file as a `Vec<u8>`.
pub fn read_file_to_vec(path: &Path) -> Result<Vec<u8>, FileError> {
    fs::read(path).map_err(|_| FileError::File(path.to_path_buf()))
}

/// Parse a toml document into a deserializable value.
pub fn read_toml<T: DeserializeOwned>(toml_string: &str) -> Result<T, FileError> {
    Ok(toml::from_str(toml_string)?)
}
