//! Atomic JSON journal writes
//!
//! Every persisted state file goes through the same path: serialize, write
//! to `<file>.tmp`, fsync, rename over `<file>`. On startup a dangling
//! `<file>.tmp` with no `<file>` beside it is promoted; the rename is the
//! commit point, so a tmp file left behind is a completed write that lost
//! its rename to a crash.

use crate::error::{StoreError, StoreResult};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Path of the temp sibling used during a write
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Write bytes atomically: tmp + fsync + rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// Promote a dangling tmp file when the target is missing.
///
/// Returns true when a promotion happened.
pub fn promote_tmp(path: &Path) -> StoreResult<bool> {
    let tmp = tmp_path(path);
    if !path.exists() && tmp.exists() {
        fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
        warn!(path = %path.display(), "Promoted dangling tmp file");
        return Ok(true);
    }
    Ok(false)
}

/// Serialize a value as pretty JSON and write it atomically
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    write_atomic(path, &bytes)
}

/// Load a JSON journal, promoting a dangling tmp first.
///
/// A missing file returns `Ok(None)`. A corrupt file also returns
/// `Ok(None)` after a warning; the caller continues without the affected
/// cache rather than failing the session.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    promote_tmp(path)?;

    if !path.exists() {
        return Ok(None);
    }

    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt journal, continuing without it");
            Ok(None)
        }
    }
}
