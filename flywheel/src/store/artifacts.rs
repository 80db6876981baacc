//! Per-step artifact files
//!
//! Each worker phase drops a JSON artifact under
//! `<state_dir>/runs/<run_id>/`. Filenames carry the attempt number so
//! retries never overwrite an earlier attempt. Oversize payloads are
//! replaced with a truncation stub carrying the original byte count and a
//! bounded preview.

use crate::error::StoreResult;
use crate::store::atomic;
use crate::store::bounds::truncate_utf8;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Payloads above this size are stubbed out
pub const MAX_ARTIFACT_BYTES: usize = 128 * 1024;

/// Preview size kept inside a truncation stub
const STUB_PREVIEW_BYTES: usize = 4 * 1024;

/// Artifact writer for one run directory
pub struct ArtifactLog {
    run_dir: PathBuf,
}

impl ArtifactLog {
    pub fn new(run_dir: impl AsRef<Path>) -> Self {
        Self {
            run_dir: run_dir.as_ref().to_path_buf(),
        }
    }

    /// Write a step artifact, returning the file path.
    ///
    /// Filename shape: `<step>-<name>-a<attempt>.json`.
    pub fn write(
        &self,
        step: &str,
        name: &str,
        attempt: u32,
        payload: &Value,
    ) -> StoreResult<PathBuf> {
        let file = self
            .run_dir
            .join(format!("{step}-{name}-a{attempt}.json"));

        let serialized = serde_json::to_string_pretty(payload)
            .map_err(|e| crate::error::StoreError::Serialization(e.to_string()))?;

        let body = if serialized.len() > MAX_ARTIFACT_BYTES {
            let (preview, _) = truncate_utf8(&serialized, STUB_PREVIEW_BYTES);
            let stub = json!({
                "_artifact_truncated": true,
                "original_bytes": serialized.len(),
                "preview": preview,
            });
            serde_json::to_string_pretty(&stub)
                .map_err(|e| crate::error::StoreError::Serialization(e.to_string()))?
        } else {
            serialized
        };

        atomic::write_atomic(&file, body.as_bytes())?;
        Ok(file)
    }
}
