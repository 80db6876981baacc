//! State & event store
//!
//! Atomic-write JSON journals, bounded payloads, NDJSON event logs, and
//! per-step artifact files. Everything the session persists goes through
//! this module.

pub mod artifacts;
pub mod atomic;
pub mod bounds;
pub mod events;

pub use artifacts::ArtifactLog;
pub use atomic::{load_json, promote_tmp, save_json, write_atomic};
pub use bounds::{bound_payload, truncate_utf8, BoundKind, TruncationNote};
pub use events::{EventLog, EventRecord, EventType};
