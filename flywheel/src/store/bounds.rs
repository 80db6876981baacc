//! Payload bounding for persisted events and journals
//!
//! String fields are capped by kind (path, command, small, medium, large),
//! lists are capped by element count, and whole payloads are capped at
//! 512 KiB. Truncation is never silent: the payload gains
//! `_payload_truncated` plus a `_payload_truncations` list describing what
//! was cut.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Byte cap for a path field
pub const MAX_PATH_BYTES: usize = 2 * 1024;
/// Byte cap for a shell command field
pub const MAX_COMMAND_BYTES: usize = 4 * 1024;
/// Byte cap for a small string field (titles, reasons)
pub const MAX_SMALL_BYTES: usize = 8 * 1024;
/// Byte cap for a medium string field (descriptions, excerpts)
pub const MAX_MEDIUM_BYTES: usize = 32 * 1024;
/// Byte cap for a large string field (diffs, stdout)
pub const MAX_LARGE_BYTES: usize = 128 * 1024;
/// Element cap for string lists
pub const MAX_LIST_STRINGS: usize = 400;
/// Element cap for record lists
pub const MAX_LIST_RECORDS: usize = 200;
/// Byte cap for a whole serialized event payload
pub const MAX_EVENT_PAYLOAD_BYTES: usize = 512 * 1024;

/// Kind of bound applied to a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundKind {
    Path,
    Command,
    Small,
    Medium,
    Large,
    ListStrings,
    ListRecords,
    Payload,
}

impl BoundKind {
    /// Byte cap for string kinds, element cap for list kinds
    pub fn limit(&self) -> usize {
        match self {
            Self::Path => MAX_PATH_BYTES,
            Self::Command => MAX_COMMAND_BYTES,
            Self::Small => MAX_SMALL_BYTES,
            Self::Medium => MAX_MEDIUM_BYTES,
            Self::Large => MAX_LARGE_BYTES,
            Self::ListStrings => MAX_LIST_STRINGS,
            Self::ListRecords => MAX_LIST_RECORDS,
            Self::Payload => MAX_EVENT_PAYLOAD_BYTES,
        }
    }
}

/// One applied truncation, embedded into the payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncationNote {
    pub field: String,
    pub kind: BoundKind,
    /// Original size (bytes for strings, elements for lists)
    pub original: usize,
    /// Applied limit
    pub max: usize,
}

/// Truncate a string to a UTF-8-safe byte budget
pub fn truncate_utf8(s: &str, max_bytes: usize) -> (String, bool) {
    if s.len() <= max_bytes {
        return (s.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (s[..end].to_string(), true)
}

/// Infer the bound kind for a payload field by name
fn kind_for_field(field: &str) -> BoundKind {
    let lower = field.to_ascii_lowercase();
    if lower.ends_with("path") || lower.ends_with("file") || lower == "scope" {
        BoundKind::Path
    } else if lower.contains("command") || lower == "cmd" {
        BoundKind::Command
    } else if lower.contains("diff") || lower.contains("stdout") || lower.contains("output") {
        BoundKind::Large
    } else if lower.contains("description") || lower.contains("body") || lower.contains("prompt") {
        BoundKind::Medium
    } else {
        BoundKind::Small
    }
}

/// Apply field-level bounds to a JSON payload in place.
///
/// Walks top-level object fields: strings are capped by inferred kind,
/// arrays by element count (string arrays at 400, record arrays at 200).
/// When the bounded payload still serializes above 512 KiB, large string
/// fields are degraded to previews until it fits.
pub fn bound_payload(payload: &mut Value) -> Vec<TruncationNote> {
    let mut notes = Vec::new();

    if let Value::Object(map) = payload {
        for (field, value) in map.iter_mut() {
            match value {
                Value::String(s) => {
                    let kind = kind_for_field(field);
                    let (bounded, cut) = truncate_utf8(s, kind.limit());
                    if cut {
                        notes.push(TruncationNote {
                            field: field.clone(),
                            kind,
                            original: s.len(),
                            max: kind.limit(),
                        });
                        *s = bounded;
                    }
                }
                Value::Array(items) => {
                    let records = items.iter().any(|i| i.is_object());
                    let kind = if records {
                        BoundKind::ListRecords
                    } else {
                        BoundKind::ListStrings
                    };
                    if items.len() > kind.limit() {
                        notes.push(TruncationNote {
                            field: field.clone(),
                            kind,
                            original: items.len(),
                            max: kind.limit(),
                        });
                        items.truncate(kind.limit());
                    }
                    // Bound string elements at the small cap.
                    for item in items.iter_mut() {
                        if let Value::String(s) = item {
                            let (bounded, cut) = truncate_utf8(s, MAX_SMALL_BYTES);
                            if cut {
                                *s = bounded;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    // Whole-payload cap: shrink the biggest string fields to previews.
    let mut serialized = payload.to_string().len();
    if serialized > MAX_EVENT_PAYLOAD_BYTES {
        if let Value::Object(map) = payload {
            let mut fields: Vec<(String, usize)> = map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.len())))
                .collect();
            fields.sort_by(|a, b| b.1.cmp(&a.1));

            for (field, original) in fields {
                if serialized <= MAX_EVENT_PAYLOAD_BYTES {
                    break;
                }
                if let Some(Value::String(s)) = map.get_mut(&field) {
                    let (preview, cut) = truncate_utf8(s, 1024);
                    if cut {
                        serialized -= s.len() - preview.len();
                        *s = preview;
                        notes.push(TruncationNote {
                            field,
                            kind: BoundKind::Payload,
                            original,
                            max: 1024,
                        });
                    }
                }
            }
        }
    }

    if !notes.is_empty() {
        if let Value::Object(map) = payload {
            map.insert("_payload_truncated".to_string(), json!(true));
            map.insert(
                "_payload_truncations".to_string(),
                serde_json::to_value(&notes).unwrap_or(Value::Null),
            );
        }
    }

    notes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_utf8_char_boundary() {
        let s = "héllo wörld";
        let (out, cut) = truncate_utf8(s, 2);
        assert!(cut);
        assert_eq!(out, "h"); // 'é' is two bytes, boundary backs off
    }

    #[test]
    fn test_small_payload_untouched() {
        let mut payload = json!({"title": "short", "files": ["a.rs"]});
        let notes = bound_payload(&mut payload);
        assert!(notes.is_empty());
        assert!(payload.get("_payload_truncated").is_none());
    }

    #[test]
    fn test_large_field_truncated_with_metadata() {
        let big = "x".repeat(MAX_LARGE_BYTES + 100);
        let mut payload = json!({"diff": big});
        let notes = bound_payload(&mut payload);

        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, BoundKind::Large);
        assert_eq!(payload["_payload_truncated"], json!(true));
        assert_eq!(payload["diff"].as_str().unwrap().len(), MAX_LARGE_BYTES);
    }

    #[test]
    fn test_string_list_capped() {
        let items: Vec<String> = (0..500).map(|i| format!("file-{i}")).collect();
        let mut payload = json!({"changed_files": items});
        let notes = bound_payload(&mut payload);

        assert_eq!(notes[0].kind, BoundKind::ListStrings);
        assert_eq!(
            payload["changed_files"].as_array().unwrap().len(),
            MAX_LIST_STRINGS
        );
    }

    #[test]
    fn test_command_field_kind() {
        let big = "y".repeat(MAX_COMMAND_BYTES + 1);
        let mut payload = json!({"command": big});
        let notes = bound_payload(&mut payload);
        assert_eq!(notes[0].kind, BoundKind::Command);
    }
}
