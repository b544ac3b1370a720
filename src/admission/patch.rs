//! RFC-6901 pointer construction and RFC-6902 `add`-only patch helpers.
//! The admission webhook never emits `remove`/`replace`: idempotent
//! re-invocation relies on only ever adding missing keys (§4.D, §9).

use json_patch::{AddOperation, PatchOperation};
use serde_json::Value;

/// Escapes a single JSON-pointer path segment per RFC 6901.
pub fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Builds a `/`-joined, RFC-6901-escaped JSON pointer from path segments.
pub fn pointer(segments: &[&str]) -> String {
    let mut p = String::new();
    for segment in segments {
        p.push('/');
        p.push_str(&escape_segment(segment));
    }
    p
}

pub fn add(path: String, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}
