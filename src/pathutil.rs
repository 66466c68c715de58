//! Shared dotted/indexed path navigation over `serde_json::Value`.
//!
//! Grounded on the old `extractors::navigate_json`/`split_path` helpers: splits
//! `"entry.seed_data.items[0].id"` into segments and walks a `Value` tree one
//! segment at a time. Both the templating engine (§4.1) and the extractor
//! (§4.2) need this; array slices are explicitly out of scope per the
//! specification, so only a single numeric index per segment is supported.

use serde_json::Value;

/// Splits a path into segments: `"items[0].id"` -> `["items", "[0]", "id"]`.
pub fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();

    for ch in path.chars() {
        match ch {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                current.push('[');
            }
            ']' => {
                current.push(']');
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Strips a leading `$.` or `$` root marker, as used in JSONPath-like paths.
pub fn strip_root_marker(path: &str) -> &str {
    path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path)
}

/// Walks `root` through `segments`, returning `None` on any missing field,
/// out-of-range index, or index applied to a non-array.
pub fn navigate<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        if let Some(idx_str) = segment.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let idx: usize = idx_str.parse().ok()?;
            current = current.as_array()?.get(idx)?;
        } else {
            current = current.as_object()?.get(segment.as_str())?;
        }
    }
    Some(current)
}

/// Convenience: navigate a `$.`-prefixed or bare dotted/indexed path.
pub fn navigate_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let stripped = strip_root_marker(path);
    let segments = split_path(stripped);
    navigate(root, &segments)
}
