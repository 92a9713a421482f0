//! Configuration-file composition
//!
//! Command-line configuration is assembled from a base file (`-c`) and
//! any number of overlay objects (`-D`), composed merge-on-top: the
//! rightmost binding for a variable wins. Only top-level keys merge;
//! values are replaced wholesale.

use serde_json::Value as Json;

/// Merge `overlay` on top of `base`. Both must be JSON objects; any
/// other shape makes the overlay win entirely.
pub fn merge_on_top(base: &Json, overlay: &Json) -> Json {
    match (base.as_object(), overlay.as_object()) {
        (Some(base_map), Some(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                merged.insert(key.clone(), value.clone());
            }
            Json::Object(merged)
        }
        _ => overlay.clone(),
    }
}
