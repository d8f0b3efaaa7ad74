//! Typed deep-merge over YAML values.
//!
//! Used to layer wrapper config files: later files override or extend
//! earlier ones rather than replacing them wholesale.

use serde_yaml::Value;

/// Merge `overlay` into `base` and return the result.
///
/// Rules: scalars (and mismatched kinds) replace, mappings merge
/// recursively, sequences concatenate in file order.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => {
                        let previous = std::mem::replace(slot, Value::Null);
                        *slot = deep_merge(previous, value);
                    }
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
            Value::Mapping(base_map)
        }
        (Value::Sequence(mut base_seq), Value::Sequence(overlay_seq)) => {
            base_seq.extend(overlay_seq);
            Value::Sequence(base_seq)
        }
        (_, overlay) => overlay,
    }
}
