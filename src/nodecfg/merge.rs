//! JSON object merge/diff primitives for layered node configs.
//!
//! Merge is a recursive object merge; scalars and arrays replace. The
//! canonical serialization (serde_json's sorted object keys) is what the
//! config MD5 is computed over, so controller and minion agree on the hash
//! for identical content regardless of layer insertion order.

use serde_json::{Map, Value};

/// Deep-merge `overlay` into `base`. Objects merge recursively; any other
/// value (including arrays) replaces. `null` in the overlay removes the key.
pub fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                if overlay_val.is_null() {
                    base_map.remove(key);
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(base_val) if base_val.is_object() && overlay_val.is_object() => {
                        merge(base_val, overlay_val);
                    }
                    _ => {
                        base_map.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base_slot, overlay_val) => {
            *base_slot = overlay_val.clone();
        }
    }
}

/// Merge a sequence of layers (later wins) into one effective config.
pub fn merge_layers<'a>(layers: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut out = Value::Object(Map::new());
    for layer in layers {
        merge(&mut out, layer);
    }
    out
}

/// Full difference between two configs: every leaf that changed or was
/// removed. Changed leaves carry the new value; removed leaves carry `null`.
pub fn full_difference(old: &Value, new: &Value) -> Value {
    fn diff_objects(old: &Map<String, Value>, new: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, new_val) in new {
            match old.get(key) {
                Some(old_val) if old_val == new_val => {}
                Some(Value::Object(old_obj)) => {
                    if let Value::Object(new_obj) = new_val {
                        let nested = diff_objects(old_obj, new_obj);
                        if !nested.is_empty() {
                            out.insert(key.clone(), Value::Object(nested));
                        }
                    } else {
                        out.insert(key.clone(), new_val.clone());
                    }
                }
                _ => {
                    out.insert(key.clone(), new_val.clone());
                }
            }
        }
        for key in old.keys() {
            if !new.contains_key(key) {
                out.insert(key.clone(), Value::Null);
            }
        }
        out
    }

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            Value::Object(diff_objects(old_map, new_map))
        }
        (o, n) if o == n => Value::Object(Map::new()),
        (_, n) => n.clone(),
    }
}

/// Flatten a nested diff into dotted leaf paths.
pub fn flatten_keys(diff: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    fn walk(prefix: &str, value: &Value, out: &mut Vec<String>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (k, v) in map {
                    let path = if prefix.is_empty() {
                        k.clone()
                    } else {
                        format!("{}.{}", prefix, k)
                    };
                    walk(&path, v, out);
                }
            }
            _ => {
                if !prefix.is_empty() {
                    out.push(prefix.to_string());
                }
            }
        }
    }
    walk("", diff, &mut keys);
    keys
}

/// Canonical JSON serialization used for hashing (sorted object keys).
pub fn canonical_json(value: &Value) -> String {
    // serde_json's default map is ordered, so plain serialization is
    // already canonical for any value built through this module.
    value.to_string()
}

/// MD5 hex digest of a config's canonical serialization.
pub fn config_md5(value: &Value) -> String {
    hex::encode(md5::compute(canonical_json(value)).0)
}

/// Look up a dotted path inside a JSON value.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = value;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}
