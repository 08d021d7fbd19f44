//! Layer merging
//!
//! Each layer is a JSON document. Tables merge key by key, while arrays and
//! scalars from a later layer replace what came before. An explicit `null`
//! clears a value.

use serde_json::{Map, Value};

/// Overlay `layer` on top of `base`.
pub fn deep_merge(mut base: Value, layer: Value) -> Value {
    merge_into(&mut base, layer);
    base
}

fn merge_into(target: &mut Value, layer: Value) {
    match (target, layer) {
        (Value::Object(target_map), Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                match target_map.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        target_map.insert(key, value);
                    }
                }
            }
        }
        (target, layer) => *target = layer,
    }
}

/// Merge layers lowest precedence first.
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Convert a parsed TOML document into a JSON layer.
///
/// Datetimes become strings; non-finite floats become `null`.
pub fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
    }
}
