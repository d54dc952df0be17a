//! Small accessors over JSON objects carried in control messages.

use serde_json::Value;

/// A JSON object, as carried by control messages and `open` options.
pub type JsonObject = serde_json::Map<String, Value>;

/// String field, or `None` when absent, `null`, or of another type.
pub fn get_str<'a>(object: &'a JsonObject, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

/// String field that must have the right type when present.
pub fn typed_str<'a>(object: &'a JsonObject, key: &str) -> Result<Option<&'a str>, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(format!("attribute '{key}': must have type str")),
    }
}

/// Boolean field with a default.
pub fn get_bool(object: &JsonObject, key: &str, default: bool) -> bool {
    object.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Unsigned integer field.
pub fn get_u64(object: &JsonObject, key: &str) -> Option<u64> {
    object.get(key).and_then(Value::as_u64)
}

/// Nested object field.
pub fn get_object<'a>(object: &'a JsonObject, key: &str) -> Option<&'a JsonObject> {
    object.get(key).and_then(Value::as_object)
}
