//! Conversion between plain JSON documents and values.
//!
//! Unlike [`super::wire`], this mapping is lossy: it is used to ingest data
//! files and event payloads, and to render results for humans.

use super::{Value, ValueError, ValueResult};

/// Convert a plain JSON document into a value.
///
/// Objects become string-keyed dicts, whole numbers become integers.
pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(flag) => Value::Boolean(*flag),
        serde_json::Value::Number(num) => match num.as_i64() {
            Some(int) => Value::Integer(int),
            None => Value::Float(num.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(text) => Value::String(text.clone()),
        serde_json::Value::Array(items) => Value::List(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::dict(
            map.iter()
                .map(|(k, v)| (Value::String(k.clone()), from_json(v))),
        ),
    }
}

/// Convert a value into a plain JSON document.
///
/// Functions and builtins have no plain JSON form and yield
/// [`ValueError::UnknownType`].
pub fn to_json(value: &Value) -> ValueResult<serde_json::Value> {
    Ok(match value {
        Value::None => serde_json::Value::Null,
        Value::String(text) | Value::Symbol(text) => serde_json::Value::String(text.clone()),
        Value::Integer(num) => serde_json::Value::from(*num),
        Value::Boolean(flag) => serde_json::Value::Bool(*flag),
        Value::Float(num) => serde_json::Number::from_f64(*num)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Bytes(bytes) => {
            serde_json::Value::String(bytes.iter().map(|b| format!("{:02x}", b)).collect())
        }
        Value::Time(t) => serde_json::Value::String(t.to_rfc3339()),
        Value::Duration(d) => serde_json::Value::from(d.as_secs_f64()),
        Value::List(items) | Value::Set(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect::<ValueResult<_>>()?)
        }
        Value::Dict(items) => {
            let mut map = serde_json::Map::new();
            for item in items {
                let key = match &item.key {
                    Value::String(text) | Value::Symbol(text) => text.clone(),
                    other => other.to_string(),
                };
                map.insert(key, to_json(&item.value)?);
            }
            serde_json::Value::Object(map)
        }
        Value::Struct(s) => {
            let mut map = serde_json::Map::new();
            for (name, field) in &s.fields {
                map.insert(name.clone(), to_json(field)?);
            }
            serde_json::Value::Object(map)
        }
        Value::Module(m) => {
            let mut map = serde_json::Map::new();
            for (name, member) in &m.members {
                map.insert(name.clone(), to_json(member)?);
            }
            serde_json::Value::Object(map)
        }
        Value::Function(_) | Value::Builtin(_) => {
            return Err(ValueError::UnknownType(value.type_name().to_string()));
        }
    })
}
