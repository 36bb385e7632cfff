//! Wire representation of values.
//!
//! Values travel as self-describing JSON documents (`{"type": ..., "v": ...}`)
//! both in the remote language protocol and in persisted call records.

use super::{Value, ValueError, ValueResult};

/// Encode a value into its wire bytes.
pub fn encode(value: &Value) -> ValueResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ValueError::Encode(e.to_string()))
}

/// Decode a value from wire bytes.
pub fn decode(bytes: &[u8]) -> ValueResult<Value> {
    serde_json::from_slice(bytes).map_err(|e| ValueError::Decode(e.to_string()))
}

/// Encode a value into a wire JSON tree (for embedding in larger documents).
pub fn to_wire(value: &Value) -> ValueResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| ValueError::Encode(e.to_string()))
}

/// Decode a value from a wire JSON tree.
pub fn from_wire(json: serde_json::Value) -> ValueResult<Value> {
    serde_json::from_value(json).map_err(|e| ValueError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::{CallFlag, CallValue, ExecutorId};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::None),
            any::<String>().prop_map(Value::String),
            "[a-z][a-z0-9_]{0,8}".prop_map(Value::Symbol),
            any::<i64>().prop_map(Value::Integer),
            any::<bool>().prop_map(Value::Boolean),
            (-1_000_000i32..1_000_000).prop_map(|n| Value::Float(f64::from(n) / 4.0)),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
            (0u64..1_000_000, 0u32..1_000_000_000)
                .prop_map(|(s, n)| Value::Duration(Duration::new(s, n))),
        ]
    }

    fn value() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::set),
                proptest::collection::vec(("[a-z]{1,4}", inner.clone()), 0..4).prop_map(
                    |items| Value::dict(items.into_iter().map(|(k, v)| (Value::String(k), v)))
                ),
                proptest::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|fields| Value::structure("point", fields)),
            ]
        })
    }

    proptest! {
        #[test]
        fn wire_round_trip(v in value()) {
            let bytes = encode(&v).unwrap();
            let back = decode(&bytes).unwrap();
            prop_assert_eq!(back, v);
        }
    }

    #[test]
    fn builtin_and_module_round_trip() {
        let exec = ExecutorId::new("http");
        let call = Value::Builtin(CallValue::new(&exec, "get", &[CallFlag::Pure]));
        let mut members = BTreeMap::new();
        members.insert("get".to_string(), call);
        let module = Value::module("http", members);
        assert_eq!(decode(&encode(&module).unwrap()).unwrap(), module);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(decode(b"{\"type\":\"nope\"}"), Err(ValueError::Decode(_))));
    }
}
