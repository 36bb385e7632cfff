//! Pure builtin operators.
//!
//! `print` and `fail` need the interpreter and are dispatched there; every
//! other builtin is a pure function of its arguments.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::values::{Kwargs, Value};

type BuiltinResult = std::result::Result<Value, String>;

/// Builtin names, including the interpreter-level `print` and `fail`.
pub const NAMES: &[&str] = &[
    "+", "-", "*", "/", "%", "=", "!=", "<", "<=", ">", ">=", "not", "list", "dict", "set",
    "struct", "get", "len", "str", "int", "float", "type", "keys", "values", "contains", "append",
    "range", "ms", "seconds", "minutes", "hours", "print", "fail",
];

/// Whether a name is a builtin.
pub fn is_builtin(name: &str) -> bool {
    NAMES.contains(&name)
}

/// Starlark-style truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::None => false,
        Value::Boolean(flag) => *flag,
        Value::Integer(num) => *num != 0,
        Value::Float(num) => *num != 0.0,
        Value::String(text) => !text.is_empty(),
        Value::Bytes(bytes) => !bytes.is_empty(),
        Value::List(items) | Value::Set(items) => !items.is_empty(),
        Value::Dict(items) => !items.is_empty(),
        Value::Duration(d) => !d.is_zero(),
        _ => true,
    }
}

/// Render values the way `print` and `str` do.
pub fn render(args: &[Value]) -> String {
    args.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Apply a pure builtin.
pub fn call(name: &str, args: Vec<Value>, kwargs: Kwargs) -> BuiltinResult {
    if !kwargs.is_empty() && !matches!(name, "dict" | "struct") {
        return Err(format!("{} takes no keyword arguments", name));
    }
    match name {
        "+" => args.into_iter().try_fold(Value::Integer(0), add),
        "-" => match args.len() {
            0 => Err("- needs at least one argument".into()),
            1 => arith(Value::Integer(0), args[0].clone(), "-"),
            _ => fold(args, "-"),
        },
        "*" => args.into_iter().try_fold(Value::Integer(1), |acc, v| arith(acc, v, "*")),
        "/" | "%" => {
            if args.len() != 2 {
                return Err(format!("{} takes two arguments", name));
            }
            fold(args, name)
        }
        "=" => Ok(Value::Boolean(args.windows(2).all(|w| w[0] == w[1]))),
        "!=" => {
            let [a, b] = two(args, name)?;
            Ok(Value::Boolean(a != b))
        }
        "<" | "<=" | ">" | ">=" => {
            let mut ok = true;
            for pair in args.windows(2) {
                let ord = compare(&pair[0], &pair[1])?;
                ok &= match name {
                    "<" => ord.is_lt(),
                    "<=" => ord.is_le(),
                    ">" => ord.is_gt(),
                    _ => ord.is_ge(),
                };
            }
            Ok(Value::Boolean(ok))
        }
        "not" => {
            let [v] = one(args, name)?;
            Ok(Value::Boolean(!truthy(&v)))
        }
        "list" => Ok(Value::List(args)),
        "set" => Ok(Value::set(args)),
        "dict" => {
            if args.len() % 2 != 0 {
                return Err("dict takes alternating keys and values".into());
            }
            let mut pairs: Vec<(Value, Value)> = args
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            pairs.extend(kwargs.into_iter().map(|(k, v)| (Value::String(k), v)));
            Ok(Value::dict(pairs))
        }
        "struct" => {
            let ctor = match args.as_slice() {
                [] => "struct".to_string(),
                [Value::String(s) | Value::Symbol(s)] => s.clone(),
                _ => return Err("struct takes an optional name and keyword fields".into()),
            };
            Ok(Value::structure(ctor, kwargs.into_iter().collect::<BTreeMap<_, _>>()))
        }
        "get" => get(args),
        "len" => {
            let [v] = one(args, name)?;
            let len = match &v {
                Value::String(text) => text.chars().count(),
                Value::Bytes(bytes) => bytes.len(),
                Value::List(items) | Value::Set(items) => items.len(),
                Value::Dict(items) => items.len(),
                other => return Err(format!("len of {}", other.type_name())),
            };
            Ok(Value::Integer(len as i64))
        }
        "str" => Ok(Value::String(
            args.iter().map(|v| v.to_string()).collect::<String>(),
        )),
        "int" => {
            let [v] = one(args, name)?;
            match v {
                Value::Integer(num) => Ok(Value::Integer(num)),
                Value::Float(num) => Ok(Value::Integer(num as i64)),
                Value::Boolean(flag) => Ok(Value::Integer(flag as i64)),
                Value::String(text) => text
                    .trim()
                    .parse::<i64>()
                    .map(Value::Integer)
                    .map_err(|_| format!("invalid integer: {:?}", text)),
                other => Err(format!("cannot convert {} to int", other.type_name())),
            }
        }
        "float" => {
            let [v] = one(args, name)?;
            match v {
                Value::Integer(num) => Ok(Value::Float(num as f64)),
                Value::Float(num) => Ok(Value::Float(num)),
                Value::String(text) => text
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| format!("invalid float: {:?}", text)),
                other => Err(format!("cannot convert {} to float", other.type_name())),
            }
        }
        "type" => {
            let [v] = one(args, name)?;
            Ok(Value::String(v.type_name().to_string()))
        }
        "keys" | "values" => {
            let [v] = one(args, name)?;
            match v {
                Value::Dict(items) => Ok(Value::List(
                    items
                        .into_iter()
                        .map(|item| if name == "keys" { item.key } else { item.value })
                        .collect(),
                )),
                Value::Struct(s) if name == "keys" => Ok(Value::List(
                    s.fields.into_keys().map(Value::String).collect(),
                )),
                other => Err(format!("{} of {}", name, other.type_name())),
            }
        }
        "contains" => {
            let [coll, needle] = two(args, name)?;
            let found = match &coll {
                Value::List(items) | Value::Set(items) => items.contains(&needle),
                Value::Dict(_) => coll.dict_get(&needle).is_some(),
                Value::String(text) => match &needle {
                    Value::String(sub) => text.contains(sub.as_str()),
                    _ => false,
                },
                other => return Err(format!("contains on {}", other.type_name())),
            };
            Ok(Value::Boolean(found))
        }
        "append" => {
            let mut iter = args.into_iter();
            match iter.next() {
                Some(Value::List(mut items)) => {
                    items.extend(iter);
                    Ok(Value::List(items))
                }
                Some(other) => Err(format!("append to {}", other.type_name())),
                None => Err("append needs a list".into()),
            }
        }
        "range" => {
            let (start, end) = match args.as_slice() {
                [Value::Integer(end)] => (0, *end),
                [Value::Integer(start), Value::Integer(end)] => (*start, *end),
                _ => return Err("range takes one or two integers".into()),
            };
            Ok(Value::List((start..end).map(Value::Integer).collect()))
        }
        "ms" | "seconds" | "minutes" | "hours" => {
            let [v] = one(args, name)?;
            let amount = match v {
                Value::Integer(num) if num >= 0 => num as f64,
                Value::Float(num) if num >= 0.0 && num.is_finite() => num,
                other => return Err(format!("{} of {}", name, other)),
            };
            let secs = match name {
                "ms" => amount / 1000.0,
                "seconds" => amount,
                "minutes" => amount * 60.0,
                _ => amount * 3600.0,
            };
            Duration::try_from_secs_f64(secs)
                .map(Value::Duration)
                .map_err(|_| format!("{} of {} is out of range", name, amount))
        }
        other => Err(format!("unknown builtin: {}", other)),
    }
}

fn one(args: Vec<Value>, name: &str) -> std::result::Result<[Value; 1], String> {
    <[Value; 1]>::try_from(args).map_err(|_| format!("{} takes one argument", name))
}

fn two(args: Vec<Value>, name: &str) -> std::result::Result<[Value; 2], String> {
    <[Value; 2]>::try_from(args).map_err(|_| format!("{} takes two arguments", name))
}

fn fold(args: Vec<Value>, op: &str) -> BuiltinResult {
    let mut iter = args.into_iter();
    let first = iter.next().unwrap_or(Value::Integer(0));
    iter.try_fold(first, |acc, v| arith(acc, v, op))
}

fn add(a: Value, b: Value) -> BuiltinResult {
    match (a, b) {
        (Value::String(mut x), Value::String(y)) => {
            x.push_str(&y);
            Ok(Value::String(x))
        }
        (Value::List(mut x), Value::List(y)) => {
            x.extend(y);
            Ok(Value::List(x))
        }
        (
            Value::Integer(0),
            other @ (Value::String(_) | Value::List(_) | Value::Duration(_) | Value::Time(_)),
        ) => Ok(other),
        (Value::Duration(x), Value::Duration(y)) => x
            .checked_add(y)
            .map(Value::Duration)
            .ok_or_else(|| "duration overflow in +".to_string()),
        (Value::Time(t), Value::Duration(d)) => chrono::Duration::from_std(d)
            .map(|d| Value::Time(t + d))
            .map_err(|e| e.to_string()),
        (a, b) => arith(a, b, "+"),
    }
}

fn scale(d: Duration, n: i64) -> BuiltinResult {
    u32::try_from(n)
        .ok()
        .and_then(|n| d.checked_mul(n))
        .map(Value::Duration)
        .ok_or_else(|| "duration overflow in *".to_string())
}

fn arith(a: Value, b: Value, op: &str) -> BuiltinResult {
    match (&a, &b) {
        (Value::Integer(x), Value::Integer(y)) => {
            let (x, y) = (*x, *y);
            let result = match op {
                "+" => x.checked_add(y),
                "-" => x.checked_sub(y),
                "*" => x.checked_mul(y),
                "/" if y == 0 => return Err("division by zero".into()),
                "/" => x.checked_div(y),
                "%" if y == 0 => return Err("division by zero".into()),
                _ => x.checked_rem(y),
            };
            result
                .map(Value::Integer)
                .ok_or_else(|| format!("integer overflow in {}", op))
        }
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            let x = as_f64(&a);
            let y = as_f64(&b);
            Ok(Value::Float(match op {
                "+" => x + y,
                "-" => x - y,
                "*" => x * y,
                "/" if y == 0.0 => return Err("division by zero".into()),
                "/" => x / y,
                _ => x % y,
            }))
        }
        (Value::Duration(d), Value::Integer(n)) | (Value::Integer(n), Value::Duration(d))
            if op == "*" && *n >= 0 =>
        {
            scale(*d, *n)
        }
        (Value::Duration(x), Value::Duration(y)) if op == "-" => {
            Ok(Value::Duration(x.saturating_sub(*y)))
        }
        _ => Err(format!(
            "unsupported operands for {}: {} and {}",
            op,
            a.type_name(),
            b.type_name()
        )),
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Integer(num) => *num as f64,
        Value::Float(num) => *num,
        _ => f64::NAN,
    }
}

fn compare(a: &Value, b: &Value) -> std::result::Result<std::cmp::Ordering, String> {
    let ord = match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            as_f64(a).partial_cmp(&as_f64(b))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Duration(x), Value::Duration(y)) => Some(x.cmp(y)),
        (Value::Time(x), Value::Time(y)) => Some(x.cmp(y)),
        _ => None,
    };
    ord.ok_or_else(|| format!("cannot compare {} and {}", a.type_name(), b.type_name()))
}

fn get(args: Vec<Value>) -> BuiltinResult {
    let (coll, key, default) = match <[Value; 3]>::try_from(args) {
        Ok([c, k, d]) => (c, k, Some(d)),
        Err(args) => {
            let [c, k] = two(args, "get")?;
            (c, k, None)
        }
    };
    let found = match (&coll, &key) {
        (Value::List(items), Value::Integer(idx)) => {
            let idx = if *idx < 0 { items.len() as i64 + idx } else { *idx };
            usize::try_from(idx).ok().and_then(|i| items.get(i)).cloned()
        }
        (Value::Dict(_), _) => coll.dict_get(&key).cloned(),
        (Value::Module(_) | Value::Struct(_), Value::String(name) | Value::Symbol(name)) => {
            coll.member(name).cloned()
        }
        _ => {
            return Err(format!(
                "cannot index {} with {}",
                coll.type_name(),
                key.type_name()
            ));
        }
    };
    match (found, default) {
        (Some(v), _) => Ok(v),
        (None, Some(d)) => Ok(d),
        (None, None) => Err(format!("key not found: {}", key)),
    }
}
