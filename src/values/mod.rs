//! Tagged-union values that cross the language boundary.
//!
//! Every datum exchanged between an embedded language, the run state machine,
//! the session layer and the remote protocol is a [`Value`]. Values are
//! immutable once constructed and compare structurally, with the exception of
//! [`FunctionValue`] whose identity is its [`FuncId`].

pub mod json;
pub mod wire;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while converting values between representations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValueError {
    /// A native value has no [`Value`] counterpart.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A function value belongs to another scope.
    #[error("scope mismatch: function belongs to '{actual}', expected '{expected}'")]
    ScopeMismatch {
        /// Scope of the converting instance.
        expected: String,
        /// Scope recorded in the function value.
        actual: String,
    },

    /// A function value belongs to another language.
    #[error("lang mismatch: function belongs to '{actual}', expected '{expected}'")]
    LangMismatch {
        /// Language of the converting instance.
        expected: String,
        /// Language recorded in the function value.
        actual: String,
    },

    /// The function id is not known to the converting instance.
    #[error("unknown function: {0}")]
    UnknownFunction(FuncId),

    /// Wire decoding failed.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Wire encoding failed.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Convenience result alias for value conversions.
pub type ValueResult<T> = std::result::Result<T, ValueError>;

/// Keyword arguments of a call.
pub type Kwargs = BTreeMap<String, Value>;

/// Identifier of a named capability bundle (a module of callables).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutorId(pub String);

impl ExecutorId {
    /// Create a new executor id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a language function value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub String);

impl FuncId {
    /// Derive a function id from the owning language, scope and a per-instance counter.
    ///
    /// The derivation is deterministic so that a replayed interpreter hands out
    /// the same ids in the same order.
    pub fn derive(lang: &str, scope: &str, counter: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(lang.as_bytes());
        hasher.update(&[0]);
        hasher.update(scope.as_bytes());
        hasher.update(&[0]);
        hasher.update(&counter.to_le_bytes());
        let digest = hasher.finalize();
        Self(format!("fn_{}", &digest.to_hex()[..24]))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signature metadata attached to a function value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Positional parameter names, in order.
    pub params: Vec<String>,
}

/// A function defined inside an embedded language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionValue {
    /// Language that owns the function.
    pub lang: String,
    /// Unique id used to retrieve the native closure.
    pub func_id: FuncId,
    /// Scope in which the function was defined.
    pub scope: String,
    /// Human-readable name.
    pub name: String,
    /// Parameter metadata.
    pub signature: Signature,
}

impl PartialEq for FunctionValue {
    fn eq(&self, other: &Self) -> bool {
        self.func_id == other.func_id
    }
}

/// Capability flags carried by a [`CallValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallFlag {
    /// No side effects that require durability; may run inline.
    Pure,
    /// Needs direct access to workflow context (syscalls).
    Privileged,
}

/// An external callable issued by an executor module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallValue {
    /// Unique id (stable across replays).
    pub unique_id: String,
    /// Executor module that issued the callable.
    pub executor: ExecutorId,
    /// Function name within the executor.
    pub name: String,
    /// Capability flags.
    pub flags: BTreeSet<CallFlag>,
}

impl CallValue {
    /// Create a callable for `executor.name` with the given flags.
    pub fn new(executor: &ExecutorId, name: &str, flags: &[CallFlag]) -> Self {
        Self {
            unique_id: format!("{}.{}", executor, name),
            executor: executor.clone(),
            name: name.to_string(),
            flags: flags.iter().copied().collect(),
        }
    }

    /// Check a capability flag.
    pub fn has_flag(&self, flag: CallFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Key/value entry of an ordered dict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictItem {
    /// Entry key.
    pub key: Value,
    /// Entry value.
    pub value: Value,
}

/// Struct value: constructor plus named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructValue {
    /// Constructor (usually a symbol naming the struct kind).
    pub ctor: Box<Value>,
    /// Named fields.
    pub fields: BTreeMap<String, Value>,
}

/// Module value: name plus named members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleValue {
    /// Module name.
    pub name: String,
    /// Exported members.
    pub members: BTreeMap<String, Value>,
}

/// Closed tagged union of everything that crosses the language boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "v", rename_all = "snake_case")]
pub enum Value {
    /// Absence of a value.
    #[default]
    None,
    /// UTF-8 string.
    String(String),
    /// Symbol.
    Symbol(String),
    /// Signed integer (all integer widths collapse here).
    Integer(i64),
    /// Boolean.
    Boolean(bool),
    /// Floating point number.
    Float(f64),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Point in time.
    Time(DateTime<Utc>),
    /// Duration.
    Duration(Duration),
    /// Ordered list.
    List(Vec<Value>),
    /// Set (insertion ordered, no duplicates).
    Set(Vec<Value>),
    /// Ordered dict with value equality on keys.
    Dict(Vec<DictItem>),
    /// Struct.
    Struct(StructValue),
    /// Module.
    Module(ModuleValue),
    /// Language function.
    Function(FunctionValue),
    /// External callable.
    Builtin(CallValue),
}

impl Value {
    /// Build a set, dropping duplicates while keeping first-seen order.
    pub fn set(items: impl IntoIterator<Item = Value>) -> Value {
        let mut out: Vec<Value> = Vec::new();
        for item in items {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        Value::Set(out)
    }

    /// Build a dict; a repeated key keeps its first position and takes the last value.
    pub fn dict(items: impl IntoIterator<Item = (Value, Value)>) -> Value {
        let mut out: Vec<DictItem> = Vec::new();
        for (key, value) in items {
            match out.iter_mut().find(|item| item.key == key) {
                Some(existing) => existing.value = value,
                None => out.push(DictItem { key, value }),
            }
        }
        Value::Dict(out)
    }

    /// Build a dict keyed by strings.
    pub fn string_dict(items: impl IntoIterator<Item = (String, Value)>) -> Value {
        Value::dict(items.into_iter().map(|(k, v)| (Value::String(k), v)))
    }

    /// Build a module value.
    pub fn module(name: impl Into<String>, members: BTreeMap<String, Value>) -> Value {
        Value::Module(ModuleValue {
            name: name.into(),
            members,
        })
    }

    /// Build a struct value with a symbolic constructor.
    pub fn structure(ctor: impl Into<String>, fields: BTreeMap<String, Value>) -> Value {
        Value::Struct(StructValue {
            ctor: Box::new(Value::Symbol(ctor.into())),
            fields,
        })
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Integer(_) => "integer",
            Value::Boolean(_) => "boolean",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Time(_) => "time",
            Value::Duration(_) => "duration",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Struct(_) => "struct",
            Value::Module(_) => "module",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin",
        }
    }

    /// Whether this is [`Value::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Convenience accessor for string references.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) | Value::Symbol(text) => Some(text),
            _ => None,
        }
    }

    /// Convenience accessor for integers.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(num) => Some(*num),
            _ => None,
        }
    }

    /// Convenience accessor for durations; integers and floats are read as seconds.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Value::Duration(d) => Some(*d),
            Value::Integer(secs) if *secs >= 0 => Some(Duration::from_secs(*secs as u64)),
            Value::Float(secs) => Duration::try_from_secs_f64(*secs).ok(),
            _ => None,
        }
    }

    /// Look up a dict entry by key.
    pub fn dict_get(&self, key: &Value) -> Option<&Value> {
        match self {
            Value::Dict(items) => items
                .iter()
                .find(|item| &item.key == key)
                .map(|item| &item.value),
            _ => None,
        }
    }

    /// Look up a member of a module, struct field or string-keyed dict entry.
    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Module(module) => module.members.get(name),
            Value::Struct(s) => s.fields.get(name),
            Value::Dict(items) => items
                .iter()
                .find(|item| item.key.as_str() == Some(name))
                .map(|item| &item.value),
            _ => None,
        }
    }

    /// Unique id of a callable value (function or builtin).
    pub fn callable_id(&self) -> Option<&str> {
        match self {
            Value::Function(f) => Some(f.func_id.as_str()),
            Value::Builtin(c) => Some(&c.unique_id),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::String(text) => write!(f, "{}", text),
            Value::Symbol(sym) => write!(f, "{}", sym),
            Value::Integer(num) => write!(f, "{}", num),
            Value::Boolean(flag) => write!(f, "{}", flag),
            Value::Float(num) => write!(f, "{}", num),
            Value::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Duration(d) => write!(f, "{:?}", d),
            Value::List(items) | Value::Set(items) => {
                let open = if matches!(self, Value::Set(_)) { "#{" } else { "[" };
                let close = if matches!(self, Value::Set(_)) { "}" } else { "]" };
                write!(f, "{}", open)?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "{}", close)
            }
            Value::Dict(items) => {
                write!(f, "{{")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", item.key, item.value)?;
                }
                write!(f, "}}")
            }
            Value::Struct(s) => {
                write!(f, "{}(", s.ctor)?;
                for (idx, (name, value)) in s.fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", name, value)?;
                }
                write!(f, ")")
            }
            Value::Module(m) => write!(f, "<module {}>", m.name),
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Builtin(call) => write!(f, "<builtin {}>", call.unique_id),
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::String(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::String(text)
    }
}

impl From<i64> for Value {
    fn from(num: i64) -> Self {
        Value::Integer(num)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Boolean(flag)
    }
}

impl From<f64> for Value {
    fn from(num: f64) -> Self {
        Value::Float(num)
    }
}

impl From<Duration> for Value {
    fn from(d: Duration) -> Self {
        Value::Duration(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
