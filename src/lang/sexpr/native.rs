//! Native representation of interpreter values.
//!
//! Data values are evaluated directly as [`Value`]s. Closures cannot cross the
//! language boundary, so every closure is stored in a [`FunctionTable`] owned
//! by the language instance and represented outside by a [`Value::Function`]
//! carrying its [`FuncId`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::ast::{Expr, Span};
use crate::values::{FuncId, FunctionValue, Signature, Value, ValueError, ValueResult};

/// Lexical environment frame.
#[derive(Debug, Default)]
pub struct Frame {
    vars: Mutex<HashMap<String, Value>>,
    parent: Option<Arc<Frame>>,
}

impl Frame {
    /// A frame without a parent (module globals).
    pub fn root() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A nested frame.
    pub fn child(parent: &Arc<Frame>) -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    /// Look a name up through the frame chain.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.lock().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Whether a name is bound anywhere in the chain.
    pub fn contains(&self, name: &str) -> bool {
        self.vars.lock().contains_key(name)
            || self.parent.as_ref().is_some_and(|p| p.contains(name))
    }

    /// Bind a name in this frame.
    pub fn define(&self, name: &str, value: Value) {
        self.vars.lock().insert(name.to_string(), value);
    }

    /// Rebind the nearest existing binding; false if the name is unbound.
    pub fn set(&self, name: &str, value: Value) -> bool {
        {
            let mut vars = self.vars.lock();
            if let Some(slot) = vars.get_mut(name) {
                *slot = value;
                return true;
            }
        }
        match &self.parent {
            Some(parent) => parent.set(name, value),
            None => false,
        }
    }

    /// Snapshot of this frame's own bindings.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.vars
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A user-defined function.
#[derive(Debug)]
pub struct Closure {
    /// Name (`<lambda>` for anonymous functions).
    pub name: String,
    /// Parameter names.
    pub params: Vec<String>,
    /// Body forms.
    pub body: Vec<Expr>,
    /// Captured environment.
    pub env: Arc<Frame>,
    /// Defining module path.
    pub path: String,
    /// Definition position.
    pub span: Span,
}

/// Per-instance side table of closures keyed by function id.
#[derive(Debug)]
pub struct FunctionTable {
    lang: String,
    counter: u64,
    closures: HashMap<FuncId, Arc<Closure>>,
}

impl FunctionTable {
    /// Empty table for a language.
    pub fn new(lang: &str) -> Self {
        Self {
            lang: lang.to_string(),
            counter: 0,
            closures: HashMap::new(),
        }
    }

    /// Store a closure and return its value representation.
    ///
    /// Ids are derived from the scope and allocation order, so replaying the
    /// same execution in a fresh instance reproduces the same ids.
    pub fn insert(&mut self, scope: &str, closure: Closure) -> Value {
        let func_id = FuncId::derive(&self.lang, scope, self.counter);
        self.counter += 1;
        let value = FunctionValue {
            lang: self.lang.clone(),
            func_id: func_id.clone(),
            scope: scope.to_string(),
            name: closure.name.clone(),
            signature: Signature {
                params: closure.params.clone(),
            },
        };
        self.closures.insert(func_id, Arc::new(closure));
        Value::Function(value)
    }

    /// Retrieve the closure behind a function value.
    pub fn lookup(&self, scope: &str, func: &FunctionValue) -> ValueResult<Arc<Closure>> {
        if func.lang != self.lang {
            return Err(ValueError::LangMismatch {
                expected: self.lang.clone(),
                actual: func.lang.clone(),
            });
        }
        if func.scope != scope {
            return Err(ValueError::ScopeMismatch {
                expected: scope.to_string(),
                actual: func.scope.clone(),
            });
        }
        self.closures
            .get(&func.func_id)
            .cloned()
            .ok_or_else(|| ValueError::UnknownFunction(func.func_id.clone()))
    }

    /// Number of stored closures.
    pub fn len(&self) -> usize {
        self.closures.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.closures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closure(name: &str) -> Closure {
        Closure {
            name: name.into(),
            params: vec!["x".into()],
            body: Vec::new(),
            env: Frame::root(),
            path: "main.sx".into(),
            span: Span::default(),
        }
    }

    #[test]
    fn closures_round_trip_within_scope() {
        let mut table = FunctionTable::new("sexpr");
        let value = table.insert("s1", closure("f"));
        let Value::Function(func) = &value else {
            panic!("expected function value");
        };
        assert_eq!(func.signature.params, vec!["x".to_string()]);
        assert_eq!(table.lookup("s1", func).unwrap().name, "f");
    }

    #[test]
    fn mismatched_scope_and_lang_fail() {
        let mut table = FunctionTable::new("sexpr");
        let Value::Function(func) = table.insert("s1", closure("f")) else {
            panic!("expected function value");
        };
        assert!(matches!(
            table.lookup("s2", &func),
            Err(ValueError::ScopeMismatch { .. })
        ));

        let mut foreign = func.clone();
        foreign.lang = "other".into();
        assert!(matches!(
            table.lookup("s1", &foreign),
            Err(ValueError::LangMismatch { .. })
        ));

        let mut unknown = func;
        unknown.func_id = FuncId("fn_missing".into());
        assert!(matches!(
            table.lookup("s1", &unknown),
            Err(ValueError::UnknownFunction(_))
        ));
    }

    #[test]
    fn ids_repeat_in_fresh_tables() {
        let mut first = FunctionTable::new("sexpr");
        let mut second = FunctionTable::new("sexpr");
        let a = first.insert("s", closure("f"));
        let b = second.insert("s", closure("f"));
        assert_eq!(a.callable_id(), b.callable_id());
    }

    #[test]
    fn set_rebinds_nearest_frame() {
        let root = Frame::root();
        root.define("x", Value::Integer(1));
        let child = Frame::child(&root);
        assert!(child.set("x", Value::Integer(2)));
        assert_eq!(root.get("x"), Some(Value::Integer(2)));
        assert!(!child.set("y", Value::None));
    }
}
