use serde::{Deserialize, Serialize};

/// 1-based source position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Line number.
    pub line: u32,
    /// Column number.
    pub col: u32,
}

/// S-expression node kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ExprKind {
    /// A bare symbol, possibly dotted (`ak.sleep`).
    Symbol(String),
    /// Keyword tokens (leading colon).
    Keyword(String),
    /// String literal.
    String(String),
    /// Signed integer literal.
    Integer(i64),
    /// Floating-point literal.
    Float(f64),
    /// Boolean literal.
    Boolean(bool),
    /// `nil`.
    Nil,
    /// Parenthesized form.
    List(Vec<Expr>),
    /// Bracketed list literal.
    Vector(Vec<Expr>),
    /// Braced dict literal, alternating keys and values.
    Map(Vec<Expr>),
}

/// An expression together with the position it was parsed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    /// Node.
    pub kind: ExprKind,
    /// Position of the first character.
    pub span: Span,
}

impl Expr {
    /// Construct a node.
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Symbol name, if this is a symbol.
    pub fn as_symbol(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Symbol(sym) => Some(sym),
            _ => None,
        }
    }

    /// Items of a parenthesized form.
    pub fn as_list(&self) -> Option<&[Expr]> {
        match &self.kind {
            ExprKind::List(items) => Some(items),
            _ => None,
        }
    }

    /// Head symbol of a parenthesized form.
    pub fn head(&self) -> Option<&str> {
        self.as_list()?.first()?.as_symbol()
    }
}

/// A `load` declaration at the top of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadDecl {
    /// Module path.
    pub path: String,
    /// Names imported from the module's bindings.
    pub names: Vec<String>,
    /// Name the whole module is bound to (`:as`).
    pub alias: Option<String>,
    /// Position of the declaration.
    pub span: Span,
}

/// Output of compilation, stored in [`crate::lang::Module::compiled`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledProgram {
    /// Source path.
    pub path: String,
    /// Load declarations in source order.
    pub loads: Vec<LoadDecl>,
    /// Remaining top-level forms.
    pub forms: Vec<Expr>,
}
