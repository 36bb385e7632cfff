//! Static checks run at compile time.
//!
//! Splits `load` declarations off the top level and verifies that every
//! symbol refers to a local, a global, a predeclared name, or a builtin.

use std::collections::BTreeSet;

use super::ast::{CompiledProgram, Expr, ExprKind, LoadDecl, Span};
use super::builtins;
use crate::lang::{CallFrame, Phase, ProgramError, ProgramErrorKind};

type ResolveResult<T> = std::result::Result<T, ProgramError>;

/// Special form heads.
pub const SPECIAL_FORMS: &[&str] = &[
    "load", "def", "defn", "fn", "if", "when", "let", "do", "and", "or", "for", "set!",
];

/// Root of a possibly dotted symbol (`ak.sleep` → `ak`).
pub fn root_name(sym: &str) -> &str {
    match sym.find('.') {
        Some(0) | None => sym,
        Some(idx) => &sym[..idx],
    }
}

/// Split loads from the remaining forms and resolve every symbol.
pub fn resolve(
    path: &str,
    forms: Vec<Expr>,
    predecls: &[String],
) -> ResolveResult<CompiledProgram> {
    let resolver = Resolver { path };
    let mut loads = Vec::new();
    let mut body = Vec::new();
    let mut globals: BTreeSet<String> = predecls.iter().cloned().collect();

    for form in forms {
        if form.head() == Some("load") {
            let decl = resolver.load_decl(&form)?;
            globals.extend(decl.names.iter().cloned());
            globals.extend(decl.alias.iter().cloned());
            loads.push(decl);
            continue;
        }
        if let Some(items) = form.as_list() {
            match (form.head(), items.get(1)) {
                (Some("def" | "defn"), Some(name)) => {
                    let name = resolver.binding_name(name)?;
                    globals.insert(name.to_string());
                }
                _ => {}
            }
        }
        body.push(form);
    }

    for form in &body {
        let mut locals = Vec::new();
        resolver.expr(form, &globals, &mut locals, "<toplevel>", true)?;
    }

    Ok(CompiledProgram {
        path: path.to_string(),
        loads,
        forms: body,
    })
}

struct Resolver<'a> {
    path: &'a str,
}

impl Resolver<'_> {
    fn error(
        &self,
        span: Span,
        func: &str,
        kind: ProgramErrorKind,
        message: String,
    ) -> ProgramError {
        ProgramError::new(kind, Phase::Compile, message).with_frames(vec![CallFrame {
            name: func.to_string(),
            path: self.path.to_string(),
            line: span.line,
            col: span.col,
        }])
    }

    fn syntax(&self, expr: &Expr, func: &str, message: &str) -> ProgramError {
        self.error(expr.span, func, ProgramErrorKind::Syntax, message.to_string())
    }

    fn binding_name<'e>(&self, expr: &'e Expr) -> ResolveResult<&'e str> {
        match expr.as_symbol() {
            Some(sym) if !sym.contains('.') && !SPECIAL_FORMS.contains(&sym) => Ok(sym),
            _ => Err(self.syntax(expr, "<toplevel>", "expected a plain symbol to bind")),
        }
    }

    fn load_decl(&self, form: &Expr) -> ResolveResult<LoadDecl> {
        let items = form.as_list().unwrap_or_default();
        let path = match items.get(1).map(|e| &e.kind) {
            Some(ExprKind::String(path)) => path.clone(),
            _ => return Err(self.syntax(form, "<toplevel>", "load expects a path string")),
        };
        let mut names = Vec::new();
        let mut alias = None;
        let mut rest = items[2..].iter();
        while let Some(item) = rest.next() {
            match &item.kind {
                ExprKind::Keyword(kw) if kw == "as" => {
                    let target = rest
                        .next()
                        .ok_or_else(|| self.syntax(item, "<toplevel>", ":as needs a name"))?;
                    alias = Some(self.binding_name(target)?.to_string());
                }
                ExprKind::Symbol(_) => names.push(self.binding_name(item)?.to_string()),
                _ => return Err(self.syntax(item, "<toplevel>", "load imports symbols")),
            }
        }
        Ok(LoadDecl {
            path,
            names,
            alias,
            span: form.span,
        })
    }

    fn params(&self, expr: &Expr, func: &str) -> ResolveResult<Vec<String>> {
        match &expr.kind {
            ExprKind::Vector(items) => items
                .iter()
                .map(|item| {
                    item.as_symbol()
                        .filter(|s| !s.contains('.'))
                        .map(str::to_string)
                        .ok_or_else(|| self.syntax(item, func, "parameters must be symbols"))
                })
                .collect(),
            _ => Err(self.syntax(expr, func, "expected a parameter vector")),
        }
    }

    fn body(
        &self,
        body: &[Expr],
        globals: &BTreeSet<String>,
        locals: &mut Vec<String>,
        func: &str,
    ) -> ResolveResult<()> {
        for expr in body {
            self.expr(expr, globals, locals, func, false)?;
        }
        Ok(())
    }

    fn expr(
        &self,
        expr: &Expr,
        globals: &BTreeSet<String>,
        locals: &mut Vec<String>,
        func: &str,
        toplevel: bool,
    ) -> ResolveResult<()> {
        match &expr.kind {
            ExprKind::Symbol(sym) => {
                let root = root_name(sym);
                if locals.iter().any(|l| l == root)
                    || globals.contains(root)
                    || builtins::is_builtin(root)
                {
                    Ok(())
                } else {
                    Err(self.error(
                        expr.span,
                        func,
                        ProgramErrorKind::Resolution,
                        format!("undefined: {}", root),
                    ))
                }
            }
            ExprKind::Vector(items) | ExprKind::Map(items) => {
                self.body(items, globals, locals, func)
            }
            ExprKind::List(items) => self.form(expr, items, globals, locals, func, toplevel),
            _ => Ok(()),
        }
    }

    fn form(
        &self,
        expr: &Expr,
        items: &[Expr],
        globals: &BTreeSet<String>,
        locals: &mut Vec<String>,
        func: &str,
        toplevel: bool,
    ) -> ResolveResult<()> {
        let Some(head) = items.first() else {
            return Err(self.syntax(expr, func, "empty form"));
        };
        let shadowed = head
            .as_symbol()
            .is_some_and(|h| locals.iter().any(|l| l == h));
        let special = head.as_symbol().filter(|h| !shadowed && SPECIAL_FORMS.contains(h));

        match special {
            Some("load") => Err(self.syntax(expr, func, "load is only allowed at top level")),
            Some("def") => {
                if !toplevel {
                    return Err(self.syntax(expr, func, "def is only allowed at top level"));
                }
                if items.len() != 3 {
                    return Err(self.syntax(expr, func, "def expects a name and a value"));
                }
                self.binding_name(&items[1])?;
                self.expr(&items[2], globals, locals, func, false)
            }
            Some("defn") => {
                if !toplevel {
                    return Err(self.syntax(expr, func, "defn is only allowed at top level"));
                }
                if items.len() < 4 {
                    let message = "defn expects a name, parameters and a body";
                    return Err(self.syntax(expr, func, message));
                }
                let name = self.binding_name(&items[1])?;
                let params = self.params(&items[2], name)?;
                let mut inner = params;
                self.body(&items[3..], globals, &mut inner, name)
            }
            Some("fn") => {
                if items.len() < 3 {
                    return Err(self.syntax(expr, func, "fn expects parameters and a body"));
                }
                let params = self.params(&items[1], func)?;
                let depth = locals.len();
                locals.extend(params);
                let result = self.body(&items[2..], globals, locals, "<lambda>");
                locals.truncate(depth);
                result
            }
            Some("let") | Some("for") => {
                let Some(ExprKind::Vector(pairs)) = items.get(1).map(|e| &e.kind) else {
                    return Err(self.syntax(expr, func, "expected a binding vector"));
                };
                if pairs.len() % 2 != 0 || (special == Some("for") && pairs.len() != 2) {
                    return Err(self.syntax(&items[1], func, "malformed binding vector"));
                }
                let depth = locals.len();
                for pair in pairs.chunks(2) {
                    self.expr(&pair[1], globals, locals, func, false)?;
                    let name = pair[0]
                        .as_symbol()
                        .filter(|s| !s.contains('.'))
                        .ok_or_else(|| self.syntax(&pair[0], func, "expected a symbol"))?;
                    locals.push(name.to_string());
                }
                let result = self.body(&items[2..], globals, locals, func);
                locals.truncate(depth);
                result
            }
            Some("set!") => {
                if items.len() != 3 {
                    return Err(self.syntax(expr, func, "set! expects a name and a value"));
                }
                self.expr(&items[1], globals, locals, func, false)?;
                self.expr(&items[2], globals, locals, func, false)
            }
            Some("if") => {
                if !(3..=4).contains(&items.len()) {
                    let message = "if expects a condition and one or two branches";
                    return Err(self.syntax(expr, func, message));
                }
                self.body(&items[1..], globals, locals, func)
            }
            Some("when") if items.len() < 2 => {
                Err(self.syntax(expr, func, "when expects a condition"))
            }
            Some(_) => self.body(&items[1..], globals, locals, func),
            None => {
                self.expr(head, globals, locals, func, false)?;
                for arg in &items[1..] {
                    if !matches!(arg.kind, ExprKind::Keyword(_)) {
                        self.expr(arg, globals, locals, func, false)?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::sexpr::parser::parse_forms;

    fn compile(src: &str, predecls: &[&str]) -> ResolveResult<CompiledProgram> {
        let predecls: Vec<String> = predecls.iter().map(|s| s.to_string()).collect();
        resolve("main.sx", parse_forms("main.sx", src)?, &predecls)
    }

    #[test]
    fn loads_are_split_off() {
        let program = compile(
            "(load \"lib.sx\" helper)\n(load \"cfg.json\" :as cfg)\n(def x (helper cfg.region))",
            &[],
        )
        .unwrap();
        assert_eq!(program.loads.len(), 2);
        assert_eq!(program.loads[0].names, vec!["helper".to_string()]);
        assert_eq!(program.loads[1].alias.as_deref(), Some("cfg"));
        assert_eq!(program.forms.len(), 1);
    }

    #[test]
    fn undefined_names_are_resolution_errors() {
        let err = compile("(defn f [a]\n  (+ a b))", &[]).unwrap_err();
        assert_eq!(err.kind, ProgramErrorKind::Resolution);
        assert_eq!(err.message, "undefined: b");
        assert_eq!(err.frames[0].name, "f");
        assert_eq!((err.frames[0].line, err.frames[0].col), (2, 8));
    }

    #[test]
    fn forward_references_and_predecls_resolve() {
        compile("(defn main [] (helper ak.sleep))\n(defn helper [x] x)", &["ak"]).unwrap();
    }

    #[test]
    fn let_scopes_end_with_the_form() {
        assert!(compile("(let [a 1] a)", &[]).is_ok());
        assert!(compile("(do (let [a 1] a) a)", &[]).is_err());
    }

    #[test]
    fn nested_definitions_are_rejected() {
        let err = compile("(defn f [] (def g 1))", &[]).unwrap_err();
        assert_eq!(err.kind, ProgramErrorKind::Syntax);
        let err = compile("(defn f [] (load \"x.sx\" y))", &[]).unwrap_err();
        assert_eq!(err.kind, ProgramErrorKind::Syntax);
    }
}
