use super::ast::{Expr, ExprKind, Span};
use crate::lang::{CallFrame, Phase, ProgramError, ProgramErrorKind};

type ParseResult<T> = std::result::Result<T, ProgramError>;

/// Parse source text into top-level forms.
pub fn parse_forms(path: &str, source: &str) -> ParseResult<Vec<Expr>> {
    let mut parser = Parser::new(path, source);
    let mut forms = Vec::new();
    loop {
        parser.skip_ws();
        if parser.eof() {
            break;
        }
        if matches!(parser.current(), Some(b')' | b']' | b'}')) {
            return Err(parser.error("unexpected closing delimiter"));
        }
        forms.push(parser.parse_expr()?);
    }
    Ok(forms)
}

struct Parser<'a> {
    path: &'a str,
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
    line: u32,
    col: u32,
}

impl<'a> Parser<'a> {
    fn new(path: &'a str, src: &'a str) -> Self {
        Self {
            path,
            src,
            bytes: src.as_bytes(),
            index: 0,
            line: 1,
            col: 1,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current() {
            self.index += 1;
            if ch == b'\n' {
                self.line += 1;
                self.col = 1;
            } else if ch & 0xC0 != 0x80 {
                // continuation bytes do not start a new column
                self.col += 1;
            }
        }
    }

    fn skip_ws(&mut self) {
        loop {
            while let Some(ch) = self.current() {
                if ch.is_ascii_whitespace() || ch == b',' {
                    self.advance();
                } else {
                    break;
                }
            }
            if self.current() == Some(b';') {
                while let Some(ch) = self.current() {
                    self.advance();
                    if ch == b'\n' {
                        break;
                    }
                }
                continue;
            }
            break;
        }
    }

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.skip_ws();
        let Some(ch) = self.current() else {
            return Err(self.error("unexpected end of input"));
        };

        match ch {
            b'(' => self.parse_seq(b')', ExprKind::List),
            b'[' => self.parse_seq(b']', ExprKind::Vector),
            b'{' => {
                let span = self.span();
                let expr = self.parse_seq(b'}', ExprKind::Map)?;
                match &expr.kind {
                    ExprKind::Map(items) if items.len() % 2 != 0 => Err(self.error_at(
                        span,
                        "dict literal needs an even number of forms",
                    )),
                    _ => Ok(expr),
                }
            }
            b')' | b']' | b'}' => Err(self.error("unexpected closing delimiter")),
            b'"' => self.parse_string(),
            b':' => self.parse_keyword(),
            b'-' | b'+' | b'0'..=b'9' => self.parse_number_or_symbol(),
            _ => self.parse_symbol_or_literal(),
        }
    }

    fn parse_seq(&mut self, close: u8, build: fn(Vec<Expr>) -> ExprKind) -> ParseResult<Expr> {
        let span = self.span();
        // consume opener
        self.advance();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.current() {
                None => return Err(self.error_at(span, "unterminated form")),
                Some(ch) if ch == close => {
                    self.advance();
                    break;
                }
                Some(b')' | b']' | b'}') => return Err(self.error("mismatched closing delimiter")),
                Some(_) => items.push(self.parse_expr()?),
            }
        }
        Ok(Expr::new(build(items), span))
    }

    fn parse_string(&mut self) -> ParseResult<Expr> {
        let span = self.span();
        // consume opening quote
        self.advance();
        let mut buf = Vec::new();
        while let Some(ch) = self.current() {
            self.advance();
            match ch {
                b'"' => {
                    let text = String::from_utf8(buf)
                        .map_err(|_| self.error_at(span, "invalid utf-8 in string literal"))?;
                    return Ok(Expr::new(ExprKind::String(text), span));
                }
                b'\\' => {
                    let escaped = self
                        .current()
                        .ok_or_else(|| self.error("incomplete escape"))?;
                    self.advance();
                    let value = match escaped {
                        b'"' => b'"',
                        b'\\' => b'\\',
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        other => {
                            return Err(self.error(&format!("unknown escape: \\{}", other as char)));
                        }
                    };
                    buf.push(value);
                }
                _ => buf.push(ch),
            }
        }
        Err(self.error_at(span, "unterminated string literal"))
    }

    fn parse_keyword(&mut self) -> ParseResult<Expr> {
        let span = self.span();
        self.advance(); // consume ':'
        let start = self.index;
        while let Some(ch) = self.current() {
            if is_symbol_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.index {
            return Err(self.error("empty keyword"));
        }
        let text = &self.src[start..self.index];
        Ok(Expr::new(ExprKind::Keyword(text.to_string()), span))
    }

    fn parse_number_or_symbol(&mut self) -> ParseResult<Expr> {
        let span = self.span();
        let (start, line, col) = (self.index, self.line, self.col);
        if self.current() == Some(b'-') || self.current() == Some(b'+') {
            self.advance();
        }
        let mut has_digit = false;
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                has_digit = true;
                self.advance();
            } else {
                break;
            }
        }

        let mut is_float = false;
        if has_digit && self.current() == Some(b'.') {
            if let Some(next) = self.peek_char() {
                if next.is_ascii_digit() {
                    is_float = true;
                    self.advance();
                    while let Some(ch) = self.current() {
                        if ch.is_ascii_digit() {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
            }
        }

        if !has_digit || self.current().is_some_and(is_symbol_char) {
            self.index = start;
            self.line = line;
            self.col = col;
            return self.parse_symbol_or_literal();
        }

        let text = &self.src[start..self.index];
        if is_float {
            match text.parse::<f64>() {
                Ok(value) => Ok(Expr::new(ExprKind::Float(value), span)),
                Err(_) => Err(self.error_at(span, "invalid float literal")),
            }
        } else {
            match text.parse::<i64>() {
                Ok(value) => Ok(Expr::new(ExprKind::Integer(value), span)),
                Err(_) => Err(self.error_at(span, "invalid integer literal")),
            }
        }
    }

    fn parse_symbol_or_literal(&mut self) -> ParseResult<Expr> {
        let span = self.span();
        let start = self.index;
        while let Some(ch) = self.current() {
            if is_symbol_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.index {
            return Err(self.error("unexpected character"));
        }
        let text = &self.src[start..self.index];
        let kind = match text {
            "true" => ExprKind::Boolean(true),
            "false" => ExprKind::Boolean(false),
            "nil" => ExprKind::Nil,
            _ => ExprKind::Symbol(text.to_string()),
        };
        Ok(Expr::new(kind, span))
    }

    fn peek_char(&self) -> Option<u8> {
        self.bytes.get(self.index + 1).copied()
    }

    fn error(&self, message: &str) -> ProgramError {
        self.error_at(self.span(), message)
    }

    fn error_at(&self, span: Span, message: &str) -> ProgramError {
        ProgramError::new(ProgramErrorKind::Syntax, Phase::Compile, message).with_frames(vec![
            CallFrame {
                name: "<toplevel>".to_string(),
                path: self.path.to_string(),
                line: span.line,
                col: span.col,
            },
        ])
    }
}

fn is_symbol_char(ch: u8) -> bool {
    match ch {
        b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'"' | b';' | b',' => false,
        c if c.is_ascii_whitespace() => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literals_and_positions() {
        let forms = parse_forms("t.sx", "(def x 42)\n  [1 2.5 \"s\" :k nil true]").unwrap();
        assert_eq!(forms.len(), 2);
        assert_eq!(forms[0].head(), Some("def"));
        assert_eq!(forms[1].span, Span { line: 2, col: 3 });
        match &forms[1].kind {
            ExprKind::Vector(items) => {
                assert_eq!(items[0].kind, ExprKind::Integer(1));
                assert_eq!(items[1].kind, ExprKind::Float(2.5));
                assert_eq!(items[2].kind, ExprKind::String("s".into()));
                assert_eq!(items[3].kind, ExprKind::Keyword("k".into()));
                assert_eq!(items[4].kind, ExprKind::Nil);
                assert_eq!(items[5].kind, ExprKind::Boolean(true));
            }
            other => panic!("expected vector, got {other:?}"),
        }
    }

    #[test]
    fn symbols_may_start_with_signs() {
        let forms = parse_forms("t.sx", "(- x 1) -> +inf 1st").unwrap();
        assert_eq!(forms[0].head(), Some("-"));
        assert_eq!(forms[1].as_symbol(), Some("->"));
        assert_eq!(forms[2].as_symbol(), Some("+inf"));
        assert_eq!(forms[3].as_symbol(), Some("1st"));
    }

    #[test]
    fn comments_and_commas_are_whitespace() {
        let forms = parse_forms("t.sx", "; header\n{:a 1, :b 2} ; trailing").unwrap();
        assert_eq!(forms.len(), 1);
        assert!(matches!(&forms[0].kind, ExprKind::Map(items) if items.len() == 4));
    }

    #[test]
    fn unterminated_form_reports_its_start() {
        let err = parse_forms("t.sx", "\n\n  (def x").unwrap_err();
        assert_eq!(err.kind, ProgramErrorKind::Syntax);
        assert_eq!(err.phase, Phase::Compile);
        assert_eq!((err.frames[0].line, err.frames[0].col), (3, 3));
        assert_eq!(err.frames[0].path, "t.sx");
    }

    #[test]
    fn strings_keep_unicode() {
        let forms = parse_forms("t.sx", "\"héllo\\n\"").unwrap();
        assert_eq!(forms[0].kind, ExprKind::String("héllo\n".into()));
    }

    #[test]
    fn odd_dicts_are_rejected() {
        assert!(parse_forms("t.sx", "{:a}").is_err());
        assert!(parse_forms("t.sx", "(a]").is_err());
        assert!(parse_forms("t.sx", ")").is_err());
    }
}
