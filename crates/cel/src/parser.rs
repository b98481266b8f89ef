//! Recursive-descent parser. Macros (`has`, `all`, `exists`, `exists_one`, `map`,
//! `filter`, `cel.bind`) are expanded into dedicated nodes while parsing, as is the
//! optional syntax (`a.?b`, `a[?k]`, `[?x]`, `{?k: v}`).

use crate::lexer::{tokenize, Tok, Token};
use crate::ExprError;

/// Deepest nesting the parser accepts. Every operator in a chain counts as one level,
/// so this also bounds the depth of the tree later passes walk.
pub const MAX_NESTING: usize = 100;
pub const MAX_EXPR_LEN: usize = 100_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Lit {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    All,
    Exists,
    ExistsOne,
    Map,
    Filter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Lit),
    Ident(String),
    Select(Box<Expr>, String),
    /// `operand.?field`
    OptSelect(Box<Expr>, String),
    /// `has(operand.field)`
    Has(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    /// `operand[?index]`
    OptIndex(Box<Expr>, Box<Expr>),
    /// `?value` inside a list literal or as a map entry value; dropped when empty.
    OptElem(Box<Expr>),
    Call { target: Option<Box<Expr>>, func: String, args: Vec<Expr> },
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `range.<fold>(var, [filter,] step)`; `filter` only for the three-argument `map`.
    Fold { kind: Fold, var: String, range: Box<Expr>, filter: Option<Box<Expr>>, step: Box<Expr> },
    /// `cel.bind(var, init, body)`
    Bind { var: String, init: Box<Expr>, body: Box<Expr> },
}

pub fn parse(src: &str) -> Result<Expr, ExprError> {
    if src.len() > MAX_EXPR_LEN {
        return Err(ExprError::Compile(format!("expression longer than {} bytes", MAX_EXPR_LEN)));
    }
    let tokens = tokenize(src)?;
    let mut p = Parser { tokens, at: 0, depth: 0 };
    let e = p.expr()?;
    match p.peek() {
        Tok::Eof => Ok(e),
        other => Err(p.error(&format!("unexpected {:?} after expression", other))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    at: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.at.min(self.tokens.len() - 1)].tok
    }

    fn bump(&mut self) -> Tok {
        let t = self.peek().clone();
        if self.at < self.tokens.len() - 1 {
            self.at += 1;
        }
        t
    }

    fn eat(&mut self, t: &Tok) -> bool {
        if self.peek() == t {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Tok) -> Result<(), ExprError> {
        if self.eat(t) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}, found {:?}", t, self.peek())))
        }
    }

    fn error(&self, msg: &str) -> ExprError {
        let pos = self.tokens[self.at.min(self.tokens.len() - 1)].pos;
        ExprError::Compile(format!("{} at offset {}", msg, pos))
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let cond = self.or()?;
        let out = if self.eat(&Tok::Question) {
            let a = self.or()?;
            self.expect(&Tok::Colon)?;
            let b = self.expr()?;
            Expr::Cond(Box::new(cond), Box::new(a), Box::new(b))
        } else {
            cond
        };
        self.depth -= 1;
        Ok(out)
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        let mark = self.depth;
        while self.eat(&Tok::OrOr) {
            self.enter()?;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.relation()?;
        let mark = self.depth;
        while self.eat(&Tok::AndAnd) {
            self.enter()?;
            let rhs = self.relation()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn relation(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.addition()?;
        let mark = self.depth;
        loop {
            let op = match self.peek() {
                Tok::Eq => BinOp::Eq,
                Tok::Ne => BinOp::Ne,
                Tok::Lt => BinOp::Lt,
                Tok::Le => BinOp::Le,
                Tok::Gt => BinOp::Gt,
                Tok::Ge => BinOp::Ge,
                Tok::In => BinOp::In,
                _ => {
                    self.depth = mark;
                    return Ok(lhs);
                }
            };
            self.bump();
            self.enter()?;
            let rhs = self.addition()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn addition(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.multiplication()?;
        let mark = self.depth;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => {
                    self.depth = mark;
                    return Ok(lhs);
                }
            };
            self.bump();
            self.enter()?;
            let rhs = self.multiplication()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplication(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        let mark = self.depth;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Rem,
                _ => {
                    self.depth = mark;
                    return Ok(lhs);
                }
            };
            self.bump();
            self.enter()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Tok::Bang => {
                self.bump();
                self.enter()?;
                let e = self.unary()?;
                self.depth -= 1;
                Ok(Expr::Unary(UnOp::Not, Box::new(e)))
            }
            Tok::Minus => {
                self.bump();
                // fold negative literals so i64::MIN is expressible
                match self.peek().clone() {
                    Tok::Int(v) if !matches!(self.tokens.get(self.at + 1).map(|t| &t.tok), Some(Tok::Dot) | Some(Tok::LBracket)) => {
                        self.bump();
                        let n = if v == 1u64 << 63 {
                            i64::MIN
                        } else {
                            -(i64::try_from(v).map_err(|_| self.error("integer literal out of range"))?)
                        };
                        Ok(Expr::Lit(Lit::Int(n)))
                    }
                    Tok::Double(v) if !matches!(self.tokens.get(self.at + 1).map(|t| &t.tok), Some(Tok::Dot) | Some(Tok::LBracket)) => {
                        self.bump();
                        Ok(Expr::Lit(Lit::Double(-v)))
                    }
                    _ => {
                        self.enter()?;
                        let e = self.unary()?;
                        self.depth -= 1;
                        Ok(Expr::Unary(UnOp::Neg, Box::new(e)))
                    }
                }
            }
            _ => self.member(),
        }
    }

    fn member(&mut self) -> Result<Expr, ExprError> {
        let mut e = self.primary()?;
        let mark = self.depth;
        loop {
            if self.eat(&Tok::Dot) {
                self.enter()?;
                let optional = self.eat(&Tok::Question);
                let field = match self.bump() {
                    Tok::Ident(s) => s,
                    other => return Err(self.error(&format!("expected field name, found {:?}", other))),
                };
                if optional {
                    e = Expr::OptSelect(Box::new(e), field);
                } else if self.eat(&Tok::LParen) {
                    let args = self.args(&Tok::RParen)?;
                    e = self.member_call(e, field, args)?;
                } else {
                    e = Expr::Select(Box::new(e), field);
                }
            } else if self.eat(&Tok::LBracket) {
                self.enter()?;
                let optional = self.eat(&Tok::Question);
                let idx = self.expr()?;
                self.expect(&Tok::RBracket)?;
                e = if optional { Expr::OptIndex(Box::new(e), Box::new(idx)) } else { Expr::Index(Box::new(e), Box::new(idx)) };
            } else {
                self.depth = mark;
                return Ok(e);
            }
        }
    }

    fn args(&mut self, close: &Tok) -> Result<Vec<Expr>, ExprError> {
        let mut out = Vec::new();
        if self.eat(close) {
            return Ok(out);
        }
        loop {
            out.push(self.expr()?);
            if self.eat(close) {
                return Ok(out);
            }
            self.expect(&Tok::Comma)?;
            if self.eat(close) {
                return Ok(out);
            }
        }
    }

    fn member_call(&mut self, target: Expr, func: String, mut args: Vec<Expr>) -> Result<Expr, ExprError> {
        let fold = match func.as_str() {
            "all" => Some(Fold::All),
            "exists" => Some(Fold::Exists),
            "exists_one" => Some(Fold::ExistsOne),
            "map" => Some(Fold::Map),
            "filter" => Some(Fold::Filter),
            _ => None,
        };
        if let Some(kind) = fold {
            let arity_ok = match kind {
                Fold::Map => args.len() == 2 || args.len() == 3,
                _ => args.len() == 2,
            };
            if !arity_ok {
                return Err(self.error(&format!("wrong number of arguments to macro {}", func)));
            }
            let var = match &args[0] {
                Expr::Ident(v) => v.clone(),
                _ => return Err(self.error(&format!("argument 1 of {} must be a simple name", func))),
            };
            let step = args.pop().map(Box::new).ok_or_else(|| self.error("missing macro body"))?;
            let filter = if args.len() == 2 { args.pop().map(Box::new) } else { None };
            return Ok(Expr::Fold { kind, var, range: Box::new(target), filter, step });
        }
        if let Expr::Ident(ns) = &target {
            if ns == "cel" && func == "bind" {
                if args.len() != 3 {
                    return Err(self.error("cel.bind takes three arguments"));
                }
                let body = args.pop().map(Box::new).ok_or_else(|| self.error("missing bind body"))?;
                let init = args.pop().map(Box::new).ok_or_else(|| self.error("missing bind init"))?;
                let var = match args.pop() {
                    Some(Expr::Ident(v)) => v,
                    _ => return Err(self.error("argument 1 of cel.bind must be a simple name")),
                };
                return Ok(Expr::Bind { var, init, body });
            }
            if matches!(ns.as_str(), "sets" | "base64" | "optional") {
                return Ok(Expr::Call { target: None, func: format!("{}.{}", ns, func), args });
            }
        }
        Ok(Expr::Call { target: Some(Box::new(target)), func, args })
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let out = match self.bump() {
            Tok::Int(v) => {
                let n = i64::try_from(v).map_err(|_| self.error("integer literal out of range"))?;
                Expr::Lit(Lit::Int(n))
            }
            Tok::Uint(v) => Expr::Lit(Lit::Uint(v)),
            Tok::Double(v) => Expr::Lit(Lit::Double(v)),
            Tok::Str(s) => Expr::Lit(Lit::Str(s)),
            Tok::Bytes(b) => Expr::Lit(Lit::Bytes(b)),
            Tok::True => Expr::Lit(Lit::Bool(true)),
            Tok::False => Expr::Lit(Lit::Bool(false)),
            Tok::Null => Expr::Lit(Lit::Null),
            Tok::Dot => match self.bump() {
                Tok::Ident(name) => self.ident_or_call(name)?,
                other => return Err(self.error(&format!("expected name after '.', found {:?}", other))),
            },
            Tok::Ident(name) => self.ident_or_call(name)?,
            Tok::LParen => {
                let e = self.expr()?;
                self.expect(&Tok::RParen)?;
                e
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.maybe_optional()?);
                        if self.eat(&Tok::RBracket) {
                            break;
                        }
                        self.expect(&Tok::Comma)?;
                        if self.eat(&Tok::RBracket) {
                            break;
                        }
                    }
                }
                Expr::List(items)
            }
            Tok::LBrace => {
                let mut entries = Vec::new();
                if !self.eat(&Tok::RBrace) {
                    loop {
                        let optional = self.eat(&Tok::Question);
                        let k = self.expr()?;
                        self.expect(&Tok::Colon)?;
                        let v = self.expr()?;
                        entries.push((k, if optional { Expr::OptElem(Box::new(v)) } else { v }));
                        if self.eat(&Tok::RBrace) {
                            break;
                        }
                        self.expect(&Tok::Comma)?;
                        if self.eat(&Tok::RBrace) {
                            break;
                        }
                    }
                }
                Expr::Map(entries)
            }
            other => return Err(self.error(&format!("unexpected {:?}", other))),
        };
        self.depth -= 1;
        Ok(out)
    }

    fn maybe_optional(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Tok::Question) {
            return Ok(Expr::OptElem(Box::new(self.expr()?)));
        }
        self.expr()
    }

    fn ident_or_call(&mut self, name: String) -> Result<Expr, ExprError> {
        if !self.eat(&Tok::LParen) {
            return Ok(Expr::Ident(name));
        }
        let mut args = self.args(&Tok::RParen)?;
        if name == "has" {
            return match (args.len(), args.pop()) {
                (1, Some(Expr::Select(operand, field))) => Ok(Expr::Has(operand, field)),
                _ => Err(self.error("invalid argument to has() macro")),
            };
        }
        Ok(Expr::Call { target: None, func: name, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_macros() {
        let e = parse("a.b + 1 * 2 == 3 && xs.all(x, x > 0)").unwrap();
        let Expr::And(lhs, rhs) = e else { panic!("and expected") };
        assert!(matches!(*lhs, Expr::Binary(BinOp::Eq, _, _)));
        assert!(matches!(*rhs, Expr::Fold { kind: Fold::All, .. }));
    }

    #[test]
    fn namespaced_functions() {
        assert!(matches!(parse("sets.contains([1], [1])").unwrap(), Expr::Call { target: None, ref func, .. } if func == "sets.contains"));
        assert!(matches!(parse("cel.bind(x, 1, x + 1)").unwrap(), Expr::Bind { .. }));
        assert!(matches!(parse("has(a.b)").unwrap(), Expr::Has(..)));
        assert!(parse("has(a)").is_err());
        assert!(matches!(parse("base64.encode(b'x')").unwrap(), Expr::Call { target: None, ref func, .. } if func == "base64.encode"));
        assert!(matches!(parse("optional.none()").unwrap(), Expr::Call { target: None, ref func, ref args } if func == "optional.none" && args.is_empty()));
    }

    #[test]
    fn optional_syntax() {
        assert!(matches!(parse("a.?b").unwrap(), Expr::OptSelect(_, ref f) if f == "b"));
        assert!(matches!(parse("a[?'k']").unwrap(), Expr::OptIndex(..)));
        let Expr::List(items) = parse("[1, ?x]").unwrap() else { panic!("list expected") };
        assert!(matches!(items[1], Expr::OptElem(_)));
        let Expr::Map(entries) = parse("{?'k': x}").unwrap() else { panic!("map expected") };
        assert!(matches!(entries[0].1, Expr::OptElem(_)));
        // the conditional operator still parses
        assert!(matches!(parse("a ? b : c").unwrap(), Expr::Cond(..)));
    }

    #[test]
    fn min_int_and_nesting_limit() {
        assert_eq!(parse("-9223372036854775808").unwrap(), Expr::Lit(Lit::Int(i64::MIN)));
        assert!(parse("9223372036854775808").is_err());
        let deep = format!("{}1{}", "(".repeat(MAX_NESTING + 5), ")".repeat(MAX_NESTING + 5));
        assert!(matches!(parse(&deep), Err(ExprError::Compile(_))));
    }

    #[test]
    fn flat_chains_count_towards_nesting() {
        let ok = format!("x{}", " || x".repeat(MAX_NESTING / 2));
        assert!(parse(&ok).is_ok());
        for chain in [format!("x{}", " || x".repeat(MAX_NESTING)), format!("x{}", "[0]".repeat(MAX_NESTING)), format!("1{}", " * 2".repeat(MAX_NESTING))] {
            assert!(matches!(parse(&chain), Err(ExprError::Compile(_))), "{}", &chain[..20]);
        }
    }
}
