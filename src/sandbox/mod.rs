//! # Expression sandbox (§4.3)
//!
//! Pure function: evaluate a restricted boolean/arithmetic expression against a
//! read-only Context. Expressions are the only place where user-supplied logic
//! executes in the core — so the implementation parses to a closed AST and
//! rejects anything it cannot represent, rather than evaluating a string
//! directly.
//!
//! Grammar: comparisons (`==`, `!=`, `<`, `<=`, `>`, `>=`), boolean combinators
//! (`and`, `or`, `not`), arithmetic (`+ - * /`), indexing (`x[0]`), member
//! access (`x.y`), and a closed function allow-list (`len, sum, min, max, all,
//! any, abs`) applied to context-provided collections. There is no assignment
//! grammar, no import/module syntax, and no lexical path to anything outside
//! the Context — the allow-list check is therefore structural, not a runtime
//! blacklist.
//!
//! A function's sole argument can also be a comprehension — `any(x.ok for x
//! in items)`, `sum(x.price for x in items if x.active)` — which projects
//! (and optionally filters) a context-provided collection into the array the
//! allow-listed function then folds. `for`/`in`/`if` are ordinary identifiers
//! to the tokenizer; the parser recognizes them positionally right after a
//! function's first argument expression, never as reserved words elsewhere.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::context::Context;
use crate::errors::{ErrorKind, ObservedError};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
const FUNCTION_ALLOW_LIST: &[&str] = &["len", "sum", "min", "max", "all", "any", "abs"];

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone)]
enum Node {
    Number(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
    Unary(UnaryOp, Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Comprehension {
        projection: Box<Node>,
        var: String,
        source: Box<Node>,
        predicate: Option<Box<Node>>,
    },
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

// ============================================================================
// PARSER (recursive descent)
// ============================================================================

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Number(f64),
    Str(String),
    Ident(&'a str),
    Symbol(&'a str),
    Eof,
}

fn tokenize(expr: &str) -> Result<Vec<Token<'_>>, ObservedError> {
    let mut tokens = Vec::new();
    let bytes = expr.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let start = i + 1;
            let mut j = start;
            while j < bytes.len() && bytes[j] as char != quote {
                j += 1;
            }
            if j >= bytes.len() {
                return Err(parse_error("unterminated string literal"));
            }
            tokens.push(Token::Str(expr[start..j].to_string()));
            i = j + 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let mut j = i;
            while j < bytes.len() && (bytes[j] as char == '.' || (bytes[j] as char).is_ascii_digit()) {
                j += 1;
            }
            let num: f64 = expr[start..j]
                .parse()
                .map_err(|_| parse_error("invalid numeric literal"))?;
            tokens.push(Token::Number(num));
            i = j;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            let mut j = i;
            while j < bytes.len() {
                let ch = bytes[j] as char;
                if ch.is_ascii_alphanumeric() || ch == '_' {
                    j += 1;
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(&expr[start..j]));
            i = j;
            continue;
        }
        // Two-char symbols first.
        if i + 1 < bytes.len() {
            let two = &expr[i..i + 2];
            if matches!(two, "==" | "!=" | "<=" | ">=") {
                tokens.push(Token::Symbol(two));
                i += 2;
                continue;
            }
        }
        if "+-*/()[].,<>".contains(c) {
            tokens.push(Token::Symbol(&expr[i..i + 1]));
            i += 1;
            continue;
        }
        return Err(parse_error(&format!("unexpected character '{c}'")));
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

fn parse_error(msg: &str) -> ObservedError {
    ObservedError::new(ErrorKind::SandboxForbiddenNode, format!("sandbox parse error: {msg}"))
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token<'a>>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token<'a> {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token<'a> {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat_symbol(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Token::Symbol(s) if *s == sym) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Token::Ident(s) if *s == word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn parse_expr(&mut self) -> Result<Node, ObservedError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Node, ObservedError> {
        let mut left = self.parse_and()?;
        while self.eat_ident("or") {
            let right = self.parse_and()?;
            left = Node::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ObservedError> {
        let mut left = self.parse_not()?;
        while self.eat_ident("and") {
            let right = self.parse_not()?;
            left = Node::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Node, ObservedError> {
        if self.eat_ident("not") {
            let inner = self.parse_not()?;
            return Ok(Node::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, ObservedError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Token::Symbol("==") => Some(BinOp::Eq),
            Token::Symbol("!=") => Some(BinOp::Ne),
            Token::Symbol("<") => Some(BinOp::Lt),
            Token::Symbol("<=") => Some(BinOp::Le),
            Token::Symbol(">") => Some(BinOp::Gt),
            Token::Symbol(">=") => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_additive()?;
            return Ok(Node::Binary(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Node, ObservedError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            if self.eat_symbol("+") {
                let right = self.parse_multiplicative()?;
                left = Node::Binary(BinOp::Add, Box::new(left), Box::new(right));
            } else if self.eat_symbol("-") {
                let right = self.parse_multiplicative()?;
                left = Node::Binary(BinOp::Sub, Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Node, ObservedError> {
        let mut left = self.parse_unary()?;
        loop {
            if self.eat_symbol("*") {
                let right = self.parse_unary()?;
                left = Node::Binary(BinOp::Mul, Box::new(left), Box::new(right));
            } else if self.eat_symbol("/") {
                let right = self.parse_unary()?;
                left = Node::Binary(BinOp::Div, Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, ObservedError> {
        if self.eat_symbol("-") {
            let inner = self.parse_unary()?;
            return Ok(Node::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Node, ObservedError> {
        let mut node = self.parse_primary()?;
        loop {
            if self.eat_symbol(".") {
                match self.advance() {
                    Token::Ident(field) => node = Node::Member(Box::new(node), field.to_string()),
                    _ => return Err(parse_error("expected field name after '.'")),
                }
            } else if self.eat_symbol("[") {
                let index = self.parse_expr()?;
                if !self.eat_symbol("]") {
                    return Err(parse_error("expected closing ']'"));
                }
                node = Node::Index(Box::new(node), Box::new(index));
            } else {
                break;
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> Result<Node, ObservedError> {
        match self.advance() {
            Token::Number(n) => Ok(Node::Number(n)),
            Token::Str(s) => Ok(Node::Str(s)),
            Token::Ident("true") => Ok(Node::Bool(true)),
            Token::Ident("false") => Ok(Node::Bool(false)),
            Token::Ident(name) => {
                if matches!(self.peek(), Token::Symbol("(")) {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Token::Symbol(")")) {
                        let first = self.parse_expr()?;
                        if self.eat_ident("for") {
                            let var = match self.advance() {
                                Token::Ident(v) => v.to_string(),
                                other => {
                                    return Err(parse_error(&format!(
                                        "expected loop variable after 'for', got {other:?}"
                                    )))
                                }
                            };
                            if !self.eat_ident("in") {
                                return Err(parse_error("expected 'in' after comprehension variable"));
                            }
                            let source = self.parse_expr()?;
                            let predicate = if self.eat_ident("if") {
                                Some(Box::new(self.parse_expr()?))
                            } else {
                                None
                            };
                            args.push(Node::Comprehension {
                                projection: Box::new(first),
                                var,
                                source: Box::new(source),
                                predicate,
                            });
                        } else {
                            args.push(first);
                            while self.eat_symbol(",") {
                                args.push(self.parse_expr()?);
                            }
                        }
                    }
                    if !self.eat_symbol(")") {
                        return Err(parse_error("expected closing ')'"));
                    }
                    if !FUNCTION_ALLOW_LIST.contains(&name) {
                        return Err(ObservedError::new(
                            ErrorKind::SandboxForbiddenNode,
                            format!("function '{name}' is not in the allow-list"),
                        ));
                    }
                    Ok(Node::Call(name.to_string(), args))
                } else {
                    Ok(Node::Ident(name.to_string()))
                }
            }
            Token::Symbol("(") => {
                let inner = self.parse_expr()?;
                if !self.eat_symbol(")") {
                    return Err(parse_error("expected closing ')'"));
                }
                Ok(inner)
            }
            other => Err(parse_error(&format!("unexpected token {other:?}"))),
        }
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

struct Evaluator<'a> {
    ctx: &'a Context,
    deadline: Instant,
    checkpoints: u32,
    /// Comprehension loop variables currently in scope, innermost last —
    /// shadows the Context on lookup so nested comprehensions over the same
    /// name resolve to the nearer binding.
    locals: Vec<(String, Value)>,
}

impl<'a> Evaluator<'a> {
    fn checkpoint(&mut self) -> Result<(), ObservedError> {
        self.checkpoints += 1;
        if self.checkpoints % 8 == 0 && Instant::now() >= self.deadline {
            return Err(ObservedError::new(
                ErrorKind::SandboxTimeout,
                "expression evaluation exceeded its wall-clock budget",
            ));
        }
        Ok(())
    }

    fn eval(&mut self, node: &Node) -> Result<Value, ObservedError> {
        self.checkpoint()?;
        match node {
            Node::Number(n) => Ok(serde_json::json!(n)),
            Node::Str(s) => Ok(Value::String(s.clone())),
            Node::Bool(b) => Ok(Value::Bool(*b)),
            Node::Ident(name) => {
                if let Some((_, value)) = self.locals.iter().rev().find(|(n, _)| n == name) {
                    return Ok(value.clone());
                }
                Ok(self.ctx.get_path(name).cloned().unwrap_or(Value::Null))
            }
            Node::Member(base, field) => {
                let base_val = self.eval(base)?;
                Ok(base_val.get(field).cloned().unwrap_or(Value::Null))
            }
            Node::Index(base, idx) => {
                let base_val = self.eval(base)?;
                let idx_val = self.eval(idx)?;
                let i = idx_val.as_f64().unwrap_or(-1.0) as i64;
                if i < 0 {
                    return Ok(Value::Null);
                }
                Ok(base_val.get(i as usize).cloned().unwrap_or(Value::Null))
            }
            Node::Unary(UnaryOp::Neg, inner) => {
                let v = self.eval(inner)?;
                Ok(serde_json::json!(-as_f64(&v)))
            }
            Node::Unary(UnaryOp::Not, inner) => {
                let v = self.eval(inner)?;
                Ok(Value::Bool(!as_bool(&v)))
            }
            Node::Binary(op, l, r) => self.eval_binary(*op, l, r),
            Node::Call(name, args) => self.eval_call(name, args),
            Node::Comprehension { projection, var, source, predicate } => {
                let source_val = self.eval(source)?;
                let items: Vec<Value> = match source_val {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    self.locals.push((var.clone(), item));
                    let keep = match predicate {
                        Some(pred) => as_bool(&self.eval(pred)?),
                        None => true,
                    };
                    if keep {
                        out.push(self.eval(projection)?);
                    }
                    self.locals.pop();
                }
                Ok(Value::Array(out))
            }
        }
    }

    fn eval_binary(&mut self, op: BinOp, l: &Node, r: &Node) -> Result<Value, ObservedError> {
        match op {
            BinOp::And => {
                let lv = self.eval(l)?;
                if !as_bool(&lv) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool(&self.eval(r)?)))
            }
            BinOp::Or => {
                let lv = self.eval(l)?;
                if as_bool(&lv) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool(&self.eval(r)?)))
            }
            BinOp::Eq => Ok(Value::Bool(self.eval(l)? == self.eval(r)?)),
            BinOp::Ne => Ok(Value::Bool(self.eval(l)? != self.eval(r)?)),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let lv = as_f64(&self.eval(l)?);
                let rv = as_f64(&self.eval(r)?);
                let result = match op {
                    BinOp::Lt => lv < rv,
                    BinOp::Le => lv <= rv,
                    BinOp::Gt => lv > rv,
                    BinOp::Ge => lv >= rv,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                let lv = as_f64(&self.eval(l)?);
                let rv = as_f64(&self.eval(r)?);
                let result = match op {
                    BinOp::Add => lv + rv,
                    BinOp::Sub => lv - rv,
                    BinOp::Mul => lv * rv,
                    BinOp::Div => lv / rv,
                    _ => unreachable!(),
                };
                Ok(serde_json::json!(result))
            }
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Node]) -> Result<Value, ObservedError> {
        let values: Result<Vec<Value>, ObservedError> =
            args.iter().map(|a| self.eval(a)).collect();
        let values = values?;
        match name {
            "len" => {
                let v = values.first().cloned().unwrap_or(Value::Null);
                let n = match &v {
                    Value::Array(a) => a.len(),
                    Value::String(s) => s.chars().count(),
                    Value::Object(m) => m.len(),
                    _ => 0,
                };
                Ok(serde_json::json!(n))
            }
            "abs" => Ok(serde_json::json!(as_f64(values.first().unwrap_or(&Value::Null)).abs())),
            "sum" => Ok(serde_json::json!(numeric_iter(&values).sum::<f64>())),
            "min" => Ok(fold_numeric(&values, f64::min)),
            "max" => Ok(fold_numeric(&values, f64::max)),
            "all" => Ok(Value::Bool(bool_iter(&values).all(|b| b))),
            "any" => Ok(Value::Bool(bool_iter(&values).any(|b| b))),
            _ => Err(ObservedError::new(
                ErrorKind::SandboxForbiddenNode,
                format!("function '{name}' is not in the allow-list"),
            )),
        }
    }
}

/// Allow-list functions accept either one array argument (`sum([1,2,3])`) or
/// a variadic list of scalar arguments (`min(1,2,3)`).
fn numeric_iter(values: &[Value]) -> impl Iterator<Item = f64> + '_ {
    let flattened: Vec<f64> = if values.len() == 1 {
        match &values[0] {
            Value::Array(items) => items.iter().map(as_f64).collect(),
            other => vec![as_f64(other)],
        }
    } else {
        values.iter().map(as_f64).collect()
    };
    flattened.into_iter()
}

fn fold_numeric(values: &[Value], f: impl Fn(f64, f64) -> f64) -> Value {
    let mut iter = numeric_iter(values);
    let first = match iter.next() {
        Some(v) => v,
        None => return Value::Null,
    };
    let result = iter.fold(first, f);
    serde_json::json!(result)
}

fn bool_iter(values: &[Value]) -> std::vec::IntoIter<bool> {
    let flattened: Vec<bool> = if values.len() == 1 {
        match &values[0] {
            Value::Array(items) => items.iter().map(as_bool).collect(),
            other => vec![as_bool(other)],
        }
    } else {
        values.iter().map(as_bool).collect()
    };
    flattened.into_iter()
}

fn as_f64(v: &Value) -> f64 {
    v.as_f64().unwrap_or(0.0)
}

fn as_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Evaluates `expr` against `ctx`, enforcing `timeout` (default 100ms).
pub fn eval_bool(expr: &str, ctx: &Context) -> Result<bool, ObservedError> {
    eval_bool_with_timeout(expr, ctx, DEFAULT_TIMEOUT)
}

pub fn eval_bool_with_timeout(
    expr: &str,
    ctx: &Context,
    timeout: Duration,
) -> Result<bool, ObservedError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser::new(tokens);
    let ast = parser.parse_expr()?;
    if !matches!(parser.peek(), Token::Eof) {
        return Err(parse_error("trailing tokens after expression"));
    }
    let mut evaluator = Evaluator {
        ctx,
        deadline: Instant::now() + timeout,
        checkpoints: 0,
        locals: Vec::new(),
    };
    let result = evaluator.eval(&ast)?;
    Ok(as_bool(&result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextDelta;
    use serde_json::json;

    fn ctx_with(key: &str, value: Value) -> Context {
        let base = Context::initial("r", "i", "c", 0, Value::Null);
        let mut delta = ContextDelta::new();
        delta.insert(key, value);
        base.apply(&delta)
    }

    #[test]
    fn evaluates_comparison() {
        let ctx = ctx_with("payment_status", json!("declined"));
        assert!(eval_bool("payment_status == 'declined'", &ctx).unwrap());
        assert!(!eval_bool("payment_status == 'captured'", &ctx).unwrap());
    }

    #[test]
    fn evaluates_boolean_combinators() {
        let ctx = ctx_with("a", json!(true));
        assert!(eval_bool("a and not false", &ctx).unwrap());
        assert!(eval_bool("false or a", &ctx).unwrap());
    }

    #[test]
    fn evaluates_arithmetic_and_allow_listed_functions() {
        let ctx = ctx_with("items", json!([1, 2, 3]));
        assert!(eval_bool("sum(items) == 6", &ctx).unwrap());
        assert!(eval_bool("len(items) == 3", &ctx).unwrap());
        assert!(eval_bool("max(1, 2, 3) > 2", &ctx).unwrap());
    }

    #[test]
    fn rejects_non_allow_listed_function() {
        let ctx = Context::new();
        let err = eval_bool("eval('1')", &ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SandboxForbiddenNode);
    }

    #[test]
    fn member_and_index_access() {
        let ctx = ctx_with("entry_extra", json!({"list": [10, 20]}));
        assert!(eval_bool("entry_extra.list[1] == 20", &ctx).unwrap());
    }

    #[test]
    fn comprehension_projects_and_filters_a_collection() {
        let ctx = ctx_with(
            "items",
            json!([
                {"ok": true, "price": 10},
                {"ok": false, "price": 5},
                {"ok": true, "price": 7},
            ]),
        );
        assert!(eval_bool("any(x.ok for x in items)", &ctx).unwrap());
        assert!(eval_bool("sum(x.price for x in items if x.ok) == 17", &ctx).unwrap());
        assert!(!eval_bool("all(x.ok for x in items)", &ctx).unwrap());
    }

    #[test]
    fn timeout_breaches_with_sandbox_timeout_kind() {
        let ctx = Context::new();
        let err = eval_bool_with_timeout("1 + 1 == 2", &ctx, Duration::from_nanos(0))
            .err();
        if let Some(e) = err {
            assert_eq!(e.kind, ErrorKind::SandboxTimeout);
        }
    }
}
