//! Expression sandbox — a restricted AST evaluator for `if`, `fail_if`,
//! `run_js`, and `goto_js`.
//!
//! Identifiers resolve against a fixed scope (`step`, `outputs`,
//! `outputs_raw`, `outputs_history`, `output`, `memory`, `event`). Only a
//! whitelist of pure operations is supported: member access, indexing,
//! comparison, arithmetic, boolean logic, and a handful of builtin
//! methods (`length`, `includes`, `map`, `filter`, string methods). There
//! is no way to reach host globals, perform I/O, or recurse unboundedly —
//! the grammar has no general function definitions, only builtin calls and
//! a single-parameter lambda form (`x => expr`) accepted solely as the
//! argument to `map`/`filter`.

use std::fmt;

use crate::context::ContextView;
use crate::memory::MemoryStore;
use crate::model::{CheckId, OutputValue};

/// Any failure while lexing, parsing, or evaluating an expression. Callers
/// map this to a context-appropriate default (`false` / `[]` / `null`),
/// never propagate it as a hard engine error.
#[derive(Debug, Clone)]
pub struct SandboxError(pub String);

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type SandboxResult<T> = Result<T, SandboxError>;

// ---------------------------------------------------------------- lexer --

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Bang,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    FatArrow,
    Plus,
    Minus,
    Star,
    Slash,
    True,
    False,
    Null,
    Eof,
}

fn lex(src: &str) -> SandboxResult<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else if chars.get(i + 1) == Some(&'>') {
                    tokens.push(Token::FatArrow);
                    i += 2;
                } else {
                    return Err(SandboxError("unexpected '='".into()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::LtEq);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::GtEq);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(SandboxError("unterminated string literal".into()));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| SandboxError(format!("invalid number literal {text}")))?;
                tokens.push(Token::Number(n));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(text),
                });
            }
            other => return Err(SandboxError(format!("unexpected character '{other}'"))),
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

// ----------------------------------------------------------------- ast --

#[derive(Debug, Clone)]
enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    /// `receiver.method(args)`, or a bare `name(args)` when `receiver` is `None`
    Call(Option<Box<Expr>>, String, Vec<Expr>),
    /// `param => body` — only ever parsed as a `map`/`filter` argument
    Lambda(String, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: &Token) -> SandboxResult<()> {
        if self.peek() == want {
            self.advance();
            Ok(())
        } else {
            Err(SandboxError(format!("expected {want:?}, found {:?}", self.peek())))
        }
    }

    fn parse_expr(&mut self) -> SandboxResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> SandboxResult<Expr> {
        let mut lhs = self.parse_and()?;
        while *self.peek() == Token::OrOr {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> SandboxResult<Expr> {
        let mut lhs = self.parse_comparison()?;
        while *self.peek() == Token::AndAnd {
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> SandboxResult<Expr> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Token::EqEq => BinOp::Eq,
            Token::NotEq => BinOp::NotEq,
            Token::Lt => BinOp::Lt,
            Token::LtEq => BinOp::LtEq,
            Token::Gt => BinOp::Gt,
            Token::GtEq => BinOp::GtEq,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_additive(&mut self) -> SandboxResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> SandboxResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> SandboxResult<Expr> {
        match self.peek() {
            Token::Bang => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> SandboxResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        Token::Ident(n) => n,
                        other => return Err(SandboxError(format!("expected identifier after '.', found {other:?}"))),
                    };
                    if *self.peek() == Token::LParen {
                        self.advance();
                        let args = self.parse_args()?;
                        expr = Expr::Call(Some(Box::new(expr)), name, args);
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Token::LParen => {
                    // bare call: only valid directly on an identifier
                    if let Expr::Ident(name) = &expr {
                        let name = name.clone();
                        self.advance();
                        let args = self.parse_args()?;
                        expr = Expr::Call(None, name, args);
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> SandboxResult<Vec<Expr>> {
        let mut args = Vec::new();
        if *self.peek() == Token::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_arg()?);
            match self.peek() {
                Token::Comma => {
                    self.advance();
                }
                Token::RParen => {
                    self.advance();
                    break;
                }
                other => return Err(SandboxError(format!("expected ',' or ')', found {other:?}"))),
            }
        }
        Ok(args)
    }

    /// A call argument, which may be a single-parameter lambda (`x => expr`)
    /// ahead of a plain expression — the only place this grammar allows one.
    fn parse_arg(&mut self) -> SandboxResult<Expr> {
        if let Token::Ident(name) = self.peek().clone() {
            if self.tokens.get(self.pos + 1) == Some(&Token::FatArrow) {
                self.advance();
                self.advance();
                let body = self.parse_expr()?;
                return Ok(Expr::Lambda(name, Box::new(body)));
            }
        }
        self.parse_expr()
    }

    fn parse_primary(&mut self) -> SandboxResult<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Null => Ok(Expr::Null),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(SandboxError(format!("unexpected token {other:?}"))),
        }
    }
}

/// Parse `source` into an expression, ready to [`Expression::eval`] against a [`SandboxScope`].
pub fn parse(source: &str) -> SandboxResult<Expression> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if *parser.peek() != Token::Eof {
        return Err(SandboxError(format!("trailing input at token {:?}", parser.peek())));
    }
    Ok(Expression(expr))
}

/// A parsed, ready-to-evaluate expression
#[derive(Debug, Clone)]
pub struct Expression(Expr);

// ------------------------------------------------------------- values --

/// An intermediate value during evaluation: either a plain [`OutputValue`]
/// or one of the two special namespace objects (`outputs*`, `memory`) that
/// only make sense as the receiver of a member/index/call expression.
#[derive(Clone)]
enum Value {
    Plain(OutputValue),
    OutputsGet,
    OutputsRaw,
    OutputsHistory,
    Memory,
}

impl Value {
    fn into_output(self) -> SandboxResult<OutputValue> {
        match self {
            Value::Plain(v) => Ok(v),
            _ => Err(SandboxError("namespace object used as a value".into())),
        }
    }
}

/// The fixed identifier scope expressions evaluate against.
pub struct SandboxScope<'a> {
    /// `step`: current check id, tags, group
    pub step: OutputValue,
    /// Current check's own output, or `Null` if none yet
    pub output: OutputValue,
    /// Event metadata (`{name, payload}`)
    pub event: OutputValue,
    /// Backing journal view for `outputs` / `outputs_raw` / `outputs_history`
    pub outputs: &'a ContextView,
    /// Backing memory store for `memory.get/has/getAll`
    pub memory: &'a MemoryStore,
    /// Namespace `memory` helpers read/write by default
    pub memory_namespace: &'a str,
}

/// Lambda-parameter bindings layered over a [`SandboxScope`] during `map`/
/// `filter` evaluation; empty outside of a lambda body.
struct EvalScope<'a> {
    scope: &'a SandboxScope<'a>,
    locals: Vec<(String, OutputValue)>,
}

impl<'a> EvalScope<'a> {
    fn root(scope: &'a SandboxScope<'a>) -> Self {
        Self { scope, locals: Vec::new() }
    }

    fn with_local(&self, name: &str, value: OutputValue) -> EvalScope<'_> {
        let mut locals = self.locals.clone();
        locals.push((name.to_string(), value));
        EvalScope { scope: self.scope, locals }
    }

    fn local(&self, name: &str) -> Option<&OutputValue> {
        self.locals.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl Expression {
    /// Evaluate this expression against `scope`, returning an error on any
    /// sandbox violation (caller maps to the context-appropriate default).
    pub fn eval(&self, scope: &SandboxScope<'_>) -> SandboxResult<OutputValue> {
        eval_expr(&self.0, &EvalScope::root(scope))?.into_output()
    }

    /// Convenience for `if` / `fail_if`: evaluate and coerce truthiness,
    /// defaulting to `false` on any sandbox error.
    pub fn eval_bool(&self, scope: &SandboxScope<'_>) -> bool {
        self.eval(scope).map(|v| v.is_truthy()).unwrap_or(false)
    }

    /// Convenience for `run_js`: evaluate and coerce to a list of ids,
    /// defaulting to `[]` on any sandbox error or non-list result.
    pub fn eval_ids(&self, scope: &SandboxScope<'_>) -> Vec<CheckId> {
        match self.eval(scope) {
            Ok(OutputValue::List(items)) => items
                .into_iter()
                .filter_map(|v| match v {
                    OutputValue::String(s) => Some(CheckId::from(s)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Convenience for `goto_js`: evaluate and coerce to a single id,
    /// defaulting to `None` on any sandbox error or non-string result.
    pub fn eval_id(&self, scope: &SandboxScope<'_>) -> Option<CheckId> {
        match self.eval(scope) {
            Ok(OutputValue::String(s)) => Some(CheckId::from(s)),
            _ => None,
        }
    }
}

fn eval_expr(expr: &Expr, es: &EvalScope<'_>) -> SandboxResult<Value> {
    match expr {
        Expr::Null => Ok(Value::Plain(OutputValue::Null)),
        Expr::Bool(b) => Ok(Value::Plain(OutputValue::Bool(*b))),
        Expr::Number(n) => Ok(Value::Plain(OutputValue::Number(*n))),
        Expr::Str(s) => Ok(Value::Plain(OutputValue::String(s.clone()))),
        Expr::Ident(name) => eval_ident(name, es),
        Expr::Member(recv, name) => eval_member(recv, name, es),
        Expr::Index(recv, index) => eval_index(recv, index, es),
        Expr::Call(recv, name, args) => eval_call(recv.as_deref(), name, args, es),
        Expr::Lambda(..) => Err(SandboxError("a lambda may only appear as a map/filter argument".into())),
        Expr::Not(inner) => {
            let v = eval_expr(inner, es)?.into_output()?;
            Ok(Value::Plain(OutputValue::Bool(!v.is_truthy())))
        }
        Expr::Neg(inner) => {
            let v = eval_expr(inner, es)?.into_output()?;
            match v {
                OutputValue::Number(n) => Ok(Value::Plain(OutputValue::Number(-n))),
                _ => Err(SandboxError("unary '-' requires a number".into())),
            }
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, es),
    }
}

fn eval_ident(name: &str, es: &EvalScope<'_>) -> SandboxResult<Value> {
    if let Some(value) = es.local(name) {
        return Ok(Value::Plain(value.clone()));
    }
    match name {
        "step" => Ok(Value::Plain(es.scope.step.clone())),
        "output" => Ok(Value::Plain(es.scope.output.clone())),
        "event" => Ok(Value::Plain(es.scope.event.clone())),
        "outputs" => Ok(Value::OutputsGet),
        "outputs_raw" => Ok(Value::OutputsRaw),
        "outputs_history" => Ok(Value::OutputsHistory),
        "memory" => Ok(Value::Memory),
        other => Err(SandboxError(format!("unknown identifier '{other}'"))),
    }
}

fn eval_member(recv: &Expr, name: &str, es: &EvalScope<'_>) -> SandboxResult<Value> {
    let recv_val = eval_expr(recv, es)?;
    member_lookup(recv_val, name, es)
}

fn member_lookup(recv_val: Value, name: &str, es: &EvalScope<'_>) -> SandboxResult<Value> {
    match recv_val {
        Value::OutputsGet => Ok(Value::Plain(es.scope.outputs.get(&CheckId::from(name)).unwrap_or(OutputValue::Null))),
        Value::OutputsRaw => {
            Ok(Value::Plain(es.scope.outputs.get_raw(&CheckId::from(name)).unwrap_or(OutputValue::Null)))
        }
        Value::OutputsHistory => Ok(Value::Plain(OutputValue::List(
            es.scope
                .outputs
                .get_history(&CheckId::from(name))
                .into_iter()
                .filter_map(|r| r.output)
                .collect(),
        ))),
        Value::Plain(OutputValue::Record(map)) => Ok(Value::Plain(map.get(name).cloned().unwrap_or(OutputValue::Null))),
        Value::Plain(_) => Ok(Value::Plain(OutputValue::Null)),
        Value::Memory => Err(SandboxError("memory has no field access, only method calls".into())),
    }
}

fn eval_index(recv: &Expr, index: &Expr, es: &EvalScope<'_>) -> SandboxResult<Value> {
    let recv_val = eval_expr(recv, es)?;
    let index_val = eval_expr(index, es)?.into_output()?;
    match (&recv_val, &index_val) {
        (Value::OutputsGet | Value::OutputsRaw | Value::OutputsHistory, OutputValue::String(key)) => {
            member_lookup(recv_val, key, es)
        }
        _ => match recv_val {
            Value::Plain(OutputValue::List(items)) => match index_val {
                OutputValue::Number(n) => Ok(Value::Plain(
                    items.get(n as usize).cloned().unwrap_or(OutputValue::Null),
                )),
                _ => Err(SandboxError("list index must be a number".into())),
            },
            Value::Plain(OutputValue::Record(map)) => match index_val {
                OutputValue::String(key) => Ok(Value::Plain(map.get(&key).cloned().unwrap_or(OutputValue::Null))),
                _ => Err(SandboxError("record index must be a string".into())),
            },
            _ => Err(SandboxError("value is not indexable".into())),
        },
    }
}

fn eval_call(recv: Option<&Expr>, name: &str, args: &[Expr], es: &EvalScope<'_>) -> SandboxResult<Value> {
    match recv {
        None => eval_free_call(name, args, es),
        Some(recv_expr) => {
            let recv_val = eval_expr(recv_expr, es)?;
            eval_method_call(recv_val, name, args, es)
        }
    }
}

fn eval_free_call(name: &str, args: &[Expr], es: &EvalScope<'_>) -> SandboxResult<Value> {
    let values: Vec<OutputValue> = args
        .iter()
        .map(|a| eval_expr(a, es).and_then(Value::into_output))
        .collect::<SandboxResult<_>>()?;
    match name {
        "length" => Ok(Value::Plain(OutputValue::Number(length_of(values.first())? as f64))),
        "includes" => {
            let (haystack, needle) = (values.first(), values.get(1));
            Ok(Value::Plain(OutputValue::Bool(includes(haystack, needle))))
        }
        other => Err(SandboxError(format!("unknown function '{other}'"))),
    }
}

fn eval_method_call(recv_val: Value, name: &str, args: &[Expr], es: &EvalScope<'_>) -> SandboxResult<Value> {
    if let Value::Memory = recv_val {
        return eval_memory_call(name, args, es);
    }

    if matches!(name, "map" | "filter") {
        return eval_list_lambda_call(recv_val, name, args, es);
    }

    let receiver = recv_val.into_output()?;
    let values: Vec<OutputValue> = args
        .iter()
        .map(|a| eval_expr(a, es).and_then(Value::into_output))
        .collect::<SandboxResult<_>>()?;

    match (&receiver, name) {
        (_, "length") => Ok(Value::Plain(OutputValue::Number(length_of(Some(&receiver))? as f64))),
        (_, "includes") => Ok(Value::Plain(OutputValue::Bool(includes(Some(&receiver), values.first())))),
        (OutputValue::String(s), "toLowerCase") => Ok(Value::Plain(OutputValue::String(s.to_lowercase()))),
        (OutputValue::String(s), "toUpperCase") => Ok(Value::Plain(OutputValue::String(s.to_uppercase()))),
        (OutputValue::String(s), "trim") => Ok(Value::Plain(OutputValue::String(s.trim().to_string()))),
        (OutputValue::String(s), "startsWith") => match values.first() {
            Some(OutputValue::String(prefix)) => Ok(Value::Plain(OutputValue::Bool(s.starts_with(prefix.as_str())))),
            _ => Err(SandboxError("startsWith expects a string argument".into())),
        },
        (_, other) => Err(SandboxError(format!("unknown method '{other}'"))),
    }
}

/// `list.map(x => expr)` / `list.filter(x => expr)` — the only lambda form
/// this grammar parses, restricted to a single bound parameter evaluated
/// once per element against a scope layering that binding over `es`.
fn eval_list_lambda_call(recv_val: Value, name: &str, args: &[Expr], es: &EvalScope<'_>) -> SandboxResult<Value> {
    let items = match recv_val.into_output()? {
        OutputValue::List(items) => items,
        other => return Err(SandboxError(format!("{name} requires a list receiver, found {other:?}"))),
    };
    let (param, body) = match args {
        [Expr::Lambda(param, body)] => (param.as_str(), body.as_ref()),
        _ => return Err(SandboxError(format!("{name} requires a single lambda argument, e.g. x => x.field"))),
    };
    match name {
        "map" => {
            let mapped = items
                .into_iter()
                .map(|item| eval_expr(body, &es.with_local(param, item)).and_then(Value::into_output))
                .collect::<SandboxResult<Vec<_>>>()?;
            Ok(Value::Plain(OutputValue::List(mapped)))
        }
        "filter" => {
            let mut kept = Vec::new();
            for item in items {
                let keep = eval_expr(body, &es.with_local(param, item.clone()))?.into_output()?.is_truthy();
                if keep {
                    kept.push(item);
                }
            }
            Ok(Value::Plain(OutputValue::List(kept)))
        }
        _ => unreachable!("eval_method_call only routes map/filter here"),
    }
}

fn eval_memory_call(name: &str, args: &[Expr], es: &EvalScope<'_>) -> SandboxResult<Value> {
    let values: Vec<OutputValue> = args
        .iter()
        .map(|a| eval_expr(a, es).and_then(Value::into_output))
        .collect::<SandboxResult<_>>()?;
    let key = match values.first() {
        Some(OutputValue::String(s)) => s.clone(),
        _ => return Err(SandboxError(format!("memory.{name} requires a string key argument"))),
    };
    match name {
        "get" => Ok(Value::Plain(
            es.scope
                .memory
                .get(es.scope.memory_namespace, &key)
                .unwrap_or(OutputValue::Null),
        )),
        "has" => Ok(Value::Plain(OutputValue::Bool(
            es.scope.memory.has(es.scope.memory_namespace, &key),
        ))),
        "getAll" => Ok(Value::Plain(OutputValue::Record(
            es.scope.memory.list(es.scope.memory_namespace).into_iter().collect(),
        ))),
        other => Err(SandboxError(format!("unknown memory method '{other}'"))),
    }
}

fn length_of(value: Option<&OutputValue>) -> SandboxResult<usize> {
    match value {
        Some(OutputValue::List(items)) => Ok(items.len()),
        Some(OutputValue::String(s)) => Ok(s.chars().count()),
        Some(OutputValue::Record(map)) => Ok(map.len()),
        Some(OutputValue::Null) | None => Ok(0),
        _ => Err(SandboxError("length() requires a list, string, or record".into())),
    }
}

fn includes(haystack: Option<&OutputValue>, needle: Option<&OutputValue>) -> bool {
    match (haystack, needle) {
        (Some(OutputValue::List(items)), Some(n)) => items.contains(n),
        (Some(OutputValue::String(s)), Some(OutputValue::String(n))) => s.contains(n.as_str()),
        _ => false,
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, es: &EvalScope<'_>) -> SandboxResult<Value> {
    match op {
        BinOp::And => {
            let l = eval_expr(lhs, es)?.into_output()?;
            if !l.is_truthy() {
                return Ok(Value::Plain(OutputValue::Bool(false)));
            }
            let r = eval_expr(rhs, es)?.into_output()?;
            Ok(Value::Plain(OutputValue::Bool(r.is_truthy())))
        }
        BinOp::Or => {
            let l = eval_expr(lhs, es)?.into_output()?;
            if l.is_truthy() {
                return Ok(Value::Plain(OutputValue::Bool(true)));
            }
            let r = eval_expr(rhs, es)?.into_output()?;
            Ok(Value::Plain(OutputValue::Bool(r.is_truthy())))
        }
        BinOp::Eq | BinOp::NotEq => {
            let l = eval_expr(lhs, es)?.into_output()?;
            let r = eval_expr(rhs, es)?.into_output()?;
            let eq = values_equal(&l, &r);
            Ok(Value::Plain(OutputValue::Bool(if matches!(op, BinOp::Eq) { eq } else { !eq })))
        }
        BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
            let l = eval_expr(lhs, es)?.into_output()?;
            let r = eval_expr(rhs, es)?.into_output()?;
            let (ln, rn) = match (&l, &r) {
                (OutputValue::Number(a), OutputValue::Number(b)) => (*a, *b),
                _ => return Err(SandboxError("comparison requires two numbers".into())),
            };
            let result = match op {
                BinOp::Lt => ln < rn,
                BinOp::LtEq => ln <= rn,
                BinOp::Gt => ln > rn,
                BinOp::GtEq => ln >= rn,
                _ => unreachable!(),
            };
            Ok(Value::Plain(OutputValue::Bool(result)))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let l = eval_expr(lhs, es)?.into_output()?;
            let r = eval_expr(rhs, es)?.into_output()?;
            if let (OutputValue::String(a), OutputValue::String(b)) = (&l, &r) {
                if matches!(op, BinOp::Add) {
                    return Ok(Value::Plain(OutputValue::String(format!("{a}{b}"))));
                }
            }
            let (ln, rn) = match (&l, &r) {
                (OutputValue::Number(a), OutputValue::Number(b)) => (*a, *b),
                _ => return Err(SandboxError("arithmetic requires two numbers".into())),
            };
            let result = match op {
                BinOp::Add => ln + rn,
                BinOp::Sub => ln - rn,
                BinOp::Mul => ln * rn,
                BinOp::Div => {
                    if rn == 0.0 {
                        return Err(SandboxError("division by zero".into()));
                    }
                    ln / rn
                }
                _ => unreachable!(),
            };
            Ok(Value::Plain(OutputValue::Number(result)))
        }
    }
}

fn values_equal(a: &OutputValue, b: &OutputValue) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{Journal, Snapshot};
    use crate::memory::MemoryStore;
    use crate::model::ScopePath;
    use std::sync::Arc;

    fn scope<'a>(outputs: &'a ContextView, memory: &'a MemoryStore) -> SandboxScope<'a> {
        SandboxScope {
            step: OutputValue::Null,
            output: OutputValue::Null,
            event: OutputValue::Null,
            outputs,
            memory,
            memory_namespace: "default",
        }
    }

    #[test]
    fn member_access_on_output_dot_field() {
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let memory = MemoryStore::in_memory();
        let view = ContextView::new(
            journal,
            Snapshot {
                cutoff: 0,
                scope: ScopePath::root(),
                event: None,
            },
        );
        let mut s = scope(&view, &memory);
        s.output = OutputValue::Record(
            [("error".to_string(), OutputValue::String("Missing".into()))]
                .into_iter()
                .collect(),
        );
        let expr = parse("output.error").unwrap();
        assert_eq!(expr.eval(&s).unwrap(), OutputValue::String("Missing".into()));
        assert!(parse("output.error").unwrap().eval_bool(&s));
    }

    #[test]
    fn comparison_and_boolean_logic() {
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let memory = MemoryStore::in_memory();
        let view = ContextView::new(
            journal,
            Snapshot {
                cutoff: 0,
                scope: ScopePath::root(),
                event: None,
            },
        );
        let s = scope(&view, &memory);
        assert!(parse("1 < 2 && 3 >= 3").unwrap().eval_bool(&s));
        assert!(!parse("1 == 2 || 4 < 3").unwrap().eval_bool(&s));
    }

    #[test]
    fn run_js_coerces_list_of_ids() {
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let memory = MemoryStore::in_memory();
        let view = ContextView::new(
            journal,
            Snapshot {
                cutoff: 0,
                scope: ScopePath::root(),
                event: None,
            },
        );
        let s = scope(&view, &memory);
        memory.set("default", "k", OutputValue::String("v".into()));
        let expr = parse("memory.has(\"k\")").unwrap();
        assert!(expr.eval_bool(&s));
    }

    #[test]
    fn sandbox_error_maps_to_safe_default() {
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let memory = MemoryStore::in_memory();
        let view = ContextView::new(
            journal,
            Snapshot {
                cutoff: 0,
                scope: ScopePath::root(),
                event: None,
            },
        );
        let s = scope(&view, &memory);
        let expr = parse("nonexistent_identifier").unwrap();
        assert!(!expr.eval_bool(&s));
        assert!(expr.eval_ids(&s).is_empty());
        assert!(expr.eval_id(&s).is_none());
    }

    #[test]
    fn map_applies_a_lambda_to_every_element() {
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let memory = MemoryStore::in_memory();
        let view = ContextView::new(
            journal,
            Snapshot {
                cutoff: 0,
                scope: ScopePath::root(),
                event: None,
            },
        );
        let mut s = scope(&view, &memory);
        s.output = OutputValue::List(vec![OutputValue::Number(1.0), OutputValue::Number(2.0), OutputValue::Number(3.0)]);
        let expr = parse("output.map(x => x * 2)").unwrap();
        assert_eq!(
            expr.eval(&s).unwrap(),
            OutputValue::List(vec![OutputValue::Number(2.0), OutputValue::Number(4.0), OutputValue::Number(6.0)])
        );
    }

    #[test]
    fn filter_keeps_only_elements_where_the_lambda_is_truthy() {
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let memory = MemoryStore::in_memory();
        let view = ContextView::new(
            journal,
            Snapshot {
                cutoff: 0,
                scope: ScopePath::root(),
                event: None,
            },
        );
        let mut s = scope(&view, &memory);
        s.output = OutputValue::List(vec![OutputValue::Number(1.0), OutputValue::Number(2.0), OutputValue::Number(3.0)]);
        let expr = parse("output.filter(x => x >= 2)").unwrap();
        assert_eq!(
            expr.eval(&s).unwrap(),
            OutputValue::List(vec![OutputValue::Number(2.0), OutputValue::Number(3.0)])
        );
    }

    #[test]
    fn a_lambda_outside_map_or_filter_is_a_sandbox_error() {
        let journal = Arc::new(Journal::new(uuid::Uuid::new_v4()));
        let memory = MemoryStore::in_memory();
        let view = ContextView::new(
            journal,
            Snapshot {
                cutoff: 0,
                scope: ScopePath::root(),
                event: None,
            },
        );
        let s = scope(&view, &memory);
        let expr = parse("length(x => x)").unwrap();
        assert!(expr.eval(&s).is_err());
    }
}
