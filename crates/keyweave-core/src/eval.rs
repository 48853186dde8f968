//! Restricted expression evaluator for declarations and conditions.
//!
//! Expressions are parsed against a closed grammar; there is no way to reach
//! arbitrary code from a script. Anything outside the grammar fails with
//! [`EvalError::InvalidExpression`].
//!
//! Operator precedence (lowest → highest):
//!   or  →  and  →  not  →  comparison (chainable)  →
//!   additive  →  multiplicative  →  unary minus  →  primary
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use keyweave_core::eval::{evaluate, Value};
//!
//! let mut env = HashMap::new();
//! env.insert("$x".to_string(), Value::from(4));
//!
//! assert_eq!(evaluate("$x * 2 + 1", &env).unwrap(), Value::from(9));
//! assert!(evaluate("1 < $x <= 4", &env).unwrap().is_truthy());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A script value.
///
/// Numbers are always `f64`; integral numbers display without a fractional
/// part so that `3` substitutes back into command text as `3`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

impl Value {
    /// Numeric view of the value.
    ///
    /// Strings that parse as numbers are coerced, which is what lets the
    /// string-typed loop counter `$i` take part in arithmetic.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) if a == b => true,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Errors produced while parsing or evaluating an expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("invalid expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("unsupported operand types for '{op}': {left} and {right}")]
    UnsupportedOperand {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
}

/// Variable lookup used by [`evaluate`].
pub trait Environment {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Environment for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl Environment for BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Parse and evaluate `expression` against `env`.
///
/// Identifiers missing from `env` evaluate to `0`.
pub fn evaluate<E: Environment + ?Sized>(expression: &str, env: &E) -> Result<Value, EvalError> {
    let invalid = |reason: String| EvalError::InvalidExpression {
        expression: expression.trim().to_string(),
        reason,
    };

    let tokens = Lexer::new(expression).tokenize().map_err(invalid)?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse().map_err(invalid)?;
    eval_expr(&expr, env)
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    And,
    Or,
    Not,
    Eof,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            chars: src.chars().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        while let Some(&ch) = self.chars.peek() {
            match ch {
                ' ' | '\t' | '\r' | '\n' => {
                    self.chars.next();
                }
                '0'..='9' | '.' => tokens.push(self.read_number()?),
                '"' | '\'' => tokens.push(self.read_string(ch)?),
                '$' | '@' => {
                    self.chars.next();
                    let rest = self.read_ident_tail();
                    if rest.is_empty() {
                        return Err(format!("'{}' must be followed by a variable name", ch));
                    }
                    tokens.push(Token::Ident(format!("{}{}", ch, rest)));
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let word = self.read_ident_tail();
                    tokens.push(match word.as_str() {
                        "and" => Token::And,
                        "or" => Token::Or,
                        "not" => Token::Not,
                        _ => Token::Ident(word),
                    });
                }
                _ => tokens.push(self.read_operator()?),
            }
        }
        tokens.push(Token::Eof);
        Ok(tokens)
    }

    fn read_ident_tail(&mut self) -> String {
        let mut s = String::new();
        while let Some(&c) = self.chars.peek() {
            if !is_ident_char(c) {
                break;
            }
            s.push(c);
            self.chars.next();
        }
        s
    }

    fn read_number(&mut self) -> Result<Token, String> {
        let mut s = String::new();
        let mut seen_dot = false;
        while let Some(&c) = self.chars.peek() {
            match c {
                '0'..='9' => s.push(c),
                '.' if !seen_dot => {
                    seen_dot = true;
                    s.push(c);
                }
                _ => break,
            }
            self.chars.next();
        }
        s.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| format!("malformed number '{}'", s))
    }

    fn read_string(&mut self, quote: char) -> Result<Token, String> {
        self.chars.next();
        let mut s = String::new();
        loop {
            match self.chars.next() {
                None => return Err("unterminated string literal".into()),
                Some(c) if c == quote => return Ok(Token::Str(s)),
                Some('\\') => match self.chars.next() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(other) => s.push(other),
                    None => return Err("unterminated string literal".into()),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn read_operator(&mut self) -> Result<Token, String> {
        let ch = self.chars.next().unwrap_or_default();
        let next = self.chars.peek().copied();
        let mut eat = |expected: char| {
            if next == Some(expected) {
                self.chars.next();
                true
            } else {
                false
            }
        };
        let tok = match ch {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' if eat('*') => return Err("operator '**' is not supported".into()),
            '*' => Token::Star,
            '/' if eat('/') => return Err("operator '//' is not supported".into()),
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '=' if eat('=') => Token::Eq,
            '=' => return Err("assignment is not supported in expressions".into()),
            '!' if eat('=') => Token::Ne,
            '<' if eat('=') => Token::Le,
            '<' if eat('<') => return Err("operator '<<' is not supported".into()),
            '<' => Token::Lt,
            '>' if eat('=') => Token::Ge,
            '>' if eat('>') => return Err("operator '>>' is not supported".into()),
            '>' => Token::Gt,
            other => return Err(format!("unsupported character '{}'", other)),
        };
        Ok(tok)
    }
}

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    All(Vec<Expr>),
    Any(Vec<Expr>),
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse(&mut self) -> Result<Expr, String> {
        if self.peek() == &Token::Eof {
            return Err("empty expression".into());
        }
        let expr = self.parse_or()?;
        match self.peek() {
            Token::Eof => Ok(expr),
            other => Err(format!("unexpected token {:?}", other)),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let first = self.parse_and()?;
        if self.peek() != &Token::Or {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::Or) {
            operands.push(self.parse_and()?);
        }
        Ok(Expr::Any(operands))
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let first = self.parse_not()?;
        if self.peek() != &Token::And {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::And) {
            operands.push(self.parse_not()?);
        }
        Ok(Expr::All(operands))
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.parse_additive()?;
        let mut chain = Vec::new();
        loop {
            let op = match self.peek() {
                Token::Eq => CmpOp::Eq,
                Token::Ne => CmpOp::Ne,
                Token::Lt => CmpOp::Lt,
                Token::Le => CmpOp::Le,
                Token::Gt => CmpOp::Gt,
                Token::Ge => CmpOp::Ge,
                _ => break,
            };
            self.advance();
            chain.push((op, self.parse_additive()?));
        }
        if chain.is_empty() {
            Ok(lhs)
        } else {
            Ok(Expr::Compare(Box::new(lhs), chain))
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
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

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        if self.eat(&Token::Plus) {
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Ident(name) => {
                if self.peek() == &Token::LParen {
                    return Err(format!("function call '{}(...)' is not supported", name));
                }
                match name.as_str() {
                    "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                    _ => Ok(Expr::Var(name)),
                }
            }
            Token::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err("expected ')'".into());
                }
                Ok(inner)
            }
            Token::Eof => Err("unexpected end of expression".into()),
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

fn eval_expr<E: Environment + ?Sized>(expr: &Expr, env: &E) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => Ok(env.lookup(name).unwrap_or(Value::Number(0.0))),
        Expr::Neg(inner) => {
            let v = eval_expr(inner, env)?;
            v.as_number()
                .map(|n| Value::Number(-n))
                .ok_or(EvalError::UnsupportedOperand {
                    op: "-",
                    left: v.type_name(),
                    right: v.type_name(),
                })
        }
        Expr::Not(inner) => Ok(Value::Bool(!eval_expr(inner, env)?.is_truthy())),
        Expr::Binary(op, lhs, rhs) => {
            let l = eval_expr(lhs, env)?;
            let r = eval_expr(rhs, env)?;
            arithmetic(*op, &l, &r)
        }
        Expr::Compare(first, chain) => {
            let mut left = eval_expr(first, env)?;
            for (op, operand) in chain {
                let right = eval_expr(operand, env)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::All(operands) => {
            let values = operands
                .iter()
                .map(|e| eval_expr(e, env))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Bool(values.iter().all(Value::is_truthy)))
        }
        Expr::Any(operands) => {
            let values = operands
                .iter()
                .map(|e| eval_expr(e, env))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Bool(values.iter().any(Value::is_truthy)))
        }
    }
}

fn arithmetic(op: BinOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    let unsupported = || EvalError::UnsupportedOperand {
        op: op.symbol(),
        left: l.type_name(),
        right: r.type_name(),
    };

    let (a, b) = match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            // Non-numeric strings only support concatenation.
            if let BinOp::Add = op {
                if matches!(l, Value::Str(_)) || matches!(r, Value::Str(_)) {
                    return Ok(Value::Str(format!("{}{}", l, r)));
                }
            }
            return Err(unsupported());
        }
    };

    let n = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a / b
        }
        BinOp::Rem => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a % b
        }
    };
    Ok(Value::Number(n))
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => return Ok(l == r),
        CmpOp::Ne => return Ok(l != r),
        _ => {}
    }

    let ordering = match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (l, r) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        },
    };
    let symbol = match op {
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Gt => ">",
        _ => ">=",
    };
    let ordering = ordering.ok_or(EvalError::UnsupportedOperand {
        op: symbol,
        left: l.type_name(),
        right: r.type_name(),
    })?;

    Ok(match op {
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}
