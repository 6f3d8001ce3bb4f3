//! Sandboxed scoring expressions.
//!
//! A deliberately small language: literals, participant variables,
//! arithmetic, comparison, boolean logic, a ternary, and a fixed set of
//! numeric functions. There is no assignment, no loops and no access to
//! anything outside the variable environment handed to [`Expr::evaluate`].

use std::collections::BTreeMap;

use thiserror::Error;

use super::formula::FormulaError;
use crate::types::MetricValue;

const MAX_SOURCE_LEN: usize = 1024;
const MAX_DEPTH: usize = 32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("unknown variable {0}")]
    UnknownVariable(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(&'static str),
    #[error("division by zero")]
    DivisionByZero,
    #[error("non-finite result")]
    NonFinite,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Question,
    Colon,
}

fn syntax(position: usize, message: impl Into<String>) -> FormulaError {
    FormulaError::Expression {
        position,
        message: message.into(),
    }
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, FormulaError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let peek = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two = |expected: char, token: Token| -> Option<Token> {
            (peek == Some(expected)).then_some(token)
        };

        let (token, width) = match c {
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '*' => (Token::Star, 1),
            '/' => (Token::Slash, 1),
            '%' => (Token::Percent, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            ',' => (Token::Comma, 1),
            '?' => (Token::Question, 1),
            ':' => (Token::Colon, 1),
            '!' => match two('=', Token::NotEq) {
                Some(token) => (token, 2),
                None => (Token::Bang, 1),
            },
            '<' => match two('=', Token::Le) {
                Some(token) => (token, 2),
                None => (Token::Lt, 1),
            },
            '>' => match two('=', Token::Ge) {
                Some(token) => (token, 2),
                None => (Token::Gt, 1),
            },
            '=' => match two('=', Token::EqEq) {
                Some(token) => (token, 2),
                None => return Err(syntax(pos, "expected '=='")),
            },
            '&' => match two('&', Token::AndAnd) {
                Some(token) => (token, 2),
                None => return Err(syntax(pos, "expected '&&'")),
            },
            '|' => match two('|', Token::OrOr) {
                Some(token) => (token, 2),
                None => return Err(syntax(pos, "expected '||'")),
            },
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let (_, ch) = chars[j];
                    if ch == '\\' {
                        match chars.get(j + 1) {
                            Some((_, escaped)) => value.push(*escaped),
                            None => break,
                        }
                        j += 2;
                        continue;
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                    j += 1;
                }
                if !closed {
                    return Err(syntax(pos, "unterminated string"));
                }
                tokens.push((Token::Str(value), pos));
                i = j + 1;
                continue;
            }
            c if c.is_ascii_digit() || (c == '.' && peek.is_some_and(|p| p.is_ascii_digit())) => {
                let mut j = i;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    j += 1;
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(src.len());
                let literal = &src[pos..end];
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| syntax(pos, format!("invalid number {literal}")))?;
                tokens.push((Token::Num(value), pos));
                i = j;
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while j < chars.len()
                    && (chars[j].1.is_ascii_alphanumeric()
                        || chars[j].1 == '_'
                        || chars[j].1 == '.')
                {
                    j += 1;
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(src.len());
                let token = match &src[pos..end] {
                    "true" => Token::True,
                    "false" => Token::False,
                    ident => Token::Ident(ident.to_string()),
                };
                tokens.push((token, pos));
                i = j;
                continue;
            }
            other => return Err(syntax(pos, format!("unexpected character '{other}'"))),
        };

        tokens.push((token, pos));
        i += width;
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Min,
    Max,
    Abs,
    Sqrt,
    Log,
    Pow,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "abs" => Some(Self::Abs),
            "sqrt" => Some(Self::Sqrt),
            "log" => Some(Self::Log),
            "pow" => Some(Self::Pow),
            _ => None,
        }
    }

    fn accepts(&self, arity: usize) -> bool {
        match self {
            Self::Min | Self::Max => arity >= 1,
            Self::Abs | Self::Sqrt | Self::Log => arity == 1,
            Self::Pow => arity == 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
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
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Node {
    Num(f64),
    Str(String),
    Bool(bool),
    Var(String),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    cursor: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(token, _)| token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map(|(_, pos)| *pos)
            .unwrap_or(self.end)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), FormulaError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(syntax(self.position(), format!("expected {what}")))
        }
    }

    fn descend(&mut self) -> Result<(), FormulaError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(syntax(self.position(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Node, FormulaError> {
        self.descend()?;
        let condition = self.binary(0)?;
        let node = if self.eat(&Token::Question) {
            let then = self.expression()?;
            self.expect(&Token::Colon, "':'")?;
            let otherwise = self.expression()?;
            Node::Ternary(Box::new(condition), Box::new(then), Box::new(otherwise))
        } else {
            condition
        };
        self.depth -= 1;
        Ok(node)
    }

    /// Precedence climbing over the binary operator levels.
    fn binary(&mut self, level: usize) -> Result<Node, FormulaError> {
        const LEVELS: usize = 6;
        if level == LEVELS {
            return self.unary();
        }

        let mut lhs = self.binary(level + 1)?;
        while let Some(op) = self.peek().and_then(|token| binary_op(token, level)) {
            self.cursor += 1;
            let rhs = self.binary(level + 1)?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node, FormulaError> {
        if self.eat(&Token::Bang) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Node::Not(Box::new(inner)));
        }
        if self.eat(&Token::Minus) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Node::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node, FormulaError> {
        let position = self.position();
        let Some((token, _)) = self.tokens.get(self.cursor).cloned() else {
            return Err(syntax(position, "unexpected end of expression"));
        };
        self.cursor += 1;

        match token {
            Token::Num(value) => Ok(Node::Num(value)),
            Token::Str(value) => Ok(Node::Str(value)),
            Token::True => Ok(Node::Bool(true)),
            Token::False => Ok(Node::Bool(false)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if !self.eat(&Token::LParen) {
                    return Ok(Node::Var(name));
                }
                let func = Func::lookup(&name)
                    .ok_or_else(|| syntax(position, format!("unknown function {name}")))?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RParen, "')'")?;
                        break;
                    }
                }
                if !func.accepts(args.len()) {
                    return Err(syntax(
                        position,
                        format!("wrong number of arguments to {name}"),
                    ));
                }
                Ok(Node::Call(func, args))
            }
            _ => Err(syntax(position, "unexpected token")),
        }
    }
}

fn binary_op(token: &Token, level: usize) -> Option<BinaryOp> {
    let op = match (level, token) {
        (0, Token::OrOr) => BinaryOp::Or,
        (1, Token::AndAnd) => BinaryOp::And,
        (2, Token::EqEq) => BinaryOp::Eq,
        (2, Token::NotEq) => BinaryOp::Ne,
        (3, Token::Lt) => BinaryOp::Lt,
        (3, Token::Le) => BinaryOp::Le,
        (3, Token::Gt) => BinaryOp::Gt,
        (3, Token::Ge) => BinaryOp::Ge,
        (4, Token::Plus) => BinaryOp::Add,
        (4, Token::Minus) => BinaryOp::Sub,
        (5, Token::Star) => BinaryOp::Mul,
        (5, Token::Slash) => BinaryOp::Div,
        (5, Token::Percent) => BinaryOp::Rem,
        _ => return None,
    };
    Some(op)
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Num(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    fn num(self) -> Result<f64, EvalError> {
        match self {
            Self::Num(n) => Ok(n),
            _ => Err(EvalError::TypeMismatch("expected a number")),
        }
    }

    fn bool(self) -> Result<bool, EvalError> {
        match self {
            Self::Bool(b) => Ok(b),
            _ => Err(EvalError::TypeMismatch("expected a boolean")),
        }
    }
}

impl From<&MetricValue> for Value {
    fn from(metric: &MetricValue) -> Self {
        match metric {
            MetricValue::Number(n) => Self::Num(*n),
            MetricValue::Text(s) => Self::Str(s.clone()),
            MetricValue::Bool(b) => Self::Bool(*b),
        }
    }
}

/// A compiled scoring expression.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    pub fn compile(source: &str) -> Result<Self, FormulaError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(FormulaError::Empty);
        }
        if source.len() > MAX_SOURCE_LEN {
            return Err(syntax(MAX_SOURCE_LEN, "expression too long"));
        }

        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            cursor: 0,
            depth: 0,
            end: source.len(),
        };
        let root = parser.expression()?;
        if parser.cursor != parser.tokens.len() {
            return Err(syntax(parser.position(), "unexpected trailing input"));
        }

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Scores one participant. Booleans score 1 or 0.
    pub fn evaluate(&self, vars: &BTreeMap<String, MetricValue>) -> Result<f64, EvalError> {
        let score = match eval(&self.root, vars)? {
            Value::Num(n) => n,
            Value::Bool(b) => f64::from(u8::from(b)),
            Value::Str(_) => return Err(EvalError::TypeMismatch("score must be numeric")),
        };
        if score.is_finite() {
            Ok(score)
        } else {
            Err(EvalError::NonFinite)
        }
    }
}

fn eval(node: &Node, vars: &BTreeMap<String, MetricValue>) -> Result<Value, EvalError> {
    match node {
        Node::Num(n) => Ok(Value::Num(*n)),
        Node::Str(s) => Ok(Value::Str(s.clone())),
        Node::Bool(b) => Ok(Value::Bool(*b)),
        Node::Var(name) => vars
            .get(name)
            .map(Value::from)
            .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
        Node::Neg(inner) => Ok(Value::Num(-eval(inner, vars)?.num()?)),
        Node::Not(inner) => Ok(Value::Bool(!eval(inner, vars)?.bool()?)),
        Node::Ternary(condition, then, otherwise) => {
            if eval(condition, vars)?.bool()? {
                eval(then, vars)
            } else {
                eval(otherwise, vars)
            }
        }
        Node::Binary(BinaryOp::And, lhs, rhs) => {
            if !eval(lhs, vars)?.bool()? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(rhs, vars)?.bool()?))
        }
        Node::Binary(BinaryOp::Or, lhs, rhs) => {
            if eval(lhs, vars)?.bool()? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(rhs, vars)?.bool()?))
        }
        Node::Binary(op, lhs, rhs) => binary(*op, eval(lhs, vars)?, eval(rhs, vars)?),
        Node::Call(func, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, vars)?.num()?);
            }
            call(*func, &values)
        }
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    use std::cmp::Ordering;

    let ordering = |lhs: &Value, rhs: &Value| -> Result<Option<Ordering>, EvalError> {
        match (lhs, rhs) {
            (Value::Num(a), Value::Num(b)) => Ok(a.partial_cmp(b)),
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::Bool(a), Value::Bool(b)) => Ok(Some(a.cmp(b))),
            _ => Err(EvalError::TypeMismatch("cannot compare different types")),
        }
    };

    let value = match op {
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
            (lhs, rhs) => Value::Num(lhs.num()? + rhs.num()?),
        },
        BinaryOp::Sub => Value::Num(lhs.num()? - rhs.num()?),
        BinaryOp::Mul => Value::Num(lhs.num()? * rhs.num()?),
        BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = (lhs.num()?, rhs.num()?);
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Value::Num(if op == BinaryOp::Div { a / b } else { a % b })
        }
        BinaryOp::Eq => Value::Bool(ordering(&lhs, &rhs)? == Some(Ordering::Equal)),
        BinaryOp::Ne => Value::Bool(ordering(&lhs, &rhs)? != Some(Ordering::Equal)),
        BinaryOp::Lt => Value::Bool(ordering(&lhs, &rhs)? == Some(Ordering::Less)),
        BinaryOp::Le => Value::Bool(matches!(
            ordering(&lhs, &rhs)?,
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Gt => Value::Bool(ordering(&lhs, &rhs)? == Some(Ordering::Greater)),
        BinaryOp::Ge => Value::Bool(matches!(
            ordering(&lhs, &rhs)?,
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::And => Value::Bool(lhs.bool()? && rhs.bool()?),
        BinaryOp::Or => Value::Bool(lhs.bool()? || rhs.bool()?),
    };
    Ok(value)
}

fn call(func: Func, args: &[f64]) -> Result<Value, EvalError> {
    let value = match (func, args) {
        (Func::Min, _) => args.iter().copied().fold(f64::INFINITY, f64::min),
        (Func::Max, _) => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        (Func::Abs, [x]) => x.abs(),
        (Func::Sqrt, [x]) => x.sqrt(),
        (Func::Log, [x]) => x.ln(),
        (Func::Pow, [base, exp]) => base.powf(*exp),
        _ => return Err(EvalError::TypeMismatch("wrong number of arguments")),
    };
    Ok(Value::Num(value))
}
