// QuectoFlow — Condition expressions
//
// A small, closed expression language for `conditional` and `while_loop`
// steps. Conditions are parsed into an AST when the workflow is loaded and
// evaluated against the run context; nothing is ever handed to a general
// purpose evaluator.
//
// Grammar (lowest precedence first):
//   or      := and ( ("or" | "||") and )*
//   and     := not ( ("and" | "&&") not )*
//   not     := ("not" | "!") not | compare
//   compare := sum ( ("==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "not in") sum )?
//   sum     := product ( ("+" | "-") product )*
//   product := unary ( ("*" | "/" | "%") unary )*
//   unary   := "-" unary | postfix
//   postfix := primary ( "." ident | "[" or "]" | "(" args ")" )*
//   primary := number | string | true | false | null | ident | "(" or ")"

use super::context::Context;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("name '{0}' is not defined")]
    UnknownVariable(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("{name}() takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("unsupported operand types for {op}: {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
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
    NotIn,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(Value),
    Str(String),
    Ident(String),
    Op(&'static str),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(n) => format!("number {}", n),
            Token::Str(s) => format!("string {:?}", s),
            Token::Ident(s) => format!("'{}'", s),
            Token::Op(op) => format!("'{}'", op),
        }
    }
}

const OPERATORS: [&str; 20] = [
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!", "(", ")", "[",
    "]", ".", ",",
];

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let value = if text.contains('.') {
                text.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
            } else {
                text.parse::<i64>().ok().map(Value::from)
            };
            tokens.push(Token::Num(value.ok_or(ExprError::InvalidNumber(text))?));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().map(|(_, c)| c).collect()));
            continue;
        }

        if c == '"' || c == '\'' {
            let mut s = String::new();
            i += 1;
            loop {
                let Some(&(_, ch)) = chars.get(i) else {
                    return Err(ExprError::UnterminatedString(pos));
                };
                i += 1;
                match ch {
                    '\\' => {
                        let Some(&(_, esc)) = chars.get(i) else {
                            return Err(ExprError::UnterminatedString(pos));
                        };
                        i += 1;
                        s.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                    ch if ch == c => break,
                    ch => s.push(ch),
                }
            }
            tokens.push(Token::Str(s));
            continue;
        }

        let rest = &src[pos..];
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token::Op(*op));
                i += op.chars().count();
            }
            None => return Err(ExprError::UnexpectedChar { ch: c, pos }),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Maximum nesting of an expression tree. Parsing and evaluation both
/// recurse on it, so it bounds stack use.
pub const MAX_DEPTH: usize = 128;

/// Parse a condition into an [`Expr`].
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(ExprError::UnexpectedToken {
            expected: "end of expression".into(),
            found: tok.describe(),
        }),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// Account for one more level of tree nesting.
    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn leave(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn expect_op(&mut self, op: &'static str) -> Result<(), ExprError> {
        match self.next() {
            Some(Token::Op(o)) if o == op => Ok(()),
            Some(tok) => Err(ExprError::UnexpectedToken {
                expected: format!("'{}'", op),
                found: tok.describe(),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and()?;
        let mut levels = 0;
        while self.is_word("or") || self.is_op("||") {
            self.pos += 1;
            self.enter()?;
            levels += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.leave(levels);
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.not()?;
        let mut levels = 0;
        while self.is_word("and") || self.is_op("&&") {
            self.pos += 1;
            self.enter()?;
            levels += 1;
            let right = self.not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.leave(levels);
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, ExprError> {
        if self.is_word("not") || self.is_op("!") {
            self.pos += 1;
            self.enter()?;
            let inner = self.not()?;
            self.leave(1);
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ExprError> {
        let left = self.sum()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => BinaryOp::Eq,
            Some(Token::Op("!=")) => BinaryOp::Ne,
            Some(Token::Op("<")) => BinaryOp::Lt,
            Some(Token::Op("<=")) => BinaryOp::Le,
            Some(Token::Op(">")) => BinaryOp::Gt,
            Some(Token::Op(">=")) => BinaryOp::Ge,
            Some(Token::Ident(w)) if w == "in" => BinaryOp::In,
            Some(Token::Ident(w))
                if w == "not" && matches!(self.peek_at(1), Some(Token::Ident(n)) if n == "in") =>
            {
                self.pos += 1;
                BinaryOp::NotIn
            }
            _ => return Ok(left),
        };
        self.pos += 1;
        self.enter()?;
        let right = self.sum()?;
        self.leave(1);
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn sum(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.product()?;
        let mut levels = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinaryOp::Add,
                Some(Token::Op("-")) => BinaryOp::Sub,
                _ => {
                    self.leave(levels);
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.enter()?;
            levels += 1;
            let right = self.product()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn product(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        let mut levels = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinaryOp::Mul,
                Some(Token::Op("/")) => BinaryOp::Div,
                Some(Token::Op("%")) => BinaryOp::Rem,
                _ => {
                    self.leave(levels);
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.enter()?;
            levels += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.is_op("-") {
            self.pos += 1;
            self.enter()?;
            let inner = self.unary()?;
            self.leave(1);
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        let mut levels = 0;
        loop {
            if self.is_op(".") || self.is_op("[") || self.is_op("(") {
                self.enter()?;
                levels += 1;
            }
            if self.is_op(".") {
                self.pos += 1;
                match self.next() {
                    Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                    Some(tok) => {
                        return Err(ExprError::UnexpectedToken {
                            expected: "attribute name".into(),
                            found: tok.describe(),
                        })
                    }
                    None => return Err(ExprError::UnexpectedEnd),
                }
            } else if self.is_op("[") {
                self.pos += 1;
                let index = self.or()?;
                self.expect_op("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.is_op("(") {
                let Expr::Var(name) = expr else {
                    return Err(ExprError::Invalid("only named functions can be called".into()));
                };
                self.pos += 1;
                let mut args = Vec::new();
                if !self.is_op(")") {
                    args.push(self.or()?);
                    while self.is_op(",") {
                        self.pos += 1;
                        args.push(self.or()?);
                    }
                }
                self.expect_op(")")?;
                expr = Expr::Call(name, args);
            } else {
                self.leave(levels);
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(n)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" | "True" => Expr::Literal(Value::Bool(true)),
                "false" | "False" => Expr::Literal(Value::Bool(false)),
                "null" | "None" => Expr::Literal(Value::Null),
                _ => Expr::Var(word),
            }),
            Some(Token::Op("(")) => {
                self.enter()?;
                let inner = self.or()?;
                self.expect_op(")")?;
                self.leave(1);
                Ok(inner)
            }
            Some(tok) => Err(ExprError::UnexpectedToken {
                expected: "a value".into(),
                found: tok.describe(),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// `null`, `false`, zero and empty strings/collections are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn mismatch(op: BinaryOp, left: &Value, right: &Value) -> ExprError {
    ExprError::TypeMismatch {
        op: op.symbol(),
        left: type_name(left),
        right: type_name(right),
    }
}

fn float(value: f64) -> Result<Value, ExprError> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Invalid(format!("{} is not a finite number", value)))
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                let exact = match op {
                    BinaryOp::Add => x.checked_add(y),
                    BinaryOp::Sub => x.checked_sub(y),
                    BinaryOp::Mul => x.checked_mul(y),
                    BinaryOp::Rem if y == 0 => return Err(ExprError::DivisionByZero),
                    BinaryOp::Rem => x.checked_rem(y),
                    _ => None,
                };
                if let Some(n) = exact {
                    return Ok(Value::from(n));
                }
            }
            let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            match op {
                BinaryOp::Add => float(x + y),
                BinaryOp::Sub => float(x - y),
                BinaryOp::Mul => float(x * y),
                BinaryOp::Div | BinaryOp::Rem if y == 0.0 => Err(ExprError::DivisionByZero),
                BinaryOp::Div => float(x / y),
                BinaryOp::Rem => float(x % y),
                _ => Err(mismatch(op, left, right)),
            }
        }
        (Value::String(a), Value::String(b)) if op == BinaryOp::Add => {
            Ok(Value::String(format!("{}{}", a, b)))
        }
        (Value::Array(a), Value::Array(b)) if op == BinaryOp::Add => {
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => Err(mismatch(op, left, right)),
    }
}

fn ordering(op: BinaryOp, left: &Value, right: &Value) -> Result<Ordering, ExprError> {
    let ord = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    ord.ok_or_else(|| mismatch(op, left, right))
}

fn contains(op: BinaryOp, needle: &Value, haystack: &Value) -> Result<bool, ExprError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            _ => Err(mismatch(op, needle, haystack)),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Err(mismatch(op, needle, haystack)),
        },
        _ => Err(mismatch(op, needle, haystack)),
    }
}

fn index(target: &Value, key: &Value) -> Result<Value, ExprError> {
    match (target, key) {
        (Value::Array(items), Value::Number(n)) => {
            let i = n
                .as_i64()
                .ok_or_else(|| ExprError::Invalid(format!("list index must be an integer, got {}", n)))?;
            let len = items.len() as i64;
            let i = if i < 0 { len + i } else { i };
            if (0..len).contains(&i) {
                Ok(items[i as usize].clone())
            } else {
                Err(ExprError::Invalid(format!("list index {} out of range", n)))
            }
        }
        (Value::Object(map), Value::String(k)) => map
            .get(k)
            .cloned()
            .ok_or_else(|| ExprError::Invalid(format!("key '{}' not found", k))),
        _ => Err(ExprError::Invalid(format!(
            "cannot index {} with {}",
            type_name(target),
            type_name(key)
        ))),
    }
}

fn call(name: &str, args: &[Expr], ctx: &Context) -> Result<Value, ExprError> {
    let arity = |expected: usize| {
        if args.len() == expected {
            Ok(())
        } else {
            Err(ExprError::Arity {
                name: name.to_string(),
                expected,
                got: args.len(),
            })
        }
    };

    match name {
        "len" => {
            arity(1)?;
            let value = evaluate(&args[0], ctx)?;
            let n = match &value {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(ExprError::Invalid(format!(
                        "len() of {} is undefined",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::from(n))
        }
        "exists" => {
            arity(1)?;
            let key = match &args[0] {
                Expr::Var(name) => name.clone(),
                other => match evaluate(other, ctx)? {
                    Value::String(s) => s,
                    v => {
                        return Err(ExprError::Invalid(format!(
                            "exists() expects a name, got {}",
                            type_name(&v)
                        )))
                    }
                },
            };
            Ok(Value::Bool(ctx.contains(&key)))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

/// Evaluate an expression against the context.
pub fn evaluate(expr: &Expr, ctx: &Context) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
        Expr::Member(target, field) => match evaluate(target, ctx)? {
            Value::Object(map) => map
                .get(field)
                .cloned()
                .ok_or_else(|| ExprError::Invalid(format!("no attribute '{}'", field))),
            other => Err(ExprError::Invalid(format!(
                "{} has no attribute '{}'",
                type_name(&other),
                field
            ))),
        },
        Expr::Index(target, key) => index(&evaluate(target, ctx)?, &evaluate(key, ctx)?),
        Expr::Call(name, args) => call(name, args, ctx),
        Expr::Neg(inner) => match evaluate(inner, ctx)? {
            Value::Number(n) => match n.as_i64().and_then(i64::checked_neg) {
                Some(i) => Ok(Value::from(i)),
                None => float(-n.as_f64().unwrap_or(0.0)),
            },
            other => Err(ExprError::Invalid(format!(
                "bad operand type for unary -: {}",
                type_name(&other)
            ))),
        },
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&evaluate(inner, ctx)?))),
        Expr::And(left, right) => {
            Ok(Value::Bool(truthy(&evaluate(left, ctx)?) && truthy(&evaluate(right, ctx)?)))
        }
        Expr::Or(left, right) => {
            Ok(Value::Bool(truthy(&evaluate(left, ctx)?) || truthy(&evaluate(right, ctx)?)))
        }
        Expr::Binary(op, left, right) => {
            let l = evaluate(left, ctx)?;
            let r = evaluate(right, ctx)?;
            match op {
                BinaryOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
                BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
                BinaryOp::Lt => Ok(Value::Bool(ordering(*op, &l, &r)?.is_lt())),
                BinaryOp::Le => Ok(Value::Bool(ordering(*op, &l, &r)?.is_le())),
                BinaryOp::Gt => Ok(Value::Bool(ordering(*op, &l, &r)?.is_gt())),
                BinaryOp::Ge => Ok(Value::Bool(ordering(*op, &l, &r)?.is_ge())),
                BinaryOp::In => Ok(Value::Bool(contains(*op, &l, &r)?)),
                BinaryOp::NotIn => Ok(Value::Bool(!contains(*op, &l, &r)?)),
                _ => arithmetic(*op, &l, &r),
            }
        }
    }
}

/// Evaluate an expression and reduce the result to its truth value.
pub fn evaluate_bool(expr: &Expr, ctx: &Context) -> Result<bool, ExprError> {
    evaluate(expr, ctx).map(|v| truthy(&v))
}
