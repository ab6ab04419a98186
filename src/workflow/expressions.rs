//! Expression evaluation for `${path.to.value}` placeholders
//!
//! Supports:
//! - ${inputs.NAME}
//! - ${steps.STEP_ID.OUTPUT}
//! - ${outputs.NAME}
//! - ${context.NAME} (ambient values, loop `item`/`index`, set-variable)
//!
//! A string that is exactly one placeholder resolves to the native value;
//! placeholders embedded in text are stringified and interpolated.
//!
//! Conditions accept comparisons (`eq ne gt lt gte lte in not_in`, or
//! `== != > < >= <=`), boolean operators (`and or not`, `&& || !`),
//! arithmetic (`+ - * / %`), parentheses, list literals, quoted strings,
//! numbers, `true`/`false`/`null`, and bare words (read as strings).
//! Arithmetic and comparison operators must be separated by whitespace
//! from placeholder operands, e.g. `${inputs.COUNT} * 2 gt 5`.

use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::LazyLock;

use super::context::ExecutionContext;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\s*([^}]*?)\s*\}").expect("placeholder regex"));

static PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*(\.[A-Za-z0-9_-]+)*$").expect("path regex")
});

/// Errors that can occur during expression evaluation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Unresolved reference: ${{{0}}}")]
    Unresolved(String),

    #[error("Invalid expression syntax: {0}")]
    Parse(String),

    #[error("Cannot evaluate expression: {0}")]
    Evaluation(String),
}

/// True if the string contains at least one placeholder
pub fn has_placeholders(input: &str) -> bool {
    PLACEHOLDER_REGEX.is_match(input)
}

/// Resolve a string, preserving the native type of a lone placeholder
pub fn resolve(input: &str, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
    if let Some(path) = sole_placeholder(input) {
        return lookup(path, ctx);
    }
    interpolate(input, ctx).map(Value::String)
}

/// Resolve a string and always return text
pub fn resolve_string(input: &str, ctx: &ExecutionContext) -> Result<String, ExpressionError> {
    resolve(input, ctx).map(|v| stringify(&v))
}

/// Resolve placeholders inside any value, recursing into lists and mappings
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => resolve(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_map(map, ctx).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve every value of a parameter mapping
pub fn resolve_map(
    params: &Map<String, Value>,
    ctx: &ExecutionContext,
) -> Result<Map<String, Value>, ExpressionError> {
    let mut result = Map::new();
    for (key, value) in params {
        result.insert(key.clone(), resolve_value(value, ctx)?);
    }
    Ok(result)
}

/// Render a value the way it appears when interpolated into text
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn sole_placeholder(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    let cap = PLACEHOLDER_REGEX.captures(trimmed)?;
    let whole = cap.get(0)?;
    if whole.start() == 0 && whole.end() == trimmed.len() {
        cap.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

fn interpolate(input: &str, ctx: &ExecutionContext) -> Result<String, ExpressionError> {
    let mut result = String::with_capacity(input.len());
    let mut last = 0;

    for cap in PLACEHOLDER_REGEX.captures_iter(input) {
        let (Some(whole), Some(path)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        result.push_str(&input[last..whole.start()]);
        result.push_str(&stringify(&lookup(path.as_str(), ctx)?));
        last = whole.end();
    }
    result.push_str(&input[last..]);

    if result.contains("${") {
        return Err(ExpressionError::Parse(format!("unterminated placeholder in '{}'", input)));
    }
    Ok(result)
}

fn lookup(path: &str, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
    if !PATH_REGEX.is_match(path) {
        return Err(ExpressionError::Parse(format!("invalid reference '${{{}}}'", path)));
    }
    ctx.lookup(path)
        .ok_or_else(|| ExpressionError::Unresolved(path.to_string()))
}

/// Truthiness used by conditions
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let lower = s.trim().to_lowercase();
            !lower.is_empty() && lower != "false" && lower != "0" && lower != "null" && lower != "none"
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluate a condition to a boolean
pub fn evaluate_condition(condition: &str, ctx: &ExecutionContext) -> Result<bool, ExpressionError> {
    evaluate_expression(condition, ctx).map(|v| is_truthy(&v))
}

/// Evaluate a condition or arithmetic expression to a value
pub fn evaluate_expression(expr: &str, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
    let tokens = tokenize(expr, ctx)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Parse("empty expression".to_string()));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        source: expr,
    };
    let value = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return Err(ExpressionError::Parse(format!(
            "unexpected {} in '{}'",
            parser.tokens[parser.pos].describe(),
            expr
        )));
    }
    Ok(value)
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
    And,
    Or,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Value(Value),
    Op(Op),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Value(v) => format!("value {}", v),
            Token::Op(op) => format!("operator {:?}", op),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::Comma => "','".to_string(),
        }
    }

    fn is_operand_end(&self) -> bool {
        matches!(self, Token::Value(_) | Token::RParen | Token::RBracket)
    }
}

fn is_word_break(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | ',' | '=' | '!' | '<' | '>' | '&' | '|')
}

fn tokenize(expr: &str, ctx: &ExecutionContext) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let follows_operand = tokens.last().is_some_and(Token::is_operand_end);

        let (token, width) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('=', Some('=')) => (Token::Op(Op::Eq), 2),
            ('!', Some('=')) => (Token::Op(Op::Ne), 2),
            ('>', Some('=')) => (Token::Op(Op::Gte), 2),
            ('<', Some('=')) => (Token::Op(Op::Lte), 2),
            ('>', _) => (Token::Op(Op::Gt), 1),
            ('<', _) => (Token::Op(Op::Lt), 1),
            ('&', Some('&')) => (Token::Op(Op::And), 2),
            ('|', Some('|')) => (Token::Op(Op::Or), 2),
            ('!', _) => (Token::Op(Op::Not), 1),
            ('=', _) | ('&', _) | ('|', _) => {
                return Err(ExpressionError::Parse(format!(
                    "unexpected '{}' at position {} in '{}'",
                    c, i, expr
                )))
            }
            ('\'', _) | ('"', _) => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == c)
                    .map(|p| start + p)
                    .ok_or_else(|| {
                        ExpressionError::Parse(format!("unterminated string in '{}'", expr))
                    })?;
                let text: String = chars[start..end].iter().collect();
                let resolved = if has_placeholders(&text) {
                    Value::String(interpolate(&text, ctx)?)
                } else {
                    Value::String(text)
                };
                (Token::Value(resolved), end - i + 1)
            }
            ('+', _) | ('*', _) | ('/', _) | ('%', _) => {
                let op = match c {
                    '+' => Op::Add,
                    '*' => Op::Mul,
                    '/' => Op::Div,
                    _ => Op::Rem,
                };
                (Token::Op(op), 1)
            }
            ('-', Some(d)) if d.is_ascii_digit() && !follows_operand => {
                let (word, width) = scan_word(&chars, i);
                (word_token(&word, ctx)?, width)
            }
            ('-', _) => (Token::Op(Op::Sub), 1),
            _ => {
                let (word, width) = scan_word(&chars, i);
                (word_token(&word, ctx)?, width)
            }
        };

        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

/// Scan a bare word; `${...}` placeholders are consumed whole
fn scan_word(chars: &[char], start: usize) -> (String, usize) {
    let mut i = start;
    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            match chars[i..].iter().position(|&c| c == '}') {
                Some(p) => i += p + 1,
                None => i = chars.len(),
            }
            continue;
        }
        if is_word_break(chars[i]) {
            break;
        }
        i += 1;
    }
    (chars[start..i].iter().collect(), i - start)
}

fn word_token(word: &str, ctx: &ExecutionContext) -> Result<Token, ExpressionError> {
    if has_placeholders(word) || word.contains("${") {
        return resolve(word, ctx).map(Token::Value);
    }

    let token = match word {
        "eq" => Token::Op(Op::Eq),
        "ne" => Token::Op(Op::Ne),
        "gt" => Token::Op(Op::Gt),
        "lt" => Token::Op(Op::Lt),
        "gte" => Token::Op(Op::Gte),
        "lte" => Token::Op(Op::Lte),
        "in" => Token::Op(Op::In),
        "not_in" => Token::Op(Op::NotIn),
        "and" => Token::Op(Op::And),
        "or" => Token::Op(Op::Or),
        "not" => Token::Op(Op::Not),
        "true" => Token::Value(Value::Bool(true)),
        "false" => Token::Value(Value::Bool(false)),
        "null" => Token::Value(Value::Null),
        _ => match parse_number(word) {
            Some(n) => Token::Value(n),
            None => Token::Value(Value::String(word.to_string())),
        },
    };
    Ok(token)
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
        .map(Value::Number)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_op(&self) -> Option<Op> {
        match self.peek() {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, message: &str) -> ExpressionError {
        ExpressionError::Parse(format!("{} in '{}'", message, self.source))
    }

    fn or(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.and()?;
        while self.peek_op() == Some(Op::Or) {
            self.advance();
            let right = self.and()?;
            left = Value::Bool(is_truthy(&left) || is_truthy(&right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.not()?;
        while self.peek_op() == Some(Op::And) {
            self.advance();
            let right = self.not()?;
            left = Value::Bool(is_truthy(&left) && is_truthy(&right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Value, ExpressionError> {
        if self.peek_op() == Some(Op::Not) {
            self.advance();
            let value = self.not()?;
            return Ok(Value::Bool(!is_truthy(&value)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, ExpressionError> {
        let left = self.sum()?;

        let op = match self.peek_op() {
            Some(op @ (Op::Eq | Op::Ne | Op::Gt | Op::Lt | Op::Gte | Op::Lte | Op::In | Op::NotIn)) => {
                self.advance();
                op
            }
            // "not in"
            Some(Op::Not)
                if matches!(self.tokens.get(self.pos + 1), Some(Token::Op(Op::In))) =>
            {
                self.pos += 2;
                Op::NotIn
            }
            _ => return Ok(left),
        };

        let right = self.sum()?;
        let result = match op {
            Op::Eq => loose_eq(&left, &right),
            Op::Ne => !loose_eq(&left, &right),
            Op::Gt => compare(&left, &right)?.is_gt(),
            Op::Lt => compare(&left, &right)?.is_lt(),
            Op::Gte => compare(&left, &right)?.is_ge(),
            Op::Lte => compare(&left, &right)?.is_le(),
            Op::In => contains(&right, &left)?,
            Op::NotIn => !contains(&right, &left)?,
            _ => unreachable!("non-comparison operator"),
        };

        if matches!(
            self.peek_op(),
            Some(Op::Eq | Op::Ne | Op::Gt | Op::Lt | Op::Gte | Op::Lte | Op::In | Op::NotIn)
        ) {
            return Err(self.error("chained comparison needs parentheses"));
        }
        Ok(Value::Bool(result))
    }

    fn sum(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.product()?;
        while let Some(op @ (Op::Add | Op::Sub)) = self.peek_op() {
            self.advance();
            let right = self.product()?;
            left = arithmetic(op, &left, &right)?;
        }
        Ok(left)
    }

    fn product(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.unary()?;
        while let Some(op @ (Op::Mul | Op::Div | Op::Rem)) = self.peek_op() {
            self.advance();
            let right = self.unary()?;
            left = arithmetic(op, &left, &right)?;
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, ExpressionError> {
        if self.peek_op() == Some(Op::Sub) {
            self.advance();
            let value = self.unary()?;
            return arithmetic(Op::Sub, &Value::Number(0.into()), &value);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value, ExpressionError> {
        match self.advance() {
            Some(Token::Value(v)) => Ok(v),
            Some(Token::LParen) => {
                let value = self.or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(self.error("missing ')'")),
                }
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.advance();
                    return Ok(Value::Array(items));
                }
                loop {
                    items.push(self.sum()?);
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => return Ok(Value::Array(items)),
                        _ => return Err(self.error("missing ']'")),
                    }
                }
            }
            Some(other) => Err(self.error(&format!("unexpected {}", other.describe()))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

// ============================================================================
// Value semantics
// ============================================================================

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn number_value(f: f64) -> Result<Value, ExpressionError> {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        return Ok(Value::Number((f as i64).into()));
    }
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Evaluation(format!("non-finite result {}", f)))
}

fn arithmetic(op: Op, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    let (l, r) = match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => (l, r),
        _ if op == Op::Add => {
            return Ok(Value::String(format!("{}{}", stringify(left), stringify(right))))
        }
        _ => {
            return Err(ExpressionError::Evaluation(format!(
                "arithmetic on non-numeric values {} and {}",
                left, right
            )))
        }
    };

    let result = match op {
        Op::Add => l + r,
        Op::Sub => l - r,
        Op::Mul => l * r,
        Op::Div | Op::Rem if r == 0.0 => {
            return Err(ExpressionError::Evaluation("division by zero".to_string()))
        }
        Op::Div => l / r,
        Op::Rem => l % r,
        _ => unreachable!("non-arithmetic operator"),
    };
    number_value(result)
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l == r;
    }
    match (left, right) {
        (Value::Array(_), _) | (Value::Object(_), _) | (_, Value::Array(_)) | (_, Value::Object(_)) => {
            left == right
        }
        _ => stringify(left) == stringify(right),
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l
            .partial_cmp(&r)
            .ok_or_else(|| ExpressionError::Evaluation(format!("cannot compare {} and {}", l, r)));
    }
    match (left, right) {
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        _ => Err(ExpressionError::Evaluation(format!(
            "cannot order {} and {}",
            left, right
        ))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, ExpressionError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        Value::String(s) => Ok(s.contains(&stringify(needle))),
        Value::Object(map) => Ok(map.contains_key(&stringify(needle))),
        other => Err(ExpressionError::Evaluation(format!(
            "'in' needs a list, string or mapping, got {}",
            other
        ))),
    }
}
