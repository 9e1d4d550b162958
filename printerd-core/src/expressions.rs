use crate::code::Code;
use crate::errors::ParseError;
use serde_json::Value;

/// Object-model roots owned by the daemon rather than the firmware. A code
/// whose expressions touch these must be evaluated host-side before
/// dispatch.
const HOST_FIELDS: [&str; 6] = [
    "network",
    "volumes",
    "directories",
    "httpEndpoints",
    "userSessions",
    "scanner",
];

// ─── Detection ────────────────────────────────────────────────

/// True when any `{…}` expression in the code references a host-owned model
/// root.
pub fn contains_host_fields(code: &Code) -> bool {
    code.parameters
        .iter()
        .filter(|p| !p.quoted)
        .any(|p| raw_contains_host_fields(&p.raw))
}

fn raw_contains_host_fields(raw: &str) -> bool {
    for expression in braced_expressions(raw) {
        let mut chars = expression.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            if !c.is_ascii_alphabetic() {
                continue;
            }
            let mut end = start + c.len_utf8();
            while let Some((i, c)) = chars.peek().copied() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    end = i + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            if HOST_FIELDS.contains(&&expression[start..end]) {
                return true;
            }
        }
    }
    false
}

/// Balanced `{…}` segments of a raw parameter value, quote-aware.
fn braced_expressions(raw: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_quotes = false;
    for (i, c) in raw.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '{' if !in_quotes => {
                if depth == 0 {
                    start = i + 1;
                }
                depth += 1;
            }
            '}' if !in_quotes && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    found.push(&raw[start..i]);
                }
            }
            _ => {}
        }
    }
    found
}

// ─── In-place evaluation ──────────────────────────────────────

/// Replaces every `{…}` segment in the code's parameters with its evaluated
/// value, rendered in G-code form.
pub fn evaluate_in_place(code: &mut Code, model: &Value) -> Result<(), ParseError> {
    for parameter in &mut code.parameters {
        if parameter.quoted || !parameter.raw.contains('{') {
            continue;
        }
        let mut rendered = String::new();
        let mut rest = parameter.raw.as_str();
        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let inner = &rest[open + 1..];
            let close = matching_brace(inner).ok_or_else(|| {
                ParseError::new(format!("unterminated expression in {:?}", parameter.raw))
            })?;
            let value = evaluate_expression(&inner[..close], model)?;
            rendered.push_str(&render(&value));
            rest = &inner[close + 1..];
        }
        rendered.push_str(rest);
        parameter.raw = rendered;
    }
    Ok(())
}

fn matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '{' if !in_quotes => depth += 1,
            '}' if !in_quotes => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Evaluates an `echo` argument list: top-level comma-separated expressions,
/// results joined by a single space.
pub fn evaluate_echo(argument: &str, model: &Value) -> Result<String, ParseError> {
    let mut parts = Vec::new();
    for expression in split_top_level(argument) {
        let value = evaluate_expression(expression.trim(), model)?;
        parts.push(render(&value));
    }
    Ok(parts.join(" "))
}

fn split_top_level(argument: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut start = 0usize;
    for (i, c) in argument.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' | '[' | '{' if !in_quotes => depth += 1,
            ')' | ']' | '}' if !in_quotes => depth -= 1,
            ',' if !in_quotes && depth == 0 => {
                parts.push(&argument[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&argument[start..]);
    parts
}

// ─── Expression grammar ───────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();
    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => {
                            if chars.peek().map(|&(_, c)| c) == Some('"') {
                                chars.next();
                                s.push('"');
                            } else {
                                break;
                            }
                        }
                        Some((_, c)) => s.push(c),
                        None => return Err(ParseError::new("unterminated string in expression")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut end = i;
                while let Some(&(j, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        end = j + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &expr[i..end];
                tokens.push(Token::Number(text.parse().map_err(|_| {
                    ParseError::new(format!("invalid number {text:?} in expression"))
                })?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = i;
                while let Some(&(j, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        end = j + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(expr[i..end].to_string()));
            }
            _ => {
                chars.next();
                let two = match (c, chars.peek().map(|&(_, c)| c)) {
                    ('=', Some('=')) => Some("=="),
                    ('!', Some('=')) => Some("!="),
                    ('<', Some('=')) => Some("<="),
                    ('>', Some('=')) => Some(">="),
                    ('&', Some('&')) => Some("&&"),
                    ('|', Some('|')) => Some("||"),
                    _ => None,
                };
                if let Some(op) = two {
                    chars.next();
                    tokens.push(Token::Op(op));
                } else {
                    let op = match c {
                        '+' => "+",
                        '-' => "-",
                        '*' => "*",
                        '/' => "/",
                        '%' => "%",
                        '^' => "^",
                        '!' => "!",
                        '<' => "<",
                        '>' => ">",
                        '(' => "(",
                        ')' => ")",
                        '[' => "[",
                        ']' => "]",
                        '.' => ".",
                        _ => {
                            return Err(ParseError::new(format!(
                                "unexpected character {c:?} in expression"
                            )))
                        }
                    };
                    tokens.push(Token::Op(op));
                }
            }
        }
    }
    Ok(tokens)
}

struct ExprParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    model: &'a Value,
}

/// Evaluates one expression against the model JSON. Supports literals,
/// object-model paths with indexing, arithmetic, comparison, logic and the
/// `^` string concatenation operator.
pub fn evaluate_expression(expr: &str, model: &Value) -> Result<Value, ParseError> {
    let mut parser = ExprParser {
        tokens: tokenize(expr)?,
        pos: 0,
        model,
    };
    let value = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ParseError::new(format!(
            "trailing input in expression {expr:?}"
        )));
    }
    Ok(value)
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        if let Some(Token::Op(op)) = self.peek() {
            if ops.contains(op) {
                let op = *op;
                self.pos += 1;
                return Some(op);
            }
        }
        None
    }

    fn or_expr(&mut self) -> Result<Value, ParseError> {
        let mut left = self.and_expr()?;
        while self.eat_op(&["||"]).is_some() {
            let right = self.and_expr()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Value, ParseError> {
        let mut left = self.comparison()?;
        while self.eat_op(&["&&"]).is_some() {
            let right = self.comparison()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Value, ParseError> {
        let left = self.additive()?;
        if let Some(op) = self.eat_op(&["==", "!=", "<=", ">=", "<", ">"]) {
            let right = self.additive()?;
            return compare(op, &left, &right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Value, ParseError> {
        let mut left = self.multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-", "^"]) {
            let right = self.multiplicative()?;
            left = match op {
                "^" => Value::String(format!("{}{}", render(&left), render(&right))),
                "+" => number_op(&left, &right, |a, b| a + b)?,
                _ => number_op(&left, &right, |a, b| a - b)?,
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Value, ParseError> {
        let mut left = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let right = self.unary()?;
            left = match op {
                "*" => number_op(&left, &right, |a, b| a * b)?,
                "/" => number_op(&left, &right, |a, b| a / b)?,
                _ => number_op(&left, &right, |a, b| a % b)?,
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, ParseError> {
        if self.eat_op(&["!"]).is_some() {
            let value = self.unary()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        if self.eat_op(&["-"]).is_some() {
            let value = self.unary()?;
            return number_op(&Value::from(0.0), &value, |a, b| a - b);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value, ParseError> {
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Value::from(n))
            }
            Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(Value::String(s))
            }
            Some(Token::Op("(")) => {
                self.pos += 1;
                let value = self.or_expr()?;
                if self.eat_op(&[")"]).is_none() {
                    return Err(ParseError::new("missing ')' in expression"));
                }
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                match name.as_str() {
                    "true" => return Ok(Value::Bool(true)),
                    "false" => return Ok(Value::Bool(false)),
                    "null" => return Ok(Value::Null),
                    _ => {}
                }
                self.resolve_path(&name)
            }
            other => Err(ParseError::new(format!(
                "unexpected token {other:?} in expression"
            ))),
        }
    }

    /// Walks `a.b[expr].c` against the model.
    fn resolve_path(&mut self, root: &str) -> Result<Value, ParseError> {
        let mut current = self
            .model
            .get(root)
            .cloned()
            .ok_or_else(|| ParseError::new(format!("unknown object model field {root:?}")))?;
        loop {
            if self.eat_op(&["."]).is_some() {
                let field = match self.peek().cloned() {
                    Some(Token::Ident(field)) => field,
                    _ => return Err(ParseError::new("expected field name after '.'")),
                };
                self.pos += 1;
                current = current.get(&field).cloned().ok_or_else(|| {
                    ParseError::new(format!("unknown object model field {field:?}"))
                })?;
            } else if self.eat_op(&["["]).is_some() {
                let index = self.or_expr()?;
                if self.eat_op(&["]"]).is_none() {
                    return Err(ParseError::new("missing ']' in expression"));
                }
                let i = index
                    .as_f64()
                    .ok_or_else(|| ParseError::new("array index must be a number"))?
                    as usize;
                current = current
                    .get(i)
                    .cloned()
                    .ok_or_else(|| ParseError::new(format!("index {i} out of range")))?;
            } else {
                return Ok(current);
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

fn number_op(
    left: &Value,
    right: &Value,
    op: impl Fn(f64, f64) -> f64,
) -> Result<Value, ParseError> {
    let (a, b) = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ParseError::new(format!(
                "arithmetic on non-numeric values {left} and {right}"
            )))
        }
    };
    Ok(Value::from(op(a, b)))
}

fn compare(op: &str, left: &Value, right: &Value) -> Result<Value, ParseError> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return Ok(Value::Bool(match op {
            "==" => a == b,
            "!=" => a != b,
            "<" => a < b,
            "<=" => a <= b,
            ">" => a > b,
            _ => a >= b,
        }));
    }
    match op {
        "==" => Ok(Value::Bool(left == right)),
        "!=" => Ok(Value::Bool(left != right)),
        _ => Err(ParseError::new(format!(
            "ordering comparison on non-numeric values {left} and {right}"
        ))),
    }
}

/// G-code rendering of an evaluated value: integers lose the decimal point,
/// strings are unquoted.
pub fn render(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            let f = n.as_f64().unwrap_or(0.0);
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", f as i64)
            } else {
                format!("{f}")
            }
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
