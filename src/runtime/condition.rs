/// Sandboxed boolean expressions for CONDITION steps
///
/// Grammar:
///   expr    := or
///   or      := and (("||" | "or") and)*
///   and     := unary (("&&" | "and") unary)*
///   unary   := ("!" | "not") unary | compare
///   compare := operand (op operand)?        op: == != === !== > >= < <=
///   operand := number | string | true | false | null | path | "(" expr ")"
///   path    := ident ("." ident | "[" integer "]")*
///
/// Paths resolve against the instance data. A leading `data` segment is the
/// data object itself, so `data.amount` and `amount` name the same field.
/// No function calls, no assignment, no host access.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Longest accepted expression, in bytes
pub const MAX_CONDITION_LEN: usize = 2048;

/// Deepest accepted nesting of parentheses and negations
pub const MAX_NESTING: usize = 64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConditionError {
    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("unterminated string starting at {0}")]
    UnterminatedString(usize),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected token {found} (expected {expected})")]
    UnexpectedToken { found: String, expected: &'static str },
    #[error("empty expression")]
    Empty,
    #[error("expression is longer than {0} bytes")]
    TooLong(usize),
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("field '{0}' is not present in instance data")]
    MissingField(String),
    #[error("cannot order {left} and {right}")]
    Incomparable { left: String, right: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CompareOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Ident(i) => write!(f, "{}", i),
            Token::Dot => write!(f, "."),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Not => write!(f, "!"),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Op(op) => write!(f, "{}", op.symbol()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<PathSegment>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

/// A parsed condition, ready to be evaluated any number of times
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        if source.len() > MAX_CONDITION_LEN {
            return Err(ConditionError::TooLong(MAX_CONDITION_LEN));
        }
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(extra) = parser.peek() {
            return Err(ConditionError::UnexpectedToken {
                found: extra.to_string(),
                expected: "end of expression",
            });
        }
        Ok(Self { expr })
    }

    /// Evaluate against instance data
    pub fn evaluate(&self, data: &Value) -> Result<bool, ConditionError> {
        Ok(truthy(&eval(&self.expr, data)?))
    }
}

/// Parse and evaluate in one go, degrading every failure to `false`
pub fn evaluate_condition(source: &str, data: &Value) -> bool {
    match Condition::parse(source).and_then(|c| c.evaluate(data)) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("⚠️ Condition '{}' failed, treating as false: {}", source, e);
            false
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
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
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let or_equal = chars.get(i + 1) == Some(&'=');
                let op = match (c, or_equal) {
                    ('>', false) => CompareOp::Gt,
                    ('>', true) => CompareOp::Ge,
                    ('<', false) => CompareOp::Lt,
                    _ => CompareOp::Le,
                };
                tokens.push(Token::Op(op));
                i += if or_equal { 2 } else { 1 };
            }
            '\'' | '"' => {
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString(start)),
                        Some('\\') => {
                            if let Some(&next) = chars.get(i + 1) {
                                s.push(next);
                                i += 2;
                            } else {
                                return Err(ConditionError::UnterminatedString(start));
                            }
                        }
                        Some(&q) if q == c => {
                            i += 1;
                            break;
                        }
                        Some(&other) => {
                            s.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::InvalidNumber(text.clone()))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ConditionError::UnexpectedChar { ch: other, pos: i }),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, want: Token, expected: &'static str) -> Result<(), ConditionError> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(ConditionError::UnexpectedToken {
                found: t.to_string(),
                expected,
            }),
            None => Err(ConditionError::UnexpectedToken {
                found: "end of expression".into(),
                expected,
            }),
        }
    }

    /// Run `parse` one nesting level down, refusing to go past `MAX_NESTING`
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ConditionError>,
    ) -> Result<T, ConditionError> {
        if self.depth >= MAX_NESTING {
            return Err(ConditionError::TooDeep(MAX_NESTING));
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => self.nested(|parser| {
                let inner = parser.parse_or()?;
                parser.expect(Token::RParen, "')'")?;
                Ok(inner)
            }),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                _ => self.parse_path(word),
            },
            Some(other) => Err(ConditionError::UnexpectedToken {
                found: other.to_string(),
                expected: "a value or field path",
            }),
            None => Err(ConditionError::UnexpectedToken {
                found: "end of expression".into(),
                expected: "a value or field path",
            }),
        }
    }

    fn parse_path(&mut self, head: String) -> Result<Expr, ConditionError> {
        let mut segments = Vec::new();
        if head != "data" {
            segments.push(PathSegment::Key(head));
        }
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(key)) => segments.push(PathSegment::Key(key)),
                        Some(other) => {
                            return Err(ConditionError::UnexpectedToken {
                                found: other.to_string(),
                                expected: "field name",
                            })
                        }
                        None => {
                            return Err(ConditionError::UnexpectedToken {
                                found: "end of expression".into(),
                                expected: "field name",
                            })
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let segment = match self.next() {
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            PathSegment::Index(n as usize)
                        }
                        Some(Token::Str(key)) => PathSegment::Key(key),
                        Some(other) => {
                            return Err(ConditionError::UnexpectedToken {
                                found: other.to_string(),
                                expected: "array index or quoted key",
                            })
                        }
                        None => {
                            return Err(ConditionError::UnexpectedToken {
                                found: "end of expression".into(),
                                expected: "array index or quoted key",
                            })
                        }
                    };
                    self.expect(Token::RBracket, "']'")?;
                    segments.push(segment);
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}

fn eval(expr: &Expr, data: &Value) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segments) => resolve(segments, data),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, data)?))),
        Expr::And(l, r) => {
            if !truthy(&eval(l, data)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, data)?)))
        }
        Expr::Or(l, r) => {
            if truthy(&eval(l, data)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, data)?)))
        }
        Expr::Compare(op, l, r) => {
            let left = eval(l, data)?;
            let right = eval(r, data)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn resolve(segments: &[PathSegment], data: &Value) -> Result<Value, ConditionError> {
    let mut current = data;
    for (depth, segment) in segments.iter().enumerate() {
        let next = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key),
            (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx),
            _ => None,
        };
        current = next.ok_or_else(|| ConditionError::MissingField(render_path(&segments[..=depth])))?;
    }
    Ok(current.clone())
}

fn render_path(segments: &[PathSegment]) -> String {
    let mut out = String::from("data");
    for segment in segments {
        match segment {
            PathSegment::Key(k) => {
                out.push('.');
                out.push_str(k);
            }
            PathSegment::Index(i) => out.push_str(&format!("[{}]", i)),
        }
    }
    out
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ConditionError> {
    match op {
        CompareOp::Eq => Ok(loosely_equal(left, right)),
        CompareOp::Ne => Ok(!loosely_equal(left, right)),
        _ => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    a.as_f64().partial_cmp(&b.as_f64())
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| ConditionError::Incomparable {
                left: left.to_string(),
                right: right.to_string(),
            })?;
            Ok(match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            })
        }
    }
}

/// Numbers compare by value regardless of integer/float representation
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(expr: &str, data: Value) -> Result<bool, ConditionError> {
        Condition::parse(expr)?.evaluate(&data)
    }

    #[test]
    fn numeric_comparison_routes_on_amount() {
        assert_eq!(check("data.amount > 100", json!({"amount": 150})), Ok(true));
        assert_eq!(check("data.amount > 100", json!({"amount": 50})), Ok(false));
        assert_eq!(check("amount >= 50", json!({"amount": 50})), Ok(true));
    }

    #[test]
    fn missing_field_is_an_error_and_degrades_to_false() {
        let err = check("data.amount > 100", json!({})).unwrap_err();
        assert_eq!(err, ConditionError::MissingField("data.amount".into()));
        assert!(!evaluate_condition("data.amount > 100", &json!({})));
    }

    #[test]
    fn boolean_connectives_and_grouping() {
        let data = json!({"status": "draft", "author": {"role": "editor"}, "tags": ["a", "b"]});
        assert_eq!(
            check("data.status == 'draft' && data.author.role === \"editor\"", data.clone()),
            Ok(true)
        );
        assert_eq!(check("!(status == 'draft') || tags[1] == 'b'", data.clone()), Ok(true));
        assert_eq!(check("not (status != 'draft') and tags[0] == 'x'", data), Ok(false));
    }

    #[test]
    fn equality_is_numeric_for_numbers() {
        assert_eq!(check("data.count == 3", json!({"count": 3.0})), Ok(true));
        assert_eq!(check("data.flag == true", json!({"flag": true})), Ok(true));
        assert_eq!(check("data.owner == null", json!({"owner": null})), Ok(true));
    }

    #[test]
    fn bare_paths_use_truthiness() {
        assert_eq!(check("data.published", json!({"published": true})), Ok(true));
        assert_eq!(check("data.title", json!({"title": ""})), Ok(false));
    }

    #[test]
    fn ordering_mismatched_types_is_an_error() {
        assert!(matches!(
            check("data.amount > 'x'", json!({"amount": 1})),
            Err(ConditionError::Incomparable { .. })
        ));
    }

    #[test]
    fn code_like_input_is_rejected_at_parse_time() {
        assert!(Condition::parse("process.exit(1)").is_err());
        assert!(Condition::parse("a = 1").is_err());
        assert!(Condition::parse("data.amount >").is_err());
        assert_eq!(Condition::parse("   "), Err(ConditionError::Empty));
        assert!(Condition::parse("'open").is_err());
    }

    #[test]
    fn nesting_and_length_are_bounded() {
        let nested = |levels: usize| format!("{}true{}", "(".repeat(levels), ")".repeat(levels));
        assert_eq!(check(&nested(MAX_NESTING), json!({})), Ok(true));
        assert_eq!(
            Condition::parse(&nested(MAX_NESTING + 1)),
            Err(ConditionError::TooDeep(MAX_NESTING))
        );
        assert_eq!(
            Condition::parse(&format!("{}true", "!".repeat(MAX_NESTING + 1))),
            Err(ConditionError::TooDeep(MAX_NESTING))
        );
        assert_eq!(
            Condition::parse(&nested(200_000)),
            Err(ConditionError::TooLong(MAX_CONDITION_LEN))
        );
    }
}
