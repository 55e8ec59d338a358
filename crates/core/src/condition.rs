//! Edge condition predicates.
//!
//! Conditions are a small closed grammar evaluated against a run's context,
//! never host code:
//!
//! ```text
//! expr       := or
//! or         := and (("or" | "||") and)*
//! and        := unary (("and" | "&&") unary)*
//! unary      := ("not" | "!") unary | comparison
//! comparison := operand (op operand)?
//! op         := "==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "not in"
//! operand    := literal | path | "(" expr ")"
//! path       := ident ("." ident | "[" (string | integer) "]")*
//! ```
//!
//! A leading `context` segment is accepted and refers to the context map
//! itself, so `x > 0`, `context.x > 0` and `context["x"] > 0` are the same
//! predicate. A bare operand is tested for truthiness.

use crate::types::Context;
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;

/// Deepest allowed chain of `not` and parentheses
const MAX_NESTING: usize = 64;

/// Reasons a condition cannot be parsed or evaluated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown context key '{0}'")]
    MissingKey(String),

    #[error("cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
}

/// A parsed edge condition
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some((position, token)) = parser.tokens.get(parser.pos) {
            return Err(ConditionError::Syntax {
                position: *position,
                message: format!("unexpected {:?}", token),
            });
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the predicate against a context map
    pub fn evaluate(&self, context: &Context) -> Result<bool, ConditionError> {
        eval_bool(&self.expr, context)
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse and evaluate a condition in one step
pub fn evaluate_condition(source: &str, context: &Context) -> Result<bool, ConditionError> {
    Condition::parse(source)?.evaluate(context)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CmpOp {
    fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Value),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Op(CmpOp),
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

fn syntax(position: usize, message: impl Into<String>) -> ConditionError {
    ConditionError::Syntax {
        position,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let token = match c {
            '(' | ')' | '[' | ']' | '.' | '-' => {
                chars.next();
                match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '.' => Token::Dot,
                    _ => Token::Minus,
                }
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                chars.next();
                let next = chars.peek().map(|&(_, n)| n);
                match (c, next) {
                    ('=', Some('=')) => {
                        chars.next();
                        Token::Op(CmpOp::Eq)
                    }
                    ('!', Some('=')) => {
                        chars.next();
                        Token::Op(CmpOp::Ne)
                    }
                    ('<', Some('=')) => {
                        chars.next();
                        Token::Op(CmpOp::Le)
                    }
                    ('>', Some('=')) => {
                        chars.next();
                        Token::Op(CmpOp::Ge)
                    }
                    ('&', Some('&')) => {
                        chars.next();
                        Token::And
                    }
                    ('|', Some('|')) => {
                        chars.next();
                        Token::Or
                    }
                    ('<', _) => Token::Op(CmpOp::Lt),
                    ('>', _) => Token::Op(CmpOp::Gt),
                    ('!', _) => Token::Not,
                    _ => return Err(syntax(pos, format!("unexpected '{}'", c))),
                }
            }
            '"' | '\'' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        ch if ch == c => {
                            closed = true;
                            break;
                        }
                        ch => value.push(ch),
                    }
                }
                if !closed {
                    return Err(syntax(pos, "unterminated string"));
                }
                Token::Str(value)
            }
            c if c.is_ascii_digit() => {
                let mut literal = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        literal.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                Token::Number(parse_number(pos, &literal)?)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "null" | "None" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    _ => Token::Ident(ident),
                }
            }
            other => return Err(syntax(pos, format!("unexpected '{}'", other))),
        };

        tokens.push((pos, token));
    }

    Ok(tokens)
}

fn parse_number(position: usize, literal: &str) -> Result<Value, ConditionError> {
    if !literal.contains('.') {
        if let Ok(n) = literal.parse::<i64>() {
            return Ok(Value::from(n));
        }
    }
    literal
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| syntax(position, format!("invalid number '{}'", literal)))
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConditionError> {
        let position = self.position();
        match self.advance() {
            Some(ref token) if *token == expected => Ok(()),
            Some(token) => Err(syntax(
                position,
                format!("expected {:?}, found {:?}", expected, token),
            )),
            None => Err(syntax(position, format!("expected {:?}", expected))),
        }
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ConditionError>,
    ) -> Result<T, ConditionError> {
        if self.depth >= MAX_NESTING {
            return Err(syntax(
                self.position(),
                format!("nested deeper than {} levels", MAX_NESTING),
            ));
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.advance();
            terms.push(self.parse_and()?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::Or(terms),
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.advance();
            terms.push(self.parse_unary()?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::And(terms),
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_operand()?;

        let op = match self.peek() {
            Some(Token::Op(op)) => Some(*op),
            Some(Token::In) => Some(CmpOp::In),
            // `not in` is the only place `not` may follow an operand
            Some(Token::Not)
                if matches!(self.tokens.get(self.pos + 1), Some((_, Token::In))) =>
            {
                self.advance();
                Some(CmpOp::NotIn)
            }
            _ => None,
        };

        match op {
            Some(op) => {
                self.advance();
                let right = self.parse_operand()?;
                Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_operand(&mut self) -> Result<Expr, ConditionError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(n)),
            Some(Token::Minus) => match self.advance() {
                Some(Token::Number(n)) => negate(position, &n).map(Expr::Literal),
                _ => Err(syntax(position, "expected number after '-'")),
            },
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let expr = self.nested(Self::parse_or)?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => self.parse_path(name),
            Some(token) => Err(syntax(position, format!("unexpected {:?}", token))),
            None => Err(syntax(position, "unexpected end of condition")),
        }
    }

    fn parse_path(&mut self, root: String) -> Result<Expr, ConditionError> {
        let mut segments = Vec::new();
        if root != "context" {
            segments.push(Segment::Key(root));
        }

        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let position = self.position();
                    match self.advance() {
                        Some(Token::Ident(key)) => segments.push(Segment::Key(key)),
                        _ => return Err(syntax(position, "expected key after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let position = self.position();
                    match self.advance() {
                        Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                        Some(Token::Number(n)) => match n.as_u64() {
                            Some(index) => segments.push(Segment::Index(index as usize)),
                            None => return Err(syntax(position, "index must be a non-negative integer")),
                        },
                        _ => return Err(syntax(position, "expected string or index in '[]'")),
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }

        Ok(Expr::Path(segments))
    }
}

fn negate(position: usize, n: &Value) -> Result<Value, ConditionError> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::from(-i));
    }
    n.as_f64()
        .and_then(|f| serde_json::Number::from_f64(-f))
        .map(Value::Number)
        .ok_or_else(|| syntax(position, "invalid number"))
}

fn eval_bool(expr: &Expr, context: &Context) -> Result<bool, ConditionError> {
    match expr {
        Expr::Not(inner) => Ok(!eval_bool(inner, context)?),
        Expr::And(terms) => {
            for term in terms {
                if !eval_bool(term, context)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Or(terms) => {
            for term in terms {
                if eval_bool(term, context)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::Compare(left, op, right) => {
            let left = eval_value(left, context)?;
            let right = eval_value(right, context)?;
            compare(*op, &left, &right)
        }
        Expr::Literal(_) | Expr::Path(_) => Ok(is_truthy(&eval_value(expr, context)?)),
    }
}

fn eval_value(expr: &Expr, context: &Context) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) if segments.is_empty() => Ok(Value::Object(context.clone())),
        Expr::Path(segments) => lookup(segments, context).cloned(),
        _ => Ok(Value::Bool(eval_bool(expr, context)?)),
    }
}

fn lookup<'a>(segments: &[Segment], context: &'a Context) -> Result<&'a Value, ConditionError> {
    let missing = || ConditionError::MissingKey(render_path(segments));

    let Some((first, rest)) = segments.split_first() else {
        return Err(missing());
    };
    let mut current = match first {
        Segment::Key(key) => context.get(key).ok_or_else(missing)?,
        Segment::Index(_) => return Err(missing()),
    };

    for segment in rest {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key).ok_or_else(missing)?,
            (Segment::Index(index), Value::Array(items)) => {
                items.get(*index).ok_or_else(missing)?
            }
            _ => return Err(missing()),
        };
    }

    Ok(current)
}

fn render_path(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Key(key) if out.is_empty() => out.push_str(key),
            Segment::Key(key) => {
                out.push('.');
                out.push_str(key);
            }
            Segment::Index(index) => out.push_str(&format!("[{}]", index)),
        }
    }
    if out.is_empty() {
        out.push_str("context");
    }
    out
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ConditionError> {
    let mismatch = || ConditionError::TypeMismatch {
        op: op.symbol(),
        left: type_name(left),
        right: type_name(right),
    };

    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::Ne => Ok(!values_equal(left, right)),
        CmpOp::In | CmpOp::NotIn => {
            let found = match (left, right) {
                (Value::String(needle), Value::String(haystack)) => haystack.contains(needle.as_str()),
                (_, Value::Array(items)) => items.iter().any(|item| values_equal(left, item)),
                (Value::String(key), Value::Object(map)) => map.contains_key(key),
                _ => return Err(mismatch()),
            };
            Ok(if op == CmpOp::In { found } else { !found })
        }
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(l), Value::Number(r)) => {
                    let (l, r) = (l.as_f64().ok_or_else(mismatch)?, r.as_f64().ok_or_else(mismatch)?);
                    l.partial_cmp(&r).ok_or_else(mismatch)?
                }
                (Value::String(l), Value::String(r)) => l.cmp(r),
                _ => return Err(mismatch()),
            };
            Ok(match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => panic!("context must be an object"),
        }
    }

    #[test]
    fn test_numeric_comparisons() {
        let context = ctx(json!({"x": 5, "y": -1, "ratio": 0.5}));

        assert!(evaluate_condition("x > 0", &context).unwrap());
        assert!(!evaluate_condition("x <= 0", &context).unwrap());
        assert!(evaluate_condition("y <= 0", &context).unwrap());
        assert!(evaluate_condition("x >= 5", &context).unwrap());
        assert!(evaluate_condition("ratio < 1", &context).unwrap());
        assert!(evaluate_condition("x == 5.0", &context).unwrap());
        assert!(evaluate_condition("y == -1", &context).unwrap());
    }

    #[test]
    fn test_string_equality_and_ordering() {
        let context = ctx(json!({"status": "complete"}));

        assert!(evaluate_condition("status == 'complete'", &context).unwrap());
        assert!(evaluate_condition(r#"status != "pending""#, &context).unwrap());
        assert!(evaluate_condition("status > 'abc'", &context).unwrap());
    }

    #[test]
    fn test_context_prefixed_lookups() {
        let context = ctx(json!({"x": 3, "user": {"name": "ada", "roles": ["admin"]}}));

        assert!(evaluate_condition("context.x == 3", &context).unwrap());
        assert!(evaluate_condition(r#"context["x"] == 3"#, &context).unwrap());
        assert!(evaluate_condition("user.name == 'ada'", &context).unwrap());
        assert!(evaluate_condition("user.roles[0] == 'admin'", &context).unwrap());
        assert!(evaluate_condition("context['user']['name'] == 'ada'", &context).unwrap());
    }

    #[test]
    fn test_boolean_combinators_and_precedence() {
        let context = ctx(json!({"a": 1, "b": 0, "flag": true}));

        assert!(evaluate_condition("a == 1 and flag", &context).unwrap());
        assert!(evaluate_condition("b == 1 || a == 1", &context).unwrap());
        assert!(evaluate_condition("not b", &context).unwrap());
        assert!(evaluate_condition("!(a == 2)", &context).unwrap());
        // and binds tighter than or
        assert!(evaluate_condition("a == 1 or b == 1 and flag == false", &context).unwrap());
        assert!(!evaluate_condition("(a == 1 or b == 1) and flag == false", &context).unwrap());
    }

    #[test]
    fn test_membership() {
        let context = ctx(json!({
            "tags": ["urgent", "billing"],
            "output": "file was created",
            "meta": {"owner": "ops"},
        }));

        assert!(evaluate_condition("'urgent' in tags", &context).unwrap());
        assert!(evaluate_condition("'created' in output", &context).unwrap());
        assert!(evaluate_condition("'owner' in meta", &context).unwrap());
        assert!(evaluate_condition("'tags' in context", &context).unwrap());
        assert!(evaluate_condition("'deleted' not in output", &context).unwrap());
        assert!(evaluate_condition("'other' not in tags", &context).unwrap());
    }

    #[test]
    fn test_truthiness() {
        let context = ctx(json!({"empty": "", "zero": 0, "list": [1], "none": null}));

        assert!(!evaluate_condition("empty", &context).unwrap());
        assert!(!evaluate_condition("zero", &context).unwrap());
        assert!(evaluate_condition("list", &context).unwrap());
        assert!(!evaluate_condition("none", &context).unwrap());
        assert!(evaluate_condition("true", &context).unwrap());
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let context = ctx(json!({}));
        assert_eq!(
            evaluate_condition("missing > 1", &context),
            Err(ConditionError::MissingKey("missing".to_string()))
        );
        assert!(matches!(
            evaluate_condition("a.b", &ctx(json!({"a": {"c": 1}}))),
            Err(ConditionError::MissingKey(_))
        ));
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let context = ctx(json!({"name": "ada"}));
        assert!(matches!(
            evaluate_condition("name > 5", &context),
            Err(ConditionError::TypeMismatch { op: ">", .. })
        ));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            Condition::parse("x >"),
            Err(ConditionError::Syntax { .. })
        ));
        assert!(matches!(
            Condition::parse("x == 'open"),
            Err(ConditionError::Syntax { .. })
        ));
        assert!(matches!(
            Condition::parse("__import__('os').system('ls')"),
            Err(ConditionError::Syntax { .. })
        ));
        assert!(matches!(
            Condition::parse("x = 1"),
            Err(ConditionError::Syntax { .. })
        ));
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let context = ctx(json!({"x": true}));

        let bangs = format!("{}x", "!".repeat(200_000));
        assert!(matches!(
            evaluate_condition(&bangs, &context),
            Err(ConditionError::Syntax { .. })
        ));

        let parens = format!("{}x{}", "(".repeat(100_000), ")".repeat(100_000));
        assert!(matches!(
            evaluate_condition(&parens, &context),
            Err(ConditionError::Syntax { .. })
        ));

        let shallow = format!("{}x{}", "(not ".repeat(20), ")".repeat(20));
        assert!(evaluate_condition(&shallow, &context).unwrap());
    }

    #[test]
    fn test_long_flat_chains_evaluate() {
        let context = ctx(json!({"x": true, "y": false}));
        let all = vec!["x"; 50_000].join(" and ");
        assert!(evaluate_condition(&all, &context).unwrap());

        let any = format!("{} or x", vec!["y"; 50_000].join(" || "));
        assert!(evaluate_condition(&any, &context).unwrap());
    }

    #[test]
    fn test_parsed_condition_is_reusable() {
        let condition: Condition = "x > 0".parse().unwrap();
        assert_eq!(condition.source(), "x > 0");
        assert!(condition.evaluate(&ctx(json!({"x": 5}))).unwrap());
        assert!(!condition.evaluate(&ctx(json!({"x": -1}))).unwrap());
    }
}
