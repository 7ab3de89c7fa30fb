//! A hand-written parser and evaluator for the JSONPath subset spec'd in
//! §4.F: dot/bracket paths, `$`, `@`, `*`, `..`, filter expressions
//! `[?(<predicate>)]` with `=`, `!=`, `<`, `<=`, `>`, `>=`, `&` (and),
//! `|` (or), and `~` (JS-style regex match). String literals are
//! single-quoted.
//!
//! No crate in the dependency tree speaks this exact grammar (the one
//! JSONPath crate the broader pack reaches for, `jsonpath_lib`, uses
//! `==`/`&&`/`||`), so this is hand-rolled rather than borrowed — see
//! DESIGN.md. Supported beyond the five-example grammar (§9 Open
//! Question iii): `~`'s right-hand side is a `/pattern/flags` literal;
//! only the `i` (case-insensitive) flag is recognized.

use regex::Regex;
use serde_json::Value;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("jsonpath parse error at byte {pos}: {message}")]
    Syntax { pos: usize, message: String },
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct JsonPath {
    steps: Vec<Step>,
}

#[derive(Debug, Clone)]
enum Step {
    Child(String),
    Wildcard,
    RecursiveChild(String),
    Index(usize),
    Filter(Predicate),
}

#[derive(Debug, Clone)]
enum Predicate {
    Or(Vec<Predicate>),
    And(Vec<Predicate>),
    Compare(Operand, Option<(CmpOp, Operand)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
}

#[derive(Debug, Clone)]
enum Operand {
    RelativePath(Vec<Step>),
    Literal(Literal),
}

#[derive(Debug, Clone)]
enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
    Regex(Box<Regex>, String),
}

impl fmt::Debug for Predicate {
    // derive already covers this; kept for readability when debugging rules.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl JsonPath {
    pub fn parse(input: &str) -> Result<JsonPath, ParseError> {
        let mut p = Parser { src: input, pos: 0 };
        p.skip_ws();
        p.expect_char('$')?;
        let steps = p.parse_segments()?;
        p.skip_ws();
        if p.pos != p.src.len() {
            return Err(p.err("trailing input after expression"));
        }
        Ok(JsonPath { steps })
    }

    /// Evaluate against `root` (the one-element `[envelope]` array per
    /// §4.F) and report whether the match set is non-empty.
    pub fn matches(&self, root: &Value) -> bool {
        !eval_steps(&self.steps, std::slice::from_ref(root)).is_empty()
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError::Syntax { pos: self.pos, message: message.into() }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.err(format!("expected '{expected}'"))),
        }
    }

    fn starts_with(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    fn consume(&mut self, s: &str) -> bool {
        if self.starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    /// Parses zero or more `.name`, `..name`, `[*]`, `['name']`, `[n]`,
    /// `[?(predicate)]` segments following a `$` or `@` root.
    fn parse_segments(&mut self) -> Result<Vec<Step>, ParseError> {
        let mut steps = Vec::new();
        loop {
            if self.consume("..") {
                let name = self.parse_identifier()?;
                steps.push(Step::RecursiveChild(name));
            } else if self.consume(".") {
                if self.consume("*") {
                    steps.push(Step::Wildcard);
                } else {
                    let name = self.parse_identifier()?;
                    steps.push(Step::Child(name));
                }
            } else if self.peek() == Some('[') {
                self.bump();
                self.skip_ws();
                if self.consume("?(") {
                    let predicate = self.parse_or()?;
                    self.skip_ws();
                    self.expect_char(')')?;
                    self.skip_ws();
                    self.expect_char(']')?;
                    steps.push(Step::Filter(predicate));
                } else if self.consume("*") {
                    self.skip_ws();
                    self.expect_char(']')?;
                    steps.push(Step::Wildcard);
                } else if self.peek() == Some('\'') {
                    let name = self.parse_string_literal()?;
                    self.skip_ws();
                    self.expect_char(']')?;
                    steps.push(Step::Child(name));
                } else {
                    let n = self.parse_uint()?;
                    self.skip_ws();
                    self.expect_char(']')?;
                    steps.push(Step::Index(n));
                }
            } else {
                break;
            }
        }
        Ok(steps)
    }

    fn parse_identifier(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.bump();
        }
        if self.pos == start {
            return Err(self.err("expected an identifier"));
        }
        Ok(self.src[start..self.pos].to_owned())
    }

    fn parse_uint(&mut self) -> Result<usize, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        if self.pos == start {
            return Err(self.err("expected an integer index"));
        }
        self.src[start..self.pos]
            .parse()
            .map_err(|_| self.err("integer index out of range"))
    }

    fn parse_string_literal(&mut self) -> Result<String, ParseError> {
        self.expect_char('\'')?;
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string literal")),
                Some('\'') => break,
                Some('\\') => match self.bump() {
                    Some('\'') => s.push('\''),
                    Some('\\') => s.push('\\'),
                    Some(other) => s.push(other),
                    None => return Err(self.err("unterminated escape")),
                },
                Some(c) => s.push(c),
            }
        }
        Ok(s)
    }

    fn parse_regex_literal(&mut self) -> Result<(Regex, String), ParseError> {
        self.expect_char('/')?;
        let mut pattern = String::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated regex literal")),
                Some('/') => break,
                Some('\\') => {
                    pattern.push('\\');
                    match self.bump() {
                        Some(c) => pattern.push(c),
                        None => return Err(self.err("unterminated escape in regex literal")),
                    }
                }
                Some(c) => pattern.push(c),
            }
        }
        let mut flags = String::new();
        while matches!(self.peek(), Some(c) if c.is_alphabetic()) {
            flags.push(self.bump().unwrap());
        }
        for flag in flags.chars() {
            if flag != 'i' {
                return Err(self.err(format!("unsupported regex flag '{flag}'")));
            }
        }
        let compiled_pattern = if flags.contains('i') {
            format!("(?i){pattern}")
        } else {
            pattern.clone()
        };
        let regex = Regex::new(&compiled_pattern)
            .map_err(|e| self.err(format!("invalid regex /{pattern}/{flags}: {e}")))?;
        Ok((regex, format!("/{pattern}/{flags}")))
    }

    // -- predicate grammar: or_expr := and_expr ('|' and_expr)* ---------------
    fn parse_or(&mut self) -> Result<Predicate, ParseError> {
        let mut terms = vec![self.parse_and()?];
        loop {
            self.skip_ws();
            if self.consume("|") {
                self.skip_ws();
                terms.push(self.parse_and()?);
            } else {
                break;
            }
        }
        Ok(if terms.len() == 1 { terms.pop().unwrap() } else { Predicate::Or(terms) })
    }

    fn parse_and(&mut self) -> Result<Predicate, ParseError> {
        let mut terms = vec![self.parse_comparison()?];
        loop {
            self.skip_ws();
            if self.consume("&") {
                self.skip_ws();
                terms.push(self.parse_comparison()?);
            } else {
                break;
            }
        }
        Ok(if terms.len() == 1 { terms.pop().unwrap() } else { Predicate::And(terms) })
    }

    fn parse_comparison(&mut self) -> Result<Predicate, ParseError> {
        self.skip_ws();
        let lhs = self.parse_operand()?;
        self.skip_ws();
        let op = self.try_parse_cmp_op();
        match op {
            None => Ok(Predicate::Compare(lhs, None)),
            Some(op) => {
                self.skip_ws();
                let rhs = self.parse_operand()?;
                Ok(Predicate::Compare(lhs, Some((op, rhs))))
            }
        }
    }

    fn try_parse_cmp_op(&mut self) -> Option<CmpOp> {
        if self.consume("!=") {
            Some(CmpOp::Ne)
        } else if self.consume("<=") {
            Some(CmpOp::Le)
        } else if self.consume(">=") {
            Some(CmpOp::Ge)
        } else if self.consume("=") {
            Some(CmpOp::Eq)
        } else if self.consume("<") {
            Some(CmpOp::Lt)
        } else if self.consume(">") {
            Some(CmpOp::Gt)
        } else if self.consume("~") {
            Some(CmpOp::Match)
        } else {
            None
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        self.skip_ws();
        match self.peek() {
            Some('@') => {
                self.bump();
                let steps = self.parse_segments()?;
                Ok(Operand::RelativePath(steps))
            }
            Some('\'') => Ok(Operand::Literal(Literal::String(self.parse_string_literal()?))),
            Some('/') => {
                let (regex, _src) = self.parse_regex_literal()?;
                Ok(Operand::Literal(Literal::Regex(Box::new(regex), _src)))
            }
            Some(c) if c == '-' || c.is_ascii_digit() => {
                let start = self.pos;
                if c == '-' {
                    self.bump();
                }
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                    self.bump();
                }
                let n: f64 = self.src[start..self.pos]
                    .parse()
                    .map_err(|_| self.err("invalid numeric literal"))?;
                Ok(Operand::Literal(Literal::Number(n)))
            }
            _ if self.consume("true") => Ok(Operand::Literal(Literal::Bool(true))),
            _ if self.consume("false") => Ok(Operand::Literal(Literal::Bool(false))),
            _ if self.consume("null") => Ok(Operand::Literal(Literal::Null)),
            _ => Err(self.err("expected a path, string, number, regex or boolean literal")),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval_steps<'v>(steps: &[Step], nodes: &[&'v Value]) -> Vec<&'v Value> {
    let mut current: Vec<&'v Value> = nodes.to_vec();
    for step in steps {
        current = eval_step(step, &current);
    }
    current
}

fn eval_step<'v>(step: &Step, nodes: &[&'v Value]) -> Vec<&'v Value> {
    match step {
        Step::Child(name) => nodes
            .iter()
            .filter_map(|n| n.as_object().and_then(|o| o.get(name)))
            .collect(),
        Step::Wildcard => nodes
            .iter()
            .flat_map(|n| -> Vec<&'v Value> {
                if let Some(arr) = n.as_array() {
                    arr.iter().collect()
                } else if let Some(obj) = n.as_object() {
                    obj.values().collect()
                } else {
                    Vec::new()
                }
            })
            .collect(),
        Step::Index(i) => nodes
            .iter()
            .filter_map(|n| n.as_array().and_then(|arr| arr.get(*i)))
            .collect(),
        Step::RecursiveChild(name) => {
            let mut out = Vec::new();
            for n in nodes {
                collect_recursive(n, name, &mut out);
            }
            out
        }
        Step::Filter(predicate) => nodes
            .iter()
            .flat_map(|n| -> Vec<&'v Value> {
                if let Some(arr) = n.as_array() {
                    arr.iter().filter(|elem| eval_predicate(predicate, elem)).collect()
                } else if eval_predicate(predicate, n) {
                    vec![*n]
                } else {
                    Vec::new()
                }
            })
            .collect(),
    }
}

fn collect_recursive<'v>(node: &'v Value, name: &str, out: &mut Vec<&'v Value>) {
    match node {
        Value::Object(map) => {
            if let Some(v) = map.get(name) {
                out.push(v);
            }
            for v in map.values() {
                collect_recursive(v, name, out);
            }
        }
        Value::Array(arr) => {
            for v in arr {
                collect_recursive(v, name, out);
            }
        }
        _ => {}
    }
}

fn eval_predicate(predicate: &Predicate, current: &Value) -> bool {
    match predicate {
        Predicate::Or(terms) => terms.iter().any(|p| eval_predicate(p, current)),
        Predicate::And(terms) => terms.iter().all(|p| eval_predicate(p, current)),
        Predicate::Compare(lhs, None) => match lhs {
            Operand::RelativePath(steps) => {
                eval_steps(steps, std::slice::from_ref(&current)).into_iter().any(is_truthy)
            }
            Operand::Literal(lit) => is_truthy(&literal_to_value(lit)),
        },
        Predicate::Compare(lhs, Some((op, rhs))) => {
            let left = resolve_operand(lhs, current);
            if *op == CmpOp::Match {
                let (Some(text), Operand::Literal(Literal::Regex(re, _))) = (&left, rhs) else {
                    return false;
                };
                return text.as_str().map(|s| re.is_match(s)).unwrap_or(false);
            }
            let right = resolve_operand(rhs, current);
            match (left, right) {
                (Some(l), Some(r)) => compare(*op, &l, &r),
                _ => false,
            }
        }
    }
}

fn resolve_operand(operand: &Operand, current: &Value) -> Option<Value> {
    match operand {
        Operand::RelativePath(steps) => {
            let matches = eval_steps(steps, std::slice::from_ref(&current));
            if matches.len() == 1 {
                Some(matches[0].clone())
            } else {
                None
            }
        }
        Operand::Literal(lit) => Some(literal_to_value(lit)),
    }
}

fn literal_to_value(lit: &Literal) -> Value {
    match lit {
        Literal::String(s) => Value::String(s.clone()),
        Literal::Number(n) => serde_json::Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
        Literal::Regex(_, src) => Value::String(src.clone()),
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        _ => true,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => json_eq(left, right),
        CmpOp::Ne => !json_eq(left, right),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => match op {
                    CmpOp::Lt => l < r,
                    CmpOp::Le => l <= r,
                    CmpOp::Gt => l > r,
                    CmpOp::Ge => l >= r,
                    _ => unreachable!(),
                },
                _ => false,
            }
        }
        CmpOp::Match => false,
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
