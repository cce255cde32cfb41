//! Restricted condition expressions for IF/ASSERT.
//!
//! Deliberately not a general evaluator: the grammar is one operand or one
//! comparison between two operands, where an operand is a literal, an
//! environment lookup, or a register lookup.
//!
//! ```text
//! expr    := operand (op operand)?
//! operand := 'str' | "str" | number | true | false
//!          | env.NAME | env['NAME'] | env["NAME"] | reg[N]
//! op      := == | != | <= | >= | < | >
//! ```

use std::collections::BTreeMap;

use crate::regs::{RegisterFile, Slot};

#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// An env/reg lookup that resolved to nothing.
    Missing,
}

impl ExprValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            ExprValue::Int(v) => Some(*v as f64),
            ExprValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            ExprValue::Bool(b) => *b,
            ExprValue::Int(v) => *v != 0,
            ExprValue::Float(v) => *v != 0.0,
            ExprValue::Str(s) => s == "true" || s == "1",
            ExprValue::Missing => false,
        }
    }

    fn display(&self) -> String {
        match self {
            ExprValue::Str(s) => s.clone(),
            ExprValue::Int(v) => v.to_string(),
            ExprValue::Float(v) => v.to_string(),
            ExprValue::Bool(b) => b.to_string(),
            ExprValue::Missing => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(ExprValue),
    Env(String),
    Reg(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    left: Operand,
    rest: Option<(CmpOp, Operand)>,
}

impl Condition {
    /// Parse a condition; the whole input must be consumed.
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut p = Parser::new(input);
        p.skip_ws();
        let left = p.operand()?;
        p.skip_ws();
        let rest = if p.at_end() {
            None
        } else {
            let op = p.cmp_op()?;
            p.skip_ws();
            let right = p.operand()?;
            p.skip_ws();
            if !p.at_end() {
                return Err(format!("trailing input at offset {}", p.pos));
            }
            Some((op, right))
        };
        Ok(Condition { left, rest })
    }

    pub fn eval(&self, env: &BTreeMap<String, String>, regs: &RegisterFile) -> bool {
        let left = resolve(&self.left, env, regs);
        match &self.rest {
            None => left.truthy(),
            Some((op, right)) => {
                let right = resolve(right, env, regs);
                compare(*op, &left, &right)
            }
        }
    }
}

fn resolve(operand: &Operand, env: &BTreeMap<String, String>, regs: &RegisterFile) -> ExprValue {
    match operand {
        Operand::Literal(v) => v.clone(),
        Operand::Env(name) => match env.get(name) {
            Some(value) => ExprValue::Str(value.clone()),
            None => ExprValue::Missing,
        },
        Operand::Reg(index) => match regs.read(*index) {
            Ok(Slot::Null) => ExprValue::Missing,
            Ok(Slot::Int(v)) => ExprValue::Int(*v),
            Ok(Slot::Float(v)) => ExprValue::Float(*v),
            Ok(Slot::Bool(v)) => ExprValue::Bool(*v),
            Ok(Slot::Str(v)) => ExprValue::Str(v.clone()),
            Ok(Slot::Bytes(_)) | Err(_) => ExprValue::Missing,
        },
    }
}

fn compare(op: CmpOp, left: &ExprValue, right: &ExprValue) -> bool {
    use ExprValue::Missing;
    if matches!(left, Missing) || matches!(right, Missing) {
        // A missing lookup equals nothing; it only satisfies `!=`.
        return op == CmpOp::Ne;
    }
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let equal = match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => l == r,
                _ => left.display() == right.display(),
            };
            (op == CmpOp::Eq) == equal
        }
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => l.partial_cmp(&r),
                _ => Some(left.display().cmp(&right.display())),
            };
            match ordering {
                Some(ord) => match op {
                    CmpOp::Lt => ord.is_lt(),
                    CmpOp::Le => ord.is_le(),
                    CmpOp::Gt => ord.is_gt(),
                    CmpOp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Parser {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.bytes[self.pos..].starts_with(token.as_bytes()) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn cmp_op(&mut self) -> Result<CmpOp, String> {
        for (token, op) in [
            ("==", CmpOp::Eq),
            ("!=", CmpOp::Ne),
            ("<=", CmpOp::Le),
            (">=", CmpOp::Ge),
            ("<", CmpOp::Lt),
            (">", CmpOp::Gt),
        ] {
            if self.eat(token) {
                return Ok(op);
            }
        }
        Err(format!("expected comparison operator at offset {}", self.pos))
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.peek() {
            Some(b'\'') | Some(b'"') => self.quoted_string().map(|s| {
                Operand::Literal(ExprValue::Str(s))
            }),
            Some(c) if c.is_ascii_digit() || c == b'-' => self.number(),
            Some(_) => self.word(),
            None => Err("expected operand, found end of input".to_string()),
        }
    }

    fn quoted_string(&mut self) -> Result<String, String> {
        let quote = self.bytes[self.pos];
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == quote {
                let s = std::str::from_utf8(&self.bytes[start..self.pos])
                    .map_err(|_| "invalid utf-8 in string literal".to_string())?
                    .to_string();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
        Err("unterminated string literal".to_string())
    }

    fn number(&mut self) -> Result<Operand, String> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut saw_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == b'.' && !saw_dot {
                saw_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        if saw_dot {
            text.parse::<f64>()
                .map(|v| Operand::Literal(ExprValue::Float(v)))
                .map_err(|_| format!("invalid float literal {text:?}"))
        } else {
            text.parse::<i64>()
                .map(|v| Operand::Literal(ExprValue::Int(v)))
                .map_err(|_| format!("invalid integer literal {text:?}"))
        }
    }

    fn word(&mut self) -> Result<Operand, String> {
        if self.eat("env.") {
            return self.env_name();
        }
        if self.eat("env[") {
            let name = match self.peek() {
                Some(b'\'') | Some(b'"') => self.quoted_string()?,
                _ => return Err("env[...] requires a quoted name".to_string()),
            };
            if !self.eat("]") {
                return Err("missing ']' after env lookup".to_string());
            }
            return Ok(Operand::Env(name));
        }
        if self.eat("reg[") {
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
            if start == self.pos {
                return Err("reg[...] requires a register index".to_string());
            }
            let index: usize = std::str::from_utf8(&self.bytes[start..self.pos])
                .unwrap()
                .parse()
                .map_err(|_| "invalid register index".to_string())?;
            if !self.eat("]") {
                return Err("missing ']' after reg lookup".to_string());
            }
            return Ok(Operand::Reg(index));
        }
        if self.eat("true") {
            return Ok(Operand::Literal(ExprValue::Bool(true)));
        }
        if self.eat("false") {
            return Ok(Operand::Literal(ExprValue::Bool(false)));
        }
        Err(format!("unrecognized operand at offset {}", self.pos))
    }

    fn env_name(&mut self) -> Result<Operand, String> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err("env. requires a variable name".to_string());
        }
        let name = std::str::from_utf8(&self.bytes[start..self.pos])
            .unwrap()
            .to_string();
        Ok(Operand::Env(name))
    }
}

/// Parse and evaluate in one step.
pub fn eval_condition(
    input: &str,
    env: &BTreeMap<String, String>,
    regs: &RegisterFile,
) -> Result<bool, String> {
    Ok(Condition::parse(input)?.eval(env, regs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn boolean_literals() {
        let regs = RegisterFile::default();
        let e = env(&[]);
        assert!(eval_condition("true", &e, &regs).unwrap());
        assert!(!eval_condition("false", &e, &regs).unwrap());
    }

    #[test]
    fn env_equality_both_syntaxes() {
        let regs = RegisterFile::default();
        let e = env(&[("X", "1"), ("NAME", "utek")]);
        assert!(eval_condition("env.X == '1'", &e, &regs).unwrap());
        assert!(eval_condition("env['NAME'] == 'utek'", &e, &regs).unwrap());
        assert!(eval_condition("env.X != '2'", &e, &regs).unwrap());
        assert!(!eval_condition("env.X == '2'", &e, &regs).unwrap());
    }

    #[test]
    fn missing_env_only_satisfies_not_equal() {
        let regs = RegisterFile::default();
        let e = env(&[]);
        assert!(!eval_condition("env.ABSENT == ''", &e, &regs).unwrap());
        assert!(eval_condition("env.ABSENT != 'x'", &e, &regs).unwrap());
        assert!(!eval_condition("env.ABSENT", &e, &regs).unwrap());
    }

    #[test]
    fn register_comparisons() {
        let mut regs = RegisterFile::default();
        regs.write(0, Slot::Int(10)).unwrap();
        regs.write(1, Slot::Str("abc".into())).unwrap();
        let e = env(&[]);
        assert!(eval_condition("reg[0] >= 10", &e, &regs).unwrap());
        assert!(eval_condition("reg[0] < 11", &e, &regs).unwrap());
        assert!(eval_condition("reg[1] == 'abc'", &e, &regs).unwrap());
        assert!(!eval_condition("reg[2] == 'abc'", &e, &regs).unwrap());
    }

    #[test]
    fn numeric_strings_compare_numerically() {
        let regs = RegisterFile::default();
        let e = env(&[("N", "10")]);
        // env values are strings; against a numeric literal the string
        // form is used unless both sides are numeric.
        assert!(eval_condition("env.N == '10'", &e, &regs).unwrap());
        assert!(eval_condition("10 == 10.0", &e, &regs).unwrap());
        assert!(eval_condition("2 < 10", &e, &regs).unwrap());
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(Condition::parse("env.").is_err());
        assert!(Condition::parse("reg[] == 1").is_err());
        assert!(Condition::parse("'unterminated").is_err());
        assert!(Condition::parse("true extra").is_err());
        assert!(Condition::parse("1 ~ 2").is_err());
        assert!(Condition::parse("").is_err());
    }

    #[test]
    fn ordering_on_strings_is_lexicographic() {
        let regs = RegisterFile::default();
        let e = env(&[("A", "apple"), ("B", "banana")]);
        assert!(eval_condition("env.A < env.B", &e, &regs).unwrap());
        assert!(eval_condition("env.B > env.A", &e, &regs).unwrap());
    }
}
