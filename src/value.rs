//! Runtime values and VCL coercion rules
//!
//! Expression evaluation produces a tagged [`Value`]. VCL is forgiving:
//! type mismatches prefer coercion over failure, and only arithmetically
//! impossible operations (division by zero) raise evaluation errors.

use crate::error::EvalError;
use regex::Regex;
use std::fmt;
use std::net::IpAddr;

/// A tagged VCL runtime value
#[derive(Debug, Clone)]
pub enum Value {
    /// String
    Str(String),
    /// Integer
    Integer(i64),
    /// Float
    Float(f64),
    /// Boolean
    Bool(bool),
    /// Duration in seconds
    Duration(f64),
    /// IP address
    Ip(IpAddr),
    /// Compiled regex
    Regex(Regex),
    /// Absent value; reads of unknown objects produce this
    Null,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::Ip(a), Value::Ip(b)) => a == b,
            (Value::Regex(a), Value::Regex(b)) => a.as_str() == b.as_str(),
            (Value::Null, Value::Null) => true,
            _ => false,
        }
    }
}

impl Value {
    /// Stringifies the value the way VCL string context does
    ///
    /// Booleans become `"true"`/`"false"`, floats use the shortest
    /// round-trip form, null becomes the empty string.
    pub fn to_vcl_string(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Integer(n) => n.to_string(),
            Value::Float(x) => format_float(*x),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Duration(secs) => format!("{:.3}", secs),
            Value::Ip(ip) => ip.to_string(),
            Value::Regex(re) => re.as_str().to_string(),
            Value::Null => String::new(),
        }
    }

    /// VCL truthiness: bools as-is, numbers non-zero, strings non-empty,
    /// null false
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Integer(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Duration(secs) => *secs != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Ip(_) | Value::Regex(_) => true,
            Value::Null => false,
        }
    }

    /// Numeric view used by arithmetic and relational operators
    ///
    /// Strings are parsed as numbers, or as durations when they carry a
    /// trailing time unit (`"5m"`).
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(x) => Some(*x),
            Value::Duration(secs) => Some(*secs),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .or_else(|| parse_duration(s)),
            _ => None,
        }
    }

    /// True when the value is an integer or float
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    /// Equality after coercing both sides to the stronger common type
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            // Bool dominates: compare truthiness.
            (Value::Bool(_), _) | (_, Value::Bool(_)) => self.truthy() == other.truthy(),
            // Null equals null and the unset empty string.
            (Value::Null, Value::Null) => true,
            (Value::Null, Value::Str(s)) | (Value::Str(s), Value::Null) => s.is_empty(),
            (Value::Null, _) | (_, Value::Null) => false,
            // Numbers (and durations) compare numerically.
            (a, b) if a.as_number().is_some() && b.is_numeric() => {
                a.as_number() == b.as_number()
            }
            (a, b) if a.is_numeric() && b.as_number().is_some() => {
                a.as_number() == b.as_number()
            }
            (Value::Duration(_), _) | (_, Value::Duration(_)) => {
                self.as_number() == other.as_number() && self.as_number().is_some()
            }
            _ => self.to_vcl_string() == other.to_vcl_string(),
        }
    }

    /// Addition: string context concatenates, numeric context adds
    pub fn add(&self, other: &Value) -> Result<Value, EvalError> {
        if matches!(self, Value::Str(_)) || matches!(other, Value::Str(_)) {
            return Ok(Value::Str(format!(
                "{}{}",
                self.to_vcl_string(),
                other.to_vcl_string()
            )));
        }
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a.wrapping_add(*b))),
            (Value::Duration(a), Value::Duration(b)) => Ok(Value::Duration(a + b)),
            _ => self.numeric_op(other, "+", |a, b| a + b),
        }
    }

    /// Subtraction
    pub fn sub(&self, other: &Value) -> Result<Value, EvalError> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a.wrapping_sub(*b))),
            (Value::Duration(a), Value::Duration(b)) => Ok(Value::Duration(a - b)),
            _ => self.numeric_op(other, "-", |a, b| a - b),
        }
    }

    /// Multiplication
    pub fn mul(&self, other: &Value) -> Result<Value, EvalError> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a.wrapping_mul(*b))),
            _ => self.numeric_op(other, "*", |a, b| a * b),
        }
    }

    /// Division; zero divisor raises an evaluation error
    pub fn div(&self, other: &Value) -> Result<Value, EvalError> {
        let rhs = other.as_number().ok_or_else(|| EvalError::InvalidOperands {
            op: "/".to_string(),
        })?;
        if rhs == 0.0 {
            return Err(EvalError::DivisionByZero);
        }
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a / b)),
            _ => self.numeric_op(other, "/", |a, b| a / b),
        }
    }

    /// Integer remainder; float operands are truncated to integers first
    pub fn rem(&self, other: &Value) -> Result<Value, EvalError> {
        let a = self.as_number().ok_or_else(|| EvalError::InvalidOperands {
            op: "%".to_string(),
        })? as i64;
        let b = other.as_number().ok_or_else(|| EvalError::InvalidOperands {
            op: "%".to_string(),
        })? as i64;
        if b == 0 {
            return Err(EvalError::DivisionByZero);
        }
        Ok(Value::Integer(a % b))
    }

    /// Relational comparison; requires numeric or duration operands
    pub fn compare(&self, other: &Value, op: &str) -> Result<bool, EvalError> {
        let (a, b) = match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(EvalError::InvalidOperands {
                    op: op.to_string(),
                });
            }
        };
        Ok(match op {
            "<" => a < b,
            "<=" => a <= b,
            ">" => a > b,
            ">=" => a >= b,
            _ => false,
        })
    }

    fn numeric_op(
        &self,
        other: &Value,
        op: &str,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Value, EvalError> {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => Ok(Value::Float(f(a, b))),
            _ => Err(EvalError::InvalidOperands {
                op: op.to_string(),
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_vcl_string())
    }
}

/// Formats a float with the shortest round-trip decimal form
fn format_float(x: f64) -> String {
    if x == x.trunc() && x.abs() < 1e15 {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}

/// Parses a VCL duration literal (`250ms`, `30s`, `5m`, `2h`, `1d`, `1y`)
/// into seconds
pub fn parse_duration(text: &str) -> Option<f64> {
    let text = text.trim();
    let unit_start = text.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (digits, unit) = text.split_at(unit_start);
    let number: f64 = digits.parse().ok()?;
    let multiplier = match unit {
        "ms" => 0.001,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        "y" => 31_536_000.0,
        _ => return None,
    };
    Some(number * multiplier)
}
