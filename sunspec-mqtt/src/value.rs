use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A metric or published path value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Text(String),
    Number(Decimal),
    Empty,
}

impl Value {
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Number(d) => Some(*d),
            Value::Integer(i) => Some(Decimal::from(*i)),
            Value::Text(_) | Value::Empty => None,
        }
    }

    /// Integral view of the value. Text is accepted when it holds a plain integer, which is how
    /// event bitfields come out of normalization.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(d) if d.fract().is_zero() => d.to_i64(),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Number(_) | Value::Empty => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Text(s) => f.write_str(s),
            Value::Number(d) => write!(f, "{}", d),
            Value::Empty => Ok(()),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Number(d)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn integer_view_of_event_text() {
    assert_eq!(Value::from("42").as_integer(), Some(42));
    assert_eq!(Value::from("0x2a").as_integer(), None);
    assert_eq!(Value::Number(Decimal::new(700, 2)).as_integer(), Some(7));
    assert_eq!(Value::Number(Decimal::new(705, 2)).as_integer(), None);
}

#[test]
fn deserialize_external_writes() {
    assert_eq!(serde_json::from_str::<Value>("0").unwrap(), Value::Integer(0));
    assert_eq!(
        serde_json::from_str::<Value>("\"12\"").unwrap(),
        Value::from("12")
    );
    assert_eq!(serde_json::from_str::<Value>("null").unwrap(), Value::Empty);
    assert!(matches!(
        serde_json::from_str::<Value>("1.5").unwrap(),
        Value::Number(_)
    ));
}
