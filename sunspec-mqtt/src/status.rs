use std::fmt;

use crate::value::Value;

/// SunSpec operating state meaning "one or more faults exist".
pub const FAULT: i64 = 7;

/// Projects the SunSpec operating state (`St`) onto the generic status code.
///
/// | `St`  | generic          |
/// |-------|------------------|
/// | 2, 8  | 8 Standby        |
/// | 4     | 7 Running        |
/// | 7     | 10 Error         |
/// | other | 0 Startup        |
pub fn status_code(state: i64) -> i64 {
    match state {
        2 | 8 => 8,
        4 => 7,
        FAULT => 10,
        _ => 0,
    }
}

/// `e-` and the zero padded `Evt1` code while the device is faulted, empty otherwise.
///
/// A missing event code is reported as zero.
pub fn error_id(state: Option<i64>, event: Option<&Value>) -> String {
    if state != Some(FAULT) {
        return String::new();
    }
    match event {
        Some(Value::Text(s)) if s.trim().parse::<i64>().is_err() => {
            format!("e-{:0>8}", s.trim())
        }
        _ => format!("e-{:08}", event.and_then(Value::as_integer).unwrap_or_default()),
    }
}

/// Wrapping freshness counter, bumped once per published cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct UpdateIndex(pub u8);

impl UpdateIndex {
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl From<&Value> for UpdateIndex {
    /// Anything outside `0..=255` starts over at zero.
    fn from(value: &Value) -> Self {
        value
            .as_integer()
            .and_then(|i| u8::try_from(i).ok())
            .map(Self)
            .unwrap_or_default()
    }
}

impl From<UpdateIndex> for Value {
    fn from(index: UpdateIndex) -> Self {
        Value::Integer(i64::from(index.0))
    }
}

impl fmt::Display for UpdateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn status_mapping_matches_table() {
    assert_eq!(status_code(2), 8);
    assert_eq!(status_code(8), 8);
    assert_eq!(status_code(4), 7);
    assert_eq!(status_code(7), 10);
    for other in [1, 3, 5, 6, 99, 0, -1] {
        assert_eq!(status_code(other), 0, "St = {}", other);
    }
}

#[test]
fn error_id_only_while_faulted() {
    assert_eq!(error_id(Some(7), Some(&Value::from("42"))), "e-00000042");
    assert_eq!(error_id(Some(7), Some(&Value::Integer(42))), "e-00000042");
    assert_eq!(error_id(Some(4), Some(&Value::from("42"))), "");
    assert_eq!(error_id(None, Some(&Value::from("42"))), "");
    assert_eq!(error_id(Some(7), None), "e-00000000");
    assert_eq!(error_id(Some(7), Some(&Value::from("A1"))), "e-000000A1");
}

#[test]
fn update_index_wraps() {
    assert_eq!(UpdateIndex(255).next(), UpdateIndex(0));
    assert_eq!(UpdateIndex(0).next(), UpdateIndex(1));
    assert_eq!(UpdateIndex::from(&Value::Integer(300)), UpdateIndex(0));
    assert_eq!(UpdateIndex::from(&Value::Integer(17)), UpdateIndex(17));
    assert_eq!(UpdateIndex::from(&Value::Empty), UpdateIndex(0));
}
