//! Acquisition and normalization: turns one device read into a flat map of canonical metrics.

use itertools::Itertools;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::{
    config::DeviceConfig,
    sunspec::{DeviceClient, Model},
    value::Value,
};

/// Presence marker written once per model. A map without it means the device was not read.
pub const MODEL_ID: &str = "ModelID";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metric {
    pub label: String,
    pub value: Value,
    pub unit: String,
}

pub type Metrics = HashMap<String, Metric>;

/// Reads the device once and normalizes every implemented point.
///
/// Errors are not returned: a failed read yields an empty map, which callers see as a missing
/// [`MODEL_ID`].
#[tracing::instrument(level = "debug", skip(client))]
pub async fn acquire<C: DeviceClient + ?Sized>(client: &C, device: &DeviceConfig) -> Metrics {
    match client.read_models(device).await {
        Ok(models) => collect(&models),
        Err(error) => {
            warn!(%error, "Reading device failed");
            Metrics::new()
        }
    }
}

/// Flattens models into metrics. Later points with the same key replace earlier ones.
pub fn collect(models: &[Model]) -> Metrics {
    let mut metrics = Metrics::new();

    for model in models {
        metrics.insert(
            MODEL_ID.to_owned(),
            Metric {
                label: model.label.clone(),
                value: Value::Integer(i64::from(model.id)),
                unit: String::new(),
            },
        );

        for point in &model.points {
            let Some(raw) = &point.value else { continue };
            let unit = point.units.as_deref().unwrap_or_default();

            match normalize(&point.id, &point.label, raw, unit) {
                Some((key, metric)) => {
                    metrics.insert(key, metric);
                }
                None => warn!(key = %point.id, %raw, unit, "Unparseable point value"),
            }
        }
    }

    for (key, metric) in metrics.iter().sorted_by_key(|(key, _)| *key) {
        debug!(%key, label = %metric.label, value = %metric.value, unit = %metric.unit, "values");
    }

    metrics
}

/// Applies the unit/key specific transform to one raw point value.
///
/// Returns the canonical key (which differs from `key` for energy) and the metric, or `None` if
/// the value cannot be parsed for the transform its unit or key selects.
pub fn normalize(key: &str, label: &str, raw: &str, unit: &str) -> Option<(String, Metric)> {
    let raw = raw.trim_end_matches('\0');

    let (key, value, unit) = match (unit, key) {
        ("A" | "W" | "V" | "C", _) => (key, Value::Number(decimal(raw)?.round_dp(2)), unit),
        ("Hz", _) => (key, Value::Number(decimal(raw)?.round_dp(4)), unit),
        (_, "St" | "StVnd") => (key, Value::Integer(raw.trim().parse().ok()?), unit),
        (_, "WH") => {
            let kwh = decimal(raw)?.checked_div(Decimal::ONE_THOUSAND)?.round_dp(2);
            ("kWH", Value::Number(kwh), "kWH")
        }
        _ => (key, Value::Text(raw.to_owned()), unit),
    };

    Some((
        key.to_owned(),
        Metric {
            label: label.to_owned(),
            value,
            unit: unit.to_owned(),
        },
    ))
}

fn decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    raw.parse()
        .ok()
        .or_else(|| Decimal::from_scientific(raw).ok())
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
use crate::sunspec::Point;

#[cfg(test)]
fn point(id: &str, units: Option<&str>, value: Option<&str>) -> Point {
    Point {
        id: id.to_owned(),
        label: format!("{} label", id),
        units: units.map(str::to_owned),
        value: value.map(str::to_owned),
    }
}

#[cfg(test)]
fn value(key: &str, raw: &str, unit: &str) -> (String, Value, String) {
    let (key, metric) = normalize(key, "label", raw, unit).unwrap();
    (key, metric.value, metric.unit)
}

#[test]
fn analog_units_round_to_two_places() {
    for unit in ["A", "W", "V", "C"] {
        assert_eq!(
            value("X", "12.3456", unit),
            ("X".to_owned(), Value::Number(Decimal::new(1235, 2)), unit.to_owned())
        );
    }
}

#[test]
fn frequency_rounds_to_four_places() {
    assert_eq!(
        value("Hz", "50.012345", "Hz").1,
        Value::Number(Decimal::new(500123, 4))
    );
}

#[test]
fn rounding_is_idempotent() {
    for (raw, unit) in [("2841.129", "W"), ("12.3456", "A"), ("50.012345", "Hz")] {
        let (_, once, _) = value("X", raw, unit);
        let (_, twice, _) = value("X", &once.to_string(), unit);
        assert_eq!(once, twice, "{}", unit);
    }
}

#[test]
fn state_codes_are_integers() {
    assert_eq!(value("St", "4\0\0", "").1, Value::Integer(4));
    assert_eq!(value("StVnd", "12", "").1, Value::Integer(12));
    assert!(normalize("St", "label", "four", "").is_none());
}

#[test]
fn watt_hours_become_kilowatt_hours() {
    assert_eq!(
        value("WH", "3000", "Wh"),
        ("kWH".to_owned(), Value::Number(Decimal::new(300, 2)), "kWH".to_owned())
    );
    assert_eq!(
        value("WH", "1234567", "Wh").1,
        Value::Number(Decimal::new(123457, 2))
    );
}

#[test]
fn other_points_stay_text_without_padding() {
    assert_eq!(
        value("Mn", "Power-One\0\0\0", ""),
        ("Mn".to_owned(), Value::from("Power-One"), "".to_owned())
    );
    assert_eq!(value("Evt1", "42", "").1, Value::from("42"));
}

#[test]
fn collect_marks_presence_and_skips_empty_points() {
    let models = vec![Model {
        id: 103,
        label: "Inverter (Three Phase)".to_owned(),
        points: vec![
            point("W", Some("W"), Some("2841")),
            point("VA", Some("VA"), None),
            point("St", None, Some("4")),
        ],
    }];

    let metrics = collect(&models);

    assert_eq!(metrics[MODEL_ID].value, Value::Integer(103));
    assert_eq!(metrics[MODEL_ID].label, "Inverter (Three Phase)");
    assert_eq!(metrics["W"].value, Value::Number(Decimal::from(2841)));
    assert_eq!(metrics["St"].unit, "");
    assert!(!metrics.contains_key("VA"));
}

#[test]
fn collect_last_point_wins() {
    let models = vec![
        Model {
            id: 1,
            label: "Common".to_owned(),
            points: vec![point("Hz", Some("Hz"), Some("49.9"))],
        },
        Model {
            id: 103,
            label: "Inverter (Three Phase)".to_owned(),
            points: vec![point("Hz", Some("Hz"), Some("50.01"))],
        },
    ];

    let metrics = collect(&models);

    assert_eq!(metrics["Hz"].value, Value::Number(Decimal::new(5001, 2)));
    assert_eq!(metrics[MODEL_ID].value, Value::Integer(103));
}

#[test]
fn collect_of_nothing_has_no_model_id() {
    assert!(!collect(&[]).contains_key(MODEL_ID));
}
