use rust_decimal::Decimal;
use std::fmt;

use crate::{config::InverterConfig, value::Value};

pub const STATUS_CODE: &str = "/StatusCode";
pub const UPDATE_INDEX: &str = "/UpdateIndex";
pub const ERROR_ID: &str = "/Error/0/Id";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    /// Line number on the published side, `L1` for phase A and so on.
    pub fn line(&self) -> u8 {
        match self {
            Phase::A => 1,
            Phase::B => 2,
            Phase::C => 3,
        }
    }

    pub fn current_key(&self) -> String {
        format!("Aph{}", self)
    }

    pub fn voltage_key(&self) -> String {
        format!("PhVph{}", self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::A => "A",
            Phase::B => "B",
            Phase::C => "C",
        })
    }
}

/// Where the value of a path comes from on each cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    DirectKey(String),
    /// Current times voltage of one phase
    PhaseDerivedPower(Phase),
    /// Total energy split evenly over the three phases
    PhaseDerivedEnergy,
    StatusDerived,
}

/// Display formatter of a path. Purely cosmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Watts,
    Amps,
    Volts,
    Hertz,
    KilowattHours,
    Integer,
    Text,
}

impl Format {
    pub fn text(&self, value: &Value) -> String {
        let Some(d) = value.as_decimal() else {
            return value.to_string();
        };
        match self {
            Format::Watts => format!("{}W", d.trunc()),
            Format::Amps => format!("{}A", fixed(d, 2)),
            Format::Volts => format!("{}V", fixed(d, 2)),
            Format::Hertz => format!("{}Hz", fixed(d, 4)),
            Format::KilowattHours => format!("{}kWh", fixed(d, 2)),
            Format::Integer => d.trunc().to_string(),
            Format::Text => value.to_string(),
        }
    }
}

fn fixed(d: Decimal, dp: u32) -> Decimal {
    let mut d = d.round_dp(dp);
    d.rescale(dp);
    d
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPath {
    pub path: String,
    pub initial: Value,
    pub format: Format,
    /// `None` for paths that are only written at startup or by the service itself.
    pub source: Option<Source>,
}

impl OutputPath {
    pub fn new<P: Into<String>>(path: P, format: Format, source: Source) -> Self {
        Self {
            path: path.into(),
            initial: Value::Integer(0),
            format,
            source: Some(source),
        }
    }

    pub fn fixed<P: Into<String>, V: Into<Value>>(path: P, format: Format, initial: V) -> Self {
        Self {
            path: path.into(),
            initial: initial.into(),
            format,
            source: None,
        }
    }
}

/// The pvinverter path table for a three phase inverter.
pub fn default_paths(inverter: &InverterConfig) -> Vec<OutputPath> {
    use Format::*;
    use Source::*;

    let key = |k: &str| DirectKey(k.to_owned());

    let mut paths = vec![
        OutputPath::new("/Ac/Power", Watts, key("W")),
        OutputPath::new("/Ac/Current", Amps, key("A")),
        OutputPath::new("/Ac/Energy/Forward", KilowattHours, key("kWH")),
        OutputPath::fixed("/Ac/MaxPower", Watts, i64::from(inverter.max_power)),
        OutputPath::fixed("/Ac/Position", Integer, i64::from(inverter.position)),
        OutputPath::new(STATUS_CODE, Integer, StatusDerived),
        OutputPath::fixed(UPDATE_INDEX, Integer, 0i64),
    ];

    for phase in Phase::ALL {
        let prefix = format!("/Ac/L{}", phase.line());
        paths.extend([
            OutputPath::new(format!("{}/Power", prefix), Watts, PhaseDerivedPower(phase)),
            OutputPath::new(format!("{}/Current", prefix), Amps, key(&phase.current_key())),
            OutputPath::new(format!("{}/Voltage", prefix), Volts, key(&phase.voltage_key())),
            OutputPath::new(format!("{}/Frequency", prefix), Hertz, key("Hz")),
            OutputPath::new(format!("{}/Energy/Forward", prefix), KilowattHours, PhaseDerivedEnergy),
        ]);
    }

    paths
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn formatters_add_units() {
    assert_eq!(Format::Amps.text(&Decimal::new(1234, 2).into()), "12.34A");
    assert_eq!(Format::Watts.text(&Decimal::new(4507, 1).into()), "450W");
    assert_eq!(Format::Hertz.text(&Decimal::from(50).into()), "50.0000Hz");
    assert_eq!(Format::Volts.text(&Decimal::new(2301, 1).into()), "230.10V");
    assert_eq!(Format::KilowattHours.text(&Decimal::new(15, 1).into()), "1.50kWh");
    assert_eq!(Format::Integer.text(&Value::Integer(7)), "7");
    assert_eq!(Format::Text.text(&Value::from("e-00000042")), "e-00000042");
    assert_eq!(Format::Watts.text(&Value::Empty), "");
}

#[test]
fn default_paths_cover_all_phases() {
    let inverter = InverterConfig {
        instance: 20,
        name: "Roof".to_owned(),
        position: 1,
        max_power: 8500,
        product_name: None,
    };

    let paths = default_paths(&inverter);
    let find = |p: &str| paths.iter().find(|o| o.path == p).unwrap();

    assert_eq!(paths.len(), 22);
    assert_eq!(find("/Ac/L2/Power").source, Some(Source::PhaseDerivedPower(Phase::B)));
    assert_eq!(
        find("/Ac/L3/Voltage").source,
        Some(Source::DirectKey("PhVphC".to_owned()))
    );
    assert_eq!(find("/Ac/L1/Energy/Forward").source, Some(Source::PhaseDerivedEnergy));
    assert_eq!(find("/Ac/MaxPower").initial, Value::Integer(8500));
    assert_eq!(find("/Ac/Position").initial, Value::Integer(1));
    assert_eq!(find(UPDATE_INDEX).source, None);
}
