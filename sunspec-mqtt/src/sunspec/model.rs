use rust_decimal::Decimal;
use std::collections::HashMap;

use super::{Model, Point};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointType {
    Uint16,
    Int16,
    Enum16,
    Sunssf,
    Uint32,
    Acc32,
    Bitfield32,
    /// Length in registers, two characters each
    String(u16),
}

impl PointType {
    // Each Modbus register holds 16-bits
    pub fn size(&self) -> u16 {
        use PointType::*;
        match self {
            Uint16 | Int16 | Enum16 | Sunssf => 1,
            Uint32 | Acc32 | Bitfield32 => 2,
            String(length) => *length,
        }
    }

    /// Reads the raw integer at the start of `words`, or `None` for the "not implemented" sentinel.
    fn integer(&self, words: &[u16]) -> Option<i64> {
        use PointType::*;
        match (self, words) {
            (Uint16 | Enum16, [w, ..]) if *w != u16::MAX => Some(i64::from(*w)),
            (Int16 | Sunssf, [w, ..]) if *w != 0x8000 => Some(i64::from(*w as i16)),
            (Uint32 | Bitfield32, [hi, lo, ..]) => {
                let v = (u32::from(*hi) << 16) | u32::from(*lo);
                (v != u32::MAX).then_some(i64::from(v))
            }
            (Acc32, [hi, lo, ..]) => {
                let v = (u32::from(*hi) << 16) | u32::from(*lo);
                (v != 0).then_some(i64::from(v))
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct PointDef {
    pub id: &'static str,
    pub label: &'static str,
    pub offset: u16,
    pub point_type: PointType,
    pub units: Option<&'static str>,
    /// Id of the scale factor point in the same model
    pub sf: Option<&'static str>,
}

#[derive(Debug)]
pub struct ModelDef {
    pub id: u16,
    pub label: &'static str,
    pub points: &'static [PointDef],
}

const fn point(
    id: &'static str,
    label: &'static str,
    offset: u16,
    point_type: PointType,
    units: Option<&'static str>,
    sf: Option<&'static str>,
) -> PointDef {
    PointDef {
        id,
        label,
        offset,
        point_type,
        units,
        sf,
    }
}

use PointType as T;

const COMMON_POINTS: &[PointDef] = &[
    point("Mn", "Manufacturer", 0, T::String(16), None, None),
    point("Md", "Model", 16, T::String(16), None, None),
    point("Opt", "Options", 32, T::String(8), None, None),
    point("Vr", "Version", 40, T::String(8), None, None),
    point("SN", "Serial Number", 48, T::String(16), None, None),
    point("DA", "Device Address", 64, T::Uint16, None, None),
];

const INVERTER_POINTS: &[PointDef] = &[
    point("A", "Amps", 0, T::Uint16, Some("A"), Some("A_SF")),
    point("AphA", "Amps PhaseA", 1, T::Uint16, Some("A"), Some("A_SF")),
    point("AphB", "Amps PhaseB", 2, T::Uint16, Some("A"), Some("A_SF")),
    point("AphC", "Amps PhaseC", 3, T::Uint16, Some("A"), Some("A_SF")),
    point("A_SF", "", 4, T::Sunssf, None, None),
    point("PPVphAB", "Phase Voltage AB", 5, T::Uint16, Some("V"), Some("V_SF")),
    point("PPVphBC", "Phase Voltage BC", 6, T::Uint16, Some("V"), Some("V_SF")),
    point("PPVphCA", "Phase Voltage CA", 7, T::Uint16, Some("V"), Some("V_SF")),
    point("PhVphA", "Phase Voltage AN", 8, T::Uint16, Some("V"), Some("V_SF")),
    point("PhVphB", "Phase Voltage BN", 9, T::Uint16, Some("V"), Some("V_SF")),
    point("PhVphC", "Phase Voltage CN", 10, T::Uint16, Some("V"), Some("V_SF")),
    point("V_SF", "", 11, T::Sunssf, None, None),
    point("W", "Watts", 12, T::Int16, Some("W"), Some("W_SF")),
    point("W_SF", "", 13, T::Sunssf, None, None),
    point("Hz", "Hz", 14, T::Uint16, Some("Hz"), Some("Hz_SF")),
    point("Hz_SF", "", 15, T::Sunssf, None, None),
    point("VA", "VA", 16, T::Int16, Some("VA"), Some("VA_SF")),
    point("VA_SF", "", 17, T::Sunssf, None, None),
    point("VAr", "VAr", 18, T::Int16, Some("var"), Some("VAr_SF")),
    point("VAr_SF", "", 19, T::Sunssf, None, None),
    point("PF", "PF", 20, T::Int16, Some("Pct"), Some("PF_SF")),
    point("PF_SF", "", 21, T::Sunssf, None, None),
    point("WH", "WattHours", 22, T::Acc32, Some("Wh"), Some("WH_SF")),
    point("WH_SF", "", 24, T::Sunssf, None, None),
    point("DCA", "DC Amps", 25, T::Uint16, Some("A"), Some("DCA_SF")),
    point("DCA_SF", "", 26, T::Sunssf, None, None),
    point("DCV", "DC Voltage", 27, T::Uint16, Some("V"), Some("DCV_SF")),
    point("DCV_SF", "", 28, T::Sunssf, None, None),
    point("DCW", "DC Watts", 29, T::Int16, Some("W"), Some("DCW_SF")),
    point("DCW_SF", "", 30, T::Sunssf, None, None),
    point("TmpCab", "Cabinet Temperature", 31, T::Int16, Some("C"), Some("Tmp_SF")),
    point("TmpSnk", "Heat Sink Temperature", 32, T::Int16, Some("C"), Some("Tmp_SF")),
    point("TmpTrns", "Transformer Temperature", 33, T::Int16, Some("C"), Some("Tmp_SF")),
    point("TmpOt", "Other Temperature", 34, T::Int16, Some("C"), Some("Tmp_SF")),
    point("Tmp_SF", "", 35, T::Sunssf, None, None),
    point("St", "Operating State", 36, T::Enum16, None, None),
    point("StVnd", "Vendor Operating State", 37, T::Enum16, None, None),
    point("Evt1", "Event1", 38, T::Bitfield32, None, None),
    point("Evt2", "Event Bitfield 2", 40, T::Bitfield32, None, None),
    point("EvtVnd1", "Vendor Event Bitfield 1", 42, T::Bitfield32, None, None),
    point("EvtVnd2", "Vendor Event Bitfield 2", 44, T::Bitfield32, None, None),
    point("EvtVnd3", "Vendor Event Bitfield 3", 46, T::Bitfield32, None, None),
    point("EvtVnd4", "Vendor Event Bitfield 4", 48, T::Bitfield32, None, None),
];

pub const MODELS: &[ModelDef] = &[
    ModelDef {
        id: 1,
        label: "Common",
        points: COMMON_POINTS,
    },
    ModelDef {
        id: 101,
        label: "Inverter (Single Phase)",
        points: INVERTER_POINTS,
    },
    ModelDef {
        id: 102,
        label: "Inverter (Split-Phase)",
        points: INVERTER_POINTS,
    },
    ModelDef {
        id: 103,
        label: "Inverter (Three Phase)",
        points: INVERTER_POINTS,
    },
];

impl ModelDef {
    pub fn find(id: u16) -> Option<&'static ModelDef> {
        MODELS.iter().find(|m| m.id == id)
    }

    /// Decodes the model body (the registers following the id/length header).
    pub fn decode(&self, words: &[u16]) -> Model {
        let scale_factors: HashMap<&str, i64> = self
            .points
            .iter()
            .filter(|p| p.point_type == PointType::Sunssf)
            .filter_map(|p| Some((p.id, p.point_type.integer(p.words(words)?)?)))
            .collect();

        let points = self
            .points
            .iter()
            .map(|p| Point {
                id: p.id.to_owned(),
                label: p.label.to_owned(),
                units: p.units.map(str::to_owned),
                value: p.words(words).and_then(|w| p.value(w, &scale_factors)),
            })
            .collect();

        Model {
            id: self.id,
            label: self.label.to_owned(),
            points,
        }
    }
}

impl PointDef {
    fn words<'a>(&self, words: &'a [u16]) -> Option<&'a [u16]> {
        let start = usize::from(self.offset);
        words.get(start..start + usize::from(self.point_type.size()))
    }

    fn value(&self, words: &[u16], scale_factors: &HashMap<&str, i64>) -> Option<String> {
        if let PointType::String(_) = self.point_type {
            if words.iter().all(|w| *w == 0) {
                return None;
            }
            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }

        let raw = self.point_type.integer(words)?;
        match self.sf {
            None => Some(raw.to_string()),
            Some(sf) => {
                let sf = *scale_factors.get(sf)?;
                Some(scale(raw, sf)?.normalize().to_string())
            }
        }
    }
}

fn scale(raw: i64, sf: i64) -> Option<Decimal> {
    if sf < 0 {
        Decimal::try_new(raw, u32::try_from(-sf).ok()?).ok()
    } else {
        let factor = 10i64.checked_pow(u32::try_from(sf).ok()?)?;
        Decimal::from(raw).checked_mul(Decimal::from(factor))
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn inverter_words() -> Vec<u16> {
    let mut words = vec![0u16; 50];
    words[0] = 1234; // A
    words[1] = 412; // AphA
    words[4] = (-2i16) as u16; // A_SF
    words[8] = 2301; // PhVphA
    words[11] = (-1i16) as u16; // V_SF
    words[12] = 2841; // W
    words[13] = 0; // W_SF
    words[14] = 5001; // Hz
    words[15] = (-2i16) as u16; // Hz_SF
    words[16] = 0x8000; // VA not implemented
    words[17] = 0x8000; // VA_SF not implemented
    words[18] = 5; // VAr, but VAr_SF not implemented
    words[19] = 0x8000;
    words[22] = 0x0001;
    words[23] = 0x86A0; // WH = 100000
    words[24] = 1; // WH_SF
    words[36] = 4; // St
    words[37] = u16::MAX; // StVnd not implemented
    words[38] = 0;
    words[39] = 42; // Evt1
    words
}

#[cfg(test)]
fn value_of<'a>(model: &'a Model, id: &str) -> Option<&'a str> {
    model
        .points
        .iter()
        .find(|p| p.id == id)
        .and_then(|p| p.value.as_deref())
}

#[test]
fn decode_inverter_applies_scale_factors() {
    let model = ModelDef::find(103).unwrap().decode(&inverter_words());

    assert_eq!(model.label, "Inverter (Three Phase)");
    assert_eq!(value_of(&model, "A"), Some("12.34"));
    assert_eq!(value_of(&model, "AphA"), Some("4.12"));
    assert_eq!(value_of(&model, "PhVphA"), Some("230.1"));
    assert_eq!(value_of(&model, "W"), Some("2841"));
    assert_eq!(value_of(&model, "Hz"), Some("50.01"));
    assert_eq!(value_of(&model, "WH"), Some("1000000"));
    assert_eq!(value_of(&model, "St"), Some("4"));
    assert_eq!(value_of(&model, "Evt1"), Some("42"));
}

#[test]
fn decode_inverter_skips_unimplemented_points() {
    let model = ModelDef::find(101).unwrap().decode(&inverter_words());

    // sentinel values
    assert_eq!(value_of(&model, "VA"), None);
    assert_eq!(value_of(&model, "StVnd"), None);
    // scale factor itself not implemented
    assert_eq!(value_of(&model, "VA_SF"), None);
    // implemented, but cannot be scaled
    assert_eq!(value_of(&model, "VAr"), None);
}

#[test]
fn decode_common_keeps_string_padding() {
    let mut words = vec![0u16; 66];
    words[0] = u16::from_be_bytes(*b"AB");
    words[1] = u16::from_be_bytes(*b"B\0");
    words[40] = u16::from_be_bytes(*b"1.");
    words[41] = u16::from_be_bytes(*b"2\0");

    let model = ModelDef::find(1).unwrap().decode(&words);

    let manufacturer = value_of(&model, "Mn").unwrap();
    assert!(manufacturer.starts_with("ABB\0"));
    assert_eq!(manufacturer.len(), 32);
    assert_eq!(value_of(&model, "Vr").unwrap().trim_end_matches('\0'), "1.2");
    // all-zero string is not implemented
    assert_eq!(value_of(&model, "SN"), None);
}

#[test]
fn decode_short_body_leaves_trailing_points_empty() {
    let model = ModelDef::find(103).unwrap().decode(&inverter_words()[..20]);

    assert_eq!(value_of(&model, "A"), Some("12.34"));
    assert_eq!(value_of(&model, "St"), None);
}
