// 測定値
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 三相の値
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug, Default)]
pub struct PhaseValues {
    pub l1: f32,
    pub l2: f32,
    pub l3: f32,
}

/// 電力(kW, kvar, kVA)
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug, Default)]
pub struct PowerValues {
    pub active: f32,
    pub reactive: f32,
    pub apparent: f32,
}

/// 計測値
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub is_simulation: bool,
    /// 電圧(V)
    pub voltage: PhaseValues,
    /// 電流(A)
    pub current: PhaseValues,
    pub power: PowerValues,
    pub power_factor: f32,
    /// 周波数(Hz)
    pub frequency: f32,
    /// 積算電力量(kWh)
    pub total_energy: f64,
}

impl Measurement {
    pub fn show(&self) -> String {
        let source = if self.is_simulation { "SIM" } else { "DEV" };
        format!(
            "[{}] V: {:.1}V | I: {:.1}A | P: {:.1}kW | PF: {:.2} | f: {:.2}Hz | E: {:.1}kWh",
            source,
            self.voltage.l1,
            self.current.l1,
            self.power.active,
            self.power_factor,
            self.frequency,
            self.total_energy
        )
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.show())
    }
}

#[test]
fn test1() {
    let m = Measurement {
        timestamp: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        is_simulation: true,
        voltage: PhaseValues {
            l1: 230.0,
            l2: 231.0,
            l3: 229.0,
        },
        current: PhaseValues {
            l1: 10.0,
            l2: 11.0,
            l3: 12.0,
        },
        power: PowerValues {
            active: 7.5,
            reactive: 1.0,
            apparent: 8.0,
        },
        power_factor: 0.9,
        frequency: 50.0,
        total_energy: 12450.5,
    };
    let json = serde_json::to_value(&m).unwrap();
    assert_eq!(json["timestamp"], 1_700_000_000_123i64);
    assert_eq!(json["isSimulation"], true);
    assert_eq!(json["voltage"]["l2"], 231.0);
    assert_eq!(json["power"]["apparent"], 8.0);
    assert_eq!(json["powerFactor"].as_f64().unwrap() as f32, 0.9);
    assert_eq!(json["totalEnergy"], 12450.5);

    let back: Measurement = serde_json::from_value(json).unwrap();
    assert_eq!(back, m);

    assert_eq!(
        m.to_string(),
        "[SIM] V: 230.0V | I: 10.0A | P: 7.5kW | PF: 0.90 | f: 50.00Hz | E: 12450.5kWh"
    );
}
