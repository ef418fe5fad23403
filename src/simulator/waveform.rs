// 擬似計測値の波形モデル
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::sentron::{Field, RegisterFrame, encode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// 1tickで進める位相
pub const PHASE_STEP: f64 = 0.1;

/// 積算電力量の初期値(kWh)
pub const INITIAL_ENERGY_KWH: f64 = 12450.5;

/// 各相の電圧位相差(rad)
const VOLTAGE_OFFSETS: [f64; 3] = [0.0, 2.0, 4.0];

/// 各相の電流位相差(rad)
const CURRENT_OFFSETS: [f64; 3] = [0.0, 1.0, 2.0];

/// ある時点の擬似計測値
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Sample {
    pub voltage: [f64; 3],
    pub current: [f64; 3],
    pub power_factor: f64,
    pub frequency: f64,
    pub active_power_kw: f64,
    pub reactive_power_kvar: f64,
    pub apparent_power_kva: f64,
}

impl Sample {
    /// レジスタに書き込む
    pub fn encode_into(&self, frame: &mut RegisterFrame) {
        let fields = [
            (Field::VoltageL1, self.voltage[0]),
            (Field::VoltageL2, self.voltage[1]),
            (Field::VoltageL3, self.voltage[2]),
            (Field::CurrentL1, self.current[0]),
            (Field::CurrentL2, self.current[1]),
            (Field::CurrentL3, self.current[2]),
            (Field::PowerFactor, self.power_factor),
            (Field::Frequency, self.frequency),
            (Field::ApparentPowerTotal, self.apparent_power_kva),
            (Field::ActivePowerTotal, self.active_power_kw),
            (Field::ReactivePowerTotal, self.reactive_power_kvar),
        ];
        for (field, value) in fields {
            encode(field, value as f32, frame);
        }
    }
}

/// 正弦波で計測値を作る
///
/// 積算電力量はリセットしない(シミュレータの稼働時間に相当する)。
#[derive(Debug)]
pub struct WaveformModel {
    phase: f64,
    energy_kwh: f64,
    rng: StdRng,
}

impl WaveformModel {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// 周波数の揺らぎを再現可能にする
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            phase: 0.0,
            energy_kwh: INITIAL_ENERGY_KWH,
            rng,
        }
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn energy_kwh(&self) -> f64 {
        self.energy_kwh
    }

    /// 現在の位相での計測値
    pub fn sample(&mut self) -> Sample {
        let phase = self.phase;
        let voltage = VOLTAGE_OFFSETS.map(|offset| 230.0 + 10.0 * (phase + offset).sin());
        let current = CURRENT_OFFSETS.map(|offset| 10.0 + 50.0 * (0.5 * phase + offset).sin().abs());
        let power_factor = 0.9 + 0.09 * (0.2 * phase).sin();
        let active_power_kw = voltage
            .iter()
            .zip(current.iter())
            .map(|(v, i)| v * i * power_factor)
            .sum::<f64>()
            / 1000.0;
        let apparent_power_kva = active_power_kw / power_factor;
        let reactive_power_kvar = (apparent_power_kva.powi(2) - active_power_kw.powi(2))
            .max(0.0)
            .sqrt();
        let frequency = 50.0 + self.rng.gen_range(0.0..0.2);
        Sample {
            voltage,
            current,
            power_factor,
            frequency,
            active_power_kw,
            reactive_power_kvar,
            apparent_power_kva,
        }
    }

    /// 位相を進めて計測値を作り、経過時間分の電力量を積算する
    pub fn advance(&mut self, elapsed: Duration) -> Sample {
        self.phase += PHASE_STEP;
        let sample = self.sample();
        let hours = elapsed.as_secs_f64() / 3600.0;
        self.energy_kwh += sample.active_power_kw.max(0.0) * hours;
        sample
    }
}

impl Default for WaveformModel {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test1() {
    let mut model = WaveformModel::with_seed(1);
    let s = model.sample();
    // 位相0
    assert_eq!(s.voltage[0], 230.0);
    assert!((s.voltage[1] - (230.0 + 10.0 * 2.0f64.sin())).abs() < 1e-9);
    assert_eq!(s.current[0], 10.0);
    assert!((s.current[2] - (10.0 + 50.0 * 2.0f64.sin().abs())).abs() < 1e-9);
    assert_eq!(s.power_factor, 0.9);
    let p = (s.voltage[0] * s.current[0] + s.voltage[1] * s.current[1] + s.voltage[2] * s.current[2])
        * 0.9
        / 1000.0;
    assert!((s.active_power_kw - p).abs() < 1e-9);
    assert!((s.apparent_power_kva - p / 0.9).abs() < 1e-9);
    assert!(s.reactive_power_kvar > 0.0);
}

#[test]
fn test2() {
    // 値は範囲内に収まる
    let mut model = WaveformModel::with_seed(2);
    for _ in 0..1000 {
        let s = model.advance(Duration::from_millis(200));
        for v in s.voltage {
            assert!((220.0..=240.0).contains(&v), "{v}");
        }
        for i in s.current {
            assert!((10.0..=60.0).contains(&i), "{i}");
        }
        assert!((0.81..=0.99).contains(&s.power_factor));
        assert!((50.0..50.2).contains(&s.frequency));
    }
    assert!((model.phase() - 100.0).abs() < 1e-6);
}

#[test]
fn test3() {
    // 積算電力量は減らない
    let mut model = WaveformModel::with_seed(3);
    let mut last = model.energy_kwh();
    assert_eq!(last, INITIAL_ENERGY_KWH);
    for _ in 0..500 {
        model.advance(Duration::from_millis(200));
        assert!(model.energy_kwh() >= last);
        last = model.energy_kwh();
    }
    assert!(last > INITIAL_ENERGY_KWH);
    // 経過時間0なら変わらない
    model.advance(Duration::ZERO);
    assert_eq!(model.energy_kwh(), last);
}

#[test]
fn test4() {
    let mut model = WaveformModel::with_seed(4);
    let sample = model.advance(Duration::from_millis(200));
    let mut frame = RegisterFrame::zeroed(200);
    sample.encode_into(&mut frame);
    let m = crate::sentron::decode(&frame);
    assert_eq!(m.voltage.l1, sample.voltage[0] as f32);
    assert_eq!(m.current.l3, sample.current[2] as f32);
    assert_eq!(m.power.active, sample.active_power_kw as f32);
    assert_eq!(m.frequency, sample.frequency as f32);
}
