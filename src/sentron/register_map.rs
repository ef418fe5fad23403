// SENTRON PAC3200 保持レジスタマップ
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::sentron::{Measurement, PhaseValues, PowerValues};
use chrono::Utc;
use std::fmt;

/// 読み出し開始レジスタ
pub const START_REGISTER: u16 = 0;

/// 読み出しレジスタ数(100レジスタ = 200バイト)
pub const REGISTER_COUNT: u16 = 100;

/// 実機の積算電力量(kWh)
///
/// 読み出し範囲に無いので固定値を返す。ダッシュボードは常に数値を受け取る。
pub const FIXED_TOTAL_ENERGY_KWH: f64 = 12500.0;

/// 測定値フィールド
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Field {
    VoltageL1,
    VoltageL2,
    VoltageL3,
    CurrentL1,
    CurrentL2,
    CurrentL3,
    PowerFactor,
    Frequency,
    ApparentPowerTotal,
    ActivePowerTotal,
    ReactivePowerTotal,
}

impl Field {
    pub const ALL: [Field; 11] = [
        Field::VoltageL1,
        Field::VoltageL2,
        Field::VoltageL3,
        Field::CurrentL1,
        Field::CurrentL2,
        Field::CurrentL3,
        Field::PowerFactor,
        Field::Frequency,
        Field::ApparentPowerTotal,
        Field::ActivePowerTotal,
        Field::ReactivePowerTotal,
    ];

    /// フレーム先頭からのバイトオフセット
    pub const fn offset(self) -> usize {
        match self {
            Field::VoltageL1 => 0,            // レジスタ 0
            Field::VoltageL2 => 4,            // レジスタ 2
            Field::VoltageL3 => 8,            // レジスタ 4
            Field::CurrentL1 => 24,           // レジスタ 12
            Field::CurrentL2 => 28,           // レジスタ 14
            Field::CurrentL3 => 32,           // レジスタ 16
            Field::PowerFactor => 100,        // レジスタ 50
            Field::Frequency => 110,          // レジスタ 55
            Field::ApparentPowerTotal => 124, // レジスタ 62
            Field::ActivePowerTotal => 128,   // レジスタ 64
            Field::ReactivePowerTotal => 132, // レジスタ 66
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}@{}", self, self.offset())
    }
}

/// 保持レジスタの内容
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct RegisterFrame(Vec<u8>);

impl RegisterFrame {
    /// ゼロで埋めたフレーム
    pub fn zeroed(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 16ビットレジスタ数
    pub fn register_count(&self) -> usize {
        self.0.len() / 2
    }

    /// 指定範囲のレジスタを複製する
    pub fn registers(&self, start: u16, count: u16) -> Option<RegisterFrame> {
        let begin = start as usize * 2;
        let end = begin + count as usize * 2;
        self.0.get(begin..end).map(|xs| RegisterFrame(xs.to_vec()))
    }

    /// オフセット位置のFloat32(ビッグエンディアン)
    /// 範囲外は 0.0 とする。
    pub fn read_f32(&self, offset: usize) -> f32 {
        match self.0.get(offset..offset.saturating_add(4)) {
            Some(&[a, b, c, d]) => f32::from_be_bytes([a, b, c, d]),
            _ => 0.0,
        }
    }

    /// オフセット位置にFloat32(ビッグエンディアン)を書き込む
    /// 範囲外への書き込みは捨てる。
    pub fn write_f32(&mut self, offset: usize, value: f32) {
        if let Some(dst) = self.0.get_mut(offset..offset.saturating_add(4)) {
            dst.copy_from_slice(&value.to_be_bytes());
        }
    }
}

impl From<Vec<u8>> for RegisterFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for RegisterFrame {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for RegisterFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dump = self
            .0
            .chunks(2)
            .map(|xs| xs.iter().map(|n| format!("{:02X}", n)).collect::<String>())
            .collect::<Vec<String>>()
            .join(" ");
        write!(f, "[{}]", dump)
    }
}

/// フィールド値を取り出す
pub fn decode_field(frame: &RegisterFrame, field: Field) -> f32 {
    frame.read_f32(field.offset())
}

/// フィールド値を書き込む(シミュレータ専用)
pub fn encode(field: Field, value: f32, frame: &mut RegisterFrame) {
    frame.write_f32(field.offset(), value)
}

/// レジスタの内容を測定値にする
///
/// 短いフレームでも失敗しない。届かないフィールドは 0.0 になる。
/// 積算電力量は読み出し範囲に無いので `FIXED_TOTAL_ENERGY_KWH` にする。
pub fn decode(frame: &RegisterFrame) -> Measurement {
    let value = |field| decode_field(frame, field);
    Measurement {
        timestamp: Utc::now(),
        is_simulation: false,
        voltage: PhaseValues {
            l1: value(Field::VoltageL1),
            l2: value(Field::VoltageL2),
            l3: value(Field::VoltageL3),
        },
        current: PhaseValues {
            l1: value(Field::CurrentL1),
            l2: value(Field::CurrentL2),
            l3: value(Field::CurrentL3),
        },
        power: PowerValues {
            active: value(Field::ActivePowerTotal),
            reactive: value(Field::ReactivePowerTotal),
            apparent: value(Field::ApparentPowerTotal),
        },
        power_factor: value(Field::PowerFactor),
        frequency: value(Field::Frequency),
        total_energy: FIXED_TOTAL_ENERGY_KWH,
    }
}

#[test]
fn test1() {
    // オフセット0に 230.0
    let mut bytes = vec![0u8; 200];
    bytes[0..4].copy_from_slice(&[0x43, 0x66, 0x00, 0x00]);
    let frame = RegisterFrame::from(bytes);
    let m = decode(&frame);
    assert_eq!(m.voltage.l1, 230.0);
    assert_eq!(m.voltage.l2, 0.0);
    assert!(!m.is_simulation);
    assert_eq!(m.total_energy, FIXED_TOTAL_ENERGY_KWH);
}

#[test]
fn test2() {
    // 短いフレームは 0.0
    for len in 0..140 {
        let frame = RegisterFrame::from(vec![0x42u8; len]);
        for field in Field::ALL {
            let v = decode_field(&frame, field);
            if field.offset() + 4 > len {
                assert_eq!(v, 0.0, "{field} len={len}");
            } else {
                assert_ne!(v, 0.0, "{field} len={len}");
            }
        }
    }
    // 途中で切れたフレームでも読める分は読める
    let mut full = RegisterFrame::zeroed(200);
    encode(Field::VoltageL1, 231.5, &mut full);
    encode(Field::CurrentL1, 12.25, &mut full);
    // L1電流(24..28)の途中で切れる
    let frame = RegisterFrame::from(&full.as_bytes()[..27]);
    let m = decode(&frame);
    assert_eq!(m.voltage.l1, 231.5);
    assert_eq!(m.current.l1, 0.0);
    assert_eq!(m.frequency, 0.0);
    assert_eq!(decode(&full).current.l1, 12.25);
}

#[test]
fn test3() {
    let mut frame = RegisterFrame::zeroed(200);
    let values = [
        (Field::VoltageL1, 229.87),
        (Field::CurrentL3, 59.999),
        (Field::PowerFactor, 0.81),
        (Field::Frequency, 50.1234),
        (Field::ActivePowerTotal, 24.5),
        (Field::ReactivePowerTotal, -3.75),
        (Field::ApparentPowerTotal, f32::MAX),
    ];
    for (field, v) in values {
        encode(field, v, &mut frame);
    }
    for (field, v) in values {
        assert_eq!(decode_field(&frame, field), v);
    }
    assert_eq!(&frame.as_bytes()[124..128], &f32::MAX.to_be_bytes());
}

#[test]
fn test4() {
    // 範囲外への書き込みは捨てられる
    let mut frame = RegisterFrame::zeroed(102);
    encode(Field::PowerFactor, 0.9, &mut frame);
    encode(Field::ActivePowerTotal, 10.0, &mut frame);
    assert_eq!(frame, RegisterFrame::zeroed(102));

    let mut frame = RegisterFrame::zeroed(8);
    frame.write_f32(usize::MAX - 1, 1.0);
    assert_eq!(frame, RegisterFrame::zeroed(8));
}

#[test]
fn test5() {
    let frame = RegisterFrame::from((0u8..20).collect::<Vec<u8>>());
    assert_eq!(frame.register_count(), 10);
    assert_eq!(
        frame.registers(2, 3),
        Some(RegisterFrame::from(vec![4, 5, 6, 7, 8, 9]))
    );
    assert_eq!(frame.registers(8, 3), None);
    assert_eq!(format!("{}", frame.registers(0, 2).unwrap()), "[0001 0203]");
}
