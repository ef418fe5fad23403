// ゲートウェイ設定ファイル
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::device_endpoint::DeviceEndpoint;
use crate::modbus::DEFAULT_UNIT_ID;
use crate::pool::PoolConfig;
use crate::simulator::DEFAULT_SIMULATOR_PORT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(r#"i/o "{0}""#)]
    Io(#[from] io::Error),

    #[error(r#"toml "{0}""#)]
    Toml(#[from] toml::de::Error),

    #[error(r#""{0}" must be greater than zero"#)]
    ZeroValue(&'static str),
}

/// 計測器
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[allow(non_snake_case)]
pub struct DeviceSettings {
    pub Id: String,
    pub Name: String,
    pub Ip: String,
    #[serde(default = "default_modbus_port")]
    pub Port: u16,
    #[serde(default)]
    pub IsSimulated: bool,
}

impl From<&DeviceSettings> for DeviceEndpoint {
    fn from(device: &DeviceSettings) -> Self {
        DeviceEndpoint::new(&device.Ip, device.Port, device.IsSimulated)
    }
}

/// 内蔵シミュレータ
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[allow(non_snake_case)]
#[serde(default)]
pub struct SimulatorSettings {
    /// 0ならModbus/TCPサーバを起動しない
    pub Port: u16,
    pub TickIntervalMs: u64,
    pub ResponseDelayMs: u64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            Port: DEFAULT_SIMULATOR_PORT,
            TickIntervalMs: 200,
            ResponseDelayMs: 50,
        }
    }
}

impl SimulatorSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.TickIntervalMs)
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.ResponseDelayMs)
    }
}

/// ゲートウェイ設定
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[allow(non_snake_case)]
#[serde(default)]
pub struct GatewaySettings {
    pub ConnectTimeoutMs: u64,
    pub ReadTimeoutMs: u64,
    pub IdleTimeoutSecs: u64,
    pub SweepIntervalSecs: u64,
    pub PollIntervalMs: u64,
    pub UnitId: u8,
    pub Simulator: SimulatorSettings,
    pub Devices: Vec<DeviceSettings>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            ConnectTimeoutMs: 2000,
            ReadTimeoutMs: 2000,
            IdleTimeoutSecs: 60,
            SweepIntervalSecs: 60,
            PollIntervalMs: 2000,
            UnitId: DEFAULT_UNIT_ID,
            Simulator: SimulatorSettings::default(),
            Devices: default_devices(),
        }
    }
}

impl GatewaySettings {
    /// 設定ファイルを読む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = fs::read_to_string(path)?;
        Self::from_toml(&file)
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let settings = toml::from_str::<GatewaySettings>(s)?;
        settings.validate()?;
        Ok(settings)
    }

    /// 時間間隔に0を許さない
    pub fn validate(&self) -> Result<(), Error> {
        let durations = [
            ("ConnectTimeoutMs", self.ConnectTimeoutMs),
            ("ReadTimeoutMs", self.ReadTimeoutMs),
            ("IdleTimeoutSecs", self.IdleTimeoutSecs),
            ("SweepIntervalSecs", self.SweepIntervalSecs),
            ("PollIntervalMs", self.PollIntervalMs),
            ("Simulator.TickIntervalMs", self.Simulator.TickIntervalMs),
        ];
        match durations.into_iter().find(|(_, v)| *v == 0) {
            Some((name, _)) => Err(Error::ZeroValue(name)),
            None => Ok(()),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            connect_timeout: Duration::from_millis(self.ConnectTimeoutMs),
            read_timeout: Duration::from_millis(self.ReadTimeoutMs),
            idle_timeout: Duration::from_secs(self.IdleTimeoutSecs),
            sweep_interval: Duration::from_secs(self.SweepIntervalSecs),
            unit_id: self.UnitId,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.PollIntervalMs)
    }

    pub fn endpoints(&self) -> Vec<DeviceEndpoint> {
        self.Devices.iter().map(DeviceEndpoint::from).collect()
    }
}

fn default_modbus_port() -> u16 {
    502
}

fn default_devices() -> Vec<DeviceSettings> {
    vec![
        DeviceSettings {
            Id: "1".to_owned(),
            Name: "Línea Producción 1".to_owned(),
            Ip: "192.168.1.50".to_owned(),
            Port: default_modbus_port(),
            IsSimulated: true,
        },
        DeviceSettings {
            Id: "2".to_owned(),
            Name: "Compresor Principal".to_owned(),
            Ip: "192.168.1.51".to_owned(),
            Port: default_modbus_port(),
            IsSimulated: true,
        },
    ]
}

#[test]
fn test1() {
    // 空なら全部既定値
    let settings = GatewaySettings::from_toml("").unwrap();
    assert_eq!(settings, GatewaySettings::default());
    let config = settings.pool_config();
    assert_eq!(config.connect_timeout, Duration::from_millis(2000));
    assert_eq!(config.idle_timeout, Duration::from_secs(60));
    assert_eq!(config.unit_id, 1);
    assert_eq!(settings.Simulator.Port, 8502);
    assert_eq!(settings.Simulator.tick_interval(), Duration::from_millis(200));
    assert_eq!(settings.Simulator.response_delay(), Duration::from_millis(50));
    assert!(settings.validate().is_ok());
    let endpoints = settings.endpoints();
    assert_eq!(endpoints.len(), 2);
    assert!(endpoints.iter().all(|e| e.simulated));
}

#[test]
fn test2() {
    let s = r#"
ConnectTimeoutMs = 500
PollIntervalMs = 1000

[Simulator]
Port = 0
ResponseDelayMs = 0

[[Devices]]
Id = "pac-1"
Name = "Main feeder"
Ip = "10.0.0.5"

[[Devices]]
Id = "pac-2"
Name = "Test bench"
Ip = "10.0.0.6"
Port = 1502
IsSimulated = true
"#;
    let settings = GatewaySettings::from_toml(s).unwrap();
    assert_eq!(settings.pool_config().connect_timeout, Duration::from_millis(500));
    assert_eq!(settings.pool_config().read_timeout, Duration::from_millis(2000));
    assert_eq!(settings.poll_interval(), Duration::from_millis(1000));
    assert_eq!(settings.Simulator.Port, 0);
    assert_eq!(settings.Simulator.TickIntervalMs, 200);
    assert_eq!(settings.Simulator.response_delay(), Duration::ZERO);
    assert_eq!(
        settings.endpoints(),
        vec![
            DeviceEndpoint::new("10.0.0.5", 502, false),
            DeviceEndpoint::new("10.0.0.6", 1502, true),
        ]
    );
}

#[test]
fn test3() {
    // 必須項目が無い
    let s = r#"
[[Devices]]
Id = "pac-1"
"#;
    assert!(matches!(
        GatewaySettings::from_toml(s),
        Err(Error::Toml(_))
    ));
    assert!(matches!(
        GatewaySettings::load("/nonexistent/gateway.toml"),
        Err(Error::Io(_))
    ));
}

#[test]
fn test4() {
    // 0の時間間隔は読み込み時に拒否する
    let s = r#"
[Simulator]
TickIntervalMs = 0
"#;
    assert!(matches!(
        GatewaySettings::from_toml(s),
        Err(Error::ZeroValue("Simulator.TickIntervalMs"))
    ));
    assert!(matches!(
        GatewaySettings::from_toml("SweepIntervalSecs = 0"),
        Err(Error::ZeroValue("SweepIntervalSecs"))
    ));
    assert!(matches!(
        GatewaySettings::from_toml("PollIntervalMs = 0"),
        Err(Error::ZeroValue("PollIntervalMs"))
    ));
    // 応答遅延は0でよい
    assert!(GatewaySettings::from_toml("[Simulator]\nResponseDelayMs = 0").is_ok());
}
