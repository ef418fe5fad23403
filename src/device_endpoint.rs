// 計測器の接続先
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use serde::{Deserialize, Serialize};
use std::fmt;

/// 計測器の接続先
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Hash, Debug)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    /// trueならシミュレータを使う(host, portは表示用)
    pub simulated: bool,
}

impl DeviceEndpoint {
    pub fn new(host: &str, port: u16, simulated: bool) -> Self {
        Self {
            host: host.to_owned(),
            port,
            simulated,
        }
    }

    /// コネクションプールのキー
    pub fn key(&self) -> String {
        endpoint_key(&self.host, self.port)
    }
}

/// "host:port"
pub fn endpoint_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.simulated {
            write!(f, "{} (simulated)", self.key())
        } else {
            write!(f, "{}", self.key())
        }
    }
}

#[test]
fn test1() {
    let endpoint = DeviceEndpoint::new("10.0.0.5", 502, false);
    assert_eq!(endpoint.key(), "10.0.0.5:502");
    assert_eq!(endpoint.to_string(), "10.0.0.5:502");
    let endpoint = DeviceEndpoint::new("192.168.1.50", 502, true);
    assert_eq!(endpoint.to_string(), "192.168.1.50:502 (simulated)");
}
