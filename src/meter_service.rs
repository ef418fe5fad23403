// 計測値の取得
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::device_endpoint::DeviceEndpoint;
use crate::pool::{self, ConnectionPool};
use crate::sentron::{self, Measurement, REGISTER_COUNT, START_REGISTER};
use crate::simulator::SimulatedDevice;
use chrono::Utc;
use thiserror::Error;

/// 計測器から読み出せなかった
#[derive(Debug, Error)]
#[error("device {endpoint} is unreachable")]
pub struct DeviceUnreachable {
    pub endpoint: DeviceEndpoint,
    #[source]
    pub source: pool::Error,
}

/// 接続先に応じて実機かシミュレータから計測値を得る
#[derive(Clone, Debug)]
pub struct MeterDataService {
    pool: ConnectionPool,
    simulator: SimulatedDevice,
}

impl MeterDataService {
    pub fn new(pool: ConnectionPool, simulator: SimulatedDevice) -> Self {
        Self { pool, simulator }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn simulator(&self) -> &SimulatedDevice {
        &self.simulator
    }

    /// 計測値を1回取得する
    pub async fn fetch(&self, endpoint: &DeviceEndpoint) -> Result<Measurement, DeviceUnreachable> {
        if endpoint.simulated {
            return Ok(self.read_simulator());
        }
        match self.read_device(endpoint).await {
            Ok(measurement) => Ok(measurement),
            Err(source) => {
                tracing::warn!("{} unreachable: {}", endpoint, source);
                Err(DeviceUnreachable {
                    endpoint: endpoint.clone(),
                    source,
                })
            }
        }
    }

    /// シミュレータの値(プールは使わない)
    pub fn read_simulator(&self) -> Measurement {
        let (frame, energy_kwh) = self.simulator.read();
        Measurement {
            timestamp: Utc::now(),
            is_simulation: true,
            total_energy: energy_kwh,
            ..sentron::decode(&frame)
        }
    }

    async fn read_device(&self, endpoint: &DeviceEndpoint) -> Result<Measurement, pool::Error> {
        let mut lease = self.pool.acquire(&endpoint.host, endpoint.port).await?;
        let frame = self
            .pool
            .read(&mut lease, START_REGISTER, REGISTER_COUNT)
            .await?;
        drop(lease);
        tracing::trace!("{} {}", endpoint, frame);
        Ok(Measurement {
            timestamp: Utc::now(),
            is_simulation: false,
            ..sentron::decode(&frame)
        })
    }
}

#[cfg(test)]
fn test_service() -> MeterDataService {
    use crate::pool::PoolConfig;
    use std::time::Duration;

    MeterDataService::new(
        ConnectionPool::new(PoolConfig {
            read_timeout: Duration::from_millis(200),
            ..Default::default()
        }),
        SimulatedDevice::default(),
    )
}

#[tokio::test]
async fn test1() {
    // シミュレータはプールを使わない
    let service = test_service();
    let endpoint = DeviceEndpoint::new("192.168.1.50", 502, true);
    let m = service.fetch(&endpoint).await.unwrap();
    assert!(m.is_simulation);
    assert!((220.0..=240.0).contains(&m.voltage.l1));
    assert!(m.total_energy >= crate::simulator::INITIAL_ENERGY_KWH);
    assert_eq!(service.pool().connect_attempts(), 0);
    assert_eq!(service.pool().connection_count(), 0);
}

#[tokio::test]
async fn test2() {
    use std::error::Error as _;
    use std::time::{Duration, Instant};

    // 接続できない
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let service = test_service();
    let endpoint = DeviceEndpoint::new("127.0.0.1", port, false);
    let started = Instant::now();
    let e = service.fetch(&endpoint).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(2000));
    assert_eq!(e.endpoint, endpoint);
    assert!(matches!(e.source, pool::Error::ConnectRefused { .. }));
    assert!(e.source().is_some());
    assert_eq!(service.pool().connection_count(), 0);
}

#[tokio::test]
async fn test3() {
    use crate::simulator::spawn_server;

    // シミュレータのサーバを実機とみなして読む
    let service = test_service();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_server(
        listener,
        service.simulator().clone(),
        std::time::Duration::ZERO,
    );

    let endpoint = DeviceEndpoint::new("127.0.0.1", port, false);
    let m = service.fetch(&endpoint).await.unwrap();
    assert!(!m.is_simulation);
    assert_eq!(m.total_energy, sentron::FIXED_TOTAL_ENERGY_KWH);
    // ダッシュボードは数値を前提にしている
    let json = serde_json::to_value(&m).unwrap();
    assert!(json["totalEnergy"].is_number());
    assert_eq!(json["isSimulation"], false);
    assert_eq!(m.voltage.l1, service.read_simulator().voltage.l1);
    assert!(m.power.apparent >= m.power.active);

    service.fetch(&endpoint).await.unwrap();
    assert_eq!(service.pool().connect_attempts(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test4() {
    // 応答しない計測器は読み出しタイムアウト
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let holder = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        std::future::pending::<()>().await;
    });

    let service = test_service();
    let endpoint = DeviceEndpoint::new("127.0.0.1", port, false);
    let e = service.fetch(&endpoint).await.unwrap_err();
    assert!(matches!(e.source, pool::Error::ReadTimeout(_)));
    assert_eq!(service.pool().connection_count(), 0);
    holder.abort();
}
