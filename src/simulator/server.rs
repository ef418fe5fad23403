// 擬似計測器のModbus/TCPサーバ
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::background::BackgroundTask;
use crate::modbus::{
    Adu, ExceptionCode, MAX_READ_QUANTITY, ModbusTcpCodec, READ_HOLDING_REGISTERS, Request,
    Response, parse_request,
};
use crate::simulator::SimulatedDevice;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// 待ち受けポート
pub const DEFAULT_SIMULATOR_PORT: u16 = 8502;

/// 要求を処理して応答を作る
pub fn handle_request(device: &SimulatedDevice, pdu: &[u8]) -> Response {
    match parse_request(pdu) {
        Ok((_rest, Request::ReadHoldingRegisters { address, quantity })) => {
            if quantity == 0 || quantity > MAX_READ_QUANTITY {
                return Response::exception(
                    READ_HOLDING_REGISTERS,
                    ExceptionCode::IllegalDataValue,
                );
            }
            match device.read_registers(address, quantity) {
                Some(frame) => Response::ReadHoldingRegisters(frame.as_bytes().to_vec()),
                None => Response::exception(
                    READ_HOLDING_REGISTERS,
                    ExceptionCode::IllegalDataAddress,
                ),
            }
        }
        Ok((_rest, Request::Unsupported { function })) => {
            Response::exception(function, ExceptionCode::IllegalFunction)
        }
        // 読み出し要求だが長さがおかしい
        Err(_) => Response::exception(
            pdu.first().copied().unwrap_or(READ_HOLDING_REGISTERS),
            ExceptionCode::IllegalDataValue,
        ),
    }
}

/// 接続を受け付けてキャンセルされるまで応答する
pub async fn serve(
    listener: TcpListener,
    device: SimulatedDevice,
    response_delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!("simulator: accepted {}", peer);
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        device.clone(),
                        response_delay,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::error!("simulator: accept failed: {}", e);
                }
            }
        }
    }
    tracing::info!("simulator server stopped");
}

/// サーバをバックグラウンドで起動する
pub fn spawn_server(
    listener: TcpListener,
    device: SimulatedDevice,
    response_delay: Duration,
) -> BackgroundTask {
    BackgroundTask::spawn("simulator server", move |cancel| {
        serve(listener, device, response_delay, cancel)
    })
}

#[tracing::instrument(skip_all, fields(peer = %peer))]
/// 1接続分の要求に応答する
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    device: SimulatedDevice,
    response_delay: Duration,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, ModbusTcpCodec);
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            next = framed.next() => next,
        };
        let request = match request {
            Some(Ok(adu)) => adu,
            Some(Err(e)) => {
                tracing::warn!("simulator: {} {}", peer, e);
                break;
            }
            None => break,
        };
        let response = handle_request(&device, &request.pdu);
        if !response_delay.is_zero() {
            tokio::time::sleep(response_delay).await;
        }
        let reply = Adu {
            transaction_id: request.transaction_id,
            unit_id: request.unit_id,
            pdu: response.to_pdu(),
        };
        if let Err(e) = framed.send(reply).await {
            tracing::warn!("simulator: {} {}", peer, e);
            break;
        }
    }
    tracing::info!("simulator: {} disconnected", peer);
}

#[cfg(test)]
async fn start_test_server(device: &SimulatedDevice) -> (SocketAddr, BackgroundTask) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, spawn_server(listener, device.clone(), Duration::ZERO))
}

#[test]
fn test1() {
    let device = SimulatedDevice::default();
    let read = |address, quantity| {
        handle_request(
            &device,
            &Request::ReadHoldingRegisters { address, quantity }.to_pdu(),
        )
    };
    match read(0, 100) {
        Response::ReadHoldingRegisters(data) => assert_eq!(data.len(), 200),
        other => panic!("{other:?}"),
    }
    assert_eq!(
        read(0, 0),
        Response::exception(0x03, ExceptionCode::IllegalDataValue)
    );
    assert_eq!(
        read(0, 126),
        Response::exception(0x03, ExceptionCode::IllegalDataValue)
    );
    // 250レジスタを越える
    assert_eq!(
        read(240, 20),
        Response::exception(0x03, ExceptionCode::IllegalDataAddress)
    );
    assert!(matches!(read(150, 100), Response::ReadHoldingRegisters(_)));
    assert_eq!(
        handle_request(&device, &[0x10, 0x00, 0x00]),
        Response::exception(0x10, ExceptionCode::IllegalFunction)
    );
    assert_eq!(
        handle_request(&device, &[0x03, 0x00]),
        Response::exception(0x03, ExceptionCode::IllegalDataValue)
    );
}

#[tokio::test]
async fn test2() {
    use crate::modbus::{self, DEFAULT_UNIT_ID, TcpTransport};

    let device = SimulatedDevice::default();
    let (addr, server) = start_test_server(&device).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut transport = TcpTransport::new(stream, &addr.to_string(), DEFAULT_UNIT_ID);
    let timeout = Duration::from_secs(2);

    let data = transport
        .read_holding_registers(0, 100, timeout)
        .await
        .unwrap();
    let m = crate::sentron::decode(&crate::sentron::RegisterFrame::from(data));
    assert!((220.0..=240.0).contains(&m.voltage.l1));
    assert!((50.0..50.2).contains(&m.frequency));

    // 例外応答を受けても接続は使える
    assert!(matches!(
        transport.read_holding_registers(0, 0, timeout).await,
        Err(modbus::Error::Exception {
            function: 0x03,
            code: 0x03
        })
    ));
    assert!(matches!(
        transport.read_holding_registers(300, 10, timeout).await,
        Err(modbus::Error::Exception {
            function: 0x03,
            code: 0x02
        })
    ));
    assert!(transport.read_holding_registers(0, 2, timeout).await.is_ok());

    server.stop().await;
}

#[tokio::test]
async fn test3() {
    use crate::pool::{ConnectionPool, PoolConfig};

    // プール経由でも読める
    let device = SimulatedDevice::default();
    device.tick();
    let (addr, server) = start_test_server(&device).await;
    let pool = ConnectionPool::new(PoolConfig::default());
    for _ in 0..3 {
        let mut lease = pool.acquire("127.0.0.1", addr.port()).await.unwrap();
        let frame = pool.read(&mut lease, 0, 100).await.unwrap();
        assert_eq!(frame.len(), 200);
        let m = crate::sentron::decode(&frame);
        assert!(m.power.active > 0.0);
        assert!((0.81..=0.99).contains(&m.power_factor));
    }
    assert_eq!(pool.connect_attempts(), 1);
    server.stop().await;
}
