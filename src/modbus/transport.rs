// Modbus/TCP クライアント側トランスポート
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::modbus::{
    Adu, Error, ModbusTcpCodec, READ_HOLDING_REGISTERS, Request, Response, parse_response,
};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// 単一ユニット
pub const DEFAULT_UNIT_ID: u8 = 1;

/// 接続済みのトランスポート
///
/// 受信は専用タスクが行い、相手の切断やエラーを検出したら
/// `closed` トークンをキャンセルする。
#[derive(Debug)]
pub struct TcpTransport {
    peer: String,
    unit_id: u8,
    next_transaction_id: u16,
    sink: FramedWrite<OwnedWriteHalf, ModbusTcpCodec>,
    responses: mpsc::Receiver<Result<Adu, Error>>,
    closed: CancellationToken,
    receiver: JoinHandle<()>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, peer: &str, unit_id: u8) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(8);
        let closed = CancellationToken::new();
        let receiver = tokio::spawn(receive_loop(
            peer.to_owned(),
            FramedRead::new(read_half, ModbusTcpCodec),
            tx,
            closed.clone(),
        ));
        Self {
            peer: peer.to_owned(),
            unit_id,
            next_transaction_id: 0,
            sink: FramedWrite::new(write_half, ModbusTcpCodec),
            responses: rx,
            closed,
            receiver,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// まだ使えるか
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// 切断されたらキャンセルされるトークン
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// 保持レジスタを読み出す
    pub async fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        // 以前にタイムアウトした要求の応答を捨てる
        while let Ok(stale) = self.responses.try_recv() {
            tracing::debug!("{} discard stale response {:?}", self.peer, stale);
        }

        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        let transaction_id = self.next_transaction_id;
        let request = Adu {
            transaction_id,
            unit_id: self.unit_id,
            pdu: Request::ReadHoldingRegisters { address, quantity }.to_pdu(),
        };

        let exchange = async {
            if let Err(e) = self.sink.send(request).await {
                return Err(e);
            }
            loop {
                match self.responses.recv().await {
                    Some(Ok(adu)) if adu.transaction_id == transaction_id => break Ok(adu),
                    Some(Ok(adu)) => {
                        tracing::debug!("{} unexpected transaction {}", self.peer, adu);
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(Error::Closed),
                }
            }
        };
        let adu = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Timeout)??;

        if adu.unit_id != self.unit_id {
            return Err(Error::Malformed(format!(
                "unit id {} for {}",
                adu.unit_id, self.unit_id
            )));
        }
        match parse_response(&adu.pdu) {
            Ok((_rest, Response::ReadHoldingRegisters(data))) => {
                // 要求より短い応答はそのまま渡す(足りない値は復号時に 0.0)
                if data.len() > quantity as usize * 2 || data.len() % 2 != 0 {
                    Err(Error::Malformed(format!(
                        "{} bytes for {} registers",
                        data.len(),
                        quantity
                    )))
                } else {
                    Ok(data)
                }
            }
            Ok((_rest, Response::Exception { function, code }))
                if function == READ_HOLDING_REGISTERS =>
            {
                Err(Error::Exception { function, code })
            }
            Ok((_rest, Response::Exception { function, .. })) => Err(Error::Malformed(format!(
                "exception for function {:#04x}",
                function
            ))),
            Err(e) => Err(Error::Malformed(format!("{:?}", e))),
        }
    }

    /// 切断する
    pub fn close(self) {
        tracing::debug!("close {}", self.peer);
        // Dropで受信タスクを止めて書き込み側を閉じる
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.closed.cancel();
        self.receiver.abort();
    }
}

#[tracing::instrument(skip_all, fields(peer = %peer))]
/// 受信タスク
async fn receive_loop(
    peer: String,
    mut stream: FramedRead<OwnedReadHalf, ModbusTcpCodec>,
    tx: mpsc::Sender<Result<Adu, Error>>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(adu)) => {
                    if tx.send(Ok(adu)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("{peer} receive error: {e}");
                    let _ = tx.send(Err(e)).await;
                    break;
                }
                None => {
                    tracing::debug!("{peer} closed by peer");
                    break;
                }
            }
        }
    }
    drop(tx);
    closed.cancel();
}

#[cfg(test)]
async fn loopback() -> (TcpTransport, TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (
        TcpTransport::new(client.unwrap(), &addr.to_string(), DEFAULT_UNIT_ID),
        server.unwrap().0,
    )
}

#[tokio::test]
async fn test1() {
    use tokio_util::codec::Framed;

    let (mut transport, server) = loopback().await;
    let mut server = Framed::new(server, ModbusTcpCodec);

    let responder = tokio::spawn(async move {
        let request = server.next().await.unwrap().unwrap();
        assert_eq!(request.pdu, vec![0x03, 0x00, 0x00, 0x00, 0x02]);
        // 関係ない応答を先に返す
        let noise = Adu {
            transaction_id: request.transaction_id.wrapping_add(100),
            unit_id: 1,
            pdu: Response::ReadHoldingRegisters(vec![0xff; 4]).to_pdu(),
        };
        server.send(noise).await.unwrap();
        let reply = Adu {
            transaction_id: request.transaction_id,
            unit_id: 1,
            pdu: Response::ReadHoldingRegisters(vec![0x43, 0x66, 0x00, 0x00]).to_pdu(),
        };
        server.send(reply).await.unwrap();
        server
    });

    let data = transport
        .read_holding_registers(0, 2, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(data, vec![0x43, 0x66, 0x00, 0x00]);
    assert!(transport.is_open());

    // 相手が切断したら閉じる
    drop(responder.await.unwrap());
    tokio::time::timeout(Duration::from_secs(2), transport.closed_token().cancelled())
        .await
        .unwrap();
    assert!(!transport.is_open());
    assert!(matches!(
        transport
            .read_holding_registers(0, 2, Duration::from_secs(2))
            .await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn test2() {
    use tokio_util::codec::Framed;

    let (mut transport, server) = loopback().await;
    let mut server = Framed::new(server, ModbusTcpCodec);

    // 応答しない
    let result = transport
        .read_holding_registers(0, 100, Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(Error::Timeout)));
    let _ignored = server.next().await.unwrap().unwrap();

    // 例外応答
    let responder = tokio::spawn(async move {
        let request = server.next().await.unwrap().unwrap();
        let reply = Adu {
            transaction_id: request.transaction_id,
            unit_id: 1,
            pdu: vec![0x83, 0x02],
        };
        server.send(reply).await.unwrap();
        server
    });
    let result = transport
        .read_holding_registers(500, 100, Duration::from_secs(2))
        .await;
    assert!(matches!(
        result,
        Err(Error::Exception {
            function: 0x03,
            code: 0x02
        })
    ));
    let _server = responder.await.unwrap();
}

#[tokio::test]
async fn test3() {
    use tokio_util::codec::Framed;

    let (mut transport, server) = loopback().await;
    let mut server = Framed::new(server, ModbusTcpCodec);

    let responder = tokio::spawn(async move {
        // 別ユニットからの応答
        let request = server.next().await.unwrap().unwrap();
        let reply = Adu {
            transaction_id: request.transaction_id,
            unit_id: 2,
            pdu: Response::ReadHoldingRegisters(vec![0x43, 0x66, 0x00, 0x00]).to_pdu(),
        };
        server.send(reply).await.unwrap();
        // 要求していない機能の例外応答
        let request = server.next().await.unwrap().unwrap();
        let reply = Adu {
            transaction_id: request.transaction_id,
            unit_id: 1,
            pdu: vec![0x90, 0x01],
        };
        server.send(reply).await.unwrap();
        server
    });

    let timeout = Duration::from_secs(2);
    assert!(matches!(
        transport.read_holding_registers(0, 2, timeout).await,
        Err(Error::Malformed(_))
    ));
    assert!(matches!(
        transport.read_holding_registers(0, 2, timeout).await,
        Err(Error::Malformed(_))
    ));
    let _server = responder.await.unwrap();
}
