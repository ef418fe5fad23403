// 計測器ごとのModbus/TCP接続を保持するコネクションプール
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::background::BackgroundTask;
use crate::device_endpoint::endpoint_key;
use crate::modbus::{self, DEFAULT_UNIT_ID, TcpTransport};
use crate::sentron::RegisterFrame;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("connect to {key} failed: {source}")]
    ConnectRefused {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("read from {0} timed out")]
    ReadTimeout(String),

    #[error("protocol error from {key}: {source}")]
    Protocol {
        key: String,
        #[source]
        source: modbus::Error,
    },
}

/// プールの設定
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// 接続タイムアウト(使用中の接続を待つ時間を含む)
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// これより長く使われていない接続は閉じる
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub unit_id: u8,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2000),
            read_timeout: Duration::from_millis(2000),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            unit_id: DEFAULT_UNIT_ID,
        }
    }
}

#[derive(Debug)]
struct PooledConnection {
    id: u64,
    transport: TcpTransport,
    last_activity: Instant,
}

/// キーごとの置き場所
///
/// 非同期Mutexで接続処理と読み出しをキーごとに直列化する。
type Slot = Arc<AsyncMutex<Option<PooledConnection>>>;

#[derive(Debug)]
struct Inner {
    config: PoolConfig,
    slots: Mutex<HashMap<String, Slot>>,
    connect_attempts: AtomicU64,
    next_id: AtomicU64,
}

/// コネクションプール
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

/// 借りている接続
///
/// 返すまで同じキーの他の利用者と掃除処理は待たされる。
#[derive(Debug)]
pub struct Lease {
    key: String,
    guard: OwnedMutexGuard<Option<PooledConnection>>,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// この接続を捨てる
    pub fn invalidate(&mut self) {
        if let Some(conn) = self.guard.take() {
            tracing::debug!("invalidate connection #{} to {}", conn.id, self.key);
            conn.transport.close();
        }
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                slots: Mutex::new(HashMap::new()),
                connect_attempts: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// 接続を借りる
    ///
    /// 開いている接続があればそれを返す。無ければ古い接続を閉じてから接続する。
    pub async fn acquire(&self, host: &str, port: u16) -> Result<Lease, Error> {
        let key = endpoint_key(host, port);
        let deadline = Instant::now() + self.inner.config.connect_timeout;
        loop {
            let slot = self.slot(&key);
            let mut guard = tokio::time::timeout_at(deadline, slot.clone().lock_owned())
                .await
                .map_err(|_| Error::ConnectTimeout(key.clone()))?;
            if !self.is_registered(&key, &slot) {
                continue; // 待っている間に掃除された
            }

            let reusable = guard
                .as_ref()
                .is_some_and(|conn| conn.transport.is_open());
            if reusable {
                return Ok(Lease { key, guard });
            }
            if let Some(stale) = guard.take() {
                tracing::debug!("discard stale connection #{} to {}", stale.id, key);
                stale.transport.close();
            }

            match self.connect(&key, host, port, deadline).await {
                Ok(transport) => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    self.watch_close(&slot, &key, id, transport.closed_token());
                    *guard = Some(PooledConnection {
                        id,
                        transport,
                        last_activity: Instant::now(),
                    });
                    return Ok(Lease { key, guard });
                }
                Err(e) => {
                    self.unregister(&key, &slot);
                    return Err(e);
                }
            }
        }
    }

    /// 保持レジスタを読み出す
    ///
    /// 例外応答以外の失敗ではこの接続を捨てる。
    pub async fn read(
        &self,
        lease: &mut Lease,
        start: u16,
        count: u16,
    ) -> Result<RegisterFrame, Error> {
        let read_timeout = self.inner.config.read_timeout;
        let Some(conn) = lease.guard.as_mut() else {
            return Err(Error::Protocol {
                key: lease.key.clone(),
                source: modbus::Error::Closed,
            });
        };
        let result = conn
            .transport
            .read_holding_registers(start, count, read_timeout)
            .await;
        match result {
            Ok(data) => {
                conn.last_activity = Instant::now();
                Ok(RegisterFrame::from(data))
            }
            Err(e) => {
                tracing::warn!("read from {} failed: {}", lease.key, e);
                if !matches!(e, modbus::Error::Exception { .. }) {
                    lease.invalidate();
                }
                match e {
                    modbus::Error::Timeout => Err(Error::ReadTimeout(lease.key.clone())),
                    source => Err(Error::Protocol {
                        key: lease.key.clone(),
                        source,
                    }),
                }
            }
        }
    }

    /// 使われていない接続を閉じる
    ///
    /// 使用中の接続には触れない。閉じた接続の数を返す。
    pub fn sweep_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.lock_slots().retain(|key, slot| {
            let Ok(mut guard) = slot.try_lock() else {
                return true; // 使用中
            };
            let expired = match guard.as_ref() {
                None => true,
                Some(conn) => {
                    !conn.transport.is_open()
                        || now.duration_since(conn.last_activity) > idle_timeout
                }
            };
            if expired {
                if let Some(conn) = guard.take() {
                    evicted.push((key.clone(), conn));
                }
            }
            !expired
        });

        let n = evicted.len();
        for (key, conn) in evicted {
            tracing::info!("close idle connection #{} to {}", conn.id, key);
            conn.transport.close();
        }
        n
    }

    /// 定期的に掃除するタスクを起動する
    pub fn spawn_reaper(&self) -> BackgroundTask {
        let pool = self.clone();
        BackgroundTask::spawn_periodic(
            "idle connection reaper",
            self.inner.config.sweep_interval,
            move || {
                let n = pool.sweep_idle();
                tracing::trace!("swept {} idle connections", n);
            },
        )
    }

    /// 開いている(または使用中の)接続の数
    pub fn connection_count(&self) -> usize {
        self.lock_slots()
            .values()
            .filter(|slot| match slot.try_lock() {
                Ok(guard) => guard
                    .as_ref()
                    .is_some_and(|conn| conn.transport.is_open()),
                Err(_) => true,
            })
            .count()
    }

    /// これまでに接続を試みた回数
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Relaxed)
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, key: &str) -> Slot {
        self.lock_slots().entry(key.to_owned()).or_default().clone()
    }

    fn is_registered(&self, key: &str, slot: &Slot) -> bool {
        self.lock_slots()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn unregister(&self, key: &str, slot: &Slot) {
        let mut slots = self.lock_slots();
        if slots
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(key);
        }
    }

    async fn connect(
        &self,
        key: &str,
        host: &str,
        port: u16,
        deadline: Instant,
    ) -> Result<TcpTransport, Error> {
        self.inner.connect_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::info!("connecting to {}", key);
        // タイムアウトしたら接続途中のソケットごと捨てる
        match tokio::time::timeout_at(deadline, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("{} set_nodelay: {}", key, e);
                }
                tracing::info!("connected to {}", key);
                Ok(TcpTransport::new(stream, key, self.inner.config.unit_id))
            }
            Ok(Err(e)) => {
                tracing::warn!("connect to {} failed: {}", key, e);
                Err(Error::ConnectRefused {
                    key: key.to_owned(),
                    source: e,
                })
            }
            Err(_) => {
                tracing::warn!("connect to {} timed out", key);
                Err(Error::ConnectTimeout(key.to_owned()))
            }
        }
    }

    /// 切断を検出したらプールから外す
    fn watch_close(&self, slot: &Slot, key: &str, id: u64, closed: CancellationToken) {
        let slot = Arc::downgrade(slot);
        let key = key.to_owned();
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(slot) = slot.upgrade() {
                let mut guard = slot.lock().await;
                if guard.as_ref().is_some_and(|conn| conn.id == id) {
                    *guard = None;
                    tracing::info!("connection #{} to {} closed", id, key);
                }
            }
        });
    }
}

#[cfg(test)]
struct TestServer {
    addr: std::net::SocketAddr,
    accepted: Arc<std::sync::atomic::AtomicUsize>,
    peers: Arc<Mutex<Vec<TcpStream>>>,
    task: tokio::task::JoinHandle<()>,
}

#[cfg(test)]
impl TestServer {
    /// 接続を受け付けるだけで応答しないサーバ
    async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peers = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let accepted = accepted.clone();
            let peers = peers.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    peers.lock().unwrap().push(stream);
                }
            })
        };
        Self {
            addr,
            accepted,
            peers,
            task,
        }
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// サーバ側から全部切断する
    fn disconnect_all(&self) {
        self.peers.lock().unwrap().clear();
    }
}

#[cfg(test)]
impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
fn test_pool() -> ConnectionPool {
    ConnectionPool::new(PoolConfig {
        connect_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_millis(100),
        ..Default::default()
    })
}

#[tokio::test]
async fn test1() {
    // 同じキーを同時に取りにいっても接続は1本
    let server = TestServer::start().await;
    let pool = test_pool();
    let port = server.addr.port();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let lease = pool.acquire("127.0.0.1", port).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(lease);
            })
        })
        .collect();
    for r in futures::future::join_all(handles).await {
        r.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(pool.connect_attempts(), 1);
    assert_eq!(pool.connection_count(), 1);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test2() {
    // 相手が切断したら次は新しく接続する
    let server = TestServer::start().await;
    let pool = test_pool();
    let port = server.addr.port();

    drop(pool.acquire("127.0.0.1", port).await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.disconnect_all();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.connection_count(), 0);

    drop(pool.acquire("127.0.0.1", port).await.unwrap());
    assert_eq!(pool.connect_attempts(), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.accepted(), 2);
    assert_eq!(pool.connection_count(), 1);
}

#[tokio::test]
async fn test3() {
    // 読み出しに失敗した接続は使い回さない
    let server = TestServer::start().await;
    let pool = test_pool();
    let port = server.addr.port();

    let mut lease = pool.acquire("127.0.0.1", port).await.unwrap();
    let result = pool.read(&mut lease, 0, 100).await;
    assert!(matches!(result, Err(Error::ReadTimeout(ref key)) if key == lease.key()));
    drop(lease);

    let mut lease = pool.acquire("127.0.0.1", port).await.unwrap();
    assert_eq!(pool.connect_attempts(), 2);
    lease.invalidate();
    assert!(matches!(
        pool.read(&mut lease, 0, 100).await,
        Err(Error::Protocol {
            source: modbus::Error::Closed,
            ..
        })
    ));
}

#[tokio::test]
async fn test4() {
    // 接続拒否
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let pool = test_pool();
    let started = std::time::Instant::now();
    let result = pool.acquire("127.0.0.1", port).await;
    assert!(matches!(result, Err(Error::ConnectRefused { .. })));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(pool.connection_count(), 0);
    assert!(pool.lock_slots().is_empty());
}

#[tokio::test]
async fn test5() {
    // 使用中の接続を待ちきれなければ接続タイムアウト
    let server = TestServer::start().await;
    let pool = ConnectionPool::new(PoolConfig {
        connect_timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let port = server.addr.port();

    let lease = pool.acquire("127.0.0.1", port).await.unwrap();
    let result = pool.acquire("127.0.0.1", port).await;
    assert!(matches!(result, Err(Error::ConnectTimeout(_))));
    drop(lease);
    assert!(pool.acquire("127.0.0.1", port).await.is_ok());
    assert_eq!(pool.connect_attempts(), 1);
}

#[tokio::test]
async fn test6() {
    // 閾値より古い接続だけを閉じる
    let server = TestServer::start().await;
    let port = server.addr.port();

    let short = ConnectionPool::new(PoolConfig {
        idle_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    let long = ConnectionPool::new(PoolConfig::default());
    drop(short.acquire("127.0.0.1", port).await.unwrap());
    drop(long.acquire("127.0.0.1", port).await.unwrap());
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(long.sweep_idle(), 0);
    assert_eq!(long.connection_count(), 1);

    // 使用中なら古くても閉じない
    let lease = short.acquire("127.0.0.1", port).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(short.sweep_idle(), 0);
    drop(lease);

    assert_eq!(short.sweep_idle(), 1);
    assert_eq!(short.connection_count(), 0);
    assert_eq!(short.connect_attempts(), 1);

    drop(short.acquire("127.0.0.1", port).await.unwrap());
    assert_eq!(short.connect_attempts(), 2);
}

#[tokio::test]
async fn test7() {
    // バックグラウンドの掃除
    let server = TestServer::start().await;
    let pool = ConnectionPool::new(PoolConfig {
        idle_timeout: Duration::from_millis(30),
        sweep_interval: Duration::from_millis(20),
        ..Default::default()
    });
    let reaper = pool.spawn_reaper();
    drop(pool.acquire("127.0.0.1", server.addr.port()).await.unwrap());
    assert_eq!(pool.connection_count(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.connection_count(), 0);
    reaper.stop().await;
}

#[tokio::test]
async fn test8() {
    use tokio::net::TcpSocket;

    // 受付待ちが溢れた相手には接続が完了しない
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();
    let mut backlog = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => backlog.push(stream),
            Ok(Err(e)) => panic!("{e}"),
            Err(_) => break,
        }
        assert!(backlog.len() < 64);
    }

    let pool = ConnectionPool::new(PoolConfig {
        connect_timeout: Duration::from_millis(200),
        ..Default::default()
    });
    let started = std::time::Instant::now();
    let result = pool.acquire("127.0.0.1", addr.port()).await;
    assert!(matches!(result, Err(Error::ConnectTimeout(_))));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.connect_attempts(), 1);
    assert_eq!(pool.connection_count(), 0);
    assert!(pool.lock_slots().is_empty());

    drop(backlog);
    drop(listener);
}
