// バックグラウンドタスク
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// 周期処理の最小周期
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// 所有者が停止できるバックグラウンドタスク
///
/// Dropされたらキャンセルする。
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// キャンセルトークンを受け取る非同期処理を起動する
    pub fn spawn<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f(cancel.clone()));
        tracing::debug!("{name} started");
        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    /// 一定周期で処理を呼び出す
    ///
    /// 周期0は最小周期に切り上げる。
    pub fn spawn_periodic<F>(name: &'static str, period: Duration, mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let period = if period.is_zero() {
            tracing::warn!("{name}: zero period, use {:?}", MIN_PERIOD);
            MIN_PERIOD
        } else {
            period
        };
        Self::spawn(name, move |cancel| async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 最初のtickはすぐに来るので読み捨てる
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => f(),
                }
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// 停止して終了を待つ
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!("{} aborted: {}", self.name, e);
            }
        }
        tracing::debug!("{} stopped", self.name);
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn test1() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let task = BackgroundTask::spawn_periodic("counter", Duration::from_millis(10), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!task.is_finished());
    task.stop().await;

    let stopped_at = count.load(Ordering::SeqCst);
    assert!(stopped_at > 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), stopped_at);
}

#[tokio::test]
async fn test2() {
    let task = BackgroundTask::spawn("waiter", |cancel| async move {
        cancel.cancelled().await;
    });
    let token = task.cancellation_token();
    drop(task);
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn test3() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // 周期0でも止まらずに動く
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let task = BackgroundTask::spawn_periodic("zero", Duration::ZERO, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    task.stop().await;
    assert!(count.load(Ordering::SeqCst) > 0);
}
