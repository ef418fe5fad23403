// 擬似計測器(SENTRON PAC3200と同じレジスタ配置)
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::background::BackgroundTask;
use crate::sentron::{REGISTER_COUNT, RegisterFrame, START_REGISTER};
use crate::simulator::{Sample, WaveformModel};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// 保持レジスタ数(500バイト)
pub const SIMULATED_REGISTER_COUNT: usize = 250;

/// tick間隔
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// ある時点のレジスタの内容
#[derive(Clone, Debug)]
pub struct SimulatedRegisterState {
    pub frame: RegisterFrame,
    pub phase: f64,
    pub energy_kwh: f64,
    pub ticks: u64,
}

/// 擬似計測器
///
/// レジスタを書き換えるのはtickだけで、読み出し側には複製を渡す。
#[derive(Clone, Debug)]
pub struct SimulatedDevice {
    model: Arc<Mutex<WaveformModel>>,
    tick_interval: Duration,
    state: Arc<watch::Sender<SimulatedRegisterState>>,
}

impl SimulatedDevice {
    pub fn new(tick_interval: Duration) -> Self {
        Self::with_model(WaveformModel::new(), tick_interval)
    }

    pub fn with_model(mut model: WaveformModel, tick_interval: Duration) -> Self {
        // 最初のtick前から妥当な値を返せるようにしておく
        let sample = model.sample();
        let state = SimulatedRegisterState {
            frame: render(&sample),
            phase: model.phase(),
            energy_kwh: model.energy_kwh(),
            ticks: 0,
        };
        let (tx, _rx) = watch::channel(state);
        Self {
            model: Arc::new(Mutex::new(model)),
            tick_interval,
            state: Arc::new(tx),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// 位相を1つ進めてレジスタを書き換える
    pub fn tick(&self) -> Sample {
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let sample = model.advance(self.tick_interval);
        let next = SimulatedRegisterState {
            frame: render(&sample),
            phase: model.phase(),
            energy_kwh: model.energy_kwh(),
            ticks: self.state.borrow().ticks + 1,
        };
        self.state.send_replace(next);
        sample
    }

    /// 現在のレジスタの複製
    pub fn snapshot(&self) -> SimulatedRegisterState {
        self.state.borrow().clone()
    }

    /// 計測器から読み出すのと同じ範囲(0番から100レジスタ)を読む
    ///
    /// 失敗しない。
    pub fn read(&self) -> (RegisterFrame, f64) {
        let state = self.state.borrow();
        let frame = state
            .frame
            .registers(START_REGISTER, REGISTER_COUNT)
            .unwrap_or_else(|| state.frame.clone());
        (frame, state.energy_kwh)
    }

    /// 指定範囲のレジスタを読む
    pub fn read_registers(&self, start: u16, count: u16) -> Option<RegisterFrame> {
        self.state.borrow().frame.registers(start, count)
    }

    /// 変化を待ち受ける
    pub fn subscribe(&self) -> watch::Receiver<SimulatedRegisterState> {
        self.state.subscribe()
    }

    /// tickを周期的に呼び出すタスクを起動する
    pub fn spawn_ticker(&self) -> BackgroundTask {
        let device = self.clone();
        BackgroundTask::spawn_periodic("simulator ticker", self.tick_interval, move || {
            let sample = device.tick();
            let ticks = device.state.borrow().ticks;
            // 約2秒ごとに様子を出す
            if ticks % 10 == 0 {
                tracing::debug!(
                    "[SIMULATOR] V: {:.1}V | I: {:.1}A | P: {:.1}kW",
                    sample.voltage[0],
                    sample.current[0],
                    sample.active_power_kw
                );
            }
        })
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}

fn render(sample: &Sample) -> RegisterFrame {
    let mut frame = RegisterFrame::zeroed(SIMULATED_REGISTER_COUNT * 2);
    sample.encode_into(&mut frame);
    frame
}

#[test]
fn test1() {
    // 200msごとの2回のtickで値が変わる
    let device = SimulatedDevice::with_model(WaveformModel::with_seed(1), DEFAULT_TICK_INTERVAL);
    device.tick();
    let (first, _) = device.read();
    device.tick();
    let (second, _) = device.read();
    let v1 = crate::sentron::decode(&first).voltage.l1;
    let v2 = crate::sentron::decode(&second).voltage.l1;
    assert_ne!(v1, v2);
    for v in [v1, v2] {
        assert!((220.0..=240.0).contains(&v), "{v}");
    }
    assert_eq!(first.len(), 200);
}

#[test]
fn test2() {
    // 読み出した複製はtickで変わらない
    let device = SimulatedDevice::with_model(WaveformModel::with_seed(2), DEFAULT_TICK_INTERVAL);
    let before = device.snapshot();
    assert_eq!(before.ticks, 0);
    assert_eq!(crate::sentron::decode(&before.frame).voltage.l1, 230.0);
    let copy = before.frame.clone();
    device.tick();
    assert_eq!(before.frame, copy);
    let after = device.snapshot();
    assert_eq!(after.ticks, 1);
    assert_ne!(after.frame, before.frame);
    assert_eq!(after.frame.len(), SIMULATED_REGISTER_COUNT * 2);
}

#[test]
fn test3() {
    // 積算電力量は減らない
    let device = SimulatedDevice::with_model(WaveformModel::with_seed(3), DEFAULT_TICK_INTERVAL);
    let mut last = device.read().1;
    for _ in 0..100 {
        device.tick();
        let (_, energy) = device.read();
        assert!(energy >= last);
        last = energy;
    }
    assert!(last > crate::simulator::INITIAL_ENERGY_KWH);
}

#[tokio::test]
async fn test4() {
    let device = SimulatedDevice::new(Duration::from_millis(10));
    let mut rx = device.subscribe();
    let ticker = device.spawn_ticker();
    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .unwrap()
        .unwrap();
    ticker.stop().await;
    let ticks = device.snapshot().ticks;
    assert!(ticks >= 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(device.snapshot().ticks, ticks);
}
