// 定期的に計測値を読み取る監視ループ
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::connection_settings::DeviceSettings;
use crate::meter::{self, MeterState, ShortReading, TriggerEvent};
use crate::polling::{DeviceHost, MeterSource, PollDecision, PowerIndicator, TriggerDispatch, Watchdog};
use std::future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

/// 監視カウンタが尽きたときの再始動までの待ち時間
pub const WATCHDOG_RESTART_DELAY: Duration = Duration::from_secs(60);

/// 設定変更による再始動までの待ち時間
pub const RECONFIGURE_RESTART_DELAY: Duration = Duration::from_secs(1);

/// 1回のポーリングの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Accepted,
    Rejected,
    Failed,
    Skipped,
    RestartRequested,
}

#[derive(Debug)]
enum Command {
    Reconfigure,
}

/// 1台分の監視
pub struct Monitor<S, H, T, V> {
    source: S,
    host: H,
    triggers: T,
    indicator: V,
    settings: DeviceSettings,
    watchdog: Watchdog,
    state: watch::Sender<MeterState>,
}

impl<S, H, T, V> Monitor<S, H, T, V>
where
    S: MeterSource,
    H: DeviceHost,
    T: TriggerDispatch,
    V: PowerIndicator,
{
    pub fn new(source: S, host: H, triggers: T, indicator: V) -> Self {
        let settings = host.settings();
        let (state, _) = watch::channel(MeterState::default());
        Self {
            source,
            host,
            triggers,
            indicator,
            settings,
            watchdog: Watchdog::default(),
            state,
        }
    }

    pub fn meter_state(&self) -> MeterState {
        self.state.borrow().clone()
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// 1回分のポーリング
    pub async fn poll_once(&mut self) -> CycleOutcome {
        match self.watchdog.decide() {
            PollDecision::Restart => {
                tracing::warn!("{} watchdog triggered, restarting device", self.settings.name);
                return CycleOutcome::RestartRequested;
            }
            PollDecision::Skip => {
                tracing::trace!("skipping poll, watchdog {}", self.watchdog.count());
                return CycleOutcome::Skipped;
            }
            PollDecision::Poll => {}
        }

        match self.source.read_meter().await {
            Ok(reading) => {
                let last = self.meter_state();
                if self.settings.filter_readings {
                    if let Err(reason) = meter::validate(&reading, &last) {
                        tracing::warn!("{} invalid reading ignored: {}", self.settings.name, reason);
                        self.watchdog.fail();
                        return CycleOutcome::Rejected;
                    }
                }
                self.host.set_available();
                self.publish(&reading, &last);
                self.watchdog.reset();
                CycleOutcome::Accepted
            }
            Err(e) => {
                self.host.set_unavailable(&e.to_string());
                self.watchdog.fail();
                tracing::error!("{} Poll error: {}", self.settings.name, e);
                CycleOutcome::Failed
            }
        }
    }

    /// 状態を更新してイベントを通知する
    fn publish(&self, reading: &ShortReading, last: &MeterState) {
        let derived = meter::derive(reading, last, self.host.observed_off_peak());
        for event in derived.events() {
            tracing::debug!("{} {} {}", self.settings.name, event.name(), event.tokens());
            self.triggers.trigger(&self.settings.name, &event, &derived.state);
            if let TriggerEvent::PowerChanged { power, .. } = event {
                self.indicator.change(&self.settings, power);
            }
        }
        for (capability, value) in derived.state.capability_values() {
            self.host.set_capability_value(capability, value);
        }
        self.state.send_replace(derived.state);
    }

    /// 設定を読み直して最初からやり直す
    pub async fn restart(&mut self) {
        self.settings = self.host.settings();
        self.source
            .restart_session(self.settings.session_config())
            .await;
        self.state.send_replace(MeterState::default());
        self.watchdog.reset();
        tracing::info!(
            "{} polling every {:?}",
            self.settings.name,
            self.settings.polling_interval()
        );
    }

    fn ticker(&self) -> Interval {
        let period = self.settings.polling_interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// キャンセルされるまでポーリングを続ける
    #[tracing::instrument(skip_all)]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        self.restart().await;
        let mut ticker = Some(self.ticker());
        // 再始動待ち(Someなら再始動中)
        let mut pending_restart: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = next_tick(&mut ticker) => {
                    if self.poll_once().await == CycleOutcome::RestartRequested {
                        ticker = None;
                        schedule_restart(&mut pending_restart, WATCHDOG_RESTART_DELAY);
                    }
                }
                _ = expired(&mut pending_restart) => {
                    pending_restart = None;
                    self.restart().await;
                    ticker = Some(self.ticker());
                }
                Some(command) = commands.recv() => match command {
                    Command::Reconfigure => {
                        tracing::info!("{} settings changed", self.settings.name);
                        ticker = None;
                        schedule_restart(&mut pending_restart, RECONFIGURE_RESTART_DELAY);
                    }
                },
            }
        }
        tracing::info!("{} monitor stopped", self.settings.name);
    }

    /// 別タスクで監視を始める
    pub fn spawn(self, cancel: CancellationToken) -> MonitorHandle {
        let (commands, rx) = mpsc::channel(8);
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(rx, cancel.clone()));
        MonitorHandle {
            commands,
            state,
            cancel,
            task,
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

async fn expired(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

/// 再始動中なら新しい要求は捨てる
fn schedule_restart(pending: &mut Option<Pin<Box<Sleep>>>, delay: Duration) {
    if pending.is_some() {
        tracing::debug!("restart already in progress");
        return;
    }
    *pending = Some(Box::pin(time::sleep(delay)));
}

/// 動作中の監視への窓口
#[derive(Debug)]
pub struct MonitorHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<MeterState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// 設定が変わったので再始動させる
    pub async fn reconfigure(&self) -> bool {
        self.commands.send(Command::Reconfigure).await.is_ok()
    }

    /// 夜間料金中か
    pub fn off_peak(&self) -> Option<bool> {
        self.state.borrow().off_peak
    }

    pub fn meter_state(&self) -> MeterState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MeterState> {
        self.state.clone()
    }

    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_settings::SessionConfig;
    use crate::meter::{Capability, CapabilityValue};
    use crate::session::SessionError;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Record {
        reads: usize,
        restarts: usize,
        available: Option<bool>,
        unavailable_reason: String,
        capabilities: Vec<(Capability, CapabilityValue)>,
        events: Vec<TriggerEvent>,
        indicator: Vec<f64>,
    }

    type Shared = Arc<Mutex<Record>>;

    /// 用意した計測値を順に返す。尽きたらタイムアウト
    struct FakeSource {
        record: Shared,
        readings: Mutex<VecDeque<ShortReading>>,
    }

    impl MeterSource for FakeSource {
        async fn restart_session(&self, _config: SessionConfig) {
            self.record.lock().unwrap().restarts += 1;
        }

        async fn read_meter(&self) -> Result<ShortReading, SessionError> {
            self.record.lock().unwrap().reads += 1;
            self.readings
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(SessionError::Timeout)
        }
    }

    struct FakeHost {
        record: Shared,
        settings: DeviceSettings,
    }

    impl DeviceHost for FakeHost {
        fn settings(&self) -> DeviceSettings {
            self.settings.clone()
        }

        fn set_available(&self) {
            self.record.lock().unwrap().available = Some(true);
        }

        fn set_unavailable(&self, reason: &str) {
            let mut record = self.record.lock().unwrap();
            record.available = Some(false);
            record.unavailable_reason = reason.to_owned();
        }

        fn set_capability_value(&self, capability: Capability, value: CapabilityValue) {
            self.record.lock().unwrap().capabilities.push((capability, value));
        }
    }

    struct FakeTriggers(Shared);

    impl TriggerDispatch for FakeTriggers {
        fn trigger(&self, _device: &str, event: &TriggerEvent, _state: &MeterState) {
            self.0.lock().unwrap().events.push(event.clone());
        }
    }

    struct FakeIndicator(Shared);

    impl PowerIndicator for FakeIndicator {
        fn change(&self, _settings: &DeviceSettings, power: f64) {
            self.0.lock().unwrap().indicator.push(power);
        }
    }

    fn reading(p1: f64, p2: f64, pwr: f64, tm: i64) -> ShortReading {
        ShortReading {
            pwr: Some(pwr),
            net: Some(meter::round_to(p1 + p2, 4)),
            p1: Some(p1),
            p2: Some(p2),
            n1: Some(0.0),
            n2: Some(0.0),
            tm: Some(tm),
            ..Default::default()
        }
    }

    fn monitor(
        readings: Vec<ShortReading>,
        filter_readings: bool,
    ) -> (
        Monitor<FakeSource, FakeHost, FakeTriggers, FakeIndicator>,
        Shared,
    ) {
        let record = Shared::default();
        let settings = DeviceSettings {
            name: "meterkast".to_owned(),
            polling_interval: 10,
            filter_readings,
            ..Default::default()
        };
        let monitor = Monitor::new(
            FakeSource {
                record: record.clone(),
                readings: Mutex::new(readings.into()),
            },
            FakeHost {
                record: record.clone(),
                settings,
            },
            FakeTriggers(record.clone()),
            FakeIndicator(record.clone()),
        );
        (monitor, record)
    }

    #[tokio::test]
    async fn test_ten_failures_request_restart() {
        let (mut monitor, record) = monitor(vec![], true);
        let mut outcomes = Vec::new();
        for _ in 0..10 {
            outcomes.push(monitor.poll_once().await);
        }
        use CycleOutcome::*;
        assert_eq!(
            outcomes,
            vec![Failed, Failed, Skipped, Failed, Skipped, Failed, Skipped, Failed, Skipped, Failed]
        );
        assert_eq!(monitor.watchdog().count(), 0);
        assert_eq!(monitor.poll_once().await, RestartRequested);
        // 再始動するまで読みに行かない
        assert_eq!(monitor.poll_once().await, RestartRequested);

        let record = record.lock().unwrap();
        assert_eq!(record.reads, 6);
        assert_eq!(record.available, Some(false));
        assert_eq!(record.unavailable_reason, "request timed out");
    }

    #[tokio::test]
    async fn test_accepted_reading() {
        let (mut monitor, record) = monitor(
            vec![
                reading(100.0, 50.0, 500.0, 1000),
                reading(100.0, 50.01, 520.0, 1010),
            ],
            true,
        );
        assert_eq!(monitor.poll_once().await, CycleOutcome::Accepted);
        assert_eq!(monitor.poll_once().await, CycleOutcome::Accepted);
        assert_eq!(monitor.meter_state().measure_power, Some(520.0));
        assert_eq!(monitor.meter_state().off_peak, Some(false));

        let record = record.lock().unwrap();
        assert_eq!(record.available, Some(true));
        assert_eq!(
            record.events,
            vec![TriggerEvent::PowerChanged {
                power: 520.0,
                power_delta: 20.0
            }]
        );
        assert_eq!(record.indicator, vec![520.0]);
        assert!(record.capabilities.contains(&(
            Capability::MeasurePower,
            CapabilityValue::Number(520.0)
        )));
    }

    #[tokio::test]
    async fn test_accepted_reading_resets_watchdog() {
        let (mut monitor, _record) = monitor(vec![], true);
        assert_eq!(monitor.poll_once().await, CycleOutcome::Failed);
        assert_eq!(monitor.watchdog().count(), 9);

        monitor
            .source
            .readings
            .lock()
            .unwrap()
            .push_back(reading(100.0, 50.0, 500.0, 1000));
        assert_eq!(monitor.poll_once().await, CycleOutcome::Accepted);
        assert_eq!(monitor.watchdog().count(), 10);
    }

    #[tokio::test]
    async fn test_rejected_reading() {
        let mut first = reading(100.0, 50.0, 500.0, 1000);
        first.gas = Some(100.0);
        first.gtm = Some(1000);
        let mut second = reading(100.0, 50.0, 500.0, 1100);
        second.gas = Some(90.0);
        second.gtm = Some(1100);
        let (mut monitor, record) = monitor(vec![first, second], true);

        assert_eq!(monitor.poll_once().await, CycleOutcome::Accepted);
        let accepted = monitor.meter_state();
        assert_eq!(monitor.poll_once().await, CycleOutcome::Rejected);
        assert_eq!(monitor.meter_state(), accepted);
        assert_eq!(monitor.watchdog().count(), 9);
        assert_eq!(record.lock().unwrap().available, Some(true));
    }

    #[tokio::test]
    async fn test_filter_disabled() {
        let mut first = reading(100.0, 50.0, 500.0, 1000);
        first.gas = Some(100.0);
        first.gtm = Some(1000);
        let mut second = reading(100.0, 50.0, 500.0, 1100);
        second.gas = Some(90.0);
        second.gtm = Some(1100);
        let (mut monitor, _record) = monitor(vec![first, second], false);

        assert_eq!(monitor.poll_once().await, CycleOutcome::Accepted);
        assert_eq!(monitor.poll_once().await, CycleOutcome::Accepted);
        assert_eq!(monitor.meter_state().meter_gas, Some(90.0));
    }

    #[tokio::test]
    async fn test_restart_resets_state() {
        let (mut monitor, record) = monitor(vec![reading(100.0, 50.0, 500.0, 1000)], true);
        assert_eq!(monitor.poll_once().await, CycleOutcome::Accepted);
        assert_ne!(monitor.meter_state(), MeterState::default());

        monitor.restart().await;
        assert_eq!(monitor.meter_state(), MeterState::default());
        assert_eq!(monitor.watchdog().count(), 10);
        assert_eq!(record.lock().unwrap().restarts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_watchdog_restart() {
        let (monitor, record) = monitor(vec![], true);
        let cancel = CancellationToken::new();
        let handle = monitor.spawn(cancel.clone());

        // 10秒間隔で11回目に再始動を要求する
        time::sleep(Duration::from_secs(115)).await;
        {
            let record = record.lock().unwrap();
            assert_eq!(record.restarts, 1);
            assert_eq!(record.reads, 6);
        }
        // 60秒待ってから再始動、その間は読みに行かない
        time::sleep(Duration::from_secs(50)).await;
        assert_eq!(record.lock().unwrap().reads, 6);
        time::sleep(Duration::from_secs(20)).await;
        {
            let record = record.lock().unwrap();
            assert_eq!(record.restarts, 2);
            assert_eq!(record.reads, 7);
        }

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_and_off_peak() {
        let (monitor, record) = monitor(
            vec![
                reading(100.0, 50.0, 500.0, 1000),
                reading(100.5, 50.0, 500.0, 1100),
            ],
            true,
        );
        let cancel = CancellationToken::new();
        let handle = monitor.spawn(cancel.clone());
        let mut updates = handle.subscribe();

        time::sleep(Duration::from_secs(25)).await;
        assert_eq!(handle.off_peak(), Some(true));
        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().meter_power, Some(150.5));

        assert!(handle.reconfigure().await);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(record.lock().unwrap().restarts, 2);
        assert_eq!(handle.meter_state(), MeterState::default());
        assert_eq!(handle.off_peak(), None);

        cancel.cancel();
        handle.shutdown().await.unwrap();
    }
}
