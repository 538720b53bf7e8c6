// 積算値から導出する計測値
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::meter::{MeterState, ShortReading, round_to};
use serde_json::{Value, json};

/// 平均電力を更新する最小間隔 秒
pub const AVERAGE_POWER_WINDOW: i64 = 60;

/// 発電量ゼロ補正を行う瞬時電力の範囲 W
const ZERO_PRODUCTION_BAND: (f64, f64) = (-50.0, 100.0);

/// 状態変化イベント
#[derive(Clone, PartialEq, Debug)]
pub enum TriggerEvent {
    TariffChanged { tariff: bool },
    PowerChanged { power: f64, power_delta: f64 },
}

impl TriggerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerEvent::TariffChanged { .. } => "tariff_changed",
            TriggerEvent::PowerChanged { .. } => "power_changed",
        }
    }

    pub fn tokens(&self) -> Value {
        match self {
            TriggerEvent::TariffChanged { tariff } => json!({ "tariff": tariff }),
            TriggerEvent::PowerChanged { power, power_delta } => {
                json!({ "power": power, "power_delta": power_delta })
            }
        }
    }
}

/// 導出結果
#[derive(Clone, PartialEq, Debug)]
pub struct Derived {
    pub state: MeterState,
    pub tariff_changed: bool,
    pub power_changed: bool,
    pub power_delta: f64,
}

impl Derived {
    /// 発火するイベント
    pub fn events(&self) -> Vec<TriggerEvent> {
        let mut events = Vec::new();
        if self.tariff_changed {
            events.push(TriggerEvent::TariffChanged {
                tariff: self.state.off_peak.unwrap_or_default(),
            });
        }
        if self.power_changed {
            events.push(TriggerEvent::PowerChanged {
                power: self.state.measure_power.unwrap_or_default(),
                power_delta: self.power_delta,
            });
        }
        events
    }
}

fn delta(now: Option<f64>, last: Option<f64>) -> f64 {
    match (now, last) {
        (Some(now), Some(last)) => now - last,
        _ => 0.0,
    }
}

fn sum(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(a? + b?)
}

/// 新しい計測値と前回の状態から次の状態を作る
///
/// 計測値に無い項目は前回値を引き継ぐ。
/// イベントの判定は常に前回の状態と比べる。
/// `observed_off_peak`は外部から見えている料金状態で、Noneなら前回の状態を使う。
pub fn derive(
    reading: &ShortReading,
    prev: &MeterState,
    observed_off_peak: Option<bool>,
) -> Derived {
    // ガス
    let meter_gas = reading.gas.or(prev.meter_gas);
    let meter_gas_tm = reading.gtm.or(prev.meter_gas_tm);
    let mut measure_gas = prev.measure_gas;
    if let (Some(gas), Some(last_gas), Some(gtm), Some(last_gtm)) =
        (meter_gas, prev.meter_gas, meter_gas_tm, prev.meter_gas_tm)
    {
        if gtm != last_gtm {
            let hours = (gtm - last_gtm) as f64 / 3600.0;
            measure_gas = round_to((gas - last_gas) / hours, 3);
        }
    }

    // 電力
    let meter_power_off_peak = reading.p1.or(prev.meter_power_off_peak);
    let meter_power_peak = reading.p2.or(prev.meter_power_peak);
    let meter_power_off_peak_produced = reading.n1.or(prev.meter_power_off_peak_produced);
    let meter_power_peak_produced = reading.n2.or(prev.meter_power_peak_produced);
    let meter_power = reading.net.or(prev.meter_power);
    let meter_power_tm = reading.tm.or(prev.meter_power_tm);
    let mut measure_power = reading.pwr.or(prev.measure_power);

    // 料金帯は正味の電力量が動いたときだけ判定する
    let mut off_peak = prev.off_peak;
    if let (Some(net), Some(last_net)) = (meter_power, prev.meter_power) {
        if net != last_net {
            let imported_off_peak = delta(meter_power_off_peak, prev.meter_power_off_peak);
            let imported_peak = delta(meter_power_peak, prev.meter_power_peak);
            let exported_off_peak =
                delta(meter_power_off_peak_produced, prev.meter_power_off_peak_produced);
            let exported_peak = delta(meter_power_peak_produced, prev.meter_power_peak_produced);
            off_peak = Some(imported_off_peak > imported_peak || exported_off_peak > exported_peak);
        }
    }

    // 平均電力
    let (mut interval, mut interval_tm) = (prev.meter_power_interval, prev.meter_power_interval_tm);
    if interval_tm.is_none() {
        interval = meter_power;
        interval_tm = meter_power_tm;
    }
    let mut measure_power_avg = prev.measure_power_avg;
    if let (Some(net), Some(tm), Some(anchor), Some(anchor_tm)) =
        (meter_power, meter_power_tm, interval, interval_tm)
    {
        let elapsed = tm - anchor_tm;
        if elapsed >= AVERAGE_POWER_WINDOW {
            measure_power_avg = (3_600_000.0 * (net - anchor) / elapsed as f64).round();
            interval = Some(net);
            interval_tm = Some(tm);
        }
    }

    // 発電中に瞬時電力がゼロ付近しか出ない機器の補正
    if let (Some(net), Some(last_net), Some(pwr)) = (meter_power, prev.meter_power, measure_power)
    {
        let (low, high) = ZERO_PRODUCTION_BAND;
        if net <= last_net && low < pwr && pwr < high && measure_power_avg < 0.0 {
            measure_power = Some(measure_power_avg);
        }
    }

    let current_off_peak = observed_off_peak.or(prev.off_peak);
    let tariff_changed = prev.off_peak.is_some() && off_peak != current_off_peak;
    let power_changed = prev.meter_power_tm.is_some() && measure_power != prev.measure_power;
    let power_delta = delta(measure_power, prev.measure_power);

    let state = MeterState {
        measure_gas,
        meter_gas,
        meter_gas_tm,
        measure_power,
        measure_power_avg,
        meter_power,
        meter_power_imported: sum(meter_power_off_peak, meter_power_peak),
        meter_power_exported: sum(meter_power_off_peak_produced, meter_power_peak_produced),
        meter_power_peak,
        meter_power_off_peak,
        meter_power_peak_produced,
        meter_power_off_peak_produced,
        meter_power_tm,
        meter_power_interval: interval,
        meter_power_interval_tm: interval_tm,
        off_peak,
        phases: reading.phases.or(&prev.phases),
    };

    Derived {
        state,
        tariff_changed,
        power_changed,
        power_delta,
    }
}

#[cfg(test)]
fn reading(p1: f64, p2: f64, n1: f64, n2: f64, pwr: f64, tm: i64) -> ShortReading {
    ShortReading {
        pwr: Some(pwr),
        net: Some(round_to(p1 + p2 - n1 - n2, 4)),
        p1: Some(p1),
        p2: Some(p2),
        n1: Some(n1),
        n2: Some(n2),
        tm: Some(tm),
        ..Default::default()
    }
}

#[test]
fn test_first_sample() {
    let first = derive(&reading(100.0, 50.0, 0.0, 0.0, 500.0, 1000), &MeterState::default(), None);
    assert!(!first.tariff_changed);
    assert!(!first.power_changed);
    assert!(first.events().is_empty());
    assert_eq!(first.state.meter_power, Some(150.0));
    assert_eq!(first.state.meter_power_imported, Some(150.0));
    assert_eq!(first.state.meter_power_exported, Some(0.0));
    assert_eq!(first.state.meter_power_interval, Some(150.0));
    assert_eq!(first.state.meter_power_interval_tm, Some(1000));
    assert_eq!(first.state.off_peak, None);
    assert_eq!(first.state.measure_power_avg, 0.0);
    assert_eq!(first.state.measure_gas, 0.0);
}

#[test]
fn test_unchanged_net() {
    let first = derive(&reading(100.0, 50.0, 0.0, 0.0, 500.0, 1000), &MeterState::default(), None);
    let second = derive(&reading(100.0, 50.0, 0.0, 0.0, 500.0, 1100), &first.state, None);
    assert!(!second.power_changed);
    assert!(!second.tariff_changed);
    assert_eq!(second.state.off_peak, first.state.off_peak);
    assert_eq!(second.state.meter_power_tm, Some(1100));
}

#[test]
fn test_off_peak_flag() {
    let first = derive(&reading(100.0, 50.0, 0.0, 0.0, 500.0, 1000), &MeterState::default(), None);
    // 夜間の買電が進んだ
    let second = derive(&reading(100.5, 50.0, 0.0, 0.0, 500.0, 1100), &first.state, None);
    assert_eq!(second.state.off_peak, Some(true));
    // 初めての判定はイベントにしない
    assert!(!second.tariff_changed);

    // 昼間の買電が進んだ
    let third = derive(&reading(100.5, 50.5, 0.0, 0.0, 500.0, 1200), &second.state, None);
    assert_eq!(third.state.off_peak, Some(false));
    assert!(third.tariff_changed);
    assert_eq!(
        third.events(),
        vec![TriggerEvent::TariffChanged { tariff: false }]
    );

    // 外から見えている状態がすでに昼間料金なら発火しない
    let observed = derive(&reading(100.5, 50.5, 0.0, 0.0, 500.0, 1200), &second.state, Some(false));
    assert!(!observed.tariff_changed);
}

#[test]
fn test_off_peak_by_production() {
    let first = derive(&reading(100.0, 50.0, 10.0, 20.0, -300.0, 1000), &MeterState::default(), None);
    let second = derive(&reading(100.0, 50.0, 10.4, 20.0, -300.0, 1100), &first.state, None);
    assert_eq!(second.state.off_peak, Some(true));
}

#[test]
fn test_power_changed() {
    let first = derive(&reading(100.0, 50.0, 0.0, 0.0, 500.0, 1000), &MeterState::default(), None);
    let second = derive(&reading(100.0, 50.01, 0.0, 0.0, 501.0, 1010), &first.state, None);
    assert!(second.power_changed);
    assert_eq!(second.power_delta, 1.0);
    assert_eq!(
        second.events(),
        vec![TriggerEvent::PowerChanged {
            power: 501.0,
            power_delta: 1.0
        }]
    );
    assert_eq!(
        second.events()[0].tokens(),
        json!({ "power": 501.0, "power_delta": 1.0 })
    );
    assert_eq!(second.events()[0].name(), "power_changed");
}

#[test]
fn test_rolling_average() {
    let first = derive(&reading(100.0, 50.0, 0.0, 0.0, 500.0, 1000), &MeterState::default(), None);
    // 60秒未満では更新しない
    let early = derive(&reading(100.0, 50.01, 0.0, 0.0, 600.0, 1030), &first.state, None);
    assert_eq!(early.state.measure_power_avg, 0.0);
    assert_eq!(early.state.meter_power_interval_tm, Some(1000));
    let again = derive(&reading(100.0, 50.01, 0.0, 0.0, 600.0, 1030), &early.state, None);
    assert_eq!(again.state.measure_power_avg, early.state.measure_power_avg);

    // 0.02kWh / 72秒 = 1000W
    let updated = derive(&reading(100.0, 50.02, 0.0, 0.0, 600.0, 1072), &again.state, None);
    assert_eq!(updated.state.measure_power_avg, 1000.0);
    assert_eq!(updated.state.meter_power_interval, Some(150.02));
    assert_eq!(updated.state.meter_power_interval_tm, Some(1072));
}

#[test]
fn test_zero_production_correction() {
    let first = derive(&reading(100.0, 50.0, 0.0, 0.0, 0.0, 1000), &MeterState::default(), None);
    // 60秒で0.01kWh売電 = -600W
    let second = derive(&reading(100.0, 50.0, 0.01, 0.0, 0.0, 1060), &first.state, None);
    assert_eq!(second.state.measure_power_avg, -600.0);
    assert_eq!(second.state.measure_power, Some(-600.0));
    assert!(second.power_changed);
    assert_eq!(second.power_delta, -600.0);
}

#[test]
fn test_gas_rate() {
    let gas = |gas: f64, gtm: i64| ShortReading {
        gas: Some(gas),
        gtm: Some(gtm),
        ..Default::default()
    };
    let first = derive(&gas(100.0, 3600), &MeterState::default(), None);
    assert_eq!(first.state.measure_gas, 0.0);
    // 同じ時刻なら流量は変わらない
    let same = derive(&gas(100.0, 3600), &first.state, None);
    assert_eq!(same.state.measure_gas, 0.0);
    // 30分で0.25m3
    let second = derive(&gas(100.25, 5400), &same.state, None);
    assert_eq!(second.state.measure_gas, 0.5);
    let carried = derive(&gas(100.25, 5400), &second.state, None);
    assert_eq!(carried.state.measure_gas, 0.5);
    // 1時間で1/3 m3
    let third = derive(&gas(100.25 + 1.0 / 3.0, 9000), &carried.state, None);
    assert_eq!(third.state.measure_gas, 0.333);
}

#[test]
fn test_missing_fields_keep_previous() {
    let first = derive(&reading(100.0, 50.0, 0.0, 0.0, 0.0, 1000), &MeterState::default(), None);
    let second = derive(&ShortReading::default(), &first.state, None);
    assert_eq!(second.state.meter_power, Some(150.0));
    assert_eq!(second.state.measure_power, Some(0.0));
    assert_eq!(second.state.meter_power_tm, Some(1000));
    assert!(!second.power_changed);
}
