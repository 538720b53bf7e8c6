// 計測値の妥当性検査
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::meter::{MeterState, ShortReading};
use thiserror::Error;

/// 1回の間隔でのガス使用量上限 m3 (G25メーター)
pub const MAX_GAS_PER_INTERVAL: f64 = 40.0;
/// ガスと電力の時刻差の上限 秒
pub const MAX_TIMESTAMP_SKEW: i64 = 45000;
/// 瞬時電力の上限 W (3 x 80A)
pub const MAX_POWER: f64 = 56000.0;
/// 積算電力量の不一致許容値 kWh
pub const COUNTER_TOLERANCE: f64 = 0.1;
/// 平均電力の上限 kW
pub const MAX_AVERAGE_POWER: f64 = 56.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Rejection {
    #[error(r#"negative gas usage "{0}""#)]
    NegativeGasUsage(f64),

    #[error(r#"excessive gas usage "{0}""#)]
    ExcessiveGasUsage(f64),

    #[error(r#"power timestamp moved backward "{now} < {last}""#)]
    PowerTimeReversed { now: i64, last: i64 },

    #[error(r#"gas timestamp moved backward "{now} < {last}""#)]
    GasTimeReversed { now: i64, last: i64 },

    #[error(r#"gas and power timestamps differ "{0}""#)]
    TimestampSkew(i64),

    #[error(r#"excessive power "{0}""#)]
    ExcessivePower(f64),

    #[error(r#"meter counters do not add up "{0}""#)]
    CounterMismatch(f64),

    #[error(r#"excessive average power "{0}""#)]
    ExcessiveAveragePower(f64),
}

/// 前回の状態と比べて物理的にありえない計測値を弾く
pub fn validate(reading: &ShortReading, last: &MeterState) -> Result<(), Rejection> {
    // 初回は無条件で受け入れる
    if last.is_fresh() {
        return Ok(());
    }

    if let (Some(gas), Some(last_gas)) = (reading.gas, last.meter_gas) {
        let usage = gas - last_gas;
        if usage < 0.0 {
            return Err(Rejection::NegativeGasUsage(usage));
        }
        if usage > MAX_GAS_PER_INTERVAL {
            return Err(Rejection::ExcessiveGasUsage(usage));
        }
    }

    if let (Some(now), Some(last)) = (reading.tm, last.meter_power_tm) {
        if now < last {
            return Err(Rejection::PowerTimeReversed { now, last });
        }
    }
    if let (Some(now), Some(last)) = (reading.gtm, last.meter_gas_tm) {
        if now < last {
            return Err(Rejection::GasTimeReversed { now, last });
        }
    }

    if let (Some(gtm), Some(tm)) = (reading.gtm, reading.tm) {
        let skew = (gtm - tm).abs();
        if skew > MAX_TIMESTAMP_SKEW {
            return Err(Rejection::TimestampSkew(skew));
        }
    }

    if let Some(pwr) = reading.pwr {
        if pwr.abs() > MAX_POWER {
            return Err(Rejection::ExcessivePower(pwr));
        }
    }

    if let (Some(net), Some(p1), Some(p2), Some(n1), Some(n2)) =
        (reading.net, reading.p1, reading.p2, reading.n1, reading.n2)
    {
        let diff = (net - ((p1 + p2) - (n1 + n2))).abs();
        if diff > COUNTER_TOLERANCE {
            return Err(Rejection::CounterMismatch(diff));
        }
    }

    if let (Some(net), Some(tm), Some(last_net), Some(last_tm)) =
        (reading.net, reading.tm, last.meter_power, last.meter_power_tm)
    {
        let delta = (net - last_net).abs();
        let elapsed = tm - last_tm;
        if elapsed > 0 {
            let average_kw = 3600.0 * delta / elapsed as f64;
            if average_kw > MAX_AVERAGE_POWER {
                return Err(Rejection::ExcessiveAveragePower(average_kw));
            }
        } else if delta > 0.0 {
            // 時間が進まずに電力量だけ変わった
            return Err(Rejection::ExcessiveAveragePower(f64::INFINITY));
        }
    }

    Ok(())
}

pub fn is_valid(reading: &ShortReading, last: &MeterState) -> bool {
    validate(reading, last).is_ok()
}

#[cfg(test)]
fn accepted_state() -> MeterState {
    MeterState {
        meter_gas: Some(100.0),
        meter_gas_tm: Some(1000),
        measure_power: Some(500.0),
        meter_power: Some(150.0),
        meter_power_off_peak: Some(100.0),
        meter_power_peak: Some(50.0),
        meter_power_off_peak_produced: Some(0.0),
        meter_power_peak_produced: Some(0.0),
        meter_power_tm: Some(1000),
        meter_power_interval: Some(150.0),
        meter_power_interval_tm: Some(1000),
        ..Default::default()
    }
}

#[cfg(test)]
fn next_reading() -> ShortReading {
    ShortReading {
        pwr: Some(500.0),
        net: Some(150.01),
        p1: Some(100.01),
        p2: Some(50.0),
        n1: Some(0.0),
        n2: Some(0.0),
        tm: Some(1100),
        gas: Some(100.2),
        gtm: Some(1100),
        ..Default::default()
    }
}

#[test]
fn test_first_sample_accepted() {
    let fresh = MeterState::default();
    let nonsense = ShortReading {
        pwr: Some(999999.0),
        net: Some(1.0),
        p1: Some(500.0),
        p2: Some(500.0),
        n1: Some(0.0),
        n2: Some(0.0),
        tm: Some(10),
        gas: Some(-3.0),
        gtm: Some(900000),
        ..Default::default()
    };
    assert_eq!(validate(&nonsense, &fresh), Ok(()));
    assert!(is_valid(&ShortReading::default(), &fresh));
}

#[test]
fn test_valid_reading() {
    assert_eq!(validate(&next_reading(), &accepted_state()), Ok(()));
}

#[test]
fn test_counter_reconciliation() {
    let last = accepted_state();
    // 許容範囲内
    let mut reading = next_reading();
    reading.net = Some(150.09);
    assert!(is_valid(&reading, &last));

    let perturbations: [fn(&mut ShortReading); 4] = [
        |r| r.p1 = r.p1.map(|v| v + 0.2),
        |r| r.p2 = r.p2.map(|v| v - 0.2),
        |r| r.n1 = r.n1.map(|v| v + 0.2),
        |r| r.n2 = r.n2.map(|v| v + 0.2),
    ];
    for perturb in perturbations {
        let mut reading = next_reading();
        perturb(&mut reading);
        assert!(matches!(
            validate(&reading, &last),
            Err(Rejection::CounterMismatch(_))
        ));
    }
}

#[test]
fn test_negative_gas_usage() {
    let mut reading = next_reading();
    reading.gas = Some(90.0);
    let result = validate(&reading, &accepted_state());
    assert_eq!(result, Err(Rejection::NegativeGasUsage(-10.0)));
    assert_eq!(
        result.unwrap_err().to_string(),
        r#"negative gas usage "-10""#
    );
}

#[test]
fn test_excessive_gas_usage() {
    let mut reading = next_reading();
    reading.gas = Some(140.5);
    assert!(matches!(
        validate(&reading, &accepted_state()),
        Err(Rejection::ExcessiveGasUsage(_))
    ));
}

#[test]
fn test_timestamps_reversed() {
    let mut reading = next_reading();
    reading.tm = Some(999);
    assert_eq!(
        validate(&reading, &accepted_state()),
        Err(Rejection::PowerTimeReversed {
            now: 999,
            last: 1000
        })
    );

    let mut reading = next_reading();
    reading.gtm = Some(900);
    assert_eq!(
        validate(&reading, &accepted_state()),
        Err(Rejection::GasTimeReversed {
            now: 900,
            last: 1000
        })
    );
}

#[test]
fn test_timestamp_skew() {
    let mut reading = next_reading();
    reading.gtm = Some(1100 + 45001);
    assert_eq!(
        validate(&reading, &accepted_state()),
        Err(Rejection::TimestampSkew(45001))
    );
    // ガスの時刻がなければ検査しない
    reading.gtm = None;
    reading.gas = None;
    assert!(is_valid(&reading, &accepted_state()));
}

#[test]
fn test_excessive_power() {
    let mut reading = next_reading();
    reading.pwr = Some(-56001.0);
    assert_eq!(
        validate(&reading, &accepted_state()),
        Err(Rejection::ExcessivePower(-56001.0))
    );
}

#[test]
fn test_excessive_average_power() {
    let last = accepted_state();
    // 100秒で2kWh = 72kW
    let mut reading = next_reading();
    reading.net = Some(152.0);
    reading.p2 = Some(51.99);
    assert!(matches!(
        validate(&reading, &last),
        Err(Rejection::ExcessiveAveragePower(_))
    ));

    // 同じ時刻で電力量が変わった
    let mut reading = next_reading();
    reading.tm = Some(1000);
    assert!(matches!(
        validate(&reading, &last),
        Err(Rejection::ExcessiveAveragePower(_))
    ));
}

#[test]
fn test_unchanged_net() {
    let reading = ShortReading {
        pwr: Some(500.0),
        net: Some(150.0),
        p1: Some(100.0),
        p2: Some(50.0),
        n1: Some(0.0),
        n2: Some(0.0),
        tm: Some(1100),
        gas: Some(100.0),
        gtm: Some(1000),
        ..Default::default()
    };
    assert!(is_valid(&reading, &accepted_state()));
}
