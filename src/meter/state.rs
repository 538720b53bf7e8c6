// 計測状態
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::meter::Phases;
use serde::{Deserialize, Serialize};

/// 最後に受け入れた計測値から作った状態
/// 受け入れるたびに丸ごと置き換える
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
pub struct MeterState {
    /// ガス流量 m3/h
    pub measure_gas: f64,
    /// ガス積算 m3
    pub meter_gas: Option<f64>,
    pub meter_gas_tm: Option<i64>,
    /// 瞬時電力 W
    pub measure_power: Option<f64>,
    /// 平均電力 W
    pub measure_power_avg: f64,
    /// 正味の積算電力量 kWh
    pub meter_power: Option<f64>,
    pub meter_power_imported: Option<f64>,
    pub meter_power_exported: Option<f64>,
    pub meter_power_peak: Option<f64>,
    pub meter_power_off_peak: Option<f64>,
    pub meter_power_peak_produced: Option<f64>,
    pub meter_power_off_peak_produced: Option<f64>,
    pub meter_power_tm: Option<i64>,
    /// 平均電力の起点
    pub meter_power_interval: Option<f64>,
    pub meter_power_interval_tm: Option<i64>,
    /// 夜間料金中
    pub off_peak: Option<bool>,
    pub phases: Phases,
}

impl MeterState {
    /// まだ一度も受け入れていない
    pub fn is_fresh(&self) -> bool {
        self.meter_power_interval_tm.is_none()
    }
}
