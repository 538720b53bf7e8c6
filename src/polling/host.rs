// 監視ループの外部との接点
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::connection_settings::{DeviceSettings, SessionConfig};
use crate::meter::{Capability, CapabilityValue, MeterState, ShortReading, TriggerEvent};
use crate::session::{Session, SessionError};
use std::future::Future;

/// デバイスを管理する側
pub trait DeviceHost: Send + Sync + 'static {
    /// 現在のデバイス設定
    fn settings(&self) -> DeviceSettings;

    fn set_available(&self);

    fn set_unavailable(&self, reason: &str);

    fn set_capability_value(&self, capability: Capability, value: CapabilityValue);

    /// 外から見えている料金帯(夜間ならtrue)
    fn observed_off_peak(&self) -> Option<bool> {
        None
    }
}

/// イベントの通知先
/// 呼び出し側を止めないこと
pub trait TriggerDispatch: Send + Sync + 'static {
    fn trigger(&self, device: &str, event: &TriggerEvent, state: &MeterState);
}

/// 電力表示器
pub trait PowerIndicator: Send + Sync + 'static {
    fn change(&self, settings: &DeviceSettings, power: f64);
}

/// 計測値の取得元
pub trait MeterSource: Send + Sync + 'static {
    /// 設定を入れ替えて認証状態を捨てる
    fn restart_session(&self, config: SessionConfig) -> impl Future<Output = ()> + Send;

    /// 短縮形の計測値を読む
    fn read_meter(&self) -> impl Future<Output = Result<ShortReading, SessionError>> + Send;
}

impl MeterSource for Session {
    async fn restart_session(&self, config: SessionConfig) {
        self.reconfigure(config).await
    }

    async fn read_meter(&self) -> Result<ShortReading, SessionError> {
        if !self.logged_in().await {
            self.login(None).await?;
        }
        self.meter_readings().await
    }
}
