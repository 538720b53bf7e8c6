// Beeclear 接続設定
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// 未設定時のホスト名(このときは探索する)
pub const DEFAULT_HOST: &str = "beeclear.local";
pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_TLS_PORT: u16 = 443;
pub const DEFAULT_USERNAME: &str = "beeclear";
pub const DEFAULT_PASSWORD: &str = "energie";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(4000);

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(r#"i/o "{0}""#)]
    Io(#[from] io::Error),

    #[error(r#"toml "{0}""#)]
    Toml(#[from] toml::de::Error),
}

/// セッション設定
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            use_tls: false,
            username: DEFAULT_USERNAME.to_owned(),
            password: DEFAULT_PASSWORD.to_owned(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// ログイン時に上書きする設定
/// 空の項目は無視される
#[derive(Clone, Default, Debug)]
pub struct SessionOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub use_tls: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Option<Duration>,
}

impl SessionConfig {
    /// 空ではない項目だけを上書きする
    pub fn merge(&mut self, options: &SessionOptions) {
        let non_empty = |s: &Option<String>| s.as_ref().filter(|s| !s.is_empty()).cloned();
        if let Some(host) = non_empty(&options.host) {
            self.host = host;
        }
        if let Some(port) = options.port.filter(|&port| port != 0) {
            self.port = port;
        }
        // TLSは有効化のみ
        if options.use_tls == Some(true) {
            self.use_tls = true;
        }
        if let Some(username) = non_empty(&options.username) {
            self.username = username;
        }
        if let Some(password) = non_empty(&options.password) {
            self.password = password;
        }
        if let Some(timeout) = options.timeout.filter(|t| !t.is_zero()) {
            self.timeout = timeout;
        }
    }

    /// ホスト名が未設定(プレースホルダ)か
    pub fn is_placeholder_host(&self) -> bool {
        self.host.is_empty() || self.host == DEFAULT_HOST
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// デバイス設定(設定ファイル)
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceSettings {
    pub name: String,
    pub mac: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(rename = "useTLS")]
    pub use_tls: bool,
    /// ポーリング間隔(秒)
    pub polling_interval: u64,
    /// 異常値を捨てる
    pub filter_readings: bool,
    pub ledring_usage_limit: u32,
    pub ledring_production_limit: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: "Beeclear".to_owned(),
            mac: String::new(),
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            username: DEFAULT_USERNAME.to_owned(),
            password: DEFAULT_PASSWORD.to_owned(),
            use_tls: false,
            polling_interval: 10,
            filter_readings: true,
            ledring_usage_limit: 3000,
            ledring_production_limit: 3000,
        }
    }
}

impl DeviceSettings {
    /// 設定ファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let file = fs::read_to_string(path)?;
        Ok(toml::from_str::<DeviceSettings>(&file)?)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval.max(1))
    }

    /// セッション設定に変換する
    /// ポート番号未指定ならTLSの有無で決める。443番ならTLSを使う。
    pub fn session_config(&self) -> SessionConfig {
        let port = match self.port {
            0 if self.use_tls => DEFAULT_TLS_PORT,
            0 => DEFAULT_PORT,
            port => port,
        };
        let defaults = SessionConfig::default();
        let or_default = |s: &str, default: String| {
            if s.is_empty() { default } else { s.to_owned() }
        };
        SessionConfig {
            host: or_default(&self.host, defaults.host),
            port,
            use_tls: self.use_tls || port == DEFAULT_TLS_PORT,
            username: or_default(&self.username, defaults.username),
            password: or_default(&self.password, defaults.password),
            timeout: defaults.timeout,
        }
    }
}

#[test]
fn test_merge() {
    let mut config = SessionConfig::default();
    config.merge(&SessionOptions {
        host: Some("10.0.0.22".to_owned()),
        port: Some(0),
        use_tls: Some(false),
        username: Some(String::new()),
        password: Some("hcfrasde".to_owned()),
        timeout: None,
    });
    assert_eq!(
        config,
        SessionConfig {
            host: "10.0.0.22".to_owned(),
            port: 80,
            use_tls: false,
            username: "beeclear".to_owned(),
            password: "hcfrasde".to_owned(),
            timeout: Duration::from_millis(4000),
        }
    );
    assert!(!config.is_placeholder_host());
    assert_eq!(config.base_url(), "http://10.0.0.22:80");
}

#[test]
fn test_device_settings() {
    let toml = r#"
name = "meterkast"
host = "10.0.0.22"
port = 0
useTLS = true
pollingInterval = 5
filterReadings = false
"#;
    let settings = toml::from_str::<DeviceSettings>(toml).unwrap();
    assert_eq!(settings.name, "meterkast");
    assert_eq!(settings.polling_interval(), Duration::from_secs(5));
    assert!(!settings.filter_readings);
    assert_eq!(settings.ledring_usage_limit, 3000);

    let config = settings.session_config();
    assert_eq!(config.port, 443);
    assert!(config.use_tls);
    assert_eq!(config.username, "beeclear");
    assert_eq!(config.base_url(), "https://10.0.0.22:443");
}

#[test]
fn test_device_settings_defaults() {
    let settings = toml::from_str::<DeviceSettings>("").unwrap();
    assert_eq!(settings, DeviceSettings::default());
    let config = settings.session_config();
    assert!(config.is_placeholder_host());
    assert!(!config.use_tls);
}
