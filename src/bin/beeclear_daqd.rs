// Beeclear P1 から計測値を収集し続ける。
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use beeclearp1::connection_settings::{DeviceSettings, SettingsError};
use beeclearp1::meter::{Capability, CapabilityValue, MeterState, TriggerEvent};
use beeclearp1::polling::{DeviceHost, Monitor, PowerIndicator, TriggerDispatch};
use beeclearp1::session::{Session, SessionError};
use clap::Parser;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    fmt::{self, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Debug, Error)]
pub enum DaqDaemonError {
    #[error(r#"settings "{0}""#)]
    Settings(#[from] SettingsError),

    #[error(r#"session "{0}""#)]
    Session(#[from] SessionError),

    #[error(r#"i/o "{0}""#)]
    Io(#[from] io::Error),

    #[error(r#"monitor task "{0}""#)]
    Join(#[from] JoinError),

    #[error("{0}")]
    Other(&'static str),
}

/// Beeclear P1 の計測値を収集する。
#[derive(Parser, Debug)]
#[command(name = "beeclear_daqd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// 設定ファイル名
    #[arg(short = 'S', long, env = "BEECLEAR_CONFIG", default_value = "beeclear.toml")]
    config_file: PathBuf,
}

/// 設定ファイルを持つホスト
/// 状態はログに出す
struct FileHost {
    path: PathBuf,
    last: Mutex<DeviceSettings>,
    available: AtomicBool,
}

impl FileHost {
    fn new(path: &Path) -> result::Result<Self, SettingsError> {
        let settings = DeviceSettings::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            last: Mutex::new(settings),
            available: AtomicBool::new(false),
        })
    }
}

impl DeviceHost for FileHost {
    fn settings(&self) -> DeviceSettings {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match DeviceSettings::load(&self.path) {
            Ok(settings) => *last = settings,
            // 読めなければ前回の設定を使う
            Err(e) => tracing::error!(r#"settings file "{}" {}"#, self.path.display(), e),
        }
        last.clone()
    }

    fn set_available(&self) {
        if !self.available.swap(true, Ordering::Relaxed) {
            tracing::info!("device available");
        }
    }

    fn set_unavailable(&self, reason: &str) {
        self.available.store(false, Ordering::Relaxed);
        tracing::warn!("device unavailable: {}", reason);
    }

    fn set_capability_value(&self, capability: Capability, value: CapabilityValue) {
        tracing::debug!("{} = {}", capability, value);
    }
}

/// イベントをログに出す
struct LogTriggers;

impl TriggerDispatch for LogTriggers {
    fn trigger(&self, device: &str, event: &TriggerEvent, state: &MeterState) {
        tracing::info!(
            "{} {} {} (meter_power {:?} kWh)",
            device,
            event.name(),
            event.tokens(),
            state.meter_power
        );
    }
}

/// 電力を上限値に対する割合でログに出す
struct LogIndicator;

impl PowerIndicator for LogIndicator {
    fn change(&self, settings: &DeviceSettings, power: f64) {
        let (limit, direction) = if power >= 0.0 {
            (settings.ledring_usage_limit, "usage")
        } else {
            (settings.ledring_production_limit, "production")
        };
        if limit == 0 {
            return;
        }
        let ratio = (power.abs() / limit as f64).min(1.0);
        tracing::trace!("{} {:.0}% of {} W", direction, ratio * 100.0, limit);
    }
}

/// 計測値の収集を続ける
/// Ctrl-Cで終わる。SIGHUPで設定を読み直す。
async fn exec_monitoring(config_file: &Path) -> result::Result<(), DaqDaemonError> {
    let host = FileHost::new(config_file)?;
    let settings = host.settings();
    tracing::info!(
        r#"monitoring "{}" at {}"#,
        settings.name,
        settings.session_config().base_url()
    );
    let session = Session::new(settings.session_config())?;

    let cancel = CancellationToken::new();
    let handle = Monitor::new(session, host, LogTriggers, LogIndicator).spawn(cancel.clone());

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            v = tokio::signal::ctrl_c() => {
                v?;
                tracing::info!("shutdown requested");
                handle.shutdown().await?;
                return Ok(());
            }
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, reloading settings");
                if !handle.reconfigure().await {
                    return Err(DaqDaemonError::Other("monitor is not running"));
                }
            }
        }
    }
}

/// password= 以降をマスクするフォーマッタ
struct MaskingPasswordFormatter;

static PASSWORD_QUERY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"password=[^&\s"]*"#).expect("valid regex"));

impl<S, N> FormatEvent<S, N> for MaskingPasswordFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        // まず標準フォーマットをバッファに書き出す
        let mut buf = String::new();
        {
            let temp_writer = fmt::format::Writer::new(&mut buf);
            fmt::format::Format::default().format_event(ctx, temp_writer, event)?;
        }
        // マスク処理
        let masked = PASSWORD_QUERY.replace_all(&buf, "password=########");
        writer.write_str(&masked)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    // プログラムの情報
    let git_head_ref = built_info::GIT_HEAD_REF.unwrap_or_default();
    let app_info = format!(
        "{} / {}{}",
        built_info::PKG_NAME,
        built_info::PKG_VERSION,
        built_info::GIT_COMMIT_HASH_SHORT
            .map(|s| format!(" ({s} - {git_head_ref})"))
            .unwrap_or_default()
    );

    // tracingの設定
    let registry = tracing_subscriber::registry();

    // systemd-journaldに接続
    match tracing_journald::layer() {
        // journaldにログ出力する
        Ok(journald_layer) => registry.with(journald_layer).init(),
        // journaldが使えないので、標準出力にログ出力する
        Err(e) => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_timer(tracing_subscriber::fmt::time::LocalTime::rfc_3339())
                        .with_file(false)
                        .with_line_number(false)
                        .with_thread_names(false)
                        .with_thread_ids(false)
                        .with_ansi(false)
                        .event_format(MaskingPasswordFormatter),
                )
                .with(tracing_subscriber::EnvFilter::from_default_env())
                .init();
            tracing::error!("couldn't connect to journald: {}", e)
        }
    }

    let cli = Cli::parse();

    // サービスを開始する
    tracing::info!("{app_info} started.");
    let reason = loop {
        break match exec_monitoring(&cli.config_file).await {
            Ok(()) => {
                tracing::info!("{app_info} stopped.");
                return ExitCode::SUCCESS;
            }
            Err(e @ DaqDaemonError::Settings(_)) => e.to_string(),
            Err(e @ DaqDaemonError::Session(_)) => e.to_string(),
            Err(e @ DaqDaemonError::Io(_)) => e.to_string(),
            Err(e @ DaqDaemonError::Join(_)) | Err(e @ DaqDaemonError::Other(_)) => {
                tracing::error!("{e}, restarting");
                tokio::time::sleep(Duration::from_secs(5)).await; // 再始動まで少々クールダウン時間をもつ
                continue; // 再始動
            }
        };
    };

    // ここに到達するのは異常終了しかありえない
    tracing::error!("{app_info} aborted, reason: {reason}");
    ExitCode::FAILURE
}

#[test]
fn test_password_masking() {
    let line = r#"GET http://10.0.0.22:80/bc_login?username=YmVlY2xlYXI%3D&password=ZW5lcmdpZQ%3D%3D"#;
    assert_eq!(
        PASSWORD_QUERY.replace_all(line, "password=########"),
        "GET http://10.0.0.22:80/bc_login?username=YmVlY2xlYXI%3D&password=########"
    );
}
