// Beeclear P1 に接続してみる。
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use anyhow::Context;
use beeclearp1::connection_settings::{DeviceSettings, SessionConfig, SessionOptions};
use beeclearp1::meter::{Capability, ShortReading};
use beeclearp1::session::Session;
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Beeclear P1 から情報を取得する。
#[derive(Parser, Debug)]
#[command(name = "dryrun")]
#[command(version, about, long_about = None)]
struct Cli {
    /// 設定ファイル名(省略時は既定値)
    #[arg(short = 'S', long, env = "BEECLEAR_CONFIG")]
    config_file: Option<PathBuf>,

    /// ホスト名またはIPアドレス
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// ポート番号
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// HTTPSで接続する
    #[arg(long)]
    tls: bool,

    #[arg(short = 'u', long)]
    username: Option<String>,

    #[arg(short = 'p', long)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// ローカルネットワーク上の Beeclear を探す
    Discover,
    /// 計測値を得る
    Readings {
        /// 機器が返す値をそのまま表示する
        #[arg(long)]
        full: bool,
    },
    /// ネットワーク, ソフトウェア, SDカードの情報を得る
    Info,
    /// 再起動する
    Reboot,
}

/// 設定ファイルとコマンドライン引数からセッション設定を作る
fn session_config(cli: &Cli) -> anyhow::Result<SessionConfig> {
    let mut config = match &cli.config_file {
        Some(path) => DeviceSettings::load(path)
            .with_context(|| format!(r#"setting file "{}" read error."#, path.display()))?
            .session_config(),
        None => SessionConfig::default(),
    };
    config.merge(&SessionOptions {
        host: cli.host.clone(),
        port: cli.port,
        use_tls: Some(cli.tls),
        username: cli.username.clone(),
        password: cli.password.clone(),
        timeout: None,
    });
    Ok(config)
}

fn unix_time(tm: Option<i64>) -> String {
    tm.and_then(|t| DateTime::from_timestamp(t, 0))
        .map(|t| t.with_timezone(&Local).to_rfc3339())
        .unwrap_or_else(|| "-".to_owned())
}

fn show_reading(reading: &ShortReading) {
    let v = |x: Option<f64>| x.map(|x| x.to_string()).unwrap_or_else(|| "-".to_owned());
    println!("time           : {}", unix_time(reading.tm));
    println!("power          : {} W", v(reading.pwr));
    println!("meter (net)    : {} kWh", v(reading.net));
    println!("import offpeak : {} kWh", v(reading.p1));
    println!("import peak    : {} kWh", v(reading.p2));
    println!("export offpeak : {} kWh", v(reading.n1));
    println!("export peak    : {} kWh", v(reading.n2));
    println!("gas time       : {}", unix_time(reading.gtm));
    println!("gas            : {} m3", v(reading.gas));
    for (i, power) in reading.phases.power.iter().enumerate() {
        if let Some(power) = power {
            println!("L{}             : {} W", i + 1, power);
        }
    }
}

async fn exec_readings(session: &Session, full: bool) -> anyhow::Result<()> {
    session.login(None).await.context("login failed")?;
    if full {
        let raw = session.raw_meter_readings().await?;
        println!("{}", serde_json::to_string_pretty(&raw)?);
    } else {
        let reading = session.meter_readings().await?;
        show_reading(&reading);
    }
    session.logout().await?;
    Ok(())
}

async fn exec_info(session: &Session) -> anyhow::Result<()> {
    session.login(None).await.context("login failed")?;

    let network = session.network().await.context("network")?;
    println!("mac       : {}", network.mac().unwrap_or("-"));
    if let Some(eth) = &network.eth.status_ethernet {
        println!("ethernet  : {} ({})", eth.ip, eth.link);
    }
    if let Some(ssid) = &network.wifi.ssid {
        println!("wifi ssid : {}", ssid);
    }

    let version = session.software_version().await.context("software version")?;
    println!("name      : {}", version.name);
    println!("firmware  : {}", version.firmware);
    println!("hardware  : {}", version.hardware);
    println!("uptime    : {} s", version.uptime);
    let capabilities = Capability::for_device(&version.setting)
        .iter()
        .map(Capability::as_str)
        .collect::<Vec<_>>();
    println!("capability: {}", capabilities.join(", "));

    let status = session.status().await.context("status")?;
    println!("P1        : {}", if status.p1 != 0 { "connected" } else { "not connected" });
    println!("SD card   : {} free of {}", status.sdcard_free, status.sdcard_total);

    let firmware = session.firmware_list().await.context("firmware list")?;
    println!("current   : {}", firmware.current);
    for file in firmware.firmware.iter() {
        println!("available : {} {}", file.version, file.file);
    }

    session.logout().await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    // デバッグレベルは RUST_LOG 環境変数で設定できる
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    let cli = Cli::parse();
    let session = Session::new(session_config(&cli)?)?;

    match &cli.command {
        Commands::Discover => {
            let host = session.discover().await;
            println!("{}", host);
            Ok(())
        }
        Commands::Readings { full } => exec_readings(&session, *full).await,
        Commands::Info => exec_info(&session).await,
        Commands::Reboot => {
            session.login(None).await.context("login failed")?;
            session.reboot().await?;
            println!("Good Bye!");
            Ok(())
        }
    }
}
