//! SPP セッション Linux版 CLI
//!
//! ペアリング済みデバイスへ接続し、受信データを標準出力へ、標準入力の各行をデバイスへ送る

use anyhow::Context;
use clap::Parser;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spp_core::config::LoggingConfig;
use spp_core::{
    BluetoothPlatform, DeviceRegistry, EnableOutcome, RadioController, RadioState, SerialSession,
    ServiceIdentifier, SessionConnector, Settings, SppError, VERSION,
};

mod bluetooth_impl;
mod platform;

use bluetooth_impl::BluezPlatform;
use platform::{LinuxPlatform, ShutdownReceiver};

/// ペアリング済みデバイスとの SPP セッション
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 接続先デバイスの表示名
    #[arg(short, long)]
    name: Option<String>,

    /// 接続先デバイスのアドレス（名前より優先）
    #[arg(short, long)]
    address: Option<String>,

    /// サービスUUID（"1101" のような短縮形も可）
    #[arg(short, long)]
    uuid: Option<String>,

    /// 接続タイムアウト（秒）
    #[arg(short, long)]
    timeout: Option<u64>,

    /// ペアリング済みデバイスを一覧表示して終了
    #[arg(short, long)]
    list: bool,

    /// 無線が無効でも有効化を要求しない
    #[arg(long)]
    no_enable: bool,

    /// 受信データを16進で表示
    #[arg(long)]
    hex: bool,

    /// 設定ファイル（json / toml / yaml）
    #[arg(short, long)]
    config: Option<String>,

    /// ログレベル設定 (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// 詳細ログ出力（bluer のログも表示）
    #[arg(short, long)]
    verbose: bool,

    /// 静かなモード（エラーのみ表示）
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// コマンドライン引数で設定を上書き
    fn apply_to(&self, settings: &mut Settings) {
        let bt = &mut settings.bluetooth;
        if let Some(name) = &self.name {
            bt.target_device_name = name.clone();
        }
        if let Some(address) = &self.address {
            bt.target_address = Some(address.clone());
        }
        if let Some(uuid) = &self.uuid {
            bt.service_uuid = uuid.clone();
        }
        if let Some(timeout) = self.timeout {
            bt.connect_timeout_secs = timeout;
        }
        if self.no_enable {
            bt.auto_enable_radio = false;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = level.clone();
        }
    }
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => {
            let mut settings = Settings::from_file(path)?;
            settings.override_from_env();
            settings
        }
        None => Settings::new()?,
    };
    args.apply_to(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn init_logging(config: &LoggingConfig, args: &Args) -> anyhow::Result<()> {
    let log_level = if args.quiet {
        Level::ERROR
    } else {
        parse_level(&config.level)
    };

    let mut env_filter = EnvFilter::from_default_env().add_directive(log_level.into());
    if !args.verbose {
        // 通常モード：bluer のログは警告以上のみ
        env_filter = env_filter.add_directive("bluer=warn".parse()?);
    }

    let file_layer = match (config.output.as_str(), &config.file_path) {
        ("file", Some(path)) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        }
        _ => None,
    };

    // 標準出力は受信データ用のため、コンソールログは標準エラーへ
    let console_layer = (file_layer.is_none() || args.verbose)
        .then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// 受信チャンクを表示用文字列へ変換
fn render_chunk(chunk: &[u8], hex: bool) -> String {
    if hex {
        let mut line = chunk
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        line.push('\n');
        line
    } else {
        String::from_utf8_lossy(chunk).into_owned()
    }
}

/// 無線が有効であることを確認し、必要なら有効化を要求
async fn ensure_radio(
    radio: &RadioController,
    auto_enable: bool,
    shutdown: ShutdownReceiver,
) -> spp_core::Result<()> {
    match radio.query_state().await {
        RadioState::Enabled => return Ok(()),
        RadioState::Absent => return Err(SppError::RadioAbsent),
        RadioState::Disabled if !auto_enable => return Err(SppError::RadioDisabled),
        RadioState::Disabled => {}
    }

    let request = radio.request_enable().await?;
    let cancel = request.cancel_handle();
    info!("Waiting for the Bluetooth radio to be enabled ({})", request.token());

    let outcome = request.outcome();
    tokio::pin!(outcome);
    let outcome = tokio::select! {
        outcome = &mut outcome => outcome,
        _ = shutdown.wait() => {
            cancel.cancel();
            outcome.await
        }
    };

    match outcome {
        EnableOutcome::Enabled => Ok(()),
        EnableOutcome::Denied => Err(SppError::RadioDisabled),
        EnableOutcome::Cancelled => Err(SppError::Cancelled),
    }
}

/// セッションの送受信ループ
///
/// `input` の各行をデバイスへ送り、受信チャンクを `output` へ書き出す。
async fn pump<R, W>(
    session: &SerialSession,
    input: R,
    output: &mut W,
    hex: bool,
    shutdown: ShutdownReceiver,
) -> spp_core::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            _ = shutdown.clone().wait() => {
                info!("Shutdown requested");
                return Ok(());
            }
            chunk = session.read_chunk() => match chunk? {
                Some(chunk) => {
                    debug!("Received {} bytes", chunk.len());
                    output.write_all(render_chunk(&chunk, hex).as_bytes()).await?;
                    output.flush().await?;
                }
                None => {
                    info!("Session ended by peer ({})", session.state());
                    return Ok(());
                }
            },
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => {
                    let mut data = line.into_bytes();
                    data.push(b'\n');
                    session.write(&data).await?;
                }
                Ok(None) => {
                    debug!("Input closed; continuing to receive");
                    input_open = false;
                }
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    input_open = false;
                }
            },
        }
    }
}

async fn run(args: Args, settings: Settings) -> spp_core::Result<()> {
    let shutdown = LinuxPlatform::setup_shutdown_handler()?;

    if !LinuxPlatform::bluetooth_subsystem_present() {
        debug!("/sys/class/bluetooth not found");
    }

    let platform: Arc<dyn BluetoothPlatform> = Arc::new(BluezPlatform::new().await?);
    let radio = RadioController::new(platform.clone());
    let registry = DeviceRegistry::new(platform.clone(), radio.clone());
    let connector = SessionConnector::new(platform, radio.clone())
        .with_options(settings.bluetooth.session_options());

    ensure_radio(&radio, settings.bluetooth.auto_enable_radio, shutdown.clone()).await?;

    if args.list {
        let devices = registry.list_bonded().await?;
        if devices.is_empty() {
            info!("No bonded devices");
        }
        for device in devices {
            println!("{}\t{}", device.address, device.name);
        }
        return Ok(());
    }

    let bt = &settings.bluetooth;
    let service: ServiceIdentifier = bt.service()?;
    let device = registry
        .resolve(Some(bt.target_device_name.as_str()), bt.target_address.as_deref())
        .await?;

    let pending = connector.connect(&device, service, bt.connect_timeout());
    let cancel = pending.cancel_handle();
    let outcome = pending.outcome();
    tokio::pin!(outcome);
    let session = tokio::select! {
        result = &mut outcome => result?,
        _ = shutdown.clone().wait() => {
            info!("Cancelling connect to {}", device);
            cancel.cancel();
            outcome.await?
        }
    };
    info!("Session open: {} [{}]", session.device(), session.service());

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let result = pump(&session, stdin, &mut stdout, args.hex, shutdown).await;

    if let Err(e) = session.close().await {
        warn!("Failed to close session: {}", e);
    }
    let stats = session.statistics();
    info!(
        "Session closed ({}): {} bytes in {} chunks received, {} bytes in {} writes sent",
        session.state(),
        stats.bytes_read,
        stats.chunks_read,
        stats.bytes_written,
        stats.writes
    );

    result
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args)?;
    init_logging(&settings.logging, &args)?;

    const BUILD_NUMBER: &str = env!("BUILD_NUMBER");
    info!("spp-session starting (Linux version {}, build #{})", VERSION, BUILD_NUMBER);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let result = runtime.block_on(run(args, settings));
    // 標準入力の読み込みはブロッキングスレッドで行われるため待たずに終了する
    runtime.shutdown_timeout(Duration::from_millis(200));

    match result {
        Ok(()) => Ok(()),
        Err(SppError::Cancelled) => {
            info!("Cancelled");
            Ok(())
        }
        Err(e) => {
            error!("{} [{}]", e, e.error_code());
            Err(e.into())
        }
    }
}
