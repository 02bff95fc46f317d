// credlink: credential transfer over BLE
//
// Cross-platform (macOS, Linux, Windows) command-line front end for the
// credlink session: frame a payload, read the one-time password from a
// peripheral, and send the credential to it.

mod ble;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use credlink_core::transport::ble::frame;
use credlink_core::{
    GattDevice, LinkState, LoopbackDevice, Payload, SessionConfig, TransferSession, TransferState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "credlink")]
#[command(about = "Chunked credential transfer over BLE", long_about = None)]
#[command(version)]
struct Cli {
    /// Log debug output (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the wire frames for a payload
    Frame {
        #[arg(short, long)]
        payload: PathBuf,
        /// Frame body size in characters (defaults to the configured value)
        #[arg(short, long)]
        max_body: Option<usize>,
        /// Treat the payload as JSON and compact it first
        #[arg(long)]
        json: bool,
    },
    /// Connect, read the password, and send a payload
    Send {
        #[arg(short, long)]
        payload: PathBuf,
        #[command(flatten)]
        target: Target,
        /// Treat the payload as JSON and compact it first
        #[arg(long)]
        json: bool,
    },
    /// Connect and read the password
    Read {
        #[command(flatten)]
        target: Target,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct Target {
    /// Peripheral name filter (defaults to the configured value)
    #[arg(short, long)]
    device: Option<String>,
    /// Use the in-process loopback peripheral instead of Bluetooth
    #[arg(long)]
    loopback: bool,
    /// Password served by the loopback peripheral
    #[arg(long, default_value = "000000")]
    loopback_password: String,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.verbose, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Frame {
            payload,
            max_body,
            json,
        } => cmd_frame(&payload, max_body, json),
        Commands::Send {
            payload,
            target,
            json,
        } => cmd_send(&payload, target, json).await,
        Commands::Read { target } => cmd_read(target).await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "credlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn read_payload(path: &Path, json: bool) -> Result<Payload> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload file {}", path.display()))?;
    if json {
        Ok(Payload::from_json_str(&text)?)
    } else {
        Ok(Payload::new(text))
    }
}

fn cmd_frame(path: &Path, max_body: Option<usize>, json: bool) -> Result<()> {
    let config = config::Config::load()?;
    let max_body = max_body.unwrap_or(config.session.max_body_size);
    let payload = read_payload(path, json)?;
    let frames = frame(payload.as_str(), max_body)?;

    println!(
        "{} {} chars in {} frames",
        "Payload:".bold(),
        payload.char_len(),
        frames.len()
    );
    println!();
    for f in &frames {
        println!(
            "  {} {} bytes  {}",
            format!("#{:<3}", f.index).bright_cyan(),
            format!("{:>4}", f.wire_len()).dimmed(),
            f.encode()
        );
    }

    Ok(())
}

async fn open_device(
    config: &config::Config,
    target: &Target,
) -> Result<(Arc<dyn GattDevice>, Option<LoopbackDevice>)> {
    if target.loopback {
        let device = LoopbackDevice::new(target.loopback_password.clone());
        return Ok((Arc::new(device.clone()), Some(device)));
    }

    let name = target.device.as_deref().or(config.device_name.as_deref());
    let device = ble::find_device(name, config.scan_timeout()).await?;
    Ok((Arc::new(device), None))
}

async fn connect_session(
    config: &config::Config,
    session_config: SessionConfig,
    target: &Target,
    payload: Payload,
) -> Result<(TransferSession, Option<LoopbackDevice>)> {
    let (device, loopback) = open_device(config, target).await?;
    let session = TransferSession::spawn(session_config, device, payload)?;

    println!("{}", "Connecting...".bold());
    session.connect()?;
    let snapshot = session
        .wait_ready(config.ready_timeout())
        .await
        .context("Link did not become ready")?;
    println!(
        "  {} Ready (MTU {}, {} services)",
        "✓".green(),
        snapshot.mtu,
        snapshot.discovered_services.len()
    );

    Ok((session, loopback))
}

async fn cmd_read(target: Target) -> Result<()> {
    let config = config::Config::load()?;
    let session_config = config.session.clone().with_read_on_ready(true);
    let (session, _) = connect_session(&config, session_config, &target, Payload::new("")).await?;

    let password = session
        .wait_for_password(config.ready_timeout())
        .await
        .context("Password read failed")?;
    println!("  {} Password: {}", "✓".green(), password.bright_yellow());

    session.shutdown();
    Ok(())
}

async fn cmd_send(path: &Path, target: Target, json: bool) -> Result<()> {
    let config = config::Config::load()?;
    let payload = read_payload(path, json)?;
    let (session, loopback) =
        connect_session(&config, config.session.clone(), &target, payload.clone()).await?;

    if config.session.read_on_ready {
        let password = session
            .wait_for_password(config.ready_timeout())
            .await
            .context("Password read failed")?;
        println!("  {} Password: {}", "✓".green(), password.bright_yellow());
    }

    println!("{}", "Sending...".bold());
    session.start_transfer()?;

    let mut rx = session.subscribe();
    let progress = tokio::time::timeout(config.transfer_timeout(), async {
        let mut shown = None;
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if shown != Some(snapshot.transfer.cursor) {
                shown = Some(snapshot.transfer.cursor);
                println!(
                    "  {} / {} frames",
                    snapshot.transfer.cursor, snapshot.transfer.total_frames
                );
            }
            if snapshot.transfer.state.is_terminal() {
                if snapshot.link_state == LinkState::Disconnected {
                    println!("  {} Link lost", "✗".red());
                }
                return Ok::<_, anyhow::Error>(snapshot.transfer);
            }
            rx.changed().await.context("Session closed")?;
        }
    })
    .await
    .context("Transfer timed out")??;

    if let TransferState::Aborted { cursor } = progress.state {
        anyhow::bail!("Transfer aborted at frame {}", cursor);
    }
    println!("  {} Sent {} frames", "✓".green(), progress.total_frames);

    if let Some(device) = loopback {
        let received = device.received_payloads();
        if received.last().map(String::as_str) == Some(payload.as_str()) {
            println!("  {} Loopback peripheral reassembled the payload", "✓".green());
        } else {
            anyhow::bail!("Loopback peripheral did not reassemble the payload");
        }
    }

    session.shutdown();
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "  {:<20} {}",
                "file".dimmed(),
                config::Config::config_file()?.display()
            );
        }
    }

    Ok(())
}
