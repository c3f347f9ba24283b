use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use monitor_fsm::{MonitorError, PortIdentifier, PortKey};
use monitor_manager::{
    ClientIdentity, DeviceScanner, HttpDeviceScanner, MonitorService, MonitorSink,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "monitor")]
#[command(about = "Serial monitor for boards attached to a bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config directory (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the ports the bridge currently detects
    Ports(PortsArgs),

    /// Open a monitor on a port and stream its output to stdout
    Attach(AttachArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Parser)]
struct PortsArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct AttachArgs {
    /// Port key, e.g. serial:/dev/ttyACM0
    port: PortKey,

    /// Baudrate for serial ports (overrides the configured default)
    #[arg(short, long)]
    baudrate: Option<u32>,

    /// Do not reopen the port by itself after it is lost or busy
    #[arg(long)]
    no_auto_play: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "monitor_cli=debug,monitor_manager=debug,info"
    } else {
        "monitor_cli=info,monitor_manager=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = CliConfig::new(cli.config_dir)?;

    match cli.command {
        Commands::Ports(args) => ports_command(&config, args.json).await,
        Commands::Attach(args) => attach_command(&config, args).await,
        Commands::Config => {
            print!("{}", config.render()?);
            Ok(())
        }
    }
}

async fn ports_command(config: &CliConfig, json: bool) -> Result<()> {
    let scanner = HttpDeviceScanner::new(&config.file.bridge.url)?;
    let ports = scanner
        .detected_ports()
        .await
        .context("Failed to query detected ports")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        println!("No ports detected");
        return Ok(());
    }
    for detected in ports.sorted() {
        let label = detected.label.as_deref().unwrap_or("");
        println!("{:<32} {}", detected.port.key(), label);
    }
    Ok(())
}

async fn attach_command(config: &CliConfig, args: AttachArgs) -> Result<()> {
    let service = MonitorService::start(config.file.to_monitor_config())?;
    let connection = service.connect(ClientIdentity::new("cli"), Arc::new(StdoutSink));

    if let Some(baudrate) = args.baudrate {
        connection.set_baudrate(baudrate).await?;
    }
    if args.no_auto_play {
        connection.set_auto_play(false).await?;
    }
    connection.select_port(Some(args.port.to_port())).await?;
    connection.play().await?;
    info!("Monitoring {} (Ctrl-C to quit)", args.port);

    // Lines typed on stdin go to the board.
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = connection.send_text(&format!("{line}\n")).await {
                        warn!("Send failed: {}", e);
                    }
                }
                Ok(None) => {
                    // stdin closed; keep streaming until interrupted
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => return Err(e).context("Failed to read stdin"),
            },
        }
    }

    connection.dispose().await;
    service.shutdown();
    Ok(())
}

/// Writes monitor output to stdout and status lines to stderr.
struct StdoutSink;

impl MonitorSink for StdoutSink {
    fn on_start(&self, port: &PortIdentifier) {
        eprintln!("--- connected to {} ---", port);
    }

    fn on_text(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn on_stop(&self, port: &PortIdentifier) {
        eprintln!("--- disconnected from {} ---", port);
    }

    fn on_busy(&self, port: &PortIdentifier, error: &MonitorError) {
        eprintln!("--- {} is busy: {} ---", port, error);
    }
}
