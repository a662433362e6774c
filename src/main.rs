//! volume-bot entry point.
//!
//! Loads `.env` and the TOML config, initialises structured logging,
//! builds the exchange adapter and either runs the cycle scheduler until
//! it stops or executes a one-shot service command.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use volume_bot::commands;
use volume_bot::config::{AppConfig, Credentials, LoggingConfig};
use volume_bot::engine::scheduler;
use volume_bot::exchanges::build_adapter;
use volume_bot::types::StopReason;

const BANNER: &str = r#"
 __   __    _                    ___      _
 \ \ / /__ | |_  _ _ __  ___    | _ ) ___| |_
  \ V / _ \| | || | '  \/ -_)   | _ \/ _ \  _|
   \_/\___/|_|\_,_|_|_|_\___|   |___/\___/\__|

  BUY → SELL volume cycles · v0.1.0
"#;

#[derive(Parser, Debug)]
#[command(name = "volume-bot", version, about = "Futures volume bot for Bybit and Binance")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short, default_value = "config.toml")]
    config: String,

    /// Force dry-run regardless of the config file.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run volume cycles until the cap is reached (default).
    Run,
    /// Show available balances.
    Balances,
    /// List open orders on the configured symbol.
    OpenOrders,
    /// Cancel all open orders on the configured symbol.
    CancelAll,
    /// Close the position on the configured symbol with a reduce-only market order.
    ClosePosition,
    /// Cancel all open orders, then close the position.
    CloseAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let mut cfg = AppConfig::load(&cli.config)?;
    if cli.dry_run {
        cfg.bot.dry_run = true;
    }

    init_logging(&cfg.logging)?;

    let mut cycle_config = cfg.cycle_config()?;
    let credentials = match cfg.credentials() {
        Ok(creds) => {
            info!(api_key = ?creds, "Credentials loaded");
            creds
        }
        Err(e) if cycle_config.dry_run => {
            warn!(error = %e, "No credentials in dry-run mode; balance check disabled");
            cycle_config.check_balance = false;
            Credentials::anonymous()
        }
        Err(e) => return Err(e).context("Live trading requires API credentials"),
    };

    let adapter = build_adapter(&cfg, credentials)?;
    let symbol = cycle_config.symbol.clone();
    let dry_run = cycle_config.dry_run;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            println!("{BANNER}");
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received, finishing current cycle");
                    let _ = tx.send(true);
                }
            });

            let summary = scheduler::run(&cycle_config, adapter.as_ref(), rx).await;
            println!("{summary}");

            match summary.stop_reason {
                StopReason::CapReached | StopReason::Shutdown => {}
                StopReason::HaltedOpenPosition => match summary.open_position {
                    Some(halt) => bail!(halt),
                    None => bail!("Halted with an open position on {symbol}"),
                },
                other => bail!("Stopped early: {other}"),
            }
        }
        Command::Balances => {
            commands::balances(adapter.as_ref()).await?;
        }
        Command::OpenOrders => {
            commands::open_orders(adapter.as_ref(), &symbol).await?;
        }
        Command::CancelAll => {
            commands::cancel_all(adapter.as_ref(), &symbol, dry_run).await?;
        }
        Command::ClosePosition => {
            commands::close_position(adapter.as_ref(), &symbol, dry_run).await?;
        }
        Command::CloseAll => {
            commands::close_all(adapter.as_ref(), &symbol, dry_run).await?;
        }
    }

    Ok(())
}

/// Initialise the `tracing` subscriber: console plus an optional append-only
/// log file. `RUST_LOG` overrides the configured level.
fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.level)
            .with_context(|| format!("Invalid logging.level: {}", cfg.level))?,
    };

    let json_logging = cfg.json || std::env::var("VOLUME_BOT_LOG_JSON").is_ok();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if json_logging {
        layers.push(fmt::layer().json().with_target(true).boxed());
    } else {
        layers.push(fmt::layer().with_target(true).boxed());
    }

    if let Some(path) = &cfg.file {
        if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {path}"))?;
        let writer = Mutex::new(file);
        if json_logging {
            layers.push(fmt::layer().json().with_writer(writer).boxed());
        } else {
            layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Failed to initialise logging")?;
    Ok(())
}
