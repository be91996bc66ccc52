mod commands;
mod config;

use bazaar::{HttpTransport, SqliteTokenStore, Store, StoreSettings, TokenStore};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::Command;

const LOG_ENV: &str = "BAZAAR_LOG";

#[derive(Parser, Debug)]
#[command(name = "bazaar")]
#[command(about = "Cached command-line client for the marketplace REST API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/bazaar/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also write logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

/// Log to a daily rolling file in the data directory, and to stderr when
/// asked. The returned guard flushes the file writer on drop.
fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("bazaar")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &log_dir,
    "bazaar.log",
  ));
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .init();

  Ok(guard)
}

fn open_tokens(config: &config::Config) -> Result<SqliteTokenStore> {
  match &config.storage.path {
    Some(path) => SqliteTokenStore::open_at(path),
    None => SqliteTokenStore::open(),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose)?;

  let config = config::Config::load(args.config.as_deref())?;
  let tokens = open_tokens(&config)?;

  if let Command::Token { action } = &args.command {
    println!("{}", commands::run_token(action, &tokens)?);
    return Ok(());
  }

  let tokens: Arc<dyn TokenStore> = Arc::new(tokens);
  let transport = HttpTransport::new(&config.api.base_url, config.api.timeout(), tokens)?;
  info!(base_url = %transport.base_url(), "using API");

  let store = Store::init(
    StoreSettings {
      revalidate: config.cache.revalidate,
      ..StoreSettings::default()
    },
    Arc::new(transport),
  );

  let output = commands::run(&args.command, &store, &config).await;
  store.dispose();

  println!("{}", output?);
  Ok(())
}
