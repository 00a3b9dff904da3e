mod commands;
mod telemetry;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use offline_cache::config::Config;

#[derive(Parser, Debug)]
#[command(name = "offline-cache")]
#[command(about = "TTL caches, HTTP response caching and offline request handling")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-cache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = telemetry::init(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  commands::run(args.command, config).await
}
