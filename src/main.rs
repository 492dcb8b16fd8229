//! dyfi-updater - keeps dy.fi hostnames pointed at this machine.

use clap::Parser;
use dyfi_updater::config::Config;
use dyfi_updater::logger::{ConsoleLogger, Level};
use dyfi_updater::updater::Updater;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dyfi-updater")]
#[command(about = "Keeps dy.fi hostnames pointed at this machine's public addresses")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "conf")]
    conf: PathBuf,

    /// State file (overrides the configuration)
    #[arg(short = 's', long = "state")]
    state: Option<PathBuf>,

    /// Don't actually update anything
    #[arg(short = 'd', long = "dry-run")]
    dry_run: bool,

    /// Log level: debug, info, warn, error
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut conf = Config::load_from(&cli.conf)?;
    if let Some(state) = cli.state {
        conf.state = Some(state);
    }
    conf.dry_run = conf.dry_run || cli.dry_run;

    let level = cli
        .log_level
        .or_else(|| conf.log_level.clone())
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::Info);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(format!(
            "dyfi_updater={}",
            level
        )))
        .with_target(false)
        .init();

    if let Err(e) = Updater::new().run(&conf, Arc::new(ConsoleLogger)).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}
