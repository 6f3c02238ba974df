//! Instance Host
//!
//! Drives one script instance through a full lifecycle from the command line.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use instance_host::{HostConfig, driver};
use script_instance::ThreadingPolicy;

/// Script instance host
#[derive(Parser, Debug)]
#[command(name = "instance-host")]
#[command(about = "Run a script instance through its lifecycle", long_about = None)]
struct Args {
    /// Path to the host configuration file
    #[arg(short, long, default_value = "instance.toml")]
    config: PathBuf,

    /// Override the number of host frames
    #[arg(long)]
    frames: Option<u32>,

    /// Override the scripts directory
    #[arg(long)]
    scripts: Option<PathBuf>,

    /// Run the script on a dedicated worker thread
    #[arg(long)]
    dedicated: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("instance_host=info,script_instance=info"));
    if args.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting instance host v{}", env!("CARGO_PKG_VERSION"));

    let mut config = HostConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(frames) = args.frames {
        config.host.frames = frames;
    }
    if let Some(scripts) = args.scripts {
        config.host.scripts_dir = scripts;
    }
    if args.dedicated {
        config.instance = config.instance.with_threading(ThreadingPolicy::DedicatedThread);
    }

    info!(
        scripts = %config.host.scripts_dir.display(),
        frames = config.host.frames,
        threading = ?config.instance.threading,
        "Configuration loaded"
    );

    let report = driver::run(&config).await?;
    info!(
        frames = report.frames,
        forwarded_ticks = report.forwarded_ticks,
        state = %report.final_state,
        contexts = report.contexts_created,
        "Host finished"
    );

    Ok(())
}
