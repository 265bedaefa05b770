//! Burrow client
//!
//! Boots a project from a configuration file and runs it until interrupted:
//! - Derives codec keys from the configured pre-shared secret
//! - Dials the remote tunnel peer over TCP
//! - Forwards configured endpoints through multiplexed channels

use anyhow::{Context, Result};
use burrow::codec::{AeadCodec, FrameLock, NullMarker, PresharedKeySource};
use burrow::network::tcp;
use burrow::project::Project;
use burrow::transceiver::CodecBuilder;
use burrow::Config;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

/// Burrow - secure, multiplexing tunnel client
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Secure, multiplexing tunnel client")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "burrow.toml")]
    config: String,

    /// Write an example configuration to the given path and exit
    #[arg(long)]
    generate_config: bool,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

fn init_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = burrow::config::generate_example_config();
        example
            .save(&args.config)
            .with_context(|| format!("failed to write {}", args.config))?;
        println!("Example configuration written to {}", args.config);
        return Ok(());
    }

    let config =
        Config::load(&args.config).with_context(|| format!("failed to load {}", args.config))?;

    let level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level)
        .to_string();
    init_logging(&level, &config.logging.format);

    if config.remote.preshared_key.is_empty() {
        anyhow::bail!("remote.preshared_key must be set");
    }

    let key_source = Arc::new(PresharedKeySource::new(
        config.remote.preshared_key.as_bytes(),
    ));
    let key_size = config.remote.key_size;

    let codec: Arc<dyn CodecBuilder> = Arc::new(move |lock: FrameLock| {
        AeadCodec::new(&*key_source, key_size, Arc::new(NullMarker), lock)
    });

    let dial = Arc::new(tcp::Dialer::new(
        config.remote.host.clone(),
        config.remote.port,
        config.transceiver.initial_timeout(),
    ));

    info!(
        remote = %dial,
        endpoints = config.endpoints.len(),
        version = burrow::VERSION,
        "starting"
    );

    let project = Project::new(config, dial, codec);

    project.bootup().await.context("bootup failed")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown requested");

    project.kick().await.context("kick failed")?;
    project.close().await.context("close failed")?;

    Ok(())
}
