//! rodentd - rodent detection daemon
//!
//! Pulls frames from the configured camera, runs detection, rate-limits
//! alerts per class and delivers them on the enabled notification channels.
//! Ctrl-C / SIGTERM stops the frame loop and drains pending alerts.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use rodent_sentry::ingest::redact_url;
use rodent_sentry::{Sentry, SentryConfig, Shutdown};

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera rodent detection daemon")]
struct Args {
    /// Configuration file (TOML when the extension is .toml, JSON otherwise).
    #[arg(long, env = "RODENT_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "rodent_sentry=debug". RUST_LOG wins when set.
    #[arg(long, env = "RODENT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_level.as_str()))
        .init();

    let config = match &args.config {
        Some(path) => SentryConfig::load_from(path)?,
        None => SentryConfig::load()?,
    };
    log::info!(
        "camera: {:?} {} | classes: {:?} | cooldown: {} min | channels: {:?}",
        config.camera.source,
        redact_url(&config.camera.url),
        config.detection.classes,
        config.alerts.cooldown_minutes,
        config.alerts.enabled_channels
    );

    let shutdown = Shutdown::new();
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        handler_shutdown.trigger();
    })
    .expect("error setting Ctrl-C handler");

    // Building the daemon validates channel credentials and the model.
    let mut sentry = Sentry::from_config(config.clone(), shutdown.clone())?;
    if args.check_config {
        log::info!("configuration OK");
        return Ok(());
    }

    if !config.system.startup_delay.is_zero() {
        log::info!("waiting {:?} before starting", config.system.startup_delay);
        if shutdown.wait_timeout(config.system.startup_delay) {
            return Ok(());
        }
    }

    let pipeline = sentry.open_pipeline()?;
    let stats = pipeline.stats_handle();
    let summary = sentry.run(pipeline, stats)?;
    log::info!(
        "rodentd exiting: {} frames processed, {} skipped",
        summary.frames_processed,
        summary.frames_failed
    );
    Ok(())
}
