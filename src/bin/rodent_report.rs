//! rodent_report - print recent detections and delivery statistics as JSON.
//!
//! Read-only: opens the daemon's database and never writes to it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use rodent_sentry::clock::epoch_now;
use rodent_sentry::storage::{DetectionQuery, DetectionRecord, DetectionStatistics};
use rodent_sentry::{ClassLabel, DetectionStore, SentryConfig, SqliteDetectionStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Report rodent detections and alert delivery statistics")]
struct Args {
    /// Configuration file used to locate the database.
    #[arg(long, env = "RODENT_CONFIG")]
    config: Option<PathBuf>,

    /// Database path (overrides the configuration).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Look-back window in hours.
    #[arg(long, default_value_t = 24)]
    hours: u32,

    /// Only report this class (norway_rat, roof_rat, mouse).
    #[arg(long)]
    class: Option<String>,

    /// Maximum number of detections to list.
    #[arg(long, default_value_t = 100)]
    limit: usize,

    /// Pretty-print the JSON output.
    #[arg(long)]
    pretty: bool,
}

#[derive(Serialize)]
struct Report {
    generated_at: f64,
    database: String,
    window_hours: u32,
    statistics: DetectionStatistics,
    detections: Vec<DetectionRecord>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let db_path = match args.db {
        Some(path) => path,
        None => {
            let config = match &args.config {
                Some(path) => SentryConfig::load_from(path)?,
                None => SentryConfig::load()?,
            };
            config.storage.database_path
        }
    };
    let class_label = args
        .class
        .as_deref()
        .map(str::parse::<ClassLabel>)
        .transpose()?;

    let database = db_path.to_string_lossy().into_owned();
    if !db_path.exists() {
        anyhow::bail!("database {} does not exist", database);
    }
    let mut store = SqliteDetectionStore::open(&database)?;

    let now = epoch_now();
    let detections = store.query_detections(&DetectionQuery {
        class_label,
        since: Some(now - f64::from(args.hours) * 3_600.0),
        limit: Some(args.limit),
        ..Default::default()
    })?;
    let report = Report {
        generated_at: now,
        database,
        window_hours: args.hours,
        statistics: store.get_detection_statistics()?,
        detections,
    };

    let json = if args.pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    }
    .context("serialize report")?;
    println!("{}", json);
    Ok(())
}
