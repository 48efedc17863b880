use anyhow::{bail, Context, Result};
use statewatch::batcher::{ChangeBatcher, JsonLinesConsumer};
use statewatch::config::{load_config, WatchConfig};
use statewatch::detector::ChangeDetector;
use statewatch::noise::{HistorySample, NoiseBaselineStore};
use statewatch::pipeline::ChangePipeline;
use statewatch::state::{AttributeFilter, RawObservation, StateStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const USAGE: &str = "usage: statewatch [run [config.toml] | baselines <history.json> [config.toml]]";

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries flushed batches
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "statewatch=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => run(None).await,
        Some("run") => run(args.get(1).map(String::as_str)).await,
        Some("baselines") => {
            let history_path = args.get(1).context(USAGE)?;
            recalculate_baselines(history_path, args.get(2).map(String::as_str))
        }
        Some(other) => bail!("unknown command {:?}\n{}", other, USAGE),
    }
}

fn load(config_path: Option<&str>) -> Result<WatchConfig> {
    let config = match config_path {
        Some(path) => load_config(path)?,
        None => WatchConfig::default(),
    };
    let config = config.apply_env();

    info!(
        database = %config.storage.database_path.display(),
        batch_delay_ms = config.batcher.batch_delay_ms,
        max_batch_size = config.batcher.max_batch_size,
        ignored_attributes = config.state.ignored_attributes.len(),
        threshold_sigmas = config.noise.threshold_sigmas,
        "Configuration loaded"
    );
    Ok(config)
}

fn open_baselines(config: &WatchConfig) -> Result<Arc<NoiseBaselineStore>> {
    let store =
        NoiseBaselineStore::with_config(&config.storage.database_path, config.noise.clone())
            .context("Failed to initialize noise baseline store")?;
    Ok(Arc::new(store))
}

/// Reads one JSON array of observations per stdin line until EOF or Ctrl-C
async fn run(config_path: Option<&str>) -> Result<()> {
    let config = load(config_path)?;

    let states = Arc::new(
        StateStore::with_filter(
            &config.storage.database_path,
            AttributeFilter::new(config.state.ignored_attributes.iter().cloned()),
        )
        .context("Failed to initialize state store")?,
    );
    let baselines = open_baselines(&config)?;
    let detector =
        ChangeDetector::new(states, baselines).report_first_seen(config.state.report_first_seen);

    let consumer = Arc::new(JsonLinesConsumer::new(std::io::stdout()));
    let batcher = ChangeBatcher::new(&config.batcher, consumer);
    let pipeline = ChangePipeline::new(detector, batcher);

    info!("statewatch running, reading observations from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        };

        let line = match line {
            Some(line) => line,
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Vec<RawObservation>>(&line) {
            Ok(observations) => {
                pipeline.ingest(&observations).await?;
            }
            Err(e) => warn!(error = %e, "Skipping malformed observation line"),
        }
    }

    let undelivered = pipeline.batcher().shutdown().await;
    let stats = pipeline.batcher().get_stats();
    info!(
        total_received = stats.total_received,
        total_processed = stats.total_processed,
        batches_processed = stats.batches_processed,
        undelivered = undelivered,
        "statewatch stopped"
    );

    Ok(())
}

fn recalculate_baselines(history_path: &str, config_path: Option<&str>) -> Result<()> {
    let config = load(config_path)?;
    let baselines = open_baselines(&config)?;

    let contents = std::fs::read_to_string(history_path)
        .with_context(|| format!("Failed to read history file {}", history_path))?;
    let history: HashMap<String, Vec<HistorySample>> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse history file {}", history_path))?;

    let calculated = baselines.calculate_from_history(&history)?;
    for baseline in &calculated {
        info!(
            entity_id = %baseline.entity_id,
            state_type = baseline.state_type.as_str(),
            threshold = ?baseline.numeric_threshold,
            samples = baseline.sample_count,
            "Baseline stored"
        );
    }

    Ok(())
}
