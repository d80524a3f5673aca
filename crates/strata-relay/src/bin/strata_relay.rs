//! # Strata Relay
//!
//! Relays live media sources to streaming endpoints, one self-healing relay
//! per line of the pair list. Output is paced to the source timeline; any
//! failure (end of input included) is retried after a cooldown until the
//! process is interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # streams.csv: one "<source>,<destination>" per line
//! strata-relay --pairs streams.csv
//!
//! # Runtime settings from TOML, MPEG-TS output, 2 s cooldown
//! strata-relay -p streams.csv -c relay.toml --container mpegts --cooldown-ms 2000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use strata_relay::config::{RelaySettings, load_pairs};
use strata_relay::media::ffmpeg::FfmpegBackend;
use strata_relay::{CancelToken, Fleet, RelayOutcome};

#[derive(Parser, Debug)]
#[command(name = "strata-relay", about = "Paced, self-healing media relay")]
struct Cli {
    /// Pair list, one `<source>,<destination>` per line.
    #[arg(short, long, env = "STRATA_RELAY_PAIRS", default_value = "streams.csv")]
    pairs: PathBuf,

    /// Optional TOML runtime settings.
    #[arg(short, long, env = "STRATA_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Destination container kind (overrides the settings file).
    #[arg(long)]
    container: Option<String>,

    /// Cooldown between attempts in milliseconds (overrides the settings file).
    #[arg(long)]
    cooldown_ms: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();

    // ── Configuration ───────────────────────────────────────────
    let mut settings = match &cli.config {
        Some(path) => RelaySettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => RelaySettings::default(),
    };
    if let Some(container) = cli.container.as_deref().map(str::trim) {
        if !container.is_empty() {
            settings.output.container = container.to_string();
        }
    }
    if let Some(ms) = cli.cooldown_ms {
        settings.cooldown = Duration::from_millis(ms);
    }

    let pairs = load_pairs(&cli.pairs)
        .with_context(|| format!("loading relay pairs from {}", cli.pairs.display()))?;
    if pairs.is_empty() {
        tracing::warn!(path = %cli.pairs.display(), "no relay pairs configured, nothing to do");
        return Ok(());
    }

    tracing::info!(
        relays = pairs.len(),
        container = %settings.output.container,
        cooldown_ms = settings.cooldown.as_millis() as u64,
        stagger_ms = settings.stagger.as_millis() as u64,
        "strata-relay starting"
    );

    // ── Media library ───────────────────────────────────────────
    let backend = FfmpegBackend::new().context("initialising FFmpeg")?;

    // ── Graceful shutdown ───────────────────────────────────────
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            if cancel.cancel() {
                tracing::info!("shutting down, waiting for relays to stop...");
            } else {
                tracing::info!("shutdown already in progress");
            }
        })
        .context("installing signal handler")?;
    }

    // ── Run ─────────────────────────────────────────────────────
    let report = Fleet::new(&backend, &settings, cancel).run(&pairs);

    for relay in &report.relays {
        match &relay.outcome {
            RelayOutcome::Stopped(r) => tracing::info!(
                source = %relay.pair.source,
                attempts = r.attempts,
                cooldowns = r.cooldowns,
                last_reason = ?r.last_reason,
                "relay summary"
            ),
            RelayOutcome::Panicked(msg) => {
                tracing::error!(source = %relay.pair.source, panic = %msg, "relay summary")
            }
            RelayOutcome::SpawnFailed(msg) => {
                tracing::error!(source = %relay.pair.source, error = %msg, "relay summary")
            }
        }
    }
    tracing::info!("strata-relay stopped");
    Ok(())
}
