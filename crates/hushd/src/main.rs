//! hushd - silence lifecycle daemon
//!
//! Loads silences from the on-disk store, keeps the expiry sweep running and
//! logs every lifecycle event until interrupted.

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hush_silences::{
    BroadcastEmitter, Environment, ExpirySweeper, FallbackChain, FileStore, ManagerConfig,
    SilenceManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::settings::JsonFileSettings;

#[derive(Debug, Parser)]
#[command(name = "hushd")]
#[command(about = "Silence lifecycle daemon")]
#[command(version)]
struct Cli {
    /// Directory holding the silence snapshot
    #[arg(long, env = "HUSH_STATE_DIR", default_value = "./hush-data")]
    state_dir: PathBuf,

    /// JSON settings file consulted before the environment
    #[arg(long, env = "HUSH_SETTINGS")]
    settings: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "HUSH_LOG_JSON")]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let mut chain = FallbackChain::new(Environment::from_process());
    if let Some(path) = &cli.settings {
        chain = chain.with_primary(JsonFileSettings::new(path));
    }
    let resolved = chain.manager_config(&ManagerConfig::default());
    for (key, source) in &resolved.sources {
        info!(key, source = %source, "resolved setting");
    }
    let config = resolved.config;
    config.validate()?;

    let store = FileStore::open(&cli.state_dir)
        .await
        .with_context(|| format!("opening silence store in {}", cli.state_dir.display()))?;

    let emitter = BroadcastEmitter::new(config.event_buffer);
    let mut events = emitter.subscribe();
    let manager = Arc::new(
        SilenceManager::new(Arc::new(store), config.clone())
            .with_event_sink(Arc::new(emitter.clone())),
    );

    let loaded = manager
        .hydrate(&manager.context())
        .await
        .context("loading silences")?;
    info!(
        state_dir = %cli.state_dir.display(),
        silences = loaded,
        "hushd started"
    );

    let shutdown = CancellationToken::new();
    let sweeper = ExpirySweeper::spawn(Arc::clone(&manager), config.sweep_interval, shutdown.clone());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for shutdown signal");
                }
                break;
            }
            event = events.recv() => match event {
                Some(event) => info!(
                    kind = %event.kind,
                    silence_id = %event.silence_id,
                    status = %event.status,
                    created_by = %event.created_by,
                    version = event.version,
                    "silence event"
                ),
                None => break,
            },
        }
    }

    info!(dropped_events = events.dropped(), "shutting down");
    shutdown.cancel();
    sweeper.join().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["hushd"]).unwrap();
        assert_eq!(cli.state_dir, PathBuf::from("./hush-data"));
        assert!(cli.settings.is_none());
        assert!(!cli.log_json);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "hushd",
            "--state-dir",
            "/var/lib/hush",
            "--settings",
            "/etc/hush.json",
            "--log-json",
        ])
        .unwrap();
        assert_eq!(cli.state_dir, PathBuf::from("/var/lib/hush"));
        assert_eq!(cli.settings, Some(PathBuf::from("/etc/hush.json")));
        assert!(cli.log_json);
    }
}
