//! statesyncd: the state sync daemon.
//!
//! Hosts the in-process bus, a pool of sync consumers on the sync route,
//! an optional TCP ingest listener, and logging taps for forwarded updates
//! and monitor events nobody in the process consumes.
//!
//! # Usage
//!
//! ```text
//! statesyncd init --config statesync.toml
//! statesyncd import-graph graph.toml
//! statesyncd run --data-dir /var/lib/statesync
//! ```

mod import;
mod ingest;
mod node;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use statesync_core::{GraphDocument, SyncConfig};
use statesync_store::StateStore;

const DEFAULT_LOG_FILTER: &str = "info,statesyncd=debug,statesync=debug";

#[derive(Parser)]
#[command(name = "statesyncd", about = "State sync daemon")]
struct Cli {
    /// Path to statesync.toml.
    #[arg(long, global = true, env = "STATESYNC_CONFIG", default_value = "statesync.toml")]
    config: PathBuf,

    /// Directory holding the state database. Overrides `storage.path`.
    #[arg(long, global = true, env = "STATESYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the sync route until interrupted.
    Run,

    /// Import states, processors, providers and routes from a TOML file.
    ImportGraph {
        /// Graph document to import.
        file: PathBuf,
    },

    /// Write a single-node configuration to `--config`.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run => {
            let config = load_config(&cli.config, cli.data_dir.as_deref())?;
            node::run(config).await
        }
        Command::ImportGraph { ref file } => {
            let config = load_config(&cli.config, cli.data_dir.as_deref())?;
            let doc = GraphDocument::from_file(file)
                .with_context(|| format!("failed to load graph {}", file.display()))?;
            let store = open_store(&config)?;
            let summary = import::import_graph(&store, &doc)?;
            info!(
                states = summary.states,
                providers = summary.providers,
                processors = summary.processors,
                routes = summary.routes,
                "graph imported"
            );
            Ok(())
        }
        Command::Init { force } => write_scaffold(&cli.config, cli.data_dir.as_deref(), force),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path, data_dir: Option<&Path>) -> anyhow::Result<SyncConfig> {
    let mut config = SyncConfig::from_file(path).with_context(|| {
        format!(
            "failed to load {} (run `statesyncd init` to create one)",
            path.display()
        )
    })?;
    if let Some(dir) = data_dir {
        config.storage.path = data_path(dir, &config.storage.path);
    }
    Ok(config)
}

/// Place the database file name from the config under `dir`.
fn data_path(dir: &Path, configured: &Path) -> PathBuf {
    let file_name = configured
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("statesync.redb"));
    dir.join(file_name)
}

pub(crate) fn open_store(config: &SyncConfig) -> anyhow::Result<StateStore> {
    let path = &config.storage.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = StateStore::open(path)
        .with_context(|| format!("failed to open state store {}", path.display()))?;
    info!(path = %path.display(), "state store opened");
    Ok(store)
}

fn write_scaffold(path: &Path, data_dir: Option<&Path>, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let db_path = data_path(data_dir.unwrap_or(Path::new(".")), Path::new("statesync.redb"));
    let content = SyncConfig::scaffold(&db_path).to_toml_string()?;
    std::fs::write(path, content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "configuration written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_keeps_configured_file_name() {
        assert_eq!(
            data_path(Path::new("/var/lib/sync"), Path::new("db/custom.redb")),
            PathBuf::from("/var/lib/sync/custom.redb")
        );
        assert_eq!(
            data_path(Path::new("/data"), Path::new("")),
            PathBuf::from("/data/statesync.redb")
        );
    }

    #[test]
    fn init_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("statesync.toml");

        write_scaffold(&config_path, Some(dir.path()), false).unwrap();
        assert!(write_scaffold(&config_path, None, false).is_err());

        let config = load_config(&config_path, None).unwrap();
        assert_eq!(config.storage.path, dir.path().join("statesync.redb"));
        assert_eq!(config.consumer.concurrency, 1);
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from([
            "statesyncd",
            "import-graph",
            "graph.toml",
            "--config",
            "/etc/statesync.toml",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/statesync.toml"));
        assert!(matches!(cli.command, Command::ImportGraph { .. }));
    }
}
