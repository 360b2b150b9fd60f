//! Helios index administration tool.
//!
//! Creates, migrates and inspects the indices of one set of document mappings
//! on an Elasticsearch cluster.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;

use helios_index::client::elasticsearch::{ClusterConnection, EsClusterClient};
use helios_index::definition::{MappingDefinition, load_mappings};
use helios_index::reindex::RemoteSource;
use helios_index::{ClusterIndexAdmin, IndexAdmin, Settings};

/// Administer schema-versioned search indices.
#[derive(Debug, Parser)]
#[command(name = "index-admin")]
#[command(about = "Schema-versioned search index administration")]
struct Cli {
    /// Elasticsearch cluster URL.
    #[arg(long, env = "INDEX_ADMIN_URL", default_value = "http://localhost:9200")]
    url: String,

    /// Basic auth user name.
    #[arg(long, env = "INDEX_ADMIN_USERNAME")]
    username: Option<String>,

    /// Basic auth password.
    #[arg(long, env = "INDEX_ADMIN_PASSWORD")]
    password: Option<String>,

    /// Admin name; indices are named `<prefix>.<name>-<type>`.
    #[arg(long, env = "INDEX_ADMIN_NAME")]
    name: String,

    /// JSON file holding an array of mapping definitions.
    #[arg(long, env = "INDEX_ADMIN_MAPPINGS")]
    mappings: PathBuf,

    /// JSON file holding the settings object.
    #[arg(long, env = "INDEX_ADMIN_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log level.
    #[arg(long, env = "INDEX_ADMIN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Checks whether every index exists.
    Exists,
    /// Creates missing indices and migrates existing ones.
    Create,
    /// Deletes every index.
    Delete,
    /// Prints the settings snapshot.
    Settings,
    /// Applies settings given as `key=value` pairs.
    UpdateSettings {
        /// Settings; values are parsed as JSON, falling back to strings.
        #[arg(value_name = "KEY=VALUE", required = true)]
        values: Vec<String>,
    },
    /// Copies one index into another.
    Reindex {
        /// Source index.
        source: String,
        /// Destination index.
        destination: String,
        /// Pull the source index from this remote cluster.
        #[arg(long)]
        remote: Option<String>,
        /// Skip refreshing the destination.
        #[arg(long)]
        no_refresh: bool,
    },
}

/// Initializes the tracing subscriber.
fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("helios_index={},index_admin={}", level, level)));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

fn parse_setting(pair: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected KEY=VALUE, got '{}'", pair))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

/// Builds the cluster connection; the request timeout is the `socketTimeout`
/// setting.
fn connection(cli: &Cli, settings: &Settings) -> ClusterConnection {
    let connection = ClusterConnection::new(cli.url.trim(), settings);
    match (&cli.username, &cli.password) {
        (Some(username), Some(password)) => connection.with_credentials(username, password),
        _ => connection,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let definitions: Vec<MappingDefinition> = read_json(&cli.mappings)?;
    let mappings = load_mappings(definitions).context("Invalid mapping definitions")?;
    let settings = match &cli.settings {
        Some(path) => Settings::new(read_json::<Map<String, Value>>(path)?)
            .context("Invalid settings")?,
        None => Settings::default(),
    };

    let connection = connection(&cli, &settings);
    info!(url = %connection.url, name = %cli.name, types = mappings.len(), "Connecting to index cluster");
    let client = Arc::new(EsClusterClient::new(&connection)?);
    let admin = ClusterIndexAdmin::new(client, &cli.name, mappings, settings);

    let result = run(&admin, cli.command).await;
    admin.close().await?;
    result
}

async fn run(admin: &ClusterIndexAdmin, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Exists => {
            let exists = admin.exists().await?;
            println!("{}", exists);
            if !exists {
                std::process::exit(1);
            }
        }
        Command::Create => {
            admin.create().await?;
            info!(name = %admin.name(), "Indices are up to date");
        }
        Command::Delete => {
            admin.delete().await?;
        }
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&admin.settings())?);
        }
        Command::UpdateSettings { values } => {
            let mut updates = Map::new();
            for pair in &values {
                let (key, value) = parse_setting(pair)?;
                updates.insert(key, value);
            }
            admin.update_settings(updates).await?;
            println!("{}", serde_json::to_string_pretty(&admin.settings())?);
        }
        Command::Reindex {
            source,
            destination,
            remote,
            no_refresh,
        } => {
            let result = admin
                .reindex(&source, &destination, remote.map(RemoteSource::new), !no_refresh)
                .await?;
            println!("{}", result);
        }
    }
    Ok(())
}
