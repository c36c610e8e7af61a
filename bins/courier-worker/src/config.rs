use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use courier_broker_pubsub::PubSubConfig;
use courier_engine::{CoordinatorConfig, HandlerConfig};
use courier_store_postgres::PgStoreConfig;

use crate::error::WorkerError;

#[derive(Parser)]
#[command(name = "courier-worker", about = "Pub/Sub consumer that records every message exactly once")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume the subscription until SIGINT/SIGTERM
    Serve(ServeArgs),
    /// Run the startup checks and exit
    Probe(ProbeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    /// Health endpoint port
    #[arg(long, default_value_t = 8080, env = "PORT")]
    pub port: u16,
    /// Name used in the greeting on `/`
    #[arg(long, default_value = "World", env = "NAME")]
    pub name: String,
}

#[derive(Args, Clone, Debug)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Flags shared by every command. Each one overrides the TOML file.
#[derive(Args, Clone, Debug, Default)]
pub struct CommonArgs {
    /// Path to a TOML config file
    #[arg(long, env = "COURIER_CONFIG")]
    pub config: Option<String>,
    #[arg(long, env = "GCP_PROJECT")]
    pub project: Option<String>,
    #[arg(long, env = "PUBSUB_SUBSCRIPTION")]
    pub subscription: Option<String>,
    #[arg(long, env = "PUBSUB_EMULATOR_HOST")]
    pub emulator_host: Option<String>,
    #[arg(long, env = "PUBSUB_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
    #[arg(long, env = "PG_HOST")]
    pub pg_host: Option<String>,
    #[arg(long, env = "PG_PORT")]
    pub pg_port: Option<u16>,
    #[arg(long, env = "PG_USER")]
    pub pg_user: Option<String>,
    #[arg(long, env = "PG_PASSWORD", hide_env_values = true)]
    pub pg_password: Option<String>,
    #[arg(long, env = "PG_DATABASE")]
    pub pg_database: Option<String>,
}

impl CommonArgs {
    fn apply(&self, config: &mut WorkerConfig) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
        fn set_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }

        set(&mut config.pubsub.project, &self.project);
        set(&mut config.pubsub.subscription, &self.subscription);
        set_opt(&mut config.pubsub.emulator_host, &self.emulator_host);
        set_opt(&mut config.pubsub.access_token, &self.access_token);

        set_opt(&mut config.store.database_url, &self.database_url);
        set(&mut config.store.host, &self.pg_host);
        set(&mut config.store.port, &self.pg_port);
        set_opt(&mut config.store.user, &self.pg_user);
        set_opt(&mut config.store.password, &self.pg_password);
        set_opt(&mut config.store.database, &self.pg_database);
    }
}

// ---- TOML Config ----

#[derive(Debug, Default, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub store: PgStoreConfig,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub handler: HandlerConfig,
}

impl WorkerConfig {
    pub fn load(path: &str) -> Result<Self, WorkerError> {
        let content = std::fs::read_to_string(path).map_err(|e| WorkerError::Config {
            context: "read",
            detail: format!("'{path}': {e}"),
        })?;
        toml::from_str(&content).map_err(|e| WorkerError::Config {
            context: "parse",
            detail: format!("'{path}': {e}"),
        })
    }

    /// Config file (if any), then flags and environment on top.
    pub fn resolve(args: &CommonArgs) -> Result<Self, WorkerError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        args.apply(&mut config);
        config.pubsub.validate()?;
        config.coordinator.validate()?;
        Ok(config)
    }
}
