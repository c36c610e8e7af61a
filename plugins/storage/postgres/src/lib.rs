use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use courier_api::{BoxFuture, CourierError, ErrorKind, ProcessedStore, WriteOutcome};

const SQL_CREATE: &str = include_str!("../sql/create_processed_messages.sql");

// ═══════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════

/// `[store]` section of the worker config.
///
/// Either `database_url` or the discrete connection fields. When `password`
/// or `database` are absent they default to `user`.
#[derive(Clone, Deserialize)]
pub struct PgStoreConfig {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Run `CREATE TABLE IF NOT EXISTS` from `init`.
    #[serde(default = "default_create_schema")]
    pub create_schema: bool,
}

fn default_host() -> String {
    "localhost".into()
}
fn default_port() -> u16 {
    5432
}
fn default_table() -> String {
    "processed_messages".into()
}
fn default_max_connections() -> u32 {
    8
}
fn default_acquire_timeout_secs() -> u64 {
    5
}
fn default_create_schema() -> bool {
    true
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: default_host(),
            port: default_port(),
            user: None,
            password: None,
            database: None,
            table: default_table(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            create_schema: default_create_schema(),
        }
    }
}

// Credentials stay out of logs.
impl fmt::Debug for PgStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStoreConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("table", &self.table)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("create_schema", &self.create_schema)
            .finish()
    }
}

impl PgStoreConfig {
    fn connect_options(&self) -> Result<PgConnectOptions, CourierError> {
        if let Some(url) = &self.database_url {
            return url
                .parse::<PgConnectOptions>()
                .map_err(|e| CourierError::config(format!("database_url: {e}")));
        }
        let user = self
            .user
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CourierError::config("store.user or store.database_url is required"))?;
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(user)
            .password(self.password.as_deref().unwrap_or(user))
            .database(self.database.as_deref().unwrap_or(user)))
    }
}

/// Accepts `name` or `schema.name`, each part a plain SQL identifier.
fn validate_table(table: &str) -> Result<(), CourierError> {
    let parts: Vec<&str> = table.split('.').collect();
    let valid_part = |p: &str| {
        let mut chars = p.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            && p.len() <= 63
    };
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(CourierError::config(format!("invalid table name '{table}'")));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
//  Error classification
// ═══════════════════════════════════════════════════════════════

/// Map a SQLSTATE code onto an error kind by its two-character class.
pub fn classify_sqlstate(code: &str) -> ErrorKind {
    match code.get(..2).unwrap_or("") {
        // connection exception, insufficient resources, operator intervention,
        // transaction rollback (serialization failure, deadlock)
        "08" | "53" | "57" | "40" => ErrorKind::Io,
        "28" => ErrorKind::Auth,
        "42" => ErrorKind::Schema,
        "23" => ErrorKind::Constraint,
        "22" => ErrorKind::Format,
        _ => ErrorKind::Logic,
    }
}

fn classify(err: sqlx::Error) -> CourierError {
    let kind = match &err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| classify_sqlstate(&code))
            .unwrap_or(ErrorKind::Logic),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => ErrorKind::Io,
        sqlx::Error::Configuration(_) => ErrorKind::Config,
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::Encode(_) => {
            ErrorKind::Format
        }
        _ => ErrorKind::Logic,
    };
    CourierError {
        kind,
        message: err.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════
//  PgStore
// ═══════════════════════════════════════════════════════════════

/// PostgreSQL `ProcessedStore`.
///
/// The primary key on `message_id` provides the uniqueness guarantee;
/// `INSERT ... ON CONFLICT DO NOTHING` reports a duplicate as zero affected
/// rows.
pub struct PgStore {
    pool: PgPool,
    table: String,
    create_schema: bool,
    insert_sql: String,
}

impl PgStore {
    /// Build a lazily connecting pool. No connection is attempted until the
    /// first query; use `ping` to fail fast.
    pub fn new(config: &PgStoreConfig) -> Result<Self, CourierError> {
        validate_table(&config.table)?;
        if config.max_connections == 0 {
            return Err(CourierError::config("store.max_connections must be at least 1"));
        }
        let options = config.connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            insert_sql: format!(
                "INSERT INTO {} (message_id, payload) VALUES ($1, $2) ON CONFLICT (message_id) DO NOTHING",
                config.table
            ),
            table: config.table.clone(),
            create_schema: config.create_schema,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl ProcessedStore for PgStore {
    fn ping(&self) -> BoxFuture<'_, Result<(), CourierError>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|e| classify(e).with_context("postgres ping"))?;
            Ok(())
        })
    }

    fn init(&self) -> BoxFuture<'_, Result<(), CourierError>> {
        Box::pin(async move {
            if !self.create_schema {
                return Ok(());
            }
            let sql = SQL_CREATE.replace("{table}", &self.table);
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| classify(e).with_context("postgres create table"))?;
            tracing::info!(table = %self.table, "processed messages table ready");
            Ok(())
        })
    }

    fn record_if_absent<'a>(
        &'a self,
        id: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<WriteOutcome, CourierError>> {
        Box::pin(async move {
            let result = sqlx::query(&self.insert_sql)
                .bind(id)
                .bind(payload)
                .execute(&self.pool)
                .await
                .map_err(|e| classify(e).with_context("postgres insert"))?;

            if result.rows_affected() == 0 {
                Ok(WriteOutcome::AlreadyPresent)
            } else {
                Ok(WriteOutcome::Inserted)
            }
        })
    }
}
