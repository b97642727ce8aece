use std::time::Duration;

use serde::Deserialize;
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::{Error, Result, executor::PartitionBinding};

const ENV_PREFIX: &str = "TENANTRY_";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub auth: AuthConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Per-statement ceiling applied inside every scoped operation.
    #[serde(with = "humantime_serde")]
    pub statement_timeout: Option<Duration>,
    /// Schemas appended after the tenant partition in `search_path`. Empty keeps every
    /// unqualified name inside the partition.
    pub base_search_path: Vec<String>,
    pub binding: PartitionBinding,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            statement_timeout: None,
            base_search_path: Vec::new(),
            binding: PartitionBinding::default(),
        }
    }
}

impl DatabaseConfig {
    pub async fn connect_pool(&self) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.url)
            .await?;
        Ok(pool)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Schema holding the durable broker tables.
    pub schema: String,
    /// Publishing/consuming service name; used as `source` and as the queue prefix.
    pub service: String,
    pub prefetch: u32,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub lease: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            service: "tenantry".to_string(),
            prefetch: 16,
            poll_interval: Duration::from_millis(250),
            lease: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl BrokerConfig {
    /// `<service>.<family>-events`, e.g. `inventory.user-events`.
    pub fn queue_name(&self, family: &str) -> String {
        format!("{}.{}-events", self.service, family)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("dlq.{}", self.service)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub issuer: String,
    #[serde(with = "humantime_serde")]
    pub access_ttl: Duration,
    /// Accept tokens minted before tenant claims existed. Transitional.
    pub allow_legacy_claims: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: "tenantry".to_string(),
            access_ttl: Duration::from_secs(15 * 60),
            allow_legacy_claims: false,
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("access_ttl", &self.access_ttl)
            .field("allow_legacy_claims", &self.allow_legacy_claims)
            .finish()
    }
}

impl Config {
    /// Defaults overlaid with `TENANTRY_*` variables, after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            get_env(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };
        let mut cfg = Self::default();

        if let Some(url) = var("DATABASE_URL").or_else(|| get_env("DATABASE_URL")) {
            cfg.database.url = url;
        }
        if let Some(raw) = var("DATABASE_MAX_CONNECTIONS") {
            cfg.database.max_connections = parse_number("DATABASE_MAX_CONNECTIONS", &raw)?;
        }
        if let Some(raw) = var("DATABASE_ACQUIRE_TIMEOUT") {
            cfg.database.acquire_timeout = parse_duration("DATABASE_ACQUIRE_TIMEOUT", &raw)?;
        }
        if let Some(raw) = var("DATABASE_STATEMENT_TIMEOUT") {
            cfg.database.statement_timeout =
                Some(parse_duration("DATABASE_STATEMENT_TIMEOUT", &raw)?);
        }
        if let Some(raw) = var("DATABASE_BASE_SEARCH_PATH") {
            cfg.database.base_search_path = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = var("DATABASE_BINDING") {
            cfg.database.binding = raw.parse()?;
        }

        if let Some(schema) = var("BROKER_SCHEMA") {
            cfg.broker.schema = schema;
        }
        if let Some(service) = var("SERVICE_NAME") {
            cfg.broker.service = service;
        }
        if let Some(raw) = var("BROKER_PREFETCH") {
            cfg.broker.prefetch = parse_number("BROKER_PREFETCH", &raw)?;
        }
        if let Some(raw) = var("BROKER_POLL_INTERVAL") {
            cfg.broker.poll_interval = parse_duration("BROKER_POLL_INTERVAL", &raw)?;
        }
        if let Some(raw) = var("BROKER_LEASE") {
            cfg.broker.lease = parse_duration("BROKER_LEASE", &raw)?;
        }
        if let Some(raw) = var("BROKER_MAX_RETRIES") {
            cfg.broker.max_retries = parse_number("BROKER_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = var("BROKER_RETRY_BACKOFF") {
            cfg.broker.retry_backoff = parse_duration("BROKER_RETRY_BACKOFF", &raw)?;
        }

        if let Some(raw) = var("CONSUMER_SHUTDOWN_GRACE") {
            cfg.consumer.shutdown_grace = parse_duration("CONSUMER_SHUTDOWN_GRACE", &raw)?;
        }

        if let Some(secret) = var("JWT_SECRET") {
            cfg.auth.jwt_secret = secret;
        }
        if let Some(issuer) = var("JWT_ISSUER") {
            cfg.auth.issuer = issuer;
        }
        if let Some(raw) = var("ACCESS_TOKEN_TTL") {
            cfg.auth.access_ttl = parse_duration("ACCESS_TOKEN_TTL", &raw)?;
        }
        if let Some(raw) = var("ALLOW_LEGACY_CLAIMS") {
            cfg.auth.allow_legacy_claims = parse_bool("ALLOW_LEGACY_CLAIMS", &raw)?;
        }

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(Error::Config("database url is required".into()));
        }
        if self.database.max_connections == 0 {
            return Err(Error::Config("database max_connections must be > 0".into()));
        }
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(Error::Config("jwt secret is required".into()));
        }
        if self.broker.max_retries == 0 {
            return Err(Error::Config("broker max_retries must be > 0".into()));
        }
        if self.broker.prefetch == 0 {
            return Err(Error::Config("broker prefetch must be > 0".into()));
        }
        if self.broker.service.trim().is_empty() {
            return Err(Error::Config("service name is required".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{ENV_PREFIX}{key} must be a number, got '{raw}'")))
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(raw.trim())
        .map_err(|e| Error::Config(format!("{ENV_PREFIX}{key}: {e}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{ENV_PREFIX}{key} must be a boolean, got '{other}'"
        ))),
    }
}
