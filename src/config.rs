use std::{str::FromStr, time::Duration};

use anyhow::{anyhow, Context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// Membership and fan-out live in this process only.
    Local,
    /// Events are relayed between processes through the shared database.
    Relay,
}

impl FromStr for BrokerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "relay" => Ok(Self::Relay),
            other => Err(anyhow!("unknown broker {other:?}, expected local or relay")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub ws_send_timeout: Duration,
    pub ws_queue_capacity: usize,
    pub broker: BrokerKind,
    pub relay_poll_interval: Duration,
    pub relay_retention: Duration,
    pub session_idle_minutes: i64,
    pub cors_origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_owned(),
            server_port: 8080,
            database_url: "sqlite://reconnect.db?mode=rwc".to_owned(),
            db_max_connections: 16,
            ws_send_timeout: Duration::from_millis(5000),
            ws_queue_capacity: 64,
            broker: BrokerKind::Local,
            relay_poll_interval: Duration::from_millis(250),
            relay_retention: Duration::from_secs(300),
            session_idle_minutes: 60,
            cors_origin: None,
        }
    }
}

fn var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match dotenv::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let ws_send_timeout_ms = var("WS_SEND_TIMEOUT_MS", defaults.ws_send_timeout.as_millis() as u64)?;
        let relay_poll_ms = var("RELAY_POLL_MS", defaults.relay_poll_interval.as_millis() as u64)?;
        let relay_retention_secs = var("RELAY_RETENTION_SECS", defaults.relay_retention.as_secs())?;

        let config = Self {
            server_host: var("SERVER_HOST", defaults.server_host)?,
            server_port: var("SERVER_PORT", defaults.server_port)?,
            database_url: var("DATABASE_URL", defaults.database_url)?,
            db_max_connections: var("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            ws_send_timeout: Duration::from_millis(ws_send_timeout_ms),
            ws_queue_capacity: var("WS_QUEUE_CAPACITY", defaults.ws_queue_capacity)?,
            broker: var("BROKER", defaults.broker)?,
            relay_poll_interval: Duration::from_millis(relay_poll_ms),
            relay_retention: Duration::from_secs(relay_retention_secs),
            session_idle_minutes: var("SESSION_IDLE_MINUTES", defaults.session_idle_minutes)?,
            cors_origin: dotenv::var("CORS_ORIGIN").ok().filter(|s| !s.trim().is_empty()),
        };

        if config.db_max_connections == 0 {
            return Err(anyhow!("DB_MAX_CONNECTIONS must be at least 1"));
        }
        if config.ws_queue_capacity == 0 {
            return Err(anyhow!("WS_QUEUE_CAPACITY must be at least 1"));
        }
        if config.relay_poll_interval.is_zero() {
            return Err(anyhow!("RELAY_POLL_MS must be at least 1"));
        }

        Ok(config)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn cors_origin_header(&self) -> anyhow::Result<Option<axum::http::HeaderValue>> {
        self.cors_origin
            .as_deref()
            .map(|origin| origin.parse().context("invalid CORS_ORIGIN"))
            .transpose()
    }
}
