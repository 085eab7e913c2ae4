// Live server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own sizing variables in
// `db::pool`.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEV_JWT_SECRET: &str = "quire_local_development_jwt_secret_must_be_32_chars";
pub const DEV_BROADCAST_SECRET: &str = "quire_local_development_broadcast_secret";

const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_MAX_DEBOUNCE_MS: u64 = 10_000;
const DEFAULT_MAX_UPDATE_BYTES: usize = 1024 * 1024;
const DEFAULT_MAX_DOCUMENT_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

/// Cross-process transport used by the broadcast backplane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackplaneKind {
    None,
    Memory,
    Postgres,
}

impl BackplaneKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "" => Some(Self::None),
            "memory" => Some(Self::Memory),
            "postgres" | "pg" => Some(Self::Postgres),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Memory => "memory",
            Self::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Timing and size limits for document sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Quiet period after the last local edit before saving.
    pub debounce: Duration,
    /// Upper bound between the first unsaved edit and its save.
    pub max_debounce: Duration,
    /// How long an empty, flushed session stays cached.
    pub teardown_grace: Duration,
    /// Largest single incoming update accepted from a client.
    pub max_update_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            max_debounce: Duration::from_millis(DEFAULT_MAX_DEBOUNCE_MS),
            teardown_grace: Duration::ZERO,
            max_update_bytes: DEFAULT_MAX_UPDATE_BYTES,
        }
    }
}

/// WebSocket liveness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between server pings.
    pub interval: Duration,
    /// Extra wait after a missed ping before the connection is dropped.
    pub timeout: Duration,
}

impl HeartbeatConfig {
    /// Longest a connection may go without a pong.
    pub fn deadline(&self) -> Duration {
        self.interval + self.timeout
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
        }
    }
}

/// Core live server configuration.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub listen_addr: SocketAddr,
    pub jwt_secret: String,
    /// Shared secret for `POST /broadcast`.
    pub broadcast_secret: String,
    /// PostgreSQL connection string; memory stores are used without it.
    pub database_url: Option<String>,
    /// Accept non-TLS PostgreSQL connections (local development only).
    pub db_allow_insecure: bool,
    pub backplane: BackplaneKind,
    pub session: SessionConfig,
    pub heartbeat: HeartbeatConfig,
    /// Largest persisted snapshot the store accepts.
    pub max_document_bytes: usize,
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl LiveConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `QUIRE_LIVE_HOST` | `0.0.0.0` |
    /// | `QUIRE_LIVE_PORT` | `3100` |
    /// | `QUIRE_LIVE_JWT_SECRET` | dev-only placeholder |
    /// | `QUIRE_LIVE_BROADCAST_SECRET` | dev-only placeholder |
    /// | `QUIRE_LIVE_DATABASE_URL` | *(none)* |
    /// | `QUIRE_LIVE_DB_ALLOW_INSECURE` | `false` |
    /// | `QUIRE_LIVE_BACKPLANE` | `postgres` with a database, else `none` |
    /// | `QUIRE_LIVE_DEBOUNCE_MS` | `2000` |
    /// | `QUIRE_LIVE_MAX_DEBOUNCE_MS` | `10000` |
    /// | `QUIRE_LIVE_TEARDOWN_GRACE_MS` | `0` |
    /// | `QUIRE_LIVE_MAX_UPDATE_BYTES` | `1048576` |
    /// | `QUIRE_LIVE_MAX_DOCUMENT_BYTES` | `8388608` |
    /// | `QUIRE_LIVE_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `QUIRE_LIVE_HEARTBEAT_TIMEOUT_MS` | `10000` |
    /// | `QUIRE_LIVE_LOG_FILTER` | `info` |
    /// | `QUIRE_LIVE_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("QUIRE_LIVE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("QUIRE_LIVE_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(3100);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("QUIRE_LIVE_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let broadcast_secret =
            env("QUIRE_LIVE_BROADCAST_SECRET").unwrap_or_else(|_| DEV_BROADCAST_SECRET.into());

        let database_url = env("QUIRE_LIVE_DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let db_allow_insecure = env("QUIRE_LIVE_DB_ALLOW_INSECURE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let default_backplane =
            if database_url.is_some() { BackplaneKind::Postgres } else { BackplaneKind::None };
        let backplane = env("QUIRE_LIVE_BACKPLANE")
            .ok()
            .and_then(|v| BackplaneKind::parse(&v))
            .unwrap_or(default_backplane);

        let millis = |key: &str, default: u64| {
            Duration::from_millis(env(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
        };
        let bytes = |key: &str, default: usize| {
            env(key).ok().and_then(|v| v.parse().ok()).filter(|v| *v > 0).unwrap_or(default)
        };

        let debounce = millis("QUIRE_LIVE_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS);
        let max_debounce = millis("QUIRE_LIVE_MAX_DEBOUNCE_MS", DEFAULT_MAX_DEBOUNCE_MS).max(debounce);
        let session = SessionConfig {
            debounce,
            max_debounce,
            teardown_grace: millis("QUIRE_LIVE_TEARDOWN_GRACE_MS", 0),
            max_update_bytes: bytes("QUIRE_LIVE_MAX_UPDATE_BYTES", DEFAULT_MAX_UPDATE_BYTES),
        };

        // A zero ping period is not a valid interval.
        let ping_every = env("QUIRE_LIVE_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        let heartbeat = HeartbeatConfig {
            interval: Duration::from_millis(ping_every),
            timeout: millis("QUIRE_LIVE_HEARTBEAT_TIMEOUT_MS", DEFAULT_HEARTBEAT_TIMEOUT_MS),
        };

        let log_filter = env("QUIRE_LIVE_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("QUIRE_LIVE_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            jwt_secret,
            broadcast_secret,
            database_url,
            db_allow_insecure,
            backplane,
            session,
            heartbeat,
            max_document_bytes: bytes("QUIRE_LIVE_MAX_DOCUMENT_BYTES", DEFAULT_MAX_DOCUMENT_BYTES),
            log_filter,
            log_format,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn is_dev_broadcast_secret(&self) -> bool {
        self.broadcast_secret == DEV_BROADCAST_SECRET
    }
}
