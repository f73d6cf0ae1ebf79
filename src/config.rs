use std::time::Duration;

use crate::error::ConfigError;

// Documented defaults, tuned for short-lived serverless processes: a small
// pool, aggressive idle reaping, bounded selection/connect deadlines.
pub const DEFAULT_MAX_POOL_SIZE: u32 = 10;
pub const DEFAULT_MIN_POOL_SIZE: u32 = 0;
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(60);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// Connection options for the marketplace database, constructed once at
/// process start and injected into the cache. Every field the establishment
/// path applies is an explicit, typed value here; nothing is read from the
/// environment after [`DbConfig::from_env`] returns.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection string, including credentials and replica-set options.
    pub uri: String,
    /// Upper bound on concurrently open physical links within one connection.
    pub max_pool_size: u32,
    /// Lower bound the driver keeps warm.
    pub min_pool_size: u32,
    /// Idle physical links are closed after this long.
    pub max_idle_time: Duration,
    /// Maximum time to locate a reachable replica before the attempt fails.
    pub server_selection_timeout: Duration,
    /// Per-link TCP connect deadline.
    pub connect_timeout: Duration,
    /// Deadline on the establishment liveness probe.
    pub socket_timeout: Duration,
    /// Interval of the driver's background liveness probes.
    pub heartbeat_frequency: Duration,
    /// Retry writes once at the transport layer on transient failure.
    pub retry_writes: bool,
    /// Require majority acknowledgment before a write is durable.
    pub write_concern_majority: bool,
}

impl DbConfig {
    /// Load configuration from the process environment (and `.env` in
    /// development). `MONGODB_URI` is required; everything else defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let uri = std::env::var("MONGODB_URI").map_err(|_| ConfigError::MissingUri)?;

        Ok(Self {
            uri,
            max_pool_size: env_u32("AGROLINK_DB_MAX_POOL_SIZE", DEFAULT_MAX_POOL_SIZE)?,
            min_pool_size: env_u32("AGROLINK_DB_MIN_POOL_SIZE", DEFAULT_MIN_POOL_SIZE)?,
            max_idle_time: env_secs("AGROLINK_DB_MAX_IDLE_SECS", DEFAULT_MAX_IDLE_TIME)?,
            server_selection_timeout: env_secs(
                "AGROLINK_DB_SERVER_SELECTION_TIMEOUT_SECS",
                DEFAULT_SERVER_SELECTION_TIMEOUT,
            )?,
            connect_timeout: env_secs("AGROLINK_DB_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT)?,
            socket_timeout: env_secs("AGROLINK_DB_SOCKET_TIMEOUT_SECS", DEFAULT_SOCKET_TIMEOUT)?,
            heartbeat_frequency: env_secs("AGROLINK_DB_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_FREQUENCY)?,
            retry_writes: env_bool("AGROLINK_DB_RETRY_WRITES", true)?,
            write_concern_majority: env_bool("AGROLINK_DB_WRITE_CONCERN_MAJORITY", true)?,
        })
    }

    /// Configuration with an explicit target and documented defaults for
    /// everything else. Used by embedders and tests.
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            min_pool_size: DEFAULT_MIN_POOL_SIZE,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            retry_writes: true,
            write_concern_majority: true,
        }
    }
}

fn env_u32(var: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_u32(var, &raw),
        Err(_) => Ok(default),
    }
}

fn env_secs(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_secs(var, &raw),
        Err(_) => Ok(default),
    }
}

fn env_bool(var: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_bool(var, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_u32(var: &str, raw: &str) -> Result<u32, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        var: var.to_string(),
        reason: format!("expected an integer, got '{raw}'"),
    })
}

fn parse_secs(var: &str, raw: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
        var: var.to_string(),
        reason: format!("expected a number of seconds, got '{raw}'"),
    })?;
    Ok(Duration::from_secs(secs))
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var: var.to_string(),
            reason: format!("expected true/false, got '{raw}'"),
        }),
    }
}
