use thiserror::Error;

/// The connection target is missing or malformed. Fatal: no amount of
/// retrying will produce a usable connection.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MONGODB_URI must be set")]
    MissingUri,

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// A connection establishment attempt failed.
///
/// Recoverable: the cache clears its in-flight state on failure, so the
/// next `connect()` starts a fresh attempt. `Clone` because every caller
/// joined to the same attempt receives the same error.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    /// A connect, server-selection, or establishment-probe deadline was
    /// exceeded.
    #[error("database connection attempt timed out: {detail}")]
    Timeout { detail: String },

    /// Any other establishment failure (network, authentication, topology).
    #[error("failed to establish database connection: {detail}")]
    Establish { detail: String },
}

/// The liveness probe itself failed. Never propagated: `check_health`
/// folds this into the returned status.
#[derive(Debug, Clone, Error)]
#[error("liveness probe failed: {0}")]
pub struct HealthError(pub String);

/// Teardown of a prior connection failed. Non-fatal: `force_reconnect`
/// logs it and proceeds with the fresh attempt.
#[derive(Debug, Clone, Error)]
#[error("failed to tear down database connection: {0}")]
pub struct TeardownError(pub String);
