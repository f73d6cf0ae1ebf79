use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DbConfig;
use crate::error::{ConnectError, HealthError, TeardownError};

/// Self-reported liveness of a connection's underlying link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Error => "error",
        }
    }
}

/// An opaque, expensive-to-create handle to the database backend.
///
/// Cloning is cheap (handles are shared references to one underlying link),
/// which is what lets the cache hand the same connection to every caller.
#[async_trait]
pub trait Connection: Clone + Send + Sync + 'static {
    /// Identifier of the underlying link, stable for its lifetime.
    fn id(&self) -> Uuid;

    /// Current liveness state, fed by the driver's background heartbeats.
    /// Must not perform network I/O.
    fn state(&self) -> Result<LinkState, HealthError>;

    /// Round-trip liveness probe against the backend.
    async fn ping(&self) -> Result<(), HealthError>;

    /// Tear down the underlying link. Idempotent.
    async fn disconnect(&self) -> Result<(), TeardownError>;
}

/// Establishes connections for the cache's cold path.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    /// Perform the actual connection-establishment I/O, applying the
    /// configured pool bounds, timeouts, and durability options.
    async fn establish(&self, config: &DbConfig) -> Result<Self::Conn, ConnectError>;
}
