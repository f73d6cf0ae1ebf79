//! Serverless-aware database connection cache for the AgroLink marketplace
//! backend.
//!
//! Hosting processes follow a cold/warm lifecycle: a process may serve one
//! request and die, or be reused for thousands. Establishing a MongoDB
//! connection is expensive, so [`ConnectionCache`] memoizes one connection
//! per process, lets concurrent cold callers join a single in-flight
//! establishment attempt, and offers an explicit invalidation path
//! ([`ConnectionCache::force_reconnect`]) for recovery after failure.
//!
//! Request handlers call [`ConnectionCache::connect`] before touching the
//! database and treat its failure as a request-level error. Operational
//! tooling reads [`ConnectionCache::check_health`].

pub mod cache;
pub mod config;
pub mod conn;
pub mod error;
pub mod health;
pub mod mongo;

pub use cache::ConnectionCache;
pub use config::DbConfig;
pub use conn::{Connection, Connector, LinkState};
pub use error::{ConfigError, ConnectError, HealthError, TeardownError};
pub use health::HealthStatus;
pub use mongo::{MongoCache, MongoConnection, MongoConnector};
