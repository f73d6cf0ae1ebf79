//! Production connector over the MongoDB driver.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::error::ErrorKind;
use mongodb::event::sdam::SdamEvent;
use mongodb::event::EventHandler;
use mongodb::options::{ClientOptions, WriteConcern};
use mongodb::Client;
use uuid::Uuid;

use crate::cache::ConnectionCache;
use crate::config::DbConfig;
use crate::conn::{Connection, Connector, LinkState};
use crate::error::{ConfigError, ConnectError, HealthError, TeardownError};

/// The cache most of the backend wires up: [`ConnectionCache`] over the
/// MongoDB driver.
pub type MongoCache = ConnectionCache<MongoConnector>;

impl ConnectionCache<MongoConnector> {
    /// Cache targeting the database named by `MONGODB_URI`. Call once at
    /// process start; a missing target is fatal here rather than on the
    /// first request.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(MongoConnector, DbConfig::from_env()?))
    }
}

pub struct MongoConnector;

#[async_trait]
impl Connector for MongoConnector {
    type Conn = MongoConnection;

    async fn establish(&self, config: &DbConfig) -> Result<MongoConnection, ConnectError> {
        let mut options =
            ClientOptions::parse(&config.uri)
                .await
                .map_err(|e| ConnectError::Establish {
                    detail: format!("invalid connection string: {e}"),
                })?;
        apply(config, &mut options);

        let state = Arc::new(RwLock::new(LinkState::Connecting));
        monitor_link_state(&mut options, &state);

        let client = Client::with_options(options).map_err(classify)?;

        // The driver connects lazily; ping to force server selection so an
        // unreachable target fails the attempt here, not on the first query.
        let ping = async {
            client.database("admin").run_command(doc! { "ping": 1 }).await
        };
        let failure = match tokio::time::timeout(config.socket_timeout, ping).await {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(classify(err)),
            Err(_) => Some(ConnectError::Timeout {
                detail: format!(
                    "liveness ping did not complete within {:?}",
                    config.socket_timeout
                ),
            }),
        };
        if let Some(err) = failure {
            client.shutdown().await;
            return Err(err);
        }

        advance(&state, LinkState::Connected);

        Ok(MongoConnection {
            id: Uuid::new_v4(),
            client,
            state,
        })
    }
}

/// Feed the driver's background monitoring into the connection's
/// self-reported state, so `check_health` tracks backend liveness between
/// requests. Heartbeats fire at the configured `heartbeat_frequency`.
fn monitor_link_state(options: &mut ClientOptions, state: &Arc<RwLock<LinkState>>) {
    let state = Arc::clone(state);
    options.sdam_event_handler = Some(EventHandler::callback(move |event: SdamEvent| {
        let next = match &event {
            SdamEvent::ServerHeartbeatSucceeded(_) => Some(LinkState::Connected),
            SdamEvent::ServerHeartbeatFailed(_) => Some(LinkState::Error),
            SdamEvent::TopologyClosed(_) => Some(LinkState::Disconnected),
            _ => None,
        };
        if let Some(next) = next {
            advance(&state, next);
        }
    }));
}

/// Record a state observed by the driver's monitoring.
fn advance(state: &RwLock<LinkState>, next: LinkState) {
    if let Ok(mut current) = state.write() {
        if *current != next {
            tracing::debug!(
                from = current.as_str(),
                to = next.as_str(),
                "database link state changed"
            );
            *current = next;
        }
    }
}

/// Map [`DbConfig`] onto driver options.
fn apply(config: &DbConfig, options: &mut ClientOptions) {
    options.max_pool_size = Some(config.max_pool_size);
    options.min_pool_size = Some(config.min_pool_size);
    options.max_idle_time = Some(config.max_idle_time);
    options.server_selection_timeout = Some(config.server_selection_timeout);
    options.connect_timeout = Some(config.connect_timeout);
    options.heartbeat_freq = Some(config.heartbeat_frequency);
    options.retry_writes = Some(config.retry_writes);
    if config.write_concern_majority {
        options.write_concern = Some(WriteConcern::majority());
    }
}

fn classify(err: mongodb::error::Error) -> ConnectError {
    match err.kind.as_ref() {
        ErrorKind::ServerSelection { message, .. } => ConnectError::Timeout {
            detail: message.clone(),
        },
        ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => ConnectError::Timeout {
            detail: io.to_string(),
        },
        _ => ConnectError::Establish {
            detail: err.to_string(),
        },
    }
}

/// A pooled link to the marketplace database. Clones share one underlying
/// driver client and one self-reported link state.
#[derive(Clone, Debug)]
pub struct MongoConnection {
    id: Uuid,
    client: Client,
    state: Arc<RwLock<LinkState>>,
}

impl MongoConnection {
    /// The underlying driver client, for issuing queries.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Connection for MongoConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> Result<LinkState, HealthError> {
        self.state
            .read()
            .map(|s| *s)
            .map_err(|_| HealthError("connection state lock poisoned".to_string()))
    }

    async fn ping(&self) -> Result<(), HealthError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| HealthError(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TeardownError> {
        if let Ok(mut state) = self.state.write() {
            *state = LinkState::Disconnected;
        }
        // shutdown() consumes a client; clones share the same topology.
        self.client.clone().shutdown().await;
        Ok(())
    }
}
