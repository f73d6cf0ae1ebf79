//! The connection cache: one memoized database connection per process.
//!
//! State lives in a single [`Slot`] behind a mutex. The lock is only ever
//! held to read or swap the slot, never across an await; the establishment
//! attempt itself is a [`Shared`] future that every concurrent cold caller
//! awaits, so at most one attempt is in flight at a time and all joiners
//! observe the same outcome.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::config::DbConfig;
use crate::conn::{Connection, Connector, LinkState};
use crate::error::{ConnectError, HealthError};
use crate::health::HealthStatus;

type Attempt<C> = Shared<BoxFuture<'static, Result<C, ConnectError>>>;

/// The process-wide cache slot: the warm handle plus any in-flight attempt.
///
/// Invariants:
/// - `pending` is `Some` only while an establishment attempt is
///   outstanding; it is cleared on success and on failure.
/// - `handle` is written only from a successful resolution of `pending`.
struct Slot<C> {
    handle: Option<C>,
    pending: Option<Attempt<C>>,
}

/// Serverless-aware connection cache.
///
/// Construct one per process (typically at startup, from
/// [`DbConfig::from_env`]) and share it with every request handler via
/// `Arc`. Warm calls to [`connect`](Self::connect) are lock-and-clone, no
/// I/O; cold calls pay for establishment once regardless of how many
/// callers race in.
pub struct ConnectionCache<B: Connector> {
    connector: Arc<B>,
    config: Arc<DbConfig>,
    slot: Mutex<Slot<B::Conn>>,
}

impl<B: Connector> ConnectionCache<B> {
    pub fn new(connector: B, config: DbConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config: Arc::new(config),
            slot: Mutex::new(Slot {
                handle: None,
                pending: None,
            }),
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Resolve a ready-to-use connection.
    ///
    /// Warm path: the memoized handle is returned immediately. Cold path:
    /// joins the in-flight attempt if one exists, otherwise installs a new
    /// one. A failed attempt clears `pending` (never the previous handle),
    /// so the next call retries from scratch; every caller joined to the
    /// same attempt receives the same connection or the same error.
    pub async fn connect(&self) -> Result<B::Conn, ConnectError> {
        let attempt = {
            let mut slot = self.slot();
            if let Some(conn) = slot.handle.as_ref() {
                return Ok(conn.clone());
            }
            match slot.pending.as_ref() {
                Some(attempt) => {
                    tracing::debug!("joining in-flight database connection attempt");
                    attempt.clone()
                }
                None => {
                    let attempt = self.begin_attempt();
                    slot.pending = Some(attempt.clone());
                    attempt
                }
            }
        };

        self.resolve(attempt).await
    }

    /// Liveness snapshot. Pure observation: never connects, never mutates
    /// the slot, never suspends on network I/O.
    pub fn check_health(&self) -> HealthStatus {
        let handle = self.slot().handle.clone();
        let Some(conn) = handle else {
            return HealthStatus::down(LinkState::Disconnected);
        };
        match conn.state() {
            Ok(LinkState::Connected) => HealthStatus::up(),
            Ok(state) => HealthStatus::down(state),
            Err(err) => {
                tracing::warn!(error = %err, "database liveness probe failed");
                HealthStatus::probe_error(err)
            }
        }
    }

    /// Active round-trip check of the cached connection, for callers that
    /// suspect a silently dropped link before escalating to
    /// [`force_reconnect`](Self::force_reconnect). Unlike
    /// [`check_health`](Self::check_health) this performs network I/O, but
    /// it still never connects and never mutates the slot; a cold cache
    /// has nothing to ping and reports that as an error.
    pub async fn ping(&self) -> Result<(), HealthError> {
        let handle = self.slot().handle.clone();
        match handle {
            Some(conn) => conn.ping().await,
            None => Err(HealthError("no connection established".to_string())),
        }
    }

    /// Deliberate invalidation path: discard the cached handle and any
    /// in-flight attempt, tear down the prior connection if it still
    /// reports itself connected, then establish a fresh one.
    ///
    /// Callers already awaiting the discarded attempt still observe its
    /// original outcome; it is simply no longer the cache's current state.
    pub async fn force_reconnect(&self) -> Result<B::Conn, ConnectError> {
        let prior = {
            let mut slot = self.slot();
            slot.pending = None;
            slot.handle.take()
        };

        if let Some(conn) = prior {
            if matches!(conn.state(), Ok(LinkState::Connected)) {
                tracing::info!(connection_id = %conn.id(), "tearing down prior database connection");
                if let Err(err) = conn.disconnect().await {
                    // Teardown failure must not block recovery.
                    tracing::warn!(error = %err, "prior connection teardown failed");
                }
            }
        }

        self.connect().await
    }

    fn begin_attempt(&self) -> Attempt<B::Conn> {
        let connector = Arc::clone(&self.connector);
        let config = Arc::clone(&self.config);
        async move {
            tracing::debug!("establishing database connection");
            match connector.establish(&config).await {
                Ok(conn) => {
                    tracing::info!(connection_id = %conn.id(), "✓ database connection established");
                    Ok(conn)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "database connection attempt failed");
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn resolve(&self, attempt: Attempt<B::Conn>) -> Result<B::Conn, ConnectError> {
        let outcome = attempt.clone().await;

        let mut slot = self.slot();
        // Only the attempt still installed may write the slot: a
        // force_reconnect racing us has already invalidated this one, and
        // a late resolver must not reinstall stale state.
        if slot.pending.as_ref().is_some_and(|p| p.ptr_eq(&attempt)) {
            slot.pending = None;
            if let Ok(conn) = &outcome {
                slot.handle = Some(conn.clone());
            }
        }

        outcome
    }

    fn slot(&self) -> MutexGuard<'_, Slot<B::Conn>> {
        // A panic while holding the lock leaves the slot consistent (plain
        // Option swaps), so recover from poisoning instead of unwrapping.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::error::{HealthError, TeardownError};

    #[derive(Clone, Debug)]
    struct StubConnection {
        id: Uuid,
        state: Arc<RwLock<LinkState>>,
        poison_probe: Arc<AtomicBool>,
        fail_teardown: Arc<AtomicBool>,
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for StubConnection {
        fn id(&self) -> Uuid {
            self.id
        }

        fn state(&self) -> Result<LinkState, HealthError> {
            if self.poison_probe.load(Ordering::SeqCst) {
                return Err(HealthError("probe exploded".to_string()));
            }
            Ok(*self.state.read().unwrap())
        }

        async fn ping(&self) -> Result<(), HealthError> {
            if self.poison_probe.load(Ordering::SeqCst) {
                return Err(HealthError("probe exploded".to_string()));
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TeardownError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            if self.fail_teardown.load(Ordering::SeqCst) {
                return Err(TeardownError("shutdown refused".to_string()));
            }
            *self.state.write().unwrap() = LinkState::Disconnected;
            Ok(())
        }
    }

    struct StubConnector {
        attempts: Arc<AtomicUsize>,
        failures_remaining: Arc<AtomicUsize>,
        fail_with_timeout: bool,
        delay: Duration,
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for StubConnector {
        type Conn = StubConnection;

        async fn establish(&self, _config: &DbConfig) -> Result<StubConnection, ConnectError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failed = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(if self.fail_with_timeout {
                    ConnectError::Timeout {
                        detail: "server selection timed out".to_string(),
                    }
                } else {
                    ConnectError::Establish {
                        detail: "connection refused".to_string(),
                    }
                });
            }
            Ok(StubConnection {
                id: Uuid::new_v4(),
                state: Arc::new(RwLock::new(LinkState::Connected)),
                poison_probe: Arc::new(AtomicBool::new(false)),
                fail_teardown: Arc::new(AtomicBool::new(false)),
                disconnects: self.disconnects.clone(),
            })
        }
    }

    struct Counters {
        attempts: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "agrolink_db=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    fn cache_with(
        failures: usize,
        fail_with_timeout: bool,
        delay: Duration,
    ) -> (Arc<ConnectionCache<StubConnector>>, Counters) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let connector = StubConnector {
            attempts: attempts.clone(),
            failures_remaining: Arc::new(AtomicUsize::new(failures)),
            fail_with_timeout,
            delay,
            disconnects: disconnects.clone(),
        };
        let cache = Arc::new(ConnectionCache::new(
            connector,
            DbConfig::from_uri("mongodb://localhost:27017/agrolink"),
        ));
        (cache, Counters { attempts, disconnects })
    }

    #[tokio::test]
    async fn warm_path_reuses_the_memoized_handle() {
        init_tracing();
        let (cache, counters) = cache_with(0, false, Duration::ZERO);

        let first = cache.connect().await.unwrap();
        let second = cache.connect().await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cold_callers_share_one_attempt() {
        init_tracing();
        let (cache, counters) = cache_with(0, false, Duration::from_millis(50));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.connect().await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id());
        }

        assert_eq!(counters.attempts.load(Ordering::SeqCst), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn joined_callers_all_observe_the_same_failure() {
        let (cache, counters) = cache_with(1, false, Duration::from_millis(50));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.connect().await })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, ConnectError::Establish { .. }));
        }
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_clears_pending_and_leaves_retry_possible() {
        let (cache, counters) = cache_with(1, false, Duration::ZERO);

        let err = cache.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Establish { .. }));
        // The failed attempt never populated the handle.
        assert_eq!(cache.check_health().state, LinkState::Disconnected);

        // Next call starts a fresh attempt rather than hanging or
        // replaying the stale error.
        let conn = cache.connect().await.unwrap();
        assert_eq!(conn.state().unwrap(), LinkState::Connected);
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_then_reachable_target_succeeds() {
        let (cache, counters) = cache_with(1, true, Duration::ZERO);

        let err = cache.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Timeout { .. }));

        let conn = cache.connect().await.unwrap();
        assert_eq!(conn.state().unwrap(), LinkState::Connected);
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_reconnect_replaces_handle_and_tears_down_prior() {
        let (cache, counters) = cache_with(0, false, Duration::ZERO);

        let first = cache.connect().await.unwrap();
        let second = cache.force_reconnect().await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 2);
        assert!(cache.check_health().connected);

        // The new handle is now the warm one.
        assert_eq!(cache.connect().await.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn force_reconnect_skips_teardown_of_a_dead_link() {
        let (cache, counters) = cache_with(0, false, Duration::ZERO);

        let first = cache.connect().await.unwrap();
        // Simulate the backend silently dropping the link.
        *first.state.write().unwrap() = LinkState::Disconnected;

        let second = cache.force_reconnect().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn force_reconnect_survives_teardown_failure() {
        let (cache, counters) = cache_with(0, false, Duration::ZERO);

        let first = cache.connect().await.unwrap();
        first.fail_teardown.store(true, Ordering::SeqCst);

        // Teardown of the prior connection fails, but recovery proceeds.
        let second = cache.force_reconnect().await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
        assert!(cache.check_health().connected);
        assert_eq!(cache.connect().await.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn check_health_reflects_monitored_state_changes() {
        let (cache, _counters) = cache_with(0, false, Duration::ZERO);

        let conn = cache.connect().await.unwrap();
        assert!(cache.check_health().connected);

        // Background monitoring marks the link bad between requests.
        *conn.state.write().unwrap() = LinkState::Error;

        let status = cache.check_health();
        assert!(!status.connected);
        assert_eq!(status.state, LinkState::Error);
        assert!(status.detail.is_none());
    }

    #[tokio::test]
    async fn ping_round_trips_the_cached_connection() {
        let (cache, counters) = cache_with(0, false, Duration::ZERO);

        // A cold cache has nothing to ping, and pinging must not connect.
        assert!(cache.ping().await.is_err());
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 0);

        let conn = cache.connect().await.unwrap();
        assert!(cache.ping().await.is_ok());

        conn.poison_probe.store(true, Ordering::SeqCst);
        assert!(cache.ping().await.is_err());

        // The failed round trip mutated nothing.
        assert_eq!(cache.connect().await.unwrap().id(), conn.id());
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn check_health_never_initiates_a_connection() {
        let (cache, counters) = cache_with(0, false, Duration::ZERO);

        let status = cache.check_health();
        assert_eq!(
            status,
            HealthStatus {
                connected: false,
                state: LinkState::Disconnected,
                detail: None
            }
        );
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 0);

        // And observing health after a connect changes nothing.
        let conn = cache.connect().await.unwrap();
        assert!(cache.check_health().connected);
        assert_eq!(cache.connect().await.unwrap().id(), conn.id());
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn check_health_folds_probe_failure_into_the_status() {
        let (cache, _counters) = cache_with(0, false, Duration::ZERO);

        let conn = cache.connect().await.unwrap();
        conn.poison_probe.store(true, Ordering::SeqCst);

        let status = cache.check_health();
        assert!(!status.connected);
        assert_eq!(status.state, LinkState::Error);
        assert!(status.detail.unwrap().contains("probe exploded"));

        // The failing probe did not evict the handle.
        conn.poison_probe.store(false, Ordering::SeqCst);
        assert!(cache.check_health().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_detaches_the_in_flight_attempt() {
        let (cache, counters) = cache_with(0, false, Duration::from_millis(50));

        let joiner = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.connect().await })
        };
        // Let the joiner install the attempt before invalidating it.
        tokio::task::yield_now().await;

        let fresh = cache.force_reconnect().await.unwrap();
        let joined = joiner.await.unwrap().unwrap();

        // The joiner keeps its original outcome; the cache keeps the fresh
        // post-invalidation connection.
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 2);
        assert_ne!(joined.id(), fresh.id());
        assert_eq!(cache.connect().await.unwrap().id(), fresh.id());
    }
}
