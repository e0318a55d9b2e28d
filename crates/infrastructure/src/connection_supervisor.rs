use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::{MultiplexedConnection, PubSub};
use redis::Client;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

use forestshield_core::{MonitoringError, MonitoringResult, RedisConfig};

/// Aggregated state of the three logical store connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

struct StoreConnections {
    command: MultiplexedConnection,
    publish: MultiplexedConnection,
    subscribe: Arc<Mutex<PubSub>>,
}

/// Supervises the three logical Redis connections (command, publish,
/// subscribe) behind a single connection state machine.
///
/// When no host is configured the supervisor stays uninitialized and the
/// system runs in degraded mode: lease and pub/sub operations report
/// unavailability while scheduling continues on in-process state.
pub struct RedisConnectionSupervisor {
    config: RedisConfig,
    state_tx: watch::Sender<ConnectionState>,
    connections: RwLock<Option<StoreConnections>>,
    /// Sticky failure flag. `failure_notify` alone would lose a report that
    /// lands while no health-check loop is waiting on it.
    failure_flag: AtomicBool,
    failure_notify: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisConnectionSupervisor {
    pub fn new(config: RedisConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Uninitialized);
        Arc::new(Self {
            config,
            state_tx,
            connections: RwLock::new(None),
            failure_flag: AtomicBool::new(false),
            failure_notify: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the supervision task off the critical startup path.
    ///
    /// Server readiness never blocks on store readiness; callers that need
    /// coordination can `wait_ready` with their own timeout.
    pub async fn initialize(self: &Arc<Self>) {
        let Some(url) = self.config.connection_url() else {
            info!("no redis host configured, coordination runs in degraded mode");
            return;
        };

        self.set_state(ConnectionState::Connecting);
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move { supervisor.supervise(url).await });
        self.tasks.lock().await.push(handle);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the aggregated state reaches `Ready`, or returns false
    /// on timeout / terminal state.
    pub async fn wait_ready(&self, wait: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let ready = async {
            loop {
                match *rx.borrow_and_update() {
                    ConnectionState::Ready => return true,
                    ConnectionState::Closed => return false,
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        timeout(wait, ready).await.unwrap_or(false)
    }

    /// Command connection for single-key operations. `None` unless ready.
    pub async fn command(&self) -> Option<MultiplexedConnection> {
        if self.state() != ConnectionState::Ready {
            return None;
        }
        self.connections
            .read()
            .await
            .as_ref()
            .map(|c| c.command.clone())
    }

    /// Publish and subscribe handles as a pair. `None` unless ready.
    pub async fn pubsub_pair(&self) -> Option<(MultiplexedConnection, Arc<Mutex<PubSub>>)> {
        if self.state() != ConnectionState::Ready {
            return None;
        }
        self.connections
            .read()
            .await
            .as_ref()
            .map(|c| (c.publish.clone(), Arc::clone(&c.subscribe)))
    }

    /// Publish-side connection only. `None` unless ready.
    pub async fn publisher(&self) -> Option<MultiplexedConnection> {
        if self.state() != ConnectionState::Ready {
            return None;
        }
        self.connections
            .read()
            .await
            .as_ref()
            .map(|c| c.publish.clone())
    }

    /// Lets operation sites (lease, publish) report a store error so the
    /// state machine degrades without waiting for the next health check.
    pub fn report_failure(&self, context: &str) {
        if self.state() == ConnectionState::Ready {
            warn!("store operation failure reported from {context}");
            self.failure_flag.store(true, Ordering::SeqCst);
            self.failure_notify.notify_waiters();
        }
    }

    /// Ordered shutdown: cancel supervision first (no dangling reconnect
    /// timers), then drop the three connections.
    pub async fn shutdown(&self) {
        self.set_state(ConnectionState::Closed);
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
        drop(tasks);
        if let Some(conns) = self.connections.write().await.take() {
            drop(conns.subscribe);
            drop(conns.publish);
            drop(conns.command);
            debug!("store connections released");
        }
        info!("connection supervisor closed");
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            debug!("store connection state -> {state}");
            self.state_tx.send_replace(state);
        }
    }

    async fn supervise(self: Arc<Self>, url: String) {
        let mut reconnect_attempt: u32 = 0;
        loop {
            if self.state() == ConnectionState::Closed {
                return;
            }
            match self.connect_all(&url).await {
                Ok(conns) => {
                    *self.connections.write().await = Some(conns);
                    reconnect_attempt = 0;
                    // Reports against the previous connection no longer apply.
                    self.failure_flag.store(false, Ordering::SeqCst);
                    self.set_state(ConnectionState::Ready);
                    info!("all store connections established, coordination ready");

                    self.run_health_checks().await;
                    if self.state() == ConnectionState::Closed {
                        return;
                    }
                    self.connections.write().await.take();
                    self.set_state(ConnectionState::Degraded);
                    warn!("store connection lost, entering degraded mode");
                }
                Err(e) => {
                    self.connections.write().await.take();
                    self.set_state(ConnectionState::Degraded);
                    error!("failed to establish store connections: {e}");
                }
            }

            reconnect_attempt += 1;
            if reconnect_attempt > self.config.max_reconnect_attempts {
                error!(
                    "giving up after {} reconnect attempts, coordination stays degraded until restart",
                    self.config.max_reconnect_attempts
                );
                return;
            }
            let delay = Duration::from_secs(
                (u64::from(reconnect_attempt) * self.config.reconnect_delay_seconds)
                    .min(self.config.reconnect_delay_cap_seconds),
            );
            warn!(
                "reconnecting to store in {}s (attempt {}/{})",
                delay.as_secs(),
                reconnect_attempt,
                self.config.max_reconnect_attempts
            );
            sleep(delay).await;
        }
    }

    /// Establishes command, publish and subscribe connections; aggregated
    /// readiness requires all three.
    async fn connect_all(&self, url: &str) -> MonitoringResult<StoreConnections> {
        let client = Client::open(url)
            .map_err(|e| MonitoringError::StoreUnavailable(format!("invalid redis url: {e}")))?;

        let command = self.connect_multiplexed(&client, "command").await?;
        let publish = self.connect_multiplexed(&client, "publish").await?;
        let subscribe = self.connect_pubsub(&client).await?;

        Ok(StoreConnections {
            command,
            publish,
            subscribe: Arc::new(Mutex::new(subscribe)),
        })
    }

    async fn connect_multiplexed(
        &self,
        client: &Client,
        label: &str,
    ) -> MonitoringResult<MultiplexedConnection> {
        let connect_timeout = Duration::from_secs(self.config.connection_timeout_seconds);
        let mut last_error = None;

        for attempt in 1..=self.config.max_retry_attempts {
            match timeout(connect_timeout, client.get_multiplexed_async_connection()).await {
                Ok(Ok(conn)) => {
                    if attempt > 1 {
                        debug!("{label} connection established on attempt {attempt}");
                    }
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    warn!("{label} connection attempt {attempt} failed: {e}");
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    warn!("{label} connection attempt {attempt} timed out");
                    last_error = Some("connection timed out".to_string());
                }
            }
            // Linear per-attempt backoff.
            sleep(Duration::from_secs(
                u64::from(attempt) * self.config.retry_delay_seconds,
            ))
            .await;
        }

        Err(MonitoringError::StoreUnavailable(format!(
            "{label} connection failed after {} attempts: {}",
            self.config.max_retry_attempts,
            last_error.unwrap_or_else(|| "unknown".to_string())
        )))
    }

    async fn connect_pubsub(&self, client: &Client) -> MonitoringResult<PubSub> {
        let connect_timeout = Duration::from_secs(self.config.connection_timeout_seconds);
        let mut last_error = None;

        for attempt in 1..=self.config.max_retry_attempts {
            match timeout(connect_timeout, client.get_async_pubsub()).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => {
                    warn!("subscribe connection attempt {attempt} failed: {e}");
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    warn!("subscribe connection attempt {attempt} timed out");
                    last_error = Some("connection timed out".to_string());
                }
            }
            sleep(Duration::from_secs(
                u64::from(attempt) * self.config.retry_delay_seconds,
            ))
            .await;
        }

        Err(MonitoringError::StoreUnavailable(format!(
            "subscribe connection failed after {} attempts: {}",
            self.config.max_retry_attempts,
            last_error.unwrap_or_else(|| "unknown".to_string())
        )))
    }

    /// Runs until a health check fails, a failure is reported, or shutdown.
    async fn run_health_checks(&self) {
        let mut ticker = interval(Duration::from_secs(
            self.config.health_check_interval_seconds.max(1),
        ));
        ticker.tick().await; // first tick completes immediately

        loop {
            if self.state() != ConnectionState::Ready {
                return;
            }
            if self.failure_flag.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(mut conn) = self.command().await else { return };
                    let result: redis::RedisResult<String> =
                        redis::cmd("PING").query_async(&mut conn).await;
                    match result {
                        Ok(_) => debug!("store health check ok"),
                        Err(e) => {
                            warn!("store health check failed: {e}");
                            return;
                        }
                    }
                }
                _ = self.failure_notify.notified() => {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> RedisConfig {
        RedisConfig::default()
    }

    #[tokio::test]
    async fn test_no_host_stays_uninitialized() {
        let supervisor = RedisConnectionSupervisor::new(offline_config());
        supervisor.initialize().await;
        assert_eq!(supervisor.state(), ConnectionState::Uninitialized);
        assert!(supervisor.command().await.is_none());
        assert!(supervisor.pubsub_pair().await.is_none());
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_in_degraded_mode() {
        let supervisor = RedisConnectionSupervisor::new(offline_config());
        supervisor.initialize().await;
        assert!(!supervisor.wait_ready(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_shutdown_reaches_closed() {
        let supervisor = RedisConnectionSupervisor::new(offline_config());
        supervisor.initialize().await;
        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), ConnectionState::Closed);
        assert!(!supervisor.wait_ready(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_reported_failure_outlives_missed_wakeup() {
        let supervisor = RedisConnectionSupervisor::new(offline_config());
        supervisor.set_state(ConnectionState::Ready);

        // Reported before any loop is waiting on the notification; the
        // health-check loop must still observe it instead of waiting a
        // full tick interval for PING to fail.
        supervisor.report_failure("lease refresh");
        let finished = timeout(Duration::from_secs(1), supervisor.run_health_checks()).await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_host_becomes_degraded() {
        let mut config = offline_config();
        config.host = Some("127.0.0.1".to_string());
        config.port = 1; // nothing listens here
        config.max_retry_attempts = 1;
        config.retry_delay_seconds = 0;
        config.connection_timeout_seconds = 1;

        let supervisor = RedisConnectionSupervisor::new(config);
        supervisor.initialize().await;

        let mut rx = supervisor.watch_state();
        let degraded = timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow_and_update() == ConnectionState::Degraded {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false);

        assert!(degraded);
        assert!(supervisor.command().await.is_none());
        supervisor.shutdown().await;
    }
}
