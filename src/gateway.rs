//! Degrade-safe facade over the volatile cache.
//!
//! [`CacheGateway`] owns the one connection a process keeps to the cache and never lets a cache failure reach its
//! callers: a missing value, a broken connection, a slow server or a corrupt payload all end up as the operation's
//! neutral result (`None`, `0`, an empty list, `false`). Callers find out whether the cache is usable with
//! [`CacheGateway::is_available`] and pick another path if it isn't.
//!
//! Availability is an atomic flag owned by the gateway. Only connection-level errors drop it; a single slow call does
//! not. Once dropped, a supervisor task reconnects with exponential backoff and gives up after a bounded number of
//! attempts, leaving the gateway unavailable until the process restarts.
pub mod backend;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use fieldx::fxstruct;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::CacheError;
pub use backend::CacheBackend;
pub use backend::CacheConnector;

/// Used when no cache URL is configured in a development environment.
pub const DEFAULT_CACHE_URL: &str = "redis://localhost:6379";

#[derive(Clone, Debug)]
#[fxstruct(sync, no_new, default, builder, get(copy))]
pub struct GatewaySettings {
    /// Upper bound of a single cache call. Running out of it fails the call but keeps the gateway available.
    #[fieldx(default(Duration::from_secs(2)))]
    op_timeout: Duration,

    /// Upper bound of a single connection attempt.
    #[fieldx(default(Duration::from_secs(5)))]
    connect_timeout: Duration,

    /// First reconnection delay; doubles with every failed attempt.
    #[fieldx(default(Duration::from_millis(500)))]
    reconnect_base: Duration,

    #[fieldx(default(Duration::from_secs(30)))]
    reconnect_cap: Duration,

    /// Consecutive failed attempts after which the gateway stops trying.
    #[fieldx(default(10))]
    max_reconnect_attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayState {
    /// No connection target; the gateway never connects.
    Disabled,
    /// Initial connection is in progress.
    Connecting,
    Connected,
    /// The connection was lost; the supervisor is retrying.
    Reconnecting,
    /// Reconnection attempts are exhausted.
    GaveUp,
    Closed,
}

impl GatewayState {
    /// States the gateway doesn't leave on its own.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            GatewayState::Connected | GatewayState::Disabled | GatewayState::GaveUp | GatewayState::Closed
        )
    }
}

/// Decide which cache to connect to, if any.
///
/// An explicitly configured, non-blank URL is used as is. Without one, development environments fall back to
/// [`DEFAULT_CACHE_URL`] while others get no cache at all. The default URL is never accepted outside of development.
pub fn resolve_cache_target(url: Option<&str>, environment: &str) -> Option<String> {
    let development = is_development(environment);

    let url = match url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => url.to_string(),
        None if development => DEFAULT_CACHE_URL.to_string(),
        None => {
            warn!("No cache URL configured for '{environment}' environment; views will be written to the database directly");
            return None;
        }
    };

    if !development && url.trim_end_matches('/') == DEFAULT_CACHE_URL {
        warn!("Cache URL is the development default in '{environment}' environment; cache is disabled");
        return None;
    }

    Some(url)
}

pub fn is_development(environment: &str) -> bool {
    matches!(
        environment.trim().to_ascii_lowercase().as_str(),
        "development" | "dev" | "local" | "test"
    )
}

/// Delay before reconnection attempt number `attempt` (1-based): `base * 2^(attempt - 1)`, capped.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

enum SupervisorStep {
    Stop,
    Wait,
    Connect(Duration),
}

pub struct CacheGateway {
    settings:   GatewaySettings,
    connector:  Option<Arc<dyn CacheConnector>>,
    backend:    RwLock<Option<Arc<dyn CacheBackend>>>,
    available:  AtomicBool,
    // Failed connection attempts since the last successful one.
    attempts:   AtomicU32,
    state:      watch::Sender<GatewayState>,
    wakeup:     Arc<Notify>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl CacheGateway {
    fn new(settings: GatewaySettings, connector: Option<Arc<dyn CacheConnector>>, state: GatewayState) -> Self {
        Self {
            settings,
            connector,
            backend: RwLock::new(None),
            available: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            state: watch::Sender::new(state),
            wakeup: Arc::new(Notify::new()),
            supervisor: Mutex::new(None),
        }
    }

    /// A gateway that never connects. Every operation is a no-op.
    pub fn disabled(settings: GatewaySettings) -> Arc<Self> {
        info!("Cache gateway is disabled");
        Arc::new(Self::new(settings, None, GatewayState::Disabled))
    }

    /// Create a gateway and start connecting in the background. Must be called within a tokio runtime.
    pub fn start(connector: Arc<dyn CacheConnector>, settings: GatewaySettings) -> Arc<Self> {
        info!("Cache gateway connecting to {}", connector.target());
        let gateway = Arc::new(Self::new(settings, Some(Arc::clone(&connector)), GatewayState::Connecting));

        let handle = tokio::spawn(Self::supervise(
            Arc::downgrade(&gateway),
            connector,
            Arc::clone(&gateway.wakeup),
        ));
        *gateway.supervisor.lock() = Some(handle);

        gateway
    }

    /// Create a gateway for a target produced by [`resolve_cache_target`]. `None`, an unusable URL, or a build without
    /// a backend for it result in a disabled gateway.
    pub fn from_target(target: Option<&str>, settings: GatewaySettings) -> Arc<Self> {
        match target.and_then(Self::connector_for) {
            Some(connector) => Self::start(connector, settings),
            None => Self::disabled(settings),
        }
    }

    #[cfg(feature = "redis")]
    fn connector_for(target: &str) -> Option<Arc<dyn CacheConnector>> {
        match redis::RedisConnector::new(target) {
            Ok(connector) => Some(Arc::new(connector)),
            Err(err) => {
                error!("Cannot use cache target: {err}");
                None
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    fn connector_for(_target: &str) -> Option<Arc<dyn CacheConnector>> {
        warn!("Built without the 'redis' feature; cache target is ignored");
        None
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> GatewayState {
        *self.state.borrow()
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn target(&self) -> Option<String> {
        self.connector.as_ref().map(|c| c.target())
    }

    /// Wait until the gateway reaches a settled state or the timeout expires. Returns availability at that moment.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        let _ = tokio::time::timeout(timeout, state.wait_for(|s| s.is_settled())).await;
        self.is_available()
    }

    /// Fetch and deserialize a value. `None` on a miss, on a corrupt payload, or when the cache is unavailable.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self
            .call("get", key, |backend| async move { backend.get(key).await })
            .await
            .flatten()?;

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, "Cached value cannot be deserialized: {err}");
                None
            }
        }
    }

    /// Serialize and store a value. Returns `true` only if the value reached the cache.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        if !self.is_available() {
            return false;
        }

        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                error!(key, "Value cannot be serialized: {}", CacheError::from(err));
                return false;
            }
        };

        self.call("set", key, |backend| async move { backend.set(key, payload, ttl).await })
            .await
            .is_some()
    }

    pub async fn delete(&self, key: &str) {
        let keys = [key.to_string()];
        self.call("delete", key, |backend| async move { backend.del(&keys).await })
            .await;
    }

    /// Delete every key matching a glob pattern. Keys are enumerated first and deleted afterwards, so keys created in
    /// between survive. Returns the number of deleted keys.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let keys = self.get_keys(pattern).await;
        if keys.is_empty() {
            return 0;
        }

        self.call("delete_pattern", pattern, |backend| async move { backend.del(&keys).await })
            .await
            .unwrap_or(0)
    }

    /// Atomically increment a counter and return its new value, or `0` if the increment didn't happen.
    ///
    /// The TTL is attached only when the increment created the key, in a separate call. If that second call is lost
    /// the key never expires.
    pub async fn increment(&self, key: &str, ttl: Option<Duration>) -> i64 {
        let Some(value) = self
            .call("increment", key, |backend| async move { backend.incr(key).await })
            .await
        else {
            return 0;
        };

        if value == 1 {
            if let Some(ttl) = ttl {
                self.call("expire", key, |backend| async move { backend.expire(key, ttl).await })
                    .await;
            }
        }

        value
    }

    /// Atomically take `amount` off a counter, removing it once nothing is left. Returns the remaining value, or
    /// `None` if the call didn't happen.
    pub async fn decrement(&self, key: &str, amount: i64) -> Option<i64> {
        self.call("decrement", key, |backend| async move { backend.decr_by(key, amount).await })
            .await
    }

    pub async fn get_keys(&self, pattern: &str) -> Vec<String> {
        self.call("get_keys", pattern, |backend| async move { backend.keys(pattern).await })
            .await
            .unwrap_or_default()
    }

    /// Drop everything in the cache database.
    pub async fn clear(&self) {
        self.call("clear", "*", |backend| async move { backend.flush().await })
            .await;
    }

    /// Disconnect and stop reconnecting. The gateway stays unavailable afterwards.
    pub async fn close(&self) {
        self.available.store(false, Ordering::SeqCst);
        self.state.send_replace(GatewayState::Closed);
        self.backend.write().take();
        self.wakeup.notify_one();

        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.abort();
            let _ = supervisor.await;
        }
        info!("Cache gateway closed");
    }

    // Run one backend call under the operation timeout. Errors are logged here and never go further.
    async fn call<T, F, Fut>(&self, op: &'static str, subject: &str, f: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn CacheBackend>) -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        if !self.is_available() {
            return None;
        }

        // Never hold the lock across an await.
        let backend = self.backend.read().clone()?;

        match tokio::time::timeout(self.settings.op_timeout(), f(backend)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                error!(op, subject, "Cache operation failed: {err}");
                if err.is_connection() {
                    self.connection_lost();
                }
                None
            }
            Err(_) => {
                warn!(op, subject, "Cache operation timed out after {:?}", self.settings.op_timeout());
                None
            }
        }
    }

    fn connection_lost(&self) {
        if self.available.swap(false, Ordering::SeqCst) {
            warn!("Cache connection lost; reconnecting");
            self.backend.write().take();
            self.attempts.store(0, Ordering::SeqCst);
            self.state.send_replace(GatewayState::Reconnecting);
            self.wakeup.notify_one();
        }
    }

    fn next_step(&self) -> SupervisorStep {
        let state = self.state();
        match state {
            GatewayState::Closed | GatewayState::GaveUp | GatewayState::Disabled => SupervisorStep::Stop,
            _ if self.is_available() => SupervisorStep::Wait,
            _ => {
                let attempts = self.attempts.load(Ordering::SeqCst);
                let delay = match (state, attempts) {
                    (GatewayState::Connecting, 0) => Duration::ZERO,
                    (GatewayState::Connecting, n) => {
                        backoff_delay(self.settings.reconnect_base(), self.settings.reconnect_cap(), n)
                    }
                    (_, n) => backoff_delay(self.settings.reconnect_base(), self.settings.reconnect_cap(), n + 1),
                };
                SupervisorStep::Connect(delay)
            }
        }
    }

    fn connected(&self, backend: Arc<dyn CacheBackend>) {
        if self.state() == GatewayState::Closed {
            return;
        }
        info!("Cache connected ({})", backend.name());
        *self.backend.write() = Some(backend);
        self.attempts.store(0, Ordering::SeqCst);
        self.state.send_replace(GatewayState::Connected);
        self.available.store(true, Ordering::SeqCst);
    }

    fn connect_failed(&self, err: CacheError) {
        let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.settings.max_reconnect_attempts();
        if attempts >= max {
            error!("Cache connection attempt {attempts}/{max} failed: {err}; giving up");
            self.state.send_replace(GatewayState::GaveUp);
        }
        else {
            warn!("Cache connection attempt {attempts}/{max} failed: {err}");
        }
    }

    async fn supervise(gateway: Weak<Self>, connector: Arc<dyn CacheConnector>, wakeup: Arc<Notify>) {
        loop {
            let step = match gateway.upgrade() {
                Some(gateway) => gateway.next_step(),
                None => SupervisorStep::Stop,
            };

            match step {
                SupervisorStep::Stop => break,
                SupervisorStep::Wait => wakeup.notified().await,
                SupervisorStep::Connect(delay) => {
                    if !delay.is_zero() {
                        debug!("Next cache connection attempt in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }

                    let connect_timeout = match gateway.upgrade() {
                        Some(gateway) => gateway.settings.connect_timeout(),
                        None => break,
                    };

                    let outcome = match tokio::time::timeout(connect_timeout, connector.connect()).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(CacheError::Connection(format!(
                            "connection attempt timed out after {connect_timeout:?}"
                        ))),
                    };

                    let Some(gateway) = gateway.upgrade()
                    else {
                        break;
                    };
                    match outcome {
                        Ok(backend) => gateway.connected(backend),
                        Err(err) => gateway.connect_failed(err),
                    }
                }
            }
        }
        debug!("Cache connection supervisor stopped");
    }
}

impl Debug for CacheGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGateway")
            .field("state", &self.state())
            .field("available", &self.is_available())
            .finish()
    }
}

impl Drop for CacheGateway {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }
    }
}
