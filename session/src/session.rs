use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::StreamExt;
use rand::Rng;
use rustls::ClientConfig;
use serde_json::Value;
use tokio::{
    sync::{Mutex, OnceCell},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use url::Url;
use xchg_core::{metrics, next_backoff, rate_limit::TokenBucket, INITIAL_BACKOFF};

use crate::{
    dispatcher::Dispatcher,
    error::{SessionError, SessionResult},
    hooks::SessionHooks,
    link::Link,
    state::{SessionState, StateCell},
    transport::{self, WsStream},
    Frame,
};

/// Connection settings for one [`Session`].
#[derive(Clone)]
pub struct SessionConfig {
    pub endpoint: Url,
    /// Exchange-enforced maximum session duration, if any.
    pub lifetime: Option<Duration>,
    /// How long before `lifetime` runs out the session refreshes itself.
    pub refresh_margin: Duration,
    /// Bound on each of dial, authentication and the after-connect hook.
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    /// A connection with no inbound frame for this long is considered dead.
    pub read_timeout: Duration,
    /// Fail requests still unanswered after this long. `None` waits forever.
    pub pending_ttl: Option<Duration>,
    pub max_reconnect_attempts: u32,
    pub max_backoff: Duration,
    pub min_stable: Duration,
    pub dial_burst: u32,
    pub dial_refill_per_sec: u32,
    pub proxy_url: Option<String>,
    pub tls: Option<Arc<ClientConfig>>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("lifetime", &self.lifetime)
            .field("refresh_margin", &self.refresh_margin)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("read_timeout", &self.read_timeout)
            .field("pending_ttl", &self.pending_ttl)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("proxy_url", &self.proxy_url)
            .field("custom_tls", &self.tls.is_some())
            .finish()
    }
}

impl SessionConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            lifetime: None,
            refresh_margin: Duration::from_secs(10 * 60),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            read_timeout: Duration::from_secs(60),
            pending_ttl: None,
            max_reconnect_attempts: 10,
            max_backoff: Duration::from_secs(64),
            min_stable: Duration::from_secs(30),
            dial_burst: 5,
            dial_refill_per_sec: 1,
            proxy_url: None,
            tls: None,
        }
    }

    /// Build session settings from the process configuration.
    pub fn from_config(
        endpoint: Url,
        cfg: &xchg_core::config::Config,
        tls: Option<Arc<ClientConfig>>,
    ) -> Self {
        Self {
            proxy_url: cfg.proxy_url.clone(),
            max_reconnect_attempts: cfg.max_failures,
            max_backoff: cfg.max_backoff,
            dial_burst: cfg.dial_burst,
            dial_refill_per_sec: cfg.dial_refill_per_sec,
            tls,
            ..Self::new(endpoint)
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration, refresh_margin: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self.refresh_margin = refresh_margin;
        self
    }

    fn refresh_after(&self) -> Option<Duration> {
        self.lifetime
            .map(|l| l.saturating_sub(self.refresh_margin))
            .filter(|d| !d.is_zero())
    }
}

#[derive(Default)]
struct Tasks {
    dispatcher: Option<JoinHandle<()>>,
    refresh: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort(&mut self) {
        if let Some(h) = self.dispatcher.take() {
            h.abort();
        }
        if let Some(h) = self.refresh.take() {
            h.abort();
        }
    }
}

struct Inner<H> {
    config: SessionConfig,
    hooks: Arc<H>,
    link: Arc<Link>,
    state: StateCell,
    clock_offset_ms: AtomicI64,
    generation: AtomicU64,
    connected_once: AtomicBool,
    // Serializes connect, reconnect and close; owns the per-connection tasks.
    lifecycle: Mutex<Tasks>,
    recovery: Mutex<Option<JoinHandle<()>>>,
    dial_budget: OnceCell<TokenBucket>,
}

impl<H> Drop for Inner<H> {
    fn drop(&mut self) {
        self.lifecycle.get_mut().abort();
        if let Some(h) = self.recovery.get_mut().take() {
            h.abort();
        }
    }
}

/// One long-lived, authenticated WebSocket connection to an exchange.
///
/// Cloning is cheap; all clones share the same connection.
pub struct Session<H: SessionHooks> {
    inner: Arc<Inner<H>>,
}

impl<H: SessionHooks> Clone for Session<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: SessionHooks> std::fmt::Debug for Session<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.inner.config.endpoint.as_str())
            .field("state", &self.inner.state.get())
            .field("pending", &self.inner.link.pending().len())
            .finish()
    }
}

impl<H: SessionHooks> Session<H> {
    pub fn new(config: SessionConfig, hooks: H) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                hooks: Arc::new(hooks),
                link: Arc::new(Link::new()),
                state: StateCell::new(SessionState::Disconnected),
                clock_offset_ms: AtomicI64::new(0),
                generation: AtomicU64::new(0),
                connected_once: AtomicBool::new(false),
                lifecycle: Mutex::new(Tasks::default()),
                recovery: Mutex::new(None),
                dial_budget: OnceCell::new(),
            }),
        }
    }

    /// Dial, authenticate and run the after-connect hook. Returns the clock
    /// offset reported by the hooks. Valid from `Disconnected` or `Closed`;
    /// failures leave the session `Disconnected` and are not retried here.
    pub async fn connect(&self) -> SessionResult<i64> {
        let mut tasks = self.inner.lifecycle.lock().await;
        let state = self.inner.state.get();
        if !state.can_connect() {
            return Err(SessionError::InvalidState(state));
        }
        self.inner.establish(&mut tasks).await
    }

    /// Send a request and wait for the response carrying the same
    /// correlation id. Fails fast unless the session is `Ready`.
    pub async fn send_request(&self, mut request: Value) -> SessionResult<Frame> {
        let inner = &self.inner;
        if inner.state.get() != SessionState::Ready {
            return Err(SessionError::NotConnected);
        }
        let id = inner
            .hooks
            .request_id(&mut request)
            .ok_or(SessionError::MissingId)?;
        metrics::incr(metrics::REQUESTS_TOTAL);
        inner.link.request(&id, &request).await
    }

    /// [`send_request`](Self::send_request) bounded by a wall-clock limit.
    ///
    /// On expiry the pending request is abandoned, not cancelled: it stays
    /// registered until a late response or the next connection reset drops it.
    pub async fn send_request_timeout(
        &self,
        request: Value,
        limit: Duration,
    ) -> SessionResult<Frame> {
        timeout(limit, self.send_request(request))
            .await
            .map_err(|_| SessionError::Timeout(limit))?
    }

    /// Tear down the current socket and run the connect sequence again.
    /// Outstanding requests fail with [`SessionError::ConnectionLost`].
    pub async fn reconnect(&self) -> SessionResult<()> {
        self.inner.reconnect("reconnect requested").await
    }

    /// Stop all tasks, close the socket and fail outstanding requests with
    /// [`SessionError::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) -> SessionResult<()> {
        let inner = &self.inner;
        if let Some(h) = inner.recovery.lock().await.take() {
            h.abort();
        }
        let mut tasks = inner.lifecycle.lock().await;
        if inner.state.get() == SessionState::Closed {
            return Ok(());
        }
        inner.state.set(SessionState::Closed);
        let failed = inner.teardown(&mut tasks, SessionError::Closed).await;
        tracing::info!(endpoint = %inner.config.endpoint, failed, "session closed");
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    /// Local minus server clock, in milliseconds, as of the last connect.
    pub fn clock_offset_ms(&self) -> i64 {
        self.inner.clock_offset_ms.load(Ordering::Acquire)
    }

    pub fn hooks(&self) -> &H {
        &self.inner.hooks
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn pending_len(&self) -> usize {
        self.inner.link.pending().len()
    }
}

impl<H: SessionHooks> Inner<H> {
    async fn dial_budget(&self) -> &TokenBucket {
        self.dial_budget
            .get_or_init(|| async {
                TokenBucket::new(
                    self.config.dial_burst,
                    self.config.dial_refill_per_sec,
                    Duration::from_secs(1),
                )
            })
            .await
    }

    async fn establish(self: &Arc<Self>, tasks: &mut Tasks) -> SessionResult<i64> {
        let mut guard = EstablishGuard {
            inner: self,
            tasks,
            armed: true,
        };
        let result = self.try_establish(&mut *guard.tasks).await;
        match result {
            Ok(offset) => {
                guard.armed = false;
                self.state.set(SessionState::Ready);
                metrics::incr(metrics::CONNECTS_TOTAL);
                tracing::info!(
                    endpoint = %self.config.endpoint,
                    clock_offset_ms = offset,
                    "session ready"
                );
                Ok(offset)
            }
            Err(e) => {
                self.teardown(&mut *guard.tasks, SessionError::ConnectionLost(e.to_string()))
                    .await;
                guard.armed = false;
                self.state.set(SessionState::Disconnected);
                tracing::warn!(endpoint = %self.config.endpoint, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    async fn try_establish(self: &Arc<Self>, tasks: &mut Tasks) -> SessionResult<i64> {
        let cfg = &self.config;
        self.state.set(SessionState::Dialing);
        if self.dial_budget().await.acquire(1).await.is_err() {
            return Err(SessionError::Dial("dial budget closed".to_string()));
        }
        let dial = transport::dial(&cfg.endpoint, cfg.proxy_url.as_deref(), cfg.tls.clone());
        let mut socket = timeout(cfg.connect_timeout, dial)
            .await
            .map_err(|_| SessionError::Dial(format!("timed out after {:?}", cfg.connect_timeout)))??;

        self.state.set(SessionState::Authenticating);
        let offset = match timeout(cfg.connect_timeout, self.hooks.authenticate(&mut socket)).await
        {
            Ok(Ok(offset)) => offset,
            Ok(Err(e)) => {
                close_quietly(&mut socket).await;
                return Err(e);
            }
            Err(_) => {
                close_quietly(&mut socket).await;
                return Err(SessionError::Auth(format!(
                    "no auth response within {:?}",
                    cfg.connect_timeout
                )));
            }
        };
        self.clock_offset_ms.store(offset, Ordering::Release);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (sink, stream) = socket.split();
        self.link.install(sink).await;
        tasks.dispatcher = Some(self.spawn_dispatcher(stream, generation));

        match timeout(cfg.connect_timeout, self.hooks.after_connect(&self.link)).await {
            Ok(Ok(())) => {}
            Ok(Err(SessionError::AfterConnect(msg))) => return Err(SessionError::AfterConnect(msg)),
            Ok(Err(e)) => return Err(SessionError::AfterConnect(e.to_string())),
            Err(_) => {
                return Err(SessionError::AfterConnect(format!(
                    "timed out after {:?}",
                    cfg.connect_timeout
                )))
            }
        }

        if let Some(after) = cfg.refresh_after() {
            tasks.refresh = Some(self.spawn_refresh(after, generation));
        }
        self.connected_once.store(true, Ordering::Release);
        Ok(offset)
    }

    /// Abort connection tasks, drop the socket and fail outstanding requests.
    async fn teardown(&self, tasks: &mut Tasks, err: SessionError) -> usize {
        tasks.abort();
        self.link.shutdown().await;
        self.link.pending().fail_all(&err)
    }

    async fn reconnect(self: &Arc<Self>, reason: &str) -> SessionResult<()> {
        let mut tasks = self.lifecycle.lock().await;
        match self.state.get() {
            SessionState::Closed => return Err(SessionError::InvalidState(SessionState::Closed)),
            _ if !self.connected_once.load(Ordering::Acquire) => {
                return Err(SessionError::NotConnected)
            }
            _ => {}
        }
        self.state.set(SessionState::Reconnecting);
        let failed = self
            .teardown(&mut tasks, SessionError::ConnectionLost(reason.to_string()))
            .await;
        tracing::info!(endpoint = %self.config.endpoint, reason, failed, "reconnecting session");
        metrics::incr(metrics::RECONNECTS_TOTAL);
        self.establish(&mut tasks).await.map(|_| ())
    }

    fn spawn_dispatcher(
        self: &Arc<Self>,
        stream: futures::stream::SplitStream<WsStream>,
        generation: u64,
    ) -> JoinHandle<()> {
        let dispatcher = Dispatcher::new(
            self.hooks.clone(),
            self.link.clone(),
            self.config.ping_interval,
            self.config.read_timeout,
            self.config.pending_ttl,
        );
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = dispatcher.run(stream).await;
            if let Some(inner) = weak.upgrade() {
                inner.connection_lost(generation, reason).await;
            }
        })
    }

    fn spawn_refresh(self: &Arc<Self>, after: Duration, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep(after).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::Acquire) != generation {
                return;
            }
            tracing::info!(
                endpoint = %inner.config.endpoint,
                "session lifetime nearly reached, refreshing connection"
            );
            inner.start_recovery(generation, "session lifetime refresh").await;
        })
    }

    /// Called by the dispatcher of `generation` when its connection fails.
    async fn connection_lost(self: &Arc<Self>, generation: u64, reason: String) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        let failed = self
            .link
            .pending()
            .fail_all(&SessionError::ConnectionLost(reason.clone()));
        let recover = {
            let _tasks = self.lifecycle.lock().await;
            if self.generation.load(Ordering::Acquire) != generation {
                return;
            }
            let was_ready = self
                .state
                .transition(SessionState::Ready, SessionState::Reconnecting);
            self.link.shutdown().await;
            was_ready
        };
        metrics::incr(metrics::CONNECTION_LOST_TOTAL);
        if !recover {
            tracing::debug!(%reason, "connection lost before session became ready");
            return;
        }
        tracing::warn!(endpoint = %self.config.endpoint, %reason, failed, "connection lost");
        self.start_recovery(generation, "connection lost").await;
    }

    /// Spawn the recovery loop unless one is already running.
    async fn start_recovery(self: &Arc<Self>, generation: u64, reason: &'static str) {
        let mut slot = self.recovery.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let inner = self.clone();
        *slot = Some(tokio::spawn(async move {
            inner.recover(generation, reason).await;
        }));
    }

    /// Reconnect with exponential backoff and jitter until the session is
    /// ready again, closed, or the attempt cap is reached.
    async fn recover(self: Arc<Self>, generation: u64, reason: &'static str) {
        let cfg = &self.config;
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = {
                let mut tasks = self.lifecycle.lock().await;
                match self.state.get() {
                    SessionState::Closed => return,
                    // Someone else already brought up a newer connection.
                    SessionState::Ready
                        if self.generation.load(Ordering::Acquire) != generation =>
                    {
                        return
                    }
                    _ => {}
                }
                self.state.set(SessionState::Reconnecting);
                self.teardown(&mut tasks, SessionError::ConnectionLost(reason.to_string()))
                    .await;
                metrics::incr(metrics::RECONNECTS_TOTAL);
                self.establish(&mut tasks).await
            };

            match result {
                Ok(_) => {
                    tracing::info!(endpoint = %cfg.endpoint, attempt, reason, "session recovered");
                    return;
                }
                Err(e) => {
                    if attempt >= cfg.max_reconnect_attempts {
                        tracing::error!(
                            endpoint = %cfg.endpoint,
                            attempt,
                            error = %e,
                            "max reconnect attempts reached, giving up"
                        );
                        return;
                    }
                    backoff =
                        next_backoff(backoff, started.elapsed(), false, cfg.max_backoff, cfg.min_stable);
                    let jitter: f32 = rand::thread_rng().gen_range(0.8..1.2);
                    let delay = backoff.mul_f32(jitter);
                    let dial_tokens = self.dial_budget().await.available();
                    tracing::warn!(
                        attempt,
                        dial_tokens,
                        error = %e,
                        "reconnect failed, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Resets a half-built connection when the connect sequence is dropped
/// before it finishes.
struct EstablishGuard<'a, H> {
    inner: &'a Inner<H>,
    tasks: &'a mut Tasks,
    armed: bool,
}

impl<H> Drop for EstablishGuard<'_, H> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = self.inner;
        self.tasks.abort();
        inner.link.detach();
        inner
            .link
            .pending()
            .fail_all(&SessionError::ConnectionLost("connect cancelled".to_string()));
        inner.state.set(SessionState::Disconnected);
        tracing::warn!(endpoint = %inner.config.endpoint, "connect cancelled");
    }
}

async fn close_quietly(socket: &mut WsStream) {
    if let Err(e) = timeout(Duration::from_secs(1), socket.close(None)).await {
        tracing::debug!("socket close timed out: {}", e);
    }
}
