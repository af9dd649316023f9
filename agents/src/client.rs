use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rustls::ClientConfig;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;
use ws_session::{Frame, Session, SessionConfig, SessionError, SessionHooks, SessionState};
use xchg_core::config::Config;

use crate::{
    account::{AccountState, Balance, OpenOrder},
    order::{OrderAck, OrderRequest},
};

/// Exchange-specific order dialect layered on top of the session hooks.
pub trait OrderProtocol: SessionHooks {
    /// Registry id, e.g. `"binance"`.
    const NAME: &'static str;
    const DEFAULT_ENDPOINT: &'static str;

    /// Apply exchange limits such as a forced session lifetime.
    fn session_config(&self, base: SessionConfig) -> SessionConfig {
        base
    }

    fn account(&self) -> &AccountState;

    /// Build a signed order placement request. `offset_ms` is the clock
    /// offset measured at the last connect.
    fn place_request(&self, order: &OrderRequest, client_order_id: &str, offset_ms: i64)
        -> Result<Value>;

    fn cancel_request(&self, symbol: &str, order_id: &str, offset_ms: i64) -> Result<Value>;

    fn parse_ack(&self, frame: &Frame) -> Result<OrderAck>;
}

/// Order entry and account view over one authenticated session.
#[async_trait]
pub trait PrivateClient: Send + Sync {
    fn exchange(&self) -> &'static str;

    /// Connect, retrying a bounded number of times. Returns the clock offset.
    async fn connect(&self) -> Result<i64>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    /// Cancel every known open order for `symbol`. Returns how many cancels
    /// the exchange accepted.
    async fn cancel_all(&self, symbol: &str) -> Result<usize>;

    fn balances(&self) -> Vec<Balance>;

    fn open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrder>;

    fn state(&self) -> SessionState;

    async fn close(&self) -> Result<()>;
}

pub struct WsPrivateClient<P: OrderProtocol> {
    session: Session<P>,
    connect_attempts: u32,
    connect_backoff: Duration,
    request_timeout: Duration,
}

impl<P: OrderProtocol> WsPrivateClient<P> {
    pub fn new(protocol: P, config: SessionConfig) -> Self {
        let config = protocol.session_config(config);
        Self {
            session: Session::new(config, protocol),
            connect_attempts: 3,
            connect_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.connect_backoff = backoff;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Attempts and fixed delay used by [`PrivateClient::connect`].
    pub fn retry_policy(&self) -> (u32, Duration) {
        (self.connect_attempts, self.connect_backoff)
    }

    pub fn session(&self) -> &Session<P> {
        &self.session
    }

    pub fn account(&self) -> &AccountState {
        self.session.hooks().account()
    }

    async fn call(&self, request: Value, what: &str) -> Result<Frame> {
        let outcome = self
            .session
            .send_request_timeout(request, self.request_timeout)
            .await;
        if xchg_core::config::metrics_enabled() {
            let result = match &outcome {
                Ok(_) => "ok",
                Err(SessionError::Api { .. }) => "rejected",
                Err(e) if e.is_ambiguous() => "unknown",
                Err(_) => "failed",
            };
            metrics::counter!("agents_order_requests_total", "exchange" => P::NAME, "result" => result)
                .increment(1);
        }
        outcome.with_context(|| format!("{} {}", P::NAME, what))
    }
}

#[async_trait]
impl<P: OrderProtocol> PrivateClient for WsPrivateClient<P> {
    fn exchange(&self) -> &'static str {
        P::NAME
    }

    async fn connect(&self) -> Result<i64> {
        connect_with_retry(
            &self.session,
            P::NAME,
            self.connect_attempts,
            self.connect_backoff,
        )
        .await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        order.validate()?;
        let client_order_id = order
            .client_order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let protocol = self.session.hooks();
        let request =
            protocol.place_request(order, &client_order_id, self.session.clock_offset_ms())?;
        let frame = self.call(request, "order placement").await?;
        let ack = protocol.parse_ack(&frame)?;
        protocol.account().apply_order(
            OpenOrder {
                order_id: ack.order_id.clone(),
                client_order_id: ack.client_order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                price: order.price,
                quantity: order.quantity,
                filled: Default::default(),
            },
            true,
        );
        info!(exchange = P::NAME, order_id = %ack.order_id, symbol = %order.symbol, "order placed");
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let protocol = self.session.hooks();
        let request = protocol.cancel_request(symbol, order_id, self.session.clock_offset_ms())?;
        self.call(request, "order cancel").await?;
        protocol.account().remove_order(order_id);
        Ok(())
    }

    async fn cancel_all(&self, symbol: &str) -> Result<usize> {
        let ids = self.account().open_order_ids(Some(symbol));
        let mut cancelled = 0;
        for id in &ids {
            match self.cancel_order(symbol, id).await {
                Ok(()) => cancelled += 1,
                Err(e) => warn!(exchange = P::NAME, order_id = %id, "cancel failed: {:#}", e),
            }
        }
        info!(exchange = P::NAME, symbol, cancelled, total = ids.len(), "cancel all finished");
        Ok(cancelled)
    }

    fn balances(&self) -> Vec<Balance> {
        self.account().balances()
    }

    fn open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrder> {
        self.account().open_orders(symbol)
    }

    fn state(&self) -> SessionState {
        self.session.state()
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await?;
        Ok(())
    }
}

/// Connect `session`, retrying up to `attempts` times with a fixed delay.
/// A session in the wrong state is reported at once.
pub(crate) async fn connect_with_retry<H: SessionHooks>(
    session: &Session<H>,
    name: &str,
    attempts: u32,
    backoff: Duration,
) -> Result<i64> {
    let mut last_err = None;
    for attempt in 1..=attempts {
        match session.connect().await {
            Ok(offset) => {
                info!(
                    exchange = name,
                    attempt,
                    offset_ms = offset,
                    endpoint = %session.config().endpoint,
                    "connected"
                );
                return Ok(offset);
            }
            Err(e @ SessionError::InvalidState(_)) => return Err(e.into()),
            Err(e) => {
                warn!(exchange = name, attempt, error = %e, "connect attempt failed");
                last_err = Some(e);
                if attempt < attempts {
                    sleep(backoff).await;
                }
            }
        }
    }
    let err = last_err.map(anyhow::Error::from).unwrap_or_else(|| anyhow!("no attempts"));
    Err(err.context(format!("connecting to {} after {} attempts", name, attempts)))
}

/// `override_url` if configured, otherwise the exchange default.
pub(crate) fn endpoint(override_url: Option<&Url>, default: &str) -> Result<Url> {
    match override_url {
        Some(url) => Ok(url.clone()),
        None => Url::parse(default).with_context(|| format!("parsing endpoint {default}")),
    }
}

/// Wire `protocol` to the configured endpoint and retry policy.
pub fn build<P: OrderProtocol>(
    protocol: P,
    cfg: &Config,
    tls: Option<Arc<ClientConfig>>,
) -> Result<Arc<dyn PrivateClient>> {
    let endpoint = endpoint(cfg.ws_endpoint.as_ref(), P::DEFAULT_ENDPOINT)?;
    let session_cfg = SessionConfig::from_config(endpoint, cfg, tls);
    let client = WsPrivateClient::new(protocol, session_cfg)
        .with_retry(cfg.connect_attempts, cfg.connect_backoff)
        .with_request_timeout(cfg.request_timeout);
    Ok(Arc::new(client))
}
