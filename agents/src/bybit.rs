//! Bybit v5. Orders go over the trade WebSocket; order and wallet updates
//! arrive on the separate private stream, so a client runs one session on
//! each and both feed the same [`AccountState`].

use std::{
    sync::{Arc, Once},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rustls::ClientConfig;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use ws_session::{
    ApiError, Frame, Link, Session, SessionConfig, SessionError, SessionHooks, SessionState,
    WsStream,
};
use xchg_core::config::{Config, Credentials};

use crate::{
    account::{AccountState, Balance, OpenOrder},
    client::{self, OrderProtocol, PrivateClient, WsPrivateClient},
    handshake::{read_frame, send_frame},
    order::{decimal, id_string, OrderAck, OrderKind, OrderRequest, Side},
    registry,
    signing::{now_ms, server_time_ms, sign_hex, RequestIds},
};

pub const NAME: &str = "bybit";
pub const ENDPOINT: &str = "wss://stream.bybit.com/v5/trade";
pub const PRIVATE_ENDPOINT: &str = "wss://stream.bybit.com/v5/private";

const SESSION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
const REFRESH_MARGIN: Duration = Duration::from_secs(10 * 60);
/// Validity of the auth signature.
const AUTH_WINDOW_MS: i64 = 10_000;
const RECV_WINDOW_MS: &str = "5000";
const CATEGORY: &str = "spot";
const TOPICS: [&str; 2] = ["order", "wallet"];

/// Auth frame shared by both streams; they differ only in the id key
/// (`reqId` on trade, `req_id` on private).
fn auth_frame(credentials: &Credentials, id_key: &str, id: String, expires: i64) -> Result<Value> {
    let signature = sign_hex(&credentials.api_secret, &format!("GET/realtime{expires}"))?;
    let mut frame = json!({
        "op": "auth",
        "args": [credentials.api_key, expires, signature],
    });
    frame[id_key] = json!(id);
    Ok(frame)
}

/// Bybit reports no server time during auth, so the offset is always 0.
async fn authenticate(socket: &mut WsStream, frame: Value) -> Result<i64, SessionError> {
    send_frame(socket, &frame).await?;
    let reply = read_frame(socket, |f| f.get("op").and_then(Value::as_str) == Some("auth")).await?;
    match extract_error(&reply) {
        Some(err) => Err(SessionError::Auth(format!("{} {}", err.code, err.message))),
        None => Ok(0),
    }
}

/// Trade replies carry `retCode`; private-stream replies carry `success`.
fn extract_error(frame: &Frame) -> Option<ApiError> {
    match frame.get("retCode").and_then(Value::as_i64) {
        Some(0) => None,
        Some(code) => Some(ApiError::new(
            code,
            frame.get("retMsg").and_then(Value::as_str).unwrap_or_default(),
        )),
        None if frame.get("success") == Some(&Value::Bool(false)) => Some(ApiError::new(
            -1,
            frame.get("ret_msg").and_then(Value::as_str).unwrap_or_default(),
        )),
        None => None,
    }
}

fn is_heartbeat(frame: &Frame) -> bool {
    matches!(
        frame.get("op").and_then(Value::as_str),
        Some("pong") | Some("ping")
    )
}

fn keepalive() -> Option<Message> {
    Some(Message::Text(json!({"op": "ping"}).to_string()))
}

/// Order entry over the trade WebSocket.
pub struct BybitProtocol {
    credentials: Credentials,
    ids: RequestIds,
    account: Arc<AccountState>,
}

impl BybitProtocol {
    pub fn new(credentials: Credentials, account: Arc<AccountState>) -> Self {
        Self {
            credentials,
            ids: RequestIds::new(),
            account,
        }
    }

    fn op(&self, op: &str, args: Value, offset_ms: i64) -> Value {
        json!({
            "reqId": self.ids.next(),
            "header": {
                "X-BAPI-TIMESTAMP": server_time_ms(offset_ms).to_string(),
                "X-BAPI-RECV-WINDOW": RECV_WINDOW_MS,
            },
            "op": op,
            "args": [args],
        })
    }
}

#[async_trait]
impl SessionHooks for BybitProtocol {
    async fn authenticate(&self, socket: &mut WsStream) -> Result<i64, SessionError> {
        let frame = auth_frame(
            &self.credentials,
            "reqId",
            self.ids.next(),
            now_ms() + AUTH_WINDOW_MS,
        )
        .map_err(|e| SessionError::Auth(e.to_string()))?;
        authenticate(socket, frame).await
    }

    fn on_push(&self, frame: Frame) {
        if !is_heartbeat(&frame) {
            warn!("unrecognised frame without reqId on trade stream");
        }
    }

    fn request_id(&self, request: &mut Value) -> Option<String> {
        if let Some(id) = id_string(request.get("reqId")) {
            return Some(id);
        }
        let id = self.ids.next();
        request.as_object_mut()?.insert("reqId".into(), json!(id));
        Some(id)
    }

    fn extract_id(&self, frame: &Frame) -> Option<String> {
        id_string(frame.get("reqId"))
    }

    fn extract_error(&self, frame: &Frame) -> Option<ApiError> {
        extract_error(frame)
    }

    fn keepalive(&self) -> Option<Message> {
        keepalive()
    }
}

impl OrderProtocol for BybitProtocol {
    const NAME: &'static str = NAME;
    const DEFAULT_ENDPOINT: &'static str = ENDPOINT;

    fn session_config(&self, base: SessionConfig) -> SessionConfig {
        base.with_lifetime(SESSION_LIFETIME, REFRESH_MARGIN)
    }

    fn account(&self) -> &AccountState {
        &self.account
    }

    fn place_request(
        &self,
        order: &OrderRequest,
        client_order_id: &str,
        offset_ms: i64,
    ) -> Result<Value> {
        let mut args = json!({
            "category": CATEGORY,
            "symbol": order.symbol.to_uppercase(),
            "side": match order.side {
                Side::Buy => "Buy",
                Side::Sell => "Sell",
            },
            "qty": order.quantity.normalize().to_string(),
            "orderLinkId": client_order_id,
        });
        match order.kind {
            OrderKind::Limit => {
                let price = order.price.ok_or_else(|| anyhow!("limit order requires a price"))?;
                args["orderType"] = json!("Limit");
                args["timeInForce"] = json!("GTC");
                args["price"] = json!(price.normalize().to_string());
            }
            OrderKind::Market => args["orderType"] = json!("Market"),
        }
        Ok(self.op("order.create", args, offset_ms))
    }

    fn cancel_request(&self, symbol: &str, order_id: &str, offset_ms: i64) -> Result<Value> {
        let args = json!({
            "category": CATEGORY,
            "symbol": symbol.to_uppercase(),
            "orderId": order_id,
        });
        Ok(self.op("order.cancel", args, offset_ms))
    }

    fn parse_ack(&self, frame: &Frame) -> Result<OrderAck> {
        let data = frame
            .get("data")
            .ok_or_else(|| anyhow!("order response without data"))?;
        Ok(OrderAck {
            order_id: id_string(data.get("orderId"))
                .ok_or_else(|| anyhow!("order response without orderId"))?,
            client_order_id: id_string(data.get("orderLinkId")).unwrap_or_default(),
        })
    }
}

/// Order and wallet updates from the private stream.
pub struct BybitAccountStream {
    credentials: Credentials,
    ids: RequestIds,
    account: Arc<AccountState>,
}

impl BybitAccountStream {
    pub fn new(credentials: Credentials, account: Arc<AccountState>) -> Self {
        Self {
            credentials,
            ids: RequestIds::new(),
            account,
        }
    }

    fn on_orders(&self, data: &[Value]) {
        for o in data {
            let Some(order_id) = id_string(o.get("orderId")) else {
                continue;
            };
            let Some(side) = o.get("side").and_then(Value::as_str).and_then(Side::parse) else {
                continue;
            };
            let status = o.get("orderStatus").and_then(Value::as_str).unwrap_or_default();
            let price = decimal(o.get("price"));
            let order = OpenOrder {
                order_id,
                client_order_id: id_string(o.get("orderLinkId")).unwrap_or_default(),
                symbol: o
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                side,
                price: (!price.is_zero()).then_some(price),
                quantity: decimal(o.get("qty")),
                filled: decimal(o.get("cumExecQty")),
            };
            let live = matches!(status, "New" | "PartiallyFilled" | "Untriggered");
            self.account.apply_order(order, live);
        }
    }

    fn on_wallet(&self, data: &[Value]) {
        for account in data {
            let Some(coins) = account.get("coin").and_then(Value::as_array) else {
                continue;
            };
            for c in coins {
                let Some(asset) = c.get("coin").and_then(Value::as_str) else {
                    continue;
                };
                let total = decimal(c.get("walletBalance"));
                let locked = decimal(c.get("locked"));
                self.account.set_balance(Balance {
                    asset: asset.to_string(),
                    free: total - locked,
                    locked,
                });
            }
        }
    }
}

#[async_trait]
impl SessionHooks for BybitAccountStream {
    async fn authenticate(&self, socket: &mut WsStream) -> Result<i64, SessionError> {
        let frame = auth_frame(
            &self.credentials,
            "req_id",
            self.ids.next(),
            now_ms() + AUTH_WINDOW_MS,
        )
        .map_err(|e| SessionError::Auth(e.to_string()))?;
        authenticate(socket, frame).await
    }

    async fn after_connect(&self, link: &Link) -> Result<(), SessionError> {
        let id = self.ids.next();
        link.request(&id, &json!({"req_id": id, "op": "subscribe", "args": TOPICS}))
            .await?;
        info!(topics = ?TOPICS, "subscribed to account updates");
        Ok(())
    }

    fn on_push(&self, frame: Frame) {
        let data = frame.get("data").and_then(Value::as_array);
        match (frame.get("topic").and_then(Value::as_str), data) {
            (Some(topic), Some(data)) if topic.starts_with("order") => self.on_orders(data),
            (Some(topic), Some(data)) if topic.starts_with("wallet") => self.on_wallet(data),
            (Some(topic), _) => debug!(topic, "ignoring topic"),
            (None, _) if is_heartbeat(&frame) => {}
            (None, _) => warn!("unrecognised frame without topic on private stream"),
        }
    }

    fn request_id(&self, request: &mut Value) -> Option<String> {
        if let Some(id) = id_string(request.get("req_id")) {
            return Some(id);
        }
        let id = self.ids.next();
        request.as_object_mut()?.insert("req_id".into(), json!(id));
        Some(id)
    }

    fn extract_id(&self, frame: &Frame) -> Option<String> {
        id_string(frame.get("req_id"))
    }

    fn extract_error(&self, frame: &Frame) -> Option<ApiError> {
        extract_error(frame)
    }

    fn keepalive(&self) -> Option<Message> {
        keepalive()
    }
}

/// Order entry on the trade stream plus account tracking on the private
/// stream.
pub struct BybitClient {
    trade: WsPrivateClient<BybitProtocol>,
    stream: Session<BybitAccountStream>,
}

impl BybitClient {
    pub fn new(credentials: Credentials, trade: SessionConfig, private: SessionConfig) -> Self {
        let account = Arc::new(AccountState::new());
        let stream = Session::new(
            private.with_lifetime(SESSION_LIFETIME, REFRESH_MARGIN),
            BybitAccountStream::new(credentials.clone(), account.clone()),
        );
        Self {
            trade: WsPrivateClient::new(BybitProtocol::new(credentials, account), trade),
            stream,
        }
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.trade = self.trade.with_retry(attempts, backoff);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.trade = self.trade.with_request_timeout(timeout);
        self
    }

    pub fn trade(&self) -> &WsPrivateClient<BybitProtocol> {
        &self.trade
    }

    pub fn stream(&self) -> &Session<BybitAccountStream> {
        &self.stream
    }

    pub fn account(&self) -> &AccountState {
        self.trade.account()
    }
}

#[async_trait]
impl PrivateClient for BybitClient {
    fn exchange(&self) -> &'static str {
        NAME
    }

    /// Connects the trade stream first; its clock offset is returned.
    async fn connect(&self) -> Result<i64> {
        let offset = self.trade.connect().await?;
        let (attempts, backoff) = self.trade.retry_policy();
        if let Err(e) = client::connect_with_retry(&self.stream, NAME, attempts, backoff).await {
            if let Err(close_err) = self.trade.close().await {
                debug!("closing trade stream: {:#}", close_err);
            }
            return Err(e.context("connecting bybit private stream"));
        }
        Ok(offset)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        self.trade.place_order(order).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        self.trade.cancel_order(symbol, order_id).await
    }

    async fn cancel_all(&self, symbol: &str) -> Result<usize> {
        self.trade.cancel_all(symbol).await
    }

    fn balances(&self) -> Vec<Balance> {
        self.trade.balances()
    }

    fn open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrder> {
        self.trade.open_orders(symbol)
    }

    /// The trade stream's state, unless it is ready while the private stream
    /// is not.
    fn state(&self) -> SessionState {
        match self.trade.state() {
            SessionState::Ready => self.stream.state(),
            other => other,
        }
    }

    async fn close(&self) -> Result<()> {
        let stream = self.stream.close().await;
        self.trade.close().await?;
        stream.context("closing bybit private stream")
    }
}

/// Wire a [`BybitClient`] to the configured endpoints and retry policy.
pub fn build(cfg: &Config, tls: Option<Arc<ClientConfig>>) -> Result<Arc<dyn PrivateClient>> {
    let trade = client::endpoint(cfg.ws_endpoint.as_ref(), ENDPOINT)?;
    let private = client::endpoint(cfg.push_endpoint.as_ref(), PRIVATE_ENDPOINT)?;
    let client = BybitClient::new(
        cfg.credentials.clone(),
        SessionConfig::from_config(trade, cfg, tls.clone()),
        SessionConfig::from_config(private, cfg, tls),
    )
    .with_retry(cfg.connect_attempts, cfg.connect_backoff)
    .with_request_timeout(cfg.request_timeout);
    Ok(Arc::new(client))
}

static REGISTER: Once = Once::new();

/// Register the Bybit client factory.
pub fn register() {
    REGISTER.call_once(|| {
        registry::register_client(
            NAME,
            Arc::new(|cfg: &Config, tls: Option<Arc<ClientConfig>>| build(cfg, tls)),
        );
    });
}
