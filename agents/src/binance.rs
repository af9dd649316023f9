//! Binance spot WebSocket API.
//!
//! Every trading request is individually HMAC signed. The connection has no
//! login step; `authenticate` only measures the clock offset with a `time`
//! request, and user data is subscribed with a signed
//! `userDataStream.subscribe.signature` once the dispatcher is running.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rustls::ClientConfig;
use serde_json::{json, Value};
use tracing::{debug, warn};
use ws_session::{ApiError, Frame, Link, SessionConfig, SessionError, SessionHooks, WsStream};
use xchg_core::config::{Config, Credentials};

use crate::{
    account::{AccountState, Balance, OpenOrder},
    client::{self, OrderProtocol},
    handshake::{read_frame, send_frame},
    order::{decimal, id_string, OrderAck, OrderKind, OrderRequest, Side},
    registry,
    signing::{now_ms, query_string, server_time_ms, sign_hex, RequestIds},
};

pub const NAME: &str = "binance";
pub const ENDPOINT: &str = "wss://ws-api.binance.com:443/ws-api/v3";

/// Binance drops WebSocket API connections after 24 hours.
const SESSION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
const REFRESH_MARGIN: Duration = Duration::from_secs(10 * 60);

pub struct BinanceProtocol {
    credentials: Credentials,
    ids: RequestIds,
    clock_offset_ms: AtomicI64,
    account: AccountState,
}

impl BinanceProtocol {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            ids: RequestIds::new(),
            clock_offset_ms: AtomicI64::new(0),
            account: AccountState::new(),
        }
    }

    /// Add `apiKey`, `timestamp` and `signature` to `params`.
    fn sign(&self, mut params: BTreeMap<String, String>, offset_ms: i64) -> Result<Value> {
        params.insert("apiKey".into(), self.credentials.api_key.clone());
        params.insert("timestamp".into(), server_time_ms(offset_ms).to_string());
        let signature = sign_hex(&self.credentials.api_secret, &query_string(&params))?;
        params.insert("signature".into(), signature);
        Ok(json!(params))
    }

    fn on_execution_report(&self, event: &Frame) {
        let Some(order_id) = id_string(event.get("i")) else {
            warn!("executionReport without order id");
            return;
        };
        let status = event.get("X").and_then(Value::as_str).unwrap_or_default();
        // On cancels `c` carries the cancel request's id and `C` the original.
        let client_order_id = id_string(event.get("C"))
            .or_else(|| id_string(event.get("c")))
            .unwrap_or_default();
        let Some(side) = event.get("S").and_then(Value::as_str).and_then(Side::parse) else {
            warn!(%order_id, "executionReport without side");
            return;
        };
        let price = decimal(event.get("p"));
        let order = OpenOrder {
            order_id,
            client_order_id,
            symbol: event
                .get("s")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            side,
            price: (!price.is_zero()).then_some(price),
            quantity: decimal(event.get("q")),
            filled: decimal(event.get("z")),
        };
        let live = matches!(status, "NEW" | "PARTIALLY_FILLED" | "PENDING_NEW");
        debug!(order_id = %order.order_id, status, "order update");
        self.account.apply_order(order, live);
    }

    fn on_account_position(&self, event: &Frame) {
        let Some(balances) = event.get("B").and_then(Value::as_array) else {
            return;
        };
        for b in balances {
            let Some(asset) = b.get("a").and_then(Value::as_str) else {
                continue;
            };
            self.account.set_balance(Balance {
                asset: asset.to_string(),
                free: decimal(b.get("f")),
                locked: decimal(b.get("l")),
            });
        }
    }
}

#[async_trait]
impl SessionHooks for BinanceProtocol {
    async fn authenticate(&self, socket: &mut WsStream) -> Result<i64, SessionError> {
        let id = self.ids.next();
        let sent = now_ms();
        send_frame(socket, &json!({"id": id, "method": "time"})).await?;
        let reply = read_frame(socket, |f| {
            f.get("id").and_then(Value::as_str) == Some(id.as_str())
        })
        .await?;
        let received = now_ms();
        if let Some(err) = self.extract_error(&reply) {
            return Err(SessionError::Auth(format!("{} {}", err.code, err.message)));
        }
        let server_time = reply
            .get("result")
            .and_then(|r| r.get("serverTime"))
            .and_then(Value::as_i64)
            .ok_or_else(|| SessionError::Auth("time response without serverTime".into()))?;
        let offset = (sent + received) / 2 - server_time;
        self.clock_offset_ms.store(offset, Ordering::Release);
        Ok(offset)
    }

    async fn after_connect(&self, link: &Link) -> Result<(), SessionError> {
        let offset = self.clock_offset_ms.load(Ordering::Acquire);
        let params = self
            .sign(BTreeMap::new(), offset)
            .map_err(|e| SessionError::AfterConnect(e.to_string()))?;
        let id = self.ids.next();
        let request = json!({
            "id": id,
            "method": "userDataStream.subscribe.signature",
            "params": params,
        });
        link.request(&id, &request).await?;
        Ok(())
    }

    fn on_push(&self, frame: Frame) {
        let event = match frame.get("event") {
            Some(Value::Object(event)) => event,
            _ => &frame,
        };
        match event.get("e").and_then(Value::as_str) {
            Some("executionReport") => self.on_execution_report(event),
            Some("outboundAccountPosition") => self.on_account_position(event),
            Some("eventStreamTerminated") => warn!("user data stream terminated by exchange"),
            Some(other) => debug!(event = other, "ignoring user data event"),
            None => debug!("ignoring unsolicited frame"),
        }
    }

    fn request_id(&self, request: &mut Value) -> Option<String> {
        if let Some(id) = id_string(request.get("id")) {
            return Some(id);
        }
        let id = self.ids.next();
        request.as_object_mut()?.insert("id".into(), json!(id));
        Some(id)
    }

    fn extract_id(&self, frame: &Frame) -> Option<String> {
        id_string(frame.get("id"))
    }

    fn extract_error(&self, frame: &Frame) -> Option<ApiError> {
        let err = frame.get("error")?;
        Some(ApiError::new(
            err.get("code").and_then(Value::as_i64).unwrap_or_default(),
            err.get("msg").and_then(Value::as_str).unwrap_or_default(),
        ))
    }
}

impl OrderProtocol for BinanceProtocol {
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
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), order.symbol.to_uppercase());
        let side = match order.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        params.insert("side".to_string(), side.to_string());
        params.insert("quantity".to_string(), order.quantity.normalize().to_string());
        params.insert("newClientOrderId".to_string(), client_order_id.to_string());
        match order.kind {
            OrderKind::Limit => {
                let price = order.price.ok_or_else(|| anyhow!("limit order requires a price"))?;
                params.insert("type".to_string(), "LIMIT".to_string());
                params.insert("timeInForce".to_string(), "GTC".to_string());
                params.insert("price".to_string(), price.normalize().to_string());
            }
            OrderKind::Market => {
                params.insert("type".to_string(), "MARKET".to_string());
            }
        }
        Ok(json!({
            "id": self.ids.next(),
            "method": "order.place",
            "params": self.sign(params, offset_ms)?,
        }))
    }

    fn cancel_request(&self, symbol: &str, order_id: &str, offset_ms: i64) -> Result<Value> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), symbol.to_uppercase());
        params.insert("orderId".to_string(), order_id.to_string());
        Ok(json!({
            "id": self.ids.next(),
            "method": "order.cancel",
            "params": self.sign(params, offset_ms)?,
        }))
    }

    fn parse_ack(&self, frame: &Frame) -> Result<OrderAck> {
        let result = frame
            .get("result")
            .ok_or_else(|| anyhow!("order response without result"))?;
        Ok(OrderAck {
            order_id: id_string(result.get("orderId"))
                .ok_or_else(|| anyhow!("order response without orderId"))?,
            client_order_id: id_string(result.get("clientOrderId")).unwrap_or_default(),
        })
    }
}

static REGISTER: Once = Once::new();

/// Register the Binance client factory.
pub fn register() {
    REGISTER.call_once(|| {
        registry::register_client(
            NAME,
            Arc::new(|cfg: &Config, tls: Option<Arc<ClientConfig>>| {
                client::build(BinanceProtocol::new(cfg.credentials.clone()), cfg, tls)
            }),
        );
    });
}
