//! OKX v5 private WebSocket.

use std::sync::{Arc, Once};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rustls::ClientConfig;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use ws_session::{ApiError, Frame, Link, SessionError, SessionHooks, WsStream};
use xchg_core::config::{Config, Credentials};

use crate::{
    account::{AccountState, Balance, OpenOrder},
    client::{self, OrderProtocol},
    handshake::{read_frame, send_frame},
    order::{decimal, id_string, OrderAck, OrderKind, OrderRequest, Side},
    registry,
    signing::{now_ms, sign_base64, RequestIds},
};

pub const NAME: &str = "okx";
pub const ENDPOINT: &str = "wss://ws.okx.com:8443/ws/v5/private";

const VERIFY_PATH: &str = "/users/self/verify";
const TD_MODE: &str = "cash";

pub struct OkxProtocol {
    credentials: Credentials,
    passphrase: String,
    ids: RequestIds,
    account: AccountState,
}

impl OkxProtocol {
    pub fn new(credentials: Credentials) -> Result<Self> {
        let passphrase = credentials
            .passphrase
            .clone()
            .context("okx requires an API passphrase")?;
        Ok(Self {
            credentials,
            passphrase,
            ids: RequestIds::new(),
            account: AccountState::new(),
        })
    }

    fn login_frame(&self, timestamp: &str) -> Result<Value> {
        let sign = sign_base64(
            &self.credentials.api_secret,
            &format!("{timestamp}GET{VERIFY_PATH}"),
        )?;
        Ok(json!({
            "op": "login",
            "args": [{
                "apiKey": self.credentials.api_key,
                "passphrase": self.passphrase,
                "timestamp": timestamp,
                "sign": sign,
            }],
        }))
    }

    fn on_orders(&self, data: &[Value]) {
        for o in data {
            let Some(order_id) = id_string(o.get("ordId")) else {
                continue;
            };
            let Some(side) = o.get("side").and_then(Value::as_str).and_then(Side::parse) else {
                continue;
            };
            let state = o.get("state").and_then(Value::as_str).unwrap_or_default();
            let price = decimal(o.get("px"));
            let order = OpenOrder {
                order_id,
                client_order_id: id_string(o.get("clOrdId")).unwrap_or_default(),
                symbol: o
                    .get("instId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                side,
                price: (!price.is_zero()).then_some(price),
                quantity: decimal(o.get("sz")),
                filled: decimal(o.get("accFillSz")),
            };
            let live = matches!(state, "live" | "partially_filled");
            self.account.apply_order(order, live);
        }
    }

    fn on_account(&self, data: &[Value]) {
        for account in data {
            let Some(details) = account.get("details").and_then(Value::as_array) else {
                continue;
            };
            for d in details {
                let Some(asset) = d.get("ccy").and_then(Value::as_str) else {
                    continue;
                };
                self.account.set_balance(Balance {
                    asset: asset.to_string(),
                    free: decimal(d.get("availBal")),
                    locked: decimal(d.get("frozenBal")),
                });
            }
        }
    }
}

fn code(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

#[async_trait]
impl SessionHooks for OkxProtocol {
    /// OKX reports no server time during login, so the offset is always 0.
    async fn authenticate(&self, socket: &mut WsStream) -> Result<i64, SessionError> {
        let timestamp = (now_ms() / 1000).to_string();
        let frame = self
            .login_frame(&timestamp)
            .map_err(|e| SessionError::Auth(e.to_string()))?;
        send_frame(socket, &frame).await?;
        let reply = read_frame(socket, |f| {
            matches!(
                f.get("event").and_then(Value::as_str),
                Some("login") | Some("error")
            )
        })
        .await?;
        match self.extract_error(&reply) {
            Some(err) => Err(SessionError::Auth(format!("{} {}", err.code, err.message))),
            None => Ok(0),
        }
    }

    async fn after_connect(&self, link: &Link) -> Result<(), SessionError> {
        // Subscription acks carry no id and arrive through on_push.
        link.send_json(&json!({
            "op": "subscribe",
            "args": [
                {"channel": "orders", "instType": "ANY"},
                {"channel": "account"},
            ],
        }))
        .await
    }

    fn on_push(&self, frame: Frame) {
        if let Some(event) = frame.get("event").and_then(Value::as_str) {
            match event {
                "subscribe" => info!(arg = ?frame.get("arg"), "subscribed"),
                "error" => warn!(
                    code = ?frame.get("code"),
                    msg = ?frame.get("msg"),
                    "exchange reported an error"
                ),
                other => debug!(event = other, "ignoring event"),
            }
            return;
        }
        let channel = frame
            .get("arg")
            .and_then(|a| a.get("channel"))
            .and_then(Value::as_str);
        let Some(data) = frame.get("data").and_then(Value::as_array) else {
            return;
        };
        match channel {
            Some("orders") => self.on_orders(data),
            Some("account") => self.on_account(data),
            other => debug!(channel = ?other, "ignoring push"),
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

    /// Prefers the per-order `sCode`/`sMsg` over the envelope `code`/`msg`.
    fn extract_error(&self, frame: &Frame) -> Option<ApiError> {
        let top = code(frame.get("code"))?;
        if top == 0 {
            return None;
        }
        let item = frame
            .get("data")
            .and_then(Value::as_array)
            .and_then(|d| d.first());
        if let Some(item) = item {
            if let Some(s_code) = code(item.get("sCode")).filter(|c| *c != 0) {
                let msg = item.get("sMsg").and_then(Value::as_str).unwrap_or_default();
                return Some(ApiError::new(s_code, msg));
            }
        }
        let msg = frame.get("msg").and_then(Value::as_str).unwrap_or_default();
        Some(ApiError::new(top, msg))
    }

    fn keepalive(&self) -> Option<Message> {
        Some(Message::Text("ping".to_string()))
    }
}

impl OrderProtocol for OkxProtocol {
    const NAME: &'static str = NAME;
    const DEFAULT_ENDPOINT: &'static str = ENDPOINT;

    fn account(&self) -> &AccountState {
        &self.account
    }

    fn place_request(
        &self,
        order: &OrderRequest,
        client_order_id: &str,
        _offset_ms: i64,
    ) -> Result<Value> {
        let mut args = json!({
            "instId": order.symbol.to_uppercase(),
            "tdMode": TD_MODE,
            "side": match order.side {
                Side::Buy => "buy",
                Side::Sell => "sell",
            },
            "sz": order.quantity.normalize().to_string(),
            "clOrdId": client_order_id,
        });
        match order.kind {
            OrderKind::Limit => {
                let price = order.price.ok_or_else(|| anyhow!("limit order requires a price"))?;
                args["ordType"] = json!("limit");
                args["px"] = json!(price.normalize().to_string());
            }
            OrderKind::Market => args["ordType"] = json!("market"),
        }
        Ok(json!({"id": self.ids.next(), "op": "order", "args": [args]}))
    }

    fn cancel_request(&self, symbol: &str, order_id: &str, _offset_ms: i64) -> Result<Value> {
        Ok(json!({
            "id": self.ids.next(),
            "op": "cancel-order",
            "args": [{"instId": symbol.to_uppercase(), "ordId": order_id}],
        }))
    }

    fn parse_ack(&self, frame: &Frame) -> Result<OrderAck> {
        let item = frame
            .get("data")
            .and_then(Value::as_array)
            .and_then(|d| d.first())
            .ok_or_else(|| anyhow!("order response without data"))?;
        Ok(OrderAck {
            order_id: id_string(item.get("ordId"))
                .ok_or_else(|| anyhow!("order response without ordId"))?,
            client_order_id: id_string(item.get("clOrdId")).unwrap_or_default(),
        })
    }
}

static REGISTER: Once = Once::new();

/// Register the OKX client factory.
pub fn register() {
    REGISTER.call_once(|| {
        registry::register_client(
            NAME,
            Arc::new(|cfg: &Config, tls: Option<Arc<ClientConfig>>| {
                client::build(OkxProtocol::new(cfg.credentials.clone())?, cfg, tls)
            }),
        );
    });
}
