#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use url::Url;
use ws_session::{ApiError, Frame, Link, SessionConfig, SessionError, SessionHooks, WsStream};

pub type ServerSocket = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Clone, Copy)]
enum Auth {
    Accept { skew_ms: i64 },
    Reject,
}

/// Local exchange stand-in. Answers the auth handshake itself and hands every
/// authenticated server-side socket to the test.
pub struct MockExchange {
    pub url: Url,
    conns: mpsc::UnboundedReceiver<ServerSocket>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockExchange {
    pub async fn start() -> Self {
        Self::spawn(Auth::Accept { skew_ms: 0 }).await
    }

    /// Server clock runs `skew_ms` behind the local one.
    pub async fn skewed(skew_ms: i64) -> Self {
        Self::spawn(Auth::Accept { skew_ms }).await
    }

    pub async fn rejecting() -> Self {
        Self::spawn(Auth::Reject).await
    }

    async fn spawn(auth: Auth) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    let Some(login) = recv_json_opt(&mut ws).await else {
                        return;
                    };
                    assert_eq!(login["op"], "auth");
                    match auth {
                        Auth::Accept { skew_ms } => {
                            let reply = json!({
                                "op": "auth",
                                "success": true,
                                "serverTime": now_ms() - skew_ms,
                            });
                            if ws.send(Message::Text(reply.to_string())).await.is_ok() {
                                counter.fetch_add(1, Ordering::SeqCst);
                                let _ = tx.send(ws);
                            }
                        }
                        Auth::Reject => {
                            let reply = json!({"op": "auth", "success": false, "msg": "invalid key"});
                            let _ = ws.send(Message::Text(reply.to_string())).await;
                            let _ = ws.close(None).await;
                        }
                    }
                });
            }
        });
        Self {
            url: Url::parse(&format!("ws://{addr}/ws")).unwrap(),
            conns,
            accepted,
            task,
        }
    }

    /// Next authenticated connection.
    pub async fn next_conn(&mut self) -> ServerSocket {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection within timeout")
            .expect("mock exchange stopped")
    }

    /// Number of connections that completed authentication.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockExchange {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn recv_json_opt<S>(ws: &mut WebSocketStream<S>) -> Option<Value>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

/// Next JSON frame from the client, skipping control frames.
pub async fn recv_json(ws: &mut ServerSocket) -> Value {
    timeout(WAIT, recv_json_opt(ws))
        .await
        .expect("no frame within timeout")
        .expect("client closed the connection")
}

pub async fn send_json(ws: &mut ServerSocket, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Generic JSON exchange dialect used by the session tests: `id` correlates,
/// `error.code`/`error.msg` report failures, everything else is a push.
pub struct TestHooks {
    pushes: mpsc::UnboundedSender<Frame>,
    next_id: AtomicU64,
    setup_request: bool,
    pub after_connect_calls: AtomicUsize,
}

impl TestHooks {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pushes: tx,
                next_id: AtomicU64::new(0),
                setup_request: false,
                after_connect_calls: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Hooks whose after-connect step sends a `subscribe` request and waits
    /// for the answer.
    pub fn with_setup() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (mut hooks, rx) = Self::new();
        hooks.setup_request = true;
        (hooks, rx)
    }
}

#[async_trait]
impl SessionHooks for TestHooks {
    async fn authenticate(&self, socket: &mut WsStream) -> Result<i64, SessionError> {
        socket
            .send(Message::Text(json!({"op": "auth"}).to_string()))
            .await?;
        let reply = recv_json_opt(socket)
            .await
            .ok_or_else(|| SessionError::Auth("no auth reply".into()))?;
        if reply["success"] != true {
            let msg = reply["msg"].as_str().unwrap_or("rejected").to_string();
            return Err(SessionError::Auth(msg));
        }
        Ok(now_ms() - reply["serverTime"].as_i64().unwrap_or_else(now_ms))
    }

    async fn after_connect(&self, link: &Link) -> Result<(), SessionError> {
        let n = self.after_connect_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.setup_request {
            let id = format!("setup-{n}");
            link.request(&id, &json!({"id": id, "op": "subscribe"}))
                .await?;
        }
        Ok(())
    }

    fn on_push(&self, frame: Frame) {
        let _ = self.pushes.send(frame);
    }

    fn request_id(&self, request: &mut Value) -> Option<String> {
        if let Some(id) = request.get("id").and_then(Value::as_str) {
            return Some(id.to_string());
        }
        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        request
            .as_object_mut()?
            .insert("id".into(), Value::String(id.clone()));
        Some(id)
    }

    fn extract_id(&self, frame: &Frame) -> Option<String> {
        frame.get("id")?.as_str().map(str::to_string)
    }

    fn extract_error(&self, frame: &Frame) -> Option<ApiError> {
        let err = frame.get("error")?;
        Some(ApiError::new(
            err.get("code")?.as_i64()?,
            err.get("msg").and_then(Value::as_str).unwrap_or_default(),
        ))
    }
}

pub fn test_config(url: &Url) -> SessionConfig {
    let mut cfg = SessionConfig::new(url.clone());
    cfg.connect_timeout = Duration::from_secs(2);
    cfg.max_reconnect_attempts = 3;
    cfg.max_backoff = Duration::from_secs(2);
    cfg
}
