//! Socket dialing: direct TCP or SOCKS5, then the WebSocket (and TLS) handshake.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::SessionError;

/// Byte stream underneath the WebSocket, direct or proxied.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// The socket handle owned by a session.
pub type WsStream = WebSocketStream<MaybeTlsStream<BoxedIo>>;

fn target(url: &Url) -> Result<(String, u16), SessionError> {
    let host = url
        .host_str()
        .ok_or_else(|| SessionError::Dial(format!("{url} is missing a host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| SessionError::Dial(format!("{url} is missing a port")))?;
    Ok((host.to_string(), port))
}

async fn open_io(url: &Url, proxy: Option<&str>) -> Result<BoxedIo, SessionError> {
    let (host, port) = target(url)?;
    match proxy {
        Some(proxy_addr) => {
            let stream = Socks5Stream::connect(proxy_addr, (host.as_str(), port))
                .await
                .map_err(|e| SessionError::Dial(format!("connecting via SOCKS5 proxy: {e}")))?;
            Ok(Box::new(stream))
        }
        None => {
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| SessionError::Dial(format!("connecting to {host}:{port}: {e}")))?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay failed: {}", e);
            }
            Ok(Box::new(stream))
        }
    }
}

/// Open a WebSocket to `url`, optionally through a SOCKS5 proxy. `wss://`
/// endpoints use `tls` when given and the native roots otherwise.
pub async fn dial(
    url: &Url,
    proxy: Option<&str>,
    tls: Option<Arc<ClientConfig>>,
) -> Result<WsStream, SessionError> {
    let io = open_io(url, proxy).await?;
    let (ws, _) = client_async_tls_with_config(url.as_str(), io, None, tls.map(Connector::Rustls))
        .await
        .map_err(|e| SessionError::Dial(format!("WebSocket handshake: {e}")))?;
    Ok(ws)
}
