use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use simd_json::serde::from_slice;
use std::{env, fs, time::Duration};
use url::Url;

/// Exchanges with a WebSocket session implementation.
pub const SUPPORTED_EXCHANGES: &[&str] = &["binance", "bybit", "okx"];

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***redacted***")
            .field("api_secret", &"***redacted***")
            .field(
                "passphrase",
                &self.passphrase.as_ref().map(|_| "***redacted***"),
            )
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub exchange: String,
    pub ws_endpoint: Option<Url>,
    /// Separate account-update stream, for exchanges that split it from order entry.
    pub push_endpoint: Option<Url>,
    pub credentials: Credentials,
    pub proxy_url: Option<String>,
    pub ca_bundle: Option<String>,
    pub cert_pins: Vec<String>,
    pub enable_metrics: bool,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub request_timeout: Duration,
    pub max_backoff: Duration,
    pub max_failures: u32,
    pub dial_burst: u32,
    pub dial_refill_per_sec: u32,
}

static CONFIG: OnceCell<Config> = OnceCell::new();

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn load_credentials() -> Result<Credentials> {
    if let (Ok(api_key), Ok(api_secret)) = (env::var("API_KEY"), env::var("API_SECRET")) {
        if !api_key.is_empty() && !api_secret.is_empty() {
            let passphrase = env::var("API_PASSPHRASE").ok().filter(|p| !p.is_empty());
            return Ok(Credentials {
                api_key,
                api_secret,
                passphrase,
            });
        }
    }

    if let Ok(path) = env::var("API_CREDENTIALS_FILE") {
        let mut content = fs::read(&path).context("reading credentials file")?;
        let creds: Credentials = from_slice(&mut content).context("parsing credentials file")?;
        if !creds.api_key.is_empty() && !creds.api_secret.is_empty() {
            return Ok(creds);
        }
    }

    Err(anyhow!(
        "API_KEY and API_SECRET must be set via env or credentials file"
    ))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let exchange = env::var("EXCHANGE")
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_else(|_| "binance".to_string());
        let ws_endpoint = match env::var("WS_ENDPOINT") {
            Ok(v) if !v.is_empty() => Some(Url::parse(&v).context("parsing WS_ENDPOINT")?),
            _ => None,
        };
        let push_endpoint = match env::var("WS_PUSH_ENDPOINT") {
            Ok(v) if !v.is_empty() => Some(Url::parse(&v).context("parsing WS_PUSH_ENDPOINT")?),
            _ => None,
        };
        let credentials = load_credentials()?;
        let proxy_url = env::var("SOCKS5_PROXY").ok().filter(|v| !v.is_empty());
        let ca_bundle = env::var("CA_BUNDLE").ok();
        let cert_pins = env::var("CERT_PINS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        Ok(Config {
            exchange,
            ws_endpoint,
            push_endpoint,
            credentials,
            proxy_url,
            ca_bundle,
            cert_pins,
            enable_metrics: env_flag("ENABLE_METRICS", true),
            connect_attempts: env_parse("CONNECT_ATTEMPTS", 3),
            connect_backoff: Duration::from_millis(env_parse("CONNECT_BACKOFF_MS", 1000)),
            request_timeout: Duration::from_millis(env_parse("REQUEST_TIMEOUT_MS", 5000)),
            max_backoff: Duration::from_secs(env_parse("MAX_BACKOFF_SECS", 64)),
            max_failures: env_parse("MAX_FAILURES", 10),
            dial_burst: env_parse("DIAL_BURST", 5),
            dial_refill_per_sec: env_parse("DIAL_REFILL_PER_SEC", 1),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.credentials.api_key.is_empty() || self.credentials.api_secret.is_empty() {
            return Err(anyhow!("API credentials are required"));
        }
        if !SUPPORTED_EXCHANGES.contains(&self.exchange.as_str()) {
            return Err(anyhow!(
                "unsupported exchange {:?}, expected one of {:?}",
                self.exchange,
                SUPPORTED_EXCHANGES
            ));
        }
        if self.exchange == "okx" && self.credentials.passphrase.is_none() {
            return Err(anyhow!("okx requires API_PASSPHRASE"));
        }
        for (key, url) in [
            ("WS_ENDPOINT", &self.ws_endpoint),
            ("WS_PUSH_ENDPOINT", &self.push_endpoint),
        ] {
            if let Some(url) = url {
                if url.scheme() != "ws" && url.scheme() != "wss" {
                    return Err(anyhow!("{key} must use ws:// or wss://"));
                }
            }
        }
        if self.connect_attempts == 0 || self.connect_attempts > 100 {
            return Err(anyhow!("connect_attempts must be between 1 and 100"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout must be greater than zero"));
        }
        if self.max_backoff < Duration::from_secs(1) {
            return Err(anyhow!("max_backoff must be at least one second"));
        }
        if self.max_failures == 0 {
            return Err(anyhow!("max_failures must be greater than zero"));
        }
        if self.dial_burst == 0 || self.dial_refill_per_sec == 0 {
            return Err(anyhow!("dial rate limit values must be greater than zero"));
        }
        Ok(())
    }
}

pub fn load() -> Result<&'static Config> {
    let cfg = Config::from_env()?;
    cfg.validate()?;
    if cfg.enable_metrics {
        if let Err(e) = crate::metrics::init_exporter() {
            tracing::warn!("metrics exporter not installed: {}", e);
        }
    }
    Ok(CONFIG.get_or_init(|| cfg))
}

pub fn metrics_enabled() -> bool {
    CONFIG.get().map(|c| c.enable_metrics).unwrap_or(false)
}
