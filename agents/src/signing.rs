//! Request signing and correlation id generation shared by the exchange
//! hook sets.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str, payload: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("invalid HMAC key: {e}"))?;
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Lowercase hex HMAC-SHA256 of `payload`.
pub fn sign_hex(secret: &str, payload: &str) -> Result<String> {
    Ok(hex::encode(mac(secret, payload)?))
}

/// Base64 HMAC-SHA256 of `payload`.
pub fn sign_base64(secret: &str, payload: &str) -> Result<String> {
    Ok(STANDARD.encode(mac(secret, payload)?))
}

/// Milliseconds since the Unix epoch on the local clock.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Local clock corrected by an offset measured as local minus server.
pub fn server_time_ms(offset_ms: i64) -> i64 {
    now_ms() - offset_ms
}

/// `k=v&k=v` with keys in lexicographic order.
pub fn query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Generator for correlation ids that stay unique across reconnects and
/// process restarts. Ids are alphanumeric and 25 characters long (prefix,
/// millisecond clock, counter), within the 32 every supported exchange accepts.
const COUNTER_SPAN: u64 = 1_000_000;

#[derive(Debug)]
pub struct RequestIds {
    prefix: String,
    counter: AtomicU64,
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIds {
    pub fn new() -> Self {
        let prefix = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) % COUNTER_SPAN;
        format!("{}{:013}{:06}", self.prefix, now_ms(), n)
    }
}
