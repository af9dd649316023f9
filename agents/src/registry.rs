use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rustls::ClientConfig;
use xchg_core::config::Config;

use crate::client::PrivateClient;

pub type ClientFactory = Arc<
    dyn Fn(&Config, Option<Arc<ClientConfig>>) -> Result<Arc<dyn PrivateClient>> + Send + Sync,
>;

static REGISTRY: Lazy<DashMap<&'static str, ClientFactory>> = Lazy::new(DashMap::new);

pub fn register_client(id: &'static str, factory: ClientFactory) {
    REGISTRY.insert(id, factory);
}

pub fn get_client(id: &str) -> Option<ClientFactory> {
    REGISTRY.get(id).map(|f| f.value().clone())
}

/// Ids of every registered exchange, sorted.
pub fn registered() -> Vec<&'static str> {
    let mut ids: Vec<_> = REGISTRY.iter().map(|e| *e.key()).collect();
    ids.sort_unstable();
    ids
}
