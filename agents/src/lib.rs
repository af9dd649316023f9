//! Exchange hook sets, order entry and account state on top of
//! [`ws_session`].

pub mod account;
pub mod binance;
pub mod bybit;
pub mod client;
mod handshake;
pub mod okx;
pub mod order;
pub mod registry;
pub mod signing;

pub use account::{AccountState, Balance, OpenOrder};
pub use client::{OrderProtocol, PrivateClient, WsPrivateClient};
pub use order::{OrderAck, OrderKind, OrderRequest, Side};

/// Register every exchange client factory. Safe to call more than once.
pub fn register_all() {
    binance::register();
    bybit::register();
    okx::register();
}
