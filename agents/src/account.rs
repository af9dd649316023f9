//! Account view maintained from user-data pushes.

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::order::Side;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled: Decimal,
}

/// Balances and open orders, each in its own map so balance updates never
/// contend with order updates.
#[derive(Debug, Default)]
pub struct AccountState {
    balances: DashMap<String, Balance>,
    orders: DashMap<String, OpenOrder>,
}

impl AccountState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, balance: Balance) {
        self.balances.insert(balance.asset.clone(), balance);
    }

    pub fn balance(&self, asset: &str) -> Option<Balance> {
        self.balances.get(asset).map(|b| b.value().clone())
    }

    pub fn balances(&self) -> Vec<Balance> {
        let mut all: Vec<Balance> = self.balances.iter().map(|b| b.value().clone()).collect();
        all.sort_by(|a, b| a.asset.cmp(&b.asset));
        all
    }

    /// Record an order update. Orders that are no longer live are dropped.
    pub fn apply_order(&self, order: OpenOrder, live: bool) {
        if live {
            self.orders.insert(order.order_id.clone(), order);
        } else {
            self.orders.remove(&order.order_id);
        }
    }

    pub fn remove_order(&self, order_id: &str) -> Option<OpenOrder> {
        self.orders.remove(order_id).map(|(_, o)| o)
    }

    pub fn open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrder> {
        self.orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .map(|o| o.value().clone())
            .collect()
    }

    /// Snapshot of open order ids. Callers iterate the snapshot, never the
    /// live map, so concurrent pushes can keep mutating it.
    pub fn open_order_ids(&self, symbol: Option<&str>) -> Vec<String> {
        self.orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .map(|o| o.key().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.balances.clear();
        self.orders.clear();
    }
}
