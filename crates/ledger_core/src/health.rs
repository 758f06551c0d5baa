use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub healthy: bool,
    pub min: u32,
    pub max: u32,
    pub in_use: u32,
    pub available: u32,
    pub read_reserved: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerHealth {
    pub healthy: bool,
    pub backend: String,
    pub pool: PoolHealth,
    pub breaker: BreakerSnapshot,
    pub row_counts: BTreeMap<String, i64>,
    pub pending_migrations: usize,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LedgerHealth {
    pub fn degraded(mut self, message: impl Into<String>) -> Self {
        self.healthy = false;
        self.message = Some(message.into());
        self
    }
}
