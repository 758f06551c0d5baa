pub mod config;
pub mod datastore;
mod db;
pub mod gateway;
pub mod graph;
pub mod ingest;
pub mod migration;
pub mod resilience;
pub mod resolver;
pub mod runtime;
pub mod source;
pub mod store;

pub use permit_ledger_core::*;

pub use config::{
    BreakerConfig, BreakerSettings, DatabaseConfig, LedgerConfig, LimitsConfig, OpsConfig,
    PoolConfig, PoolSettings, ResolutionConfig,
};
pub use datastore::{default_sqlite_path, feed_source, load_or_init_config, open_store};
pub use db::LEDGER_TABLES;
pub use gateway::{Cursor, Dialect, DuplicatePolicy, Gateway, Row, StatementClass};
pub use ingest::{CancelFlag, PageOutcome, PageStats};
pub use resilience::{Clock, Lane, ManualClock, ResilienceController, SystemClock};
pub use resolver::{MergeReport, Resolution, Resolver};
pub use runtime::LedgerRuntime;
pub use source::{JsonlRecordSource, MemoryRecordSource};
pub use store::LedgerStore;
