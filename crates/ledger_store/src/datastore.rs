use std::path::{Path, PathBuf};

use permit_ledger_core::LedgerResult;

use crate::config::LedgerConfig;
use crate::source::JsonlRecordSource;
use crate::store::LedgerStore;

const DEFAULT_DB_NAME: &str = "ledger.sqlite";

/// Reads `<base>/ledger.json`, writing a SQLite default on first use, then
/// applies environment overrides.
pub fn load_or_init_config(base: &Path) -> LedgerResult<LedgerConfig> {
    let default_sqlite = default_sqlite_path(base);
    Ok(LedgerConfig::load_or_init(base, &default_sqlite)?.with_env_overrides())
}

pub async fn open_store(base: &Path) -> LedgerResult<LedgerStore> {
    let config = load_or_init_config(base)?;
    LedgerStore::open(&config, base).await
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}

pub fn feed_source(config: &LedgerConfig, base: &Path) -> JsonlRecordSource {
    JsonlRecordSource::new(config.feeds_dir(base))
}
