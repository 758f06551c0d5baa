use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use permit_ledger_core::LedgerResult;

use crate::config::LedgerConfig;
use crate::store::LedgerStore;

static RUNTIME: Lazy<Mutex<Option<Arc<LedgerStore>>>> = Lazy::new(|| Mutex::new(None));

/// Process-wide store handle shared by the ops server and CLI commands.
pub struct LedgerRuntime;

impl LedgerRuntime {
    /// Returns the shared store, connecting on first use. The schema is left
    /// alone; callers decide when to migrate.
    pub async fn get_or_init(config: &LedgerConfig, base_dir: &Path) -> LedgerResult<Arc<LedgerStore>> {
        let mut guard = RUNTIME.lock().await;
        if let Some(store) = guard.as_ref() {
            return Ok(store.clone());
        }
        let store = Arc::new(LedgerStore::connect(config, base_dir).await?);
        *guard = Some(store.clone());
        Ok(store)
    }

    pub async fn current() -> Option<Arc<LedgerStore>> {
        RUNTIME.lock().await.clone()
    }

    /// Drops the shared handle and closes the pool once no other holder remains.
    pub async fn shutdown() -> LedgerResult<()> {
        let Some(store) = RUNTIME.lock().await.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(store) {
            Ok(store) => store.close().await,
            Err(store) => {
                store.resilience().close();
                log::warn!(
                    "ledger store still has {} holder(s); pool closes when they drop",
                    Arc::strong_count(&store) - 1
                );
                Ok(())
            }
        }
    }
}
