use std::sync::Arc;

use tokio::sync::Mutex;

use permit_ledger_store::{LedgerStore, RecordSource};

#[derive(Clone)]
pub struct OpsState {
    pub store: Arc<LedgerStore>,
    pub source: Arc<dyn RecordSource>,
    token: Option<Arc<str>>,
    /// Held for the duration of an ingestion cycle; cycles never overlap.
    pub(crate) ingest_lock: Arc<Mutex<()>>,
}

impl OpsState {
    /// A blank or missing token leaves every operational route closed.
    pub fn new(
        store: Arc<LedgerStore>,
        source: Arc<dyn RecordSource>,
        token: Option<String>,
    ) -> Self {
        let token = token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .map(Arc::from);
        Self {
            store,
            source,
            token,
            ingest_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}
