use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Entity, EntityId, LedgerResult, MentionKey, Neighbor, RawContactRecord, SourceTable,
};

/// One page pulled from an external feed. A page with no records that does
/// not move the cursor ends the cycle. `skipped` counts feed entries the source
/// could not turn into a record at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordPage {
    pub records: Vec<RawContactRecord>,
    pub next_cursor: i64,
    pub skipped: u64,
}

impl RecordPage {
    pub fn new(records: Vec<RawContactRecord>, next_cursor: i64) -> Self {
        Self {
            records,
            next_cursor,
            skipped: 0,
        }
    }

    pub fn end(cursor: i64) -> Self {
        Self::new(Vec::new(), cursor)
    }

    pub fn is_end(&self, requested: i64) -> bool {
        self.records.is_empty() && self.next_cursor <= requested
    }
}

/// Opaque paginated record source. Cursors are monotonically increasing positions.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_page(
        &self,
        source_table: SourceTable,
        cursor: i64,
        limit: usize,
    ) -> LedgerResult<RecordPage>;
}

/// How the resolver attached one mention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Existing,
    LicenseMatch,
    NameMatch,
    Created,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionCounts {
    pub existing: u64,
    pub license_matches: u64,
    pub name_matches: u64,
    pub created: u64,
}

impl ResolutionCounts {
    pub fn record(&mut self, outcome: ResolutionOutcome) {
        match outcome {
            ResolutionOutcome::Existing => self.existing += 1,
            ResolutionOutcome::LicenseMatch => self.license_matches += 1,
            ResolutionOutcome::NameMatch => self.name_matches += 1,
            ResolutionOutcome::Created => self.created += 1,
        }
    }

    pub fn merge(&mut self, other: ResolutionCounts) {
        self.existing += other.existing;
        self.license_matches += other.license_matches;
        self.name_matches += other.name_matches;
        self.created += other.created;
    }

    /// Share of newly resolved mentions that produced a new entity.
    pub fn singleton_rate(&self) -> f64 {
        let resolved = self.license_matches + self.name_matches + self.created;
        if resolved == 0 {
            return 0.0;
        }
        self.created as f64 / resolved as f64
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestOptions {
    pub page_size: Option<usize>,
    pub max_pages: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub source_table: SourceTable,
    pub pages_committed: u64,
    pub pages_skipped: u64,
    pub records: u64,
    pub records_skipped: u64,
    pub edges_added: u64,
    pub resolution: ResolutionCounts,
    pub singleton_rate: f64,
    pub start_cursor: i64,
    pub final_cursor: i64,
    pub cancelled: bool,
}

impl IngestReport {
    pub fn new(source_table: SourceTable, start_cursor: i64) -> Self {
        Self {
            source_table,
            pages_committed: 0,
            pages_skipped: 0,
            records: 0,
            records_skipped: 0,
            edges_added: 0,
            resolution: ResolutionCounts::default(),
            singleton_rate: 0.0,
            start_cursor,
            final_cursor: start_cursor,
            cancelled: false,
        }
    }
}

/// Read contract offered to downstream consumers. Strict: backend errors propagate.
#[async_trait]
pub trait LedgerReadApi: Send + Sync {
    async fn resolve_mention(&self, key: &MentionKey) -> LedgerResult<Option<EntityId>>;
    async fn get_entity(&self, entity_id: EntityId) -> LedgerResult<Option<Entity>>;
    async fn neighborhood(&self, entity_id: EntityId, limit: u32) -> LedgerResult<Vec<Neighbor>>;
    async fn raw_records_for_entity(
        &self,
        entity_id: EntityId,
    ) -> LedgerResult<Vec<RawContactRecord>>;
}

/// Consumer-facing wrapper: backend failures become "no data" plus a warning.
pub struct DegradingReader<R> {
    inner: R,
}

impl<R: LedgerReadApi> DegradingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub async fn resolve_mention(&self, key: &MentionKey) -> Option<EntityId> {
        degrade("resolve_mention", self.inner.resolve_mention(key))
            .await
            .flatten()
    }

    pub async fn get_entity(&self, entity_id: EntityId) -> Option<Entity> {
        degrade("get_entity", self.inner.get_entity(entity_id))
            .await
            .flatten()
    }

    pub async fn neighborhood(&self, entity_id: EntityId, limit: u32) -> Vec<Neighbor> {
        degrade("neighborhood", self.inner.neighborhood(entity_id, limit))
            .await
            .unwrap_or_default()
    }

    pub async fn raw_records_for_entity(&self, entity_id: EntityId) -> Vec<RawContactRecord> {
        degrade(
            "raw_records_for_entity",
            self.inner.raw_records_for_entity(entity_id),
        )
        .await
        .unwrap_or_default()
    }
}

async fn degrade<T>(operation: &str, call: impl Future<Output = LedgerResult<T>>) -> Option<T> {
    match call.await {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("ledger read '{operation}' degraded to empty result: {err}");
            None
        }
    }
}
