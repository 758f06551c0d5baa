use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sea_orm::sea_query::{Cond, Expr, ExprTrait, Order, Query};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, TransactionTrait};

use permit_ledger_core::{
    BreakerState, ContactRole, Entity, EntityId, IngestionBatch, LedgerError, LedgerHealth,
    LedgerReadApi, LedgerResult, MentionKey, Neighbor, RawContactRecord, Relationship,
    SourceTable,
};

use crate::config::{LedgerConfig, PoolSettings};
use crate::db::*;
use crate::gateway::{Gateway, query_all, query_one};
use crate::migration;
use crate::resilience::{Clock, Lane, ResilienceController, RetryPolicy, SystemClock};
use crate::resolver::{
    MergeReport, Resolver, entity_select, load_entity, merge_entities_in, read_entity,
    read_relationship, relationship_select,
};

/// Durable ledger backed by SQLite or Postgres. All database traffic goes
/// through the resilience controller.
pub struct LedgerStore {
    pub(crate) conn: DatabaseConnection,
    pub(crate) gateway: Gateway,
    pub(crate) resilience: ResilienceController,
    pub(crate) resolver: Resolver,
    pub(crate) max_ingest_batch: usize,
    backend: &'static str,
    failpoints: HashSet<String>,
}

fn connect_options(url: String, pool: &PoolSettings) -> ConnectOptions {
    let mut options = ConnectOptions::new(url);
    options
        .max_connections(pool.max_connections)
        .min_connections(pool.min_connections)
        .connect_timeout(pool.connect_timeout)
        .acquire_timeout(pool.acquire_timeout)
        .idle_timeout(pool.idle_timeout)
        .sqlx_logging(false);
    options
}

impl LedgerStore {
    /// Opens the pool without touching the schema.
    pub async fn connect(config: &LedgerConfig, base_dir: &Path) -> LedgerResult<Self> {
        Self::connect_with_clock(config, base_dir, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        config: &LedgerConfig,
        base_dir: &Path,
        clock: Arc<dyn Clock>,
    ) -> LedgerResult<Self> {
        let url = config.connection_url(base_dir)?;
        if let Ok(path) = config.sqlite_path(base_dir)
            && let Some(parent) = path.parent()
        {
            std::fs::create_dir_all(parent)
                .map_err(|err| LedgerError::config(format!("create database dir: {err}")))?;
        }
        let pool = config.pool_settings();
        let conn = Database::connect(connect_options(url, &pool)).await?;
        let gateway = Gateway::for_backend(conn.get_database_backend())?;
        let limits = config.limits();
        let retry = RetryPolicy {
            attempts: limits.retry_attempts.unwrap_or(3),
            base_backoff: Duration::from_millis(limits.retry_backoff_ms.unwrap_or(200)),
        };
        let failpoints = config
            .failpoints
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect::<HashSet<_>>();
        log::info!(
            "ledger connected to {} (pool {}..{}, {} read-reserved)",
            config.backend_name(),
            pool.min_connections,
            pool.max_connections,
            pool.read_reserved
        );
        Ok(Self {
            conn,
            gateway,
            resilience: ResilienceController::new(pool, config.breaker_settings(), retry, clock),
            resolver: Resolver::new(config.address_overlap_threshold()),
            max_ingest_batch: limits.max_ingest_batch.unwrap_or(500).max(1),
            backend: config.backend_name(),
            failpoints,
        })
    }

    /// Connects and applies every pending migration step.
    pub async fn open(config: &LedgerConfig, base_dir: &Path) -> LedgerResult<Self> {
        let store = Self::connect(config, base_dir).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Migrated SQLite store at `path` with default settings.
    pub async fn open_sqlite(path: &Path) -> LedgerResult<Self> {
        let config = LedgerConfig::default_sqlite(path.to_string_lossy());
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::open(&config, base).await
    }

    pub(crate) fn maybe_failpoint(&self, key: &str) -> LedgerResult<()> {
        if self.failpoints.contains(key) {
            Err(LedgerError::storage(format!("failpoint {key}")))
        } else {
            Ok(())
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn resilience(&self) -> &ResilienceController {
        &self.resilience
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    pub fn max_ingest_batch(&self) -> usize {
        self.max_ingest_batch
    }

    /// Applies pending steps in order and returns their names. Safe to re-run.
    pub async fn migrate(&self) -> LedgerResult<Vec<String>> {
        let conn = &self.conn;
        self.resilience
            .run(Lane::Write, "migrate", move || migration::migrate_up(conn))
            .await
    }

    pub async fn pending_migrations(&self) -> LedgerResult<Vec<String>> {
        let conn = &self.conn;
        self.resilience
            .run_idempotent(Lane::Read, "pending_migrations", move || {
                migration::pending_steps(conn)
            })
            .await
    }

    /// Folds `absorbed` into `survivor` in one transaction.
    pub async fn merge_entities(
        &self,
        survivor: EntityId,
        absorbed: EntityId,
    ) -> LedgerResult<MergeReport> {
        self.resilience
            .run(Lane::Write, "merge_entities", || async {
                let tx = self.conn.begin().await?;
                let report = merge_entities_in(&self.gateway, &tx, survivor, absorbed).await?;
                tx.commit().await?;
                Ok(report)
            })
            .await
    }

    pub async fn list_entities(&self) -> LedgerResult<Vec<Entity>> {
        let conn = &self.conn;
        self.resilience
            .run_idempotent(Lane::Read, "list_entities", move || async move {
                let select = entity_select()
                    .order_by(Entities::FirstSeen, Order::Asc)
                    .order_by(Entities::EntityId, Order::Asc)
                    .to_owned();
                query_all(conn, &select)
                    .await?
                    .iter()
                    .map(read_entity)
                    .collect()
            })
            .await
    }

    pub async fn list_relationships(&self) -> LedgerResult<Vec<Relationship>> {
        let conn = &self.conn;
        self.resilience
            .run_idempotent(Lane::Read, "list_relationships", move || async move {
                let select = relationship_select()
                    .order_by(Relationships::EntityIdA, Order::Asc)
                    .order_by(Relationships::EntityIdB, Order::Asc)
                    .to_owned();
                query_all(conn, &select)
                    .await?
                    .iter()
                    .map(read_relationship)
                    .collect()
            })
            .await
    }

    /// Committed checkpoints for one feed, oldest cursor first.
    pub async fn list_batches(&self, source_table: SourceTable) -> LedgerResult<Vec<IngestionBatch>> {
        let conn = &self.conn;
        self.resilience
            .run_idempotent(Lane::Read, "list_batches", move || {
                load_batches(conn, source_table, None)
            })
            .await
    }

    /// Highest committed cursor position for a feed.
    pub async fn last_checkpoint(
        &self,
        source_table: SourceTable,
    ) -> LedgerResult<Option<IngestionBatch>> {
        let conn = &self.conn;
        self.resilience
            .run_idempotent(Lane::Read, "last_checkpoint", move || async move {
                Ok(load_batches(conn, source_table, Some(1)).await?.pop())
            })
            .await
    }

    pub async fn row_counts(&self) -> LedgerResult<BTreeMap<String, i64>> {
        let conn = &self.conn;
        let gateway = &self.gateway;
        self.resilience
            .run_idempotent(Lane::Read, "row_counts", move || async move {
                let mut counts = BTreeMap::new();
                for table in LEDGER_TABLES {
                    let mut cursor = gateway
                        .execute(conn, &format!("SELECT COUNT(*) AS n FROM {table}"), Vec::new())
                        .await?;
                    let count: i64 = match cursor.fetch_one() {
                        Some(row) => row.try_get("", "n")?,
                        None => 0,
                    };
                    counts.insert(table.to_string(), count);
                }
                Ok(counts)
            })
            .await
    }

    /// Snapshot for operators. Never fails; backend problems show up as a
    /// degraded report.
    pub async fn health(&self) -> LedgerHealth {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        let base = LedgerHealth {
            healthy: true,
            backend: self.backend.to_string(),
            pool: self.resilience.pool_health(),
            breaker: self.resilience.breaker().snapshot(),
            row_counts: BTreeMap::new(),
            pending_migrations: 0,
            timestamp_ms,
            message: None,
        };
        let pending = match self.pending_migrations().await {
            Ok(pending) => pending,
            Err(err) => return self.refresh(base).degraded(format!("migrations: {err}")),
        };
        let row_counts = match self.row_counts().await {
            Ok(counts) => counts,
            Err(err) => return self.refresh(base).degraded(format!("row counts: {err}")),
        };
        let mut health = self.refresh(LedgerHealth {
            row_counts,
            pending_migrations: pending.len(),
            ..base
        });
        if !pending.is_empty() {
            health = health.degraded(format!("{} migration step(s) pending", pending.len()));
        } else if health.breaker.state != BreakerState::Closed {
            health = health.degraded("circuit breaker is not closed");
        } else if !health.pool.healthy {
            health = health.degraded("connection pool exhausted");
        }
        health
    }

    fn refresh(&self, health: LedgerHealth) -> LedgerHealth {
        LedgerHealth {
            pool: self.resilience.pool_health(),
            breaker: self.resilience.breaker().snapshot(),
            ..health
        }
    }

    /// Stops admitting work and closes the pool.
    pub async fn close(self) -> LedgerResult<()> {
        self.resilience.close();
        self.conn.close().await?;
        Ok(())
    }
}

async fn load_batches<C: ConnectionTrait>(
    conn: &C,
    source_table: SourceTable,
    latest: Option<u64>,
) -> LedgerResult<Vec<IngestionBatch>> {
    let mut select = Query::select()
        .columns([
            IngestionBatches::BatchId,
            IngestionBatches::SourceTable,
            IngestionBatches::CursorStart,
            IngestionBatches::CursorPosition,
            IngestionBatches::RowCount,
            IngestionBatches::CommittedAt,
        ])
        .from(IngestionBatches::Table)
        .and_where(Expr::col(IngestionBatches::SourceTable).eq(source_table.as_str()))
        .to_owned();
    match latest {
        Some(limit) => select
            .order_by(IngestionBatches::CursorPosition, Order::Desc)
            .limit(limit),
        None => select.order_by(IngestionBatches::CursorPosition, Order::Asc),
    };
    query_all(conn, &select)
        .await?
        .iter()
        .map(|row| {
            Ok(IngestionBatch {
                batch_id: read_string(row, IngestionBatches::BatchId)?,
                source_table: parse_source_table(&read_string(row, IngestionBatches::SourceTable)?)?,
                cursor_start: row.try_get("", &col_name(IngestionBatches::CursorStart))?,
                cursor_position: row.try_get("", &col_name(IngestionBatches::CursorPosition))?,
                row_count: row.try_get("", &col_name(IngestionBatches::RowCount))?,
                committed_at: read_hlc(row, IngestionBatches::CommittedAt)?,
            })
        })
        .collect()
}

fn parse_source_table(value: &str) -> LedgerResult<SourceTable> {
    value
        .parse()
        .map_err(|_| LedgerError::storage(format!("unknown source table '{value}'")))
}

fn parse_role(value: &str) -> LedgerResult<ContactRole> {
    value
        .parse()
        .map_err(|_| LedgerError::storage(format!("unknown contact role '{value}'")))
}

async fn resolve_mention_in<C: ConnectionTrait>(
    conn: &C,
    key: &MentionKey,
) -> LedgerResult<Option<EntityId>> {
    let select = Query::select()
        .column(RawContacts::EntityId)
        .from(RawContacts::Table)
        .and_where(Expr::col(RawContacts::SourceTable).eq(key.source_table.as_str()))
        .and_where(Expr::col(RawContacts::SourceRecordId).eq(key.source_record_id.as_str()))
        .and_where(Expr::col(RawContacts::Role).eq(key.role.as_str()))
        .limit(1)
        .to_owned();
    query_one(conn, &select)
        .await?
        .map(|row| read_entity_id(&row, RawContacts::EntityId))
        .transpose()
}

async fn neighborhood_in<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    entity_id: EntityId,
    limit: u32,
) -> LedgerResult<Vec<Neighbor>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let select = relationship_select()
        .cond_where(
            Cond::any()
                .add(Expr::col(Relationships::EntityIdA).eq(gateway.entity_value(entity_id)))
                .add(Expr::col(Relationships::EntityIdB).eq(gateway.entity_value(entity_id))),
        )
        .order_by(Relationships::SharedPermits, Order::Desc)
        .order_by(Relationships::LastSharedAt, Order::Desc)
        .limit(u64::from(limit))
        .to_owned();
    let edges: Vec<Relationship> = query_all(conn, &select)
        .await?
        .iter()
        .map(read_relationship)
        .collect::<LedgerResult<_>>()?;
    let mut neighbors = Vec::with_capacity(edges.len());
    for edge in edges {
        let Some(other) = edge.other_endpoint(entity_id) else {
            continue;
        };
        match load_entity(gateway, conn, other).await? {
            Some(entity) => neighbors.push(Neighbor {
                entity,
                shared_permits: edge.shared_permits,
                last_shared_at: edge.last_shared_at,
            }),
            None => log::warn!("edge {entity_id}-{other} points at a missing entity"),
        }
    }
    Ok(neighbors)
}

async fn raw_records_in<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    entity_id: EntityId,
) -> LedgerResult<Vec<RawContactRecord>> {
    let select = Query::select()
        .columns([
            RawContacts::SourceTable,
            RawContacts::SourceRecordId,
            RawContacts::Role,
            RawContacts::RawName,
            RawContacts::RawLicense,
            RawContacts::AddressHint,
        ])
        .from(RawContacts::Table)
        .and_where(Expr::col(RawContacts::EntityId).eq(gateway.entity_value(entity_id)))
        .order_by(RawContacts::SourceTable, Order::Asc)
        .order_by(RawContacts::SourceRecordId, Order::Asc)
        .order_by(RawContacts::Role, Order::Asc)
        .to_owned();
    query_all(conn, &select)
        .await?
        .iter()
        .map(|row| {
            Ok(RawContactRecord {
                source_table: parse_source_table(&read_string(row, RawContacts::SourceTable)?)?,
                source_record_id: read_string(row, RawContacts::SourceRecordId)?,
                role: parse_role(&read_string(row, RawContacts::Role)?)?,
                raw_name: read_string(row, RawContacts::RawName)?,
                raw_license: read_opt_string(row, RawContacts::RawLicense)?,
                address_hint: read_opt_string(row, RawContacts::AddressHint)?,
            })
        })
        .collect()
}

#[async_trait]
impl LedgerReadApi for LedgerStore {
    async fn resolve_mention(&self, key: &MentionKey) -> LedgerResult<Option<EntityId>> {
        let conn = &self.conn;
        self.resilience
            .run_idempotent(Lane::Read, "resolve_mention", move || {
                resolve_mention_in(conn, key)
            })
            .await
    }

    async fn get_entity(&self, entity_id: EntityId) -> LedgerResult<Option<Entity>> {
        let (gateway, conn) = (&self.gateway, &self.conn);
        self.resilience
            .run_idempotent(Lane::Read, "get_entity", move || {
                load_entity(gateway, conn, entity_id)
            })
            .await
    }

    async fn neighborhood(&self, entity_id: EntityId, limit: u32) -> LedgerResult<Vec<Neighbor>> {
        let (gateway, conn) = (&self.gateway, &self.conn);
        self.resilience
            .run_idempotent(Lane::Read, "neighborhood", move || {
                neighborhood_in(gateway, conn, entity_id, limit)
            })
            .await
    }

    async fn raw_records_for_entity(
        &self,
        entity_id: EntityId,
    ) -> LedgerResult<Vec<RawContactRecord>> {
        let (gateway, conn) = (&self.gateway, &self.conn);
        self.resilience
            .run_idempotent(Lane::Read, "raw_records_for_entity", move || {
                raw_records_in(gateway, conn, entity_id)
            })
            .await
    }
}
