use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sea_orm::sea_query::{Expr, ExprTrait, Query};
use sea_orm::{ConnectionTrait, TransactionTrait};

use permit_ledger_core::{
    Hlc, IngestOptions, IngestReport, IngestionBatch, LedgerError, LedgerResult, RecordPage,
    RecordSource, ResolutionCounts, SourceTable,
};

use crate::db::IngestionBatches;
use crate::gateway::{Row, query_one};
use crate::graph;
use crate::resilience::Lane;
use crate::store::LedgerStore;

pub const BEFORE_PAGE_COMMIT: &str = "before_page_commit";

/// Cooperative stop signal, checked between pages. A page in flight always
/// finishes or rolls back as a unit.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageStats {
    pub records: u64,
    pub edges_added: u64,
    pub resolution: ResolutionCounts,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOutcome {
    Committed(PageStats),
    /// A checkpoint for this page already exists; nothing was written.
    AlreadyCommitted,
}

impl LedgerStore {
    /// Pulls pages from `source` starting at the feed's last checkpoint and
    /// commits each one atomically with its checkpoint. The next page is
    /// fetched while the current one commits.
    pub async fn ingest_cycle(
        &self,
        source: &dyn RecordSource,
        source_table: SourceTable,
        options: &IngestOptions,
        cancel: &CancelFlag,
    ) -> LedgerResult<IngestReport> {
        let page_size = options
            .page_size
            .unwrap_or(self.max_ingest_batch)
            .clamp(1, self.max_ingest_batch);
        let start = self
            .last_checkpoint(source_table)
            .await?
            .map(|batch| batch.cursor_position)
            .unwrap_or(0);
        let mut report = IngestReport::new(source_table, start);
        log::info!("ingest {source_table}: starting at cursor {start} (page size {page_size})");

        let mut cursor = start;
        let mut pages = 0usize;
        let within_budget = |pages: usize| options.max_pages.is_none_or(|max| pages < max);
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        if !within_budget(pages) {
            return Ok(report);
        }

        let mut page = source.fetch_page(source_table, cursor, page_size).await?;
        loop {
            if page.is_end(cursor) {
                break;
            }
            if page.next_cursor <= cursor {
                return Err(LedgerError::invalid(format!(
                    "{source_table} source returned {} records without advancing past cursor {cursor}",
                    page.records.len()
                )));
            }
            let next_cursor = page.next_cursor;
            let prefetch = within_budget(pages + 1) && !cancel.is_cancelled();
            let fetch_next = async {
                if prefetch {
                    source
                        .fetch_page(source_table, next_cursor, page_size)
                        .await
                        .map(Some)
                } else {
                    Ok(None)
                }
            };
            let (committed, next) =
                tokio::join!(self.commit_page(source_table, cursor, &page), fetch_next);

            match committed? {
                PageOutcome::Committed(stats) => {
                    report.pages_committed += 1;
                    report.records += stats.records;
                    report.records_skipped += page.skipped;
                    report.edges_added += stats.edges_added;
                    report.resolution.merge(stats.resolution);
                }
                PageOutcome::AlreadyCommitted => {
                    log::info!("ingest {source_table}: page at {cursor} already committed");
                    report.pages_skipped += 1;
                }
            }
            pages += 1;
            cursor = next_cursor;
            report.final_cursor = cursor;

            if cancel.is_cancelled() {
                log::warn!("ingest {source_table}: cancelled at cursor {cursor}");
                report.cancelled = true;
                break;
            }
            match next? {
                Some(next) => page = next,
                None => break,
            }
        }

        report.singleton_rate = report.resolution.singleton_rate();
        log::info!(
            "ingest {source_table}: {} page(s) committed, {} skipped, {} records, {} new edges, cursor {} -> {}",
            report.pages_committed,
            report.pages_skipped,
            report.records,
            report.edges_added,
            report.start_cursor,
            report.final_cursor
        );
        Ok(report)
    }

    /// Commits one page and its checkpoint, retrying transient failures.
    /// A retried page either finds its checkpoint or starts from scratch.
    pub async fn commit_page(
        &self,
        source_table: SourceTable,
        cursor_start: i64,
        page: &RecordPage,
    ) -> LedgerResult<PageOutcome> {
        self.resilience
            .run_idempotent(Lane::Write, "ingest_page", move || {
                self.commit_page_once(source_table, cursor_start, page)
            })
            .await
    }

    async fn commit_page_once(
        &self,
        source_table: SourceTable,
        cursor_start: i64,
        page: &RecordPage,
    ) -> LedgerResult<PageOutcome> {
        let batch_id = IngestionBatch::batch_id_for(source_table, cursor_start);
        let tx = self.conn.begin().await?;
        if batch_exists(&tx, &batch_id).await? {
            tx.rollback().await?;
            return Ok(PageOutcome::AlreadyCommitted);
        }

        let seen_at = Hlc::now();
        let mut stats = PageStats::default();
        let mut permits = BTreeSet::new();
        for record in &page.records {
            if record.source_table != source_table {
                log::warn!(
                    "{} record {} arrived on the {source_table} feed; resolving it as {}",
                    record.source_table,
                    record.source_record_id,
                    record.source_table
                );
            }
            let resolution = self
                .resolver
                .resolve(&self.gateway, &tx, record, &batch_id, seen_at)
                .await?;
            stats.resolution.record(resolution.outcome);
            stats.records += 1;
            permits.insert((record.source_table, record.source_record_id.as_str()));
        }

        for (permit_table, permit) in permits {
            let entity_ids = graph::permit_entities(&tx, permit_table, permit).await?;
            stats.edges_added += graph::update_edges(
                &self.gateway,
                &tx,
                permit_table,
                permit,
                &entity_ids,
                seen_at,
            )
            .await?;
        }

        let checkpoint = Row::new()
            .set("batch_id", batch_id.clone())
            .set("source_table", source_table.as_str())
            .set("cursor_start", cursor_start)
            .set("cursor_position", page.next_cursor)
            .set("row_count", stats.records as i64)
            .set("committed_at", seen_at.as_i64());
        if !self
            .gateway
            .insert_if_absent(&tx, "ingestion_batches", &["batch_id"], &checkpoint)
            .await?
        {
            return Err(LedgerError::constraint(format!(
                "checkpoint {batch_id} committed concurrently"
            )));
        }

        self.maybe_failpoint(BEFORE_PAGE_COMMIT)?;
        tx.commit().await?;
        log::debug!(
            "committed {batch_id}: {} records, {} new edges",
            stats.records,
            stats.edges_added
        );
        Ok(PageOutcome::Committed(stats))
    }
}

async fn batch_exists<C: ConnectionTrait>(conn: &C, batch_id: &str) -> LedgerResult<bool> {
    let select = Query::select()
        .column(IngestionBatches::BatchId)
        .from(IngestionBatches::Table)
        .and_where(Expr::col(IngestionBatches::BatchId).eq(batch_id))
        .limit(1)
        .to_owned();
    Ok(query_one(conn, &select).await?.is_some())
}
