use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use permit_ledger_store::{CancelFlag, IngestOptions, IngestReport, SourceTable};

use crate::error::OpsError;
use crate::state::OpsState;

#[derive(Debug, Serialize, Deserialize)]
pub struct MigrationsResponse {
    pub applied: Vec<String>,
    pub pending: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct IngestParams {
    pub max_pages: Option<usize>,
    pub page_size: Option<usize>,
}

pub async fn run_migrations(
    State(state): State<OpsState>,
) -> Result<Json<MigrationsResponse>, OpsError> {
    let applied = state.store.migrate().await?;
    let pending = state.store.pending_migrations().await?.len();
    tracing::info!(applied = applied.len(), pending, "ops migrations run");
    Ok(Json(MigrationsResponse { applied, pending }))
}

pub async fn run_ingest(
    State(state): State<OpsState>,
    Path(source_table): Path<String>,
    Query(params): Query<IngestParams>,
) -> Result<Json<IngestReport>, OpsError> {
    let source_table: SourceTable = source_table
        .parse()
        .map_err(|_| OpsError::bad_request(format!("unknown source table '{source_table}'")))?;
    if params.page_size == Some(0) {
        return Err(OpsError::bad_request("page_size must be at least 1"));
    }
    let Ok(_guard) = state.ingest_lock.try_lock() else {
        return Err(OpsError::conflict("an ingestion cycle is already running"));
    };
    let pending = state.store.pending_migrations().await?;
    if !pending.is_empty() {
        return Err(OpsError::conflict(format!(
            "{} migration step(s) pending; run /ops/migrations first",
            pending.len()
        )));
    }
    let options = IngestOptions {
        page_size: params.page_size,
        max_pages: params.max_pages,
    };
    let report = state
        .store
        .ingest_cycle(
            state.source.as_ref(),
            source_table,
            &options,
            &CancelFlag::new(),
        )
        .await?;
    tracing::info!(
        source_table = %source_table,
        pages = report.pages_committed,
        records = report.records,
        final_cursor = report.final_cursor,
        "ops ingestion cycle finished"
    );
    Ok(Json(report))
}

/// 200 when healthy, 503 otherwise; the body is the full snapshot either way.
pub async fn health(State(state): State<OpsState>) -> Response {
    let health = state.store.health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}
