//! Operational HTTP surface for the ledger: migrations, ingestion cycles and
//! health, all behind a bearer token.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::{Router, middleware};
use tower_http::trace::TraceLayer;

pub use error::OpsError;
pub use state::OpsState;

pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/ops/migrations", post(routes::run_migrations))
        .route("/ops/ingest/:source_table", post(routes::run_ingest))
        .route("/ops/health", get(routes::health))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
