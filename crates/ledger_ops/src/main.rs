use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use permit_ledger_ops::{OpsState, router};
use permit_ledger_store::{LedgerRuntime, feed_source, load_or_init_config};

const DEFAULT_BIND: &str = "127.0.0.1:8787";

#[derive(Debug, Parser)]
#[command(name = "ledger-ops", about = "Operational HTTP triggers for the permit ledger")]
struct Args {
    /// Directory holding ledger.json, the SQLite file and feeds/.
    #[arg(long, env = "LEDGER_BASE_DIR", default_value = ".ledger")]
    base_dir: PathBuf,
    #[arg(long, env = "LEDGER_OPS_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config = load_or_init_config(&args.base_dir).context("load ledger config")?;
    let token = config.ops_token();
    if token.is_none() {
        tracing::warn!("no ops token configured; every ops request will be rejected");
    }
    let bind = args
        .bind
        .or_else(|| config.ops.as_ref().and_then(|ops| ops.bind.clone()))
        .unwrap_or_else(|| DEFAULT_BIND.to_string());

    let store = LedgerRuntime::get_or_init(&config, &args.base_dir)
        .await
        .context("connect ledger store")?;
    let source = Arc::new(feed_source(&config, &args.base_dir));
    let app = router(OpsState::new(store, source, token));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, backend = config.backend_name(), "ledger ops listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve ops api")?;

    LedgerRuntime::shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}
