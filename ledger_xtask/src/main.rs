use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use permit_ledger_store::{
    CancelFlag, ContactRole, EntityId, IngestOptions, LedgerReadApi, LedgerStore, MentionKey,
    SourceTable, feed_source, load_or_init_config,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Migrate => migrate(&cli.store).await,
        Command::Ingest(args) => ingest(&cli.store, args).await,
        Command::Health => health(&cli.store).await,
        Command::Resolve(args) => resolve(&cli.store, args).await,
        Command::Neighborhood(args) => neighborhood(&cli.store, args).await,
        Command::Merge(args) => merge(&cli.store, args).await,
    }
}

#[derive(Parser)]
#[command(author, version, about = "Developer utilities for the permit contact ledger")]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StoreArgs {
    /// Directory holding ledger.json, the default SQLite file and feeds/.
    #[arg(long, global = true, env = "LEDGER_BASE_DIR", default_value = ".ledger")]
    base_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending schema steps.
    Migrate,
    /// Run one ingestion cycle against the feed directory.
    Ingest(IngestArgs),
    /// Print the health snapshot; exits non-zero when degraded.
    Health,
    /// Look up the entity a mention resolved to.
    Resolve(ResolveArgs),
    /// List an entity's strongest co-occurrence neighbors.
    Neighborhood(NeighborhoodArgs),
    /// Fold one entity into another.
    Merge(MergeArgs),
}

#[derive(Args)]
struct IngestArgs {
    source_table: String,
    #[arg(long)]
    max_pages: Option<usize>,
    #[arg(long)]
    page_size: Option<usize>,
}

#[derive(Args)]
struct ResolveArgs {
    source_table: String,
    source_record_id: String,
    role: String,
}

#[derive(Args)]
struct NeighborhoodArgs {
    entity_id: String,
    #[arg(long, default_value_t = 25)]
    limit: u32,
}

#[derive(Args)]
struct MergeArgs {
    survivor: String,
    absorbed: String,
}

async fn open(args: &StoreArgs) -> Result<LedgerStore> {
    let config = load_or_init_config(&args.base_dir)
        .with_context(|| format!("load config under {}", args.base_dir.display()))?;
    Ok(LedgerStore::connect(&config, &args.base_dir).await?)
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_table(value: &str) -> Result<SourceTable> {
    value
        .parse()
        .map_err(|_| anyhow!("unknown source table '{value}'"))
}

async fn migrate(args: &StoreArgs) -> Result<()> {
    let store = open(args).await?;
    let applied = store.migrate().await?;
    print_json(&serde_json::json!({ "applied": applied }))?;
    store.close().await?;
    Ok(())
}

async fn ingest(store_args: &StoreArgs, args: IngestArgs) -> Result<()> {
    let source_table = parse_table(&args.source_table)?;
    let config = load_or_init_config(&store_args.base_dir)?;
    let store = LedgerStore::open(&config, &store_args.base_dir).await?;
    let source = feed_source(&config, &store_args.base_dir);
    let options = IngestOptions {
        page_size: args.page_size,
        max_pages: args.max_pages,
    };
    let report = store
        .ingest_cycle(&source, source_table, &options, &CancelFlag::new())
        .await?;
    print_json(&report)?;
    store.close().await?;
    Ok(())
}

async fn health(args: &StoreArgs) -> Result<()> {
    let store = open(args).await?;
    let health = store.health().await;
    print_json(&health)?;
    store.close().await?;
    if !health.healthy {
        return Err(anyhow!(
            "ledger degraded: {}",
            health.message.as_deref().unwrap_or("unknown")
        ));
    }
    Ok(())
}

async fn resolve(store_args: &StoreArgs, args: ResolveArgs) -> Result<()> {
    let store = open(store_args).await?;
    let role: ContactRole = args
        .role
        .parse()
        .map_err(|_| anyhow!("unknown role '{}'", args.role))?;
    let key = MentionKey {
        source_table: parse_table(&args.source_table)?,
        source_record_id: args.source_record_id,
        role,
    };
    let entity = match store.resolve_mention(&key).await? {
        Some(entity_id) => store.get_entity(entity_id).await?,
        None => None,
    };
    print_json(&entity)?;
    store.close().await?;
    Ok(())
}

async fn neighborhood(store_args: &StoreArgs, args: NeighborhoodArgs) -> Result<()> {
    let store = open(store_args).await?;
    let entity_id = EntityId::parse(&args.entity_id)?;
    let neighbors = store.neighborhood(entity_id, args.limit).await?;
    print_json(&neighbors)?;
    store.close().await?;
    Ok(())
}

async fn merge(store_args: &StoreArgs, args: MergeArgs) -> Result<()> {
    let store = open(store_args).await?;
    let report = store
        .merge_entities(
            EntityId::parse(&args.survivor)?,
            EntityId::parse(&args.absorbed)?,
        )
        .await?;
    print_json(&report)?;
    store.close().await?;
    Ok(())
}
