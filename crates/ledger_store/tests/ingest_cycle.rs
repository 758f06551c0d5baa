use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use permit_ledger_store::{
    CancelFlag, ContactRole, IngestOptions, JsonlRecordSource, LedgerConfig, LedgerError, LedgerReadApi,
    LedgerResult, LedgerStore, LimitsConfig, MemoryRecordSource, MentionKey, PageOutcome,
    RawContactRecord, RecordPage, RecordSource, SourceTable,
};
use tempfile::tempdir;

fn config(base: &Path) -> LedgerConfig {
    LedgerConfig {
        limits: Some(LimitsConfig {
            max_ingest_batch: Some(2),
            retry_attempts: Some(1),
            retry_backoff_ms: Some(1),
        }),
        ..LedgerConfig::default_sqlite(base.join("ledger.sqlite").to_string_lossy())
    }
}

fn contact(
    source_table: SourceTable,
    permit: &str,
    role: ContactRole,
    name: &str,
    license: Option<&str>,
    address: Option<&str>,
) -> RawContactRecord {
    RawContactRecord {
        source_table,
        source_record_id: permit.to_string(),
        role,
        raw_name: name.to_string(),
        raw_license: license.map(str::to_string),
        address_hint: address.map(str::to_string),
    }
}

/// Five plumbing permits, one page each: the same licensed contractor and a
/// different applicant on every permit.
fn plumbing_feed() -> Vec<RawContactRecord> {
    (0..5)
        .flat_map(|i| {
            let permit = format!("P-{i}");
            [
                contact(
                    SourceTable::Plumbing,
                    &permit,
                    ContactRole::Applicant,
                    &format!("Owner {i}"),
                    None,
                    Some(&format!("{i} Elm St")),
                ),
                contact(
                    SourceTable::Plumbing,
                    &permit,
                    ContactRole::Contractor,
                    "Pipe Co",
                    Some("778899"),
                    None,
                ),
            ]
        })
        .collect()
}

/// Graph state that must not depend on how ingestion was chunked.
async fn graph_shape(store: &LedgerStore) -> LedgerResult<(BTreeSet<String>, BTreeSet<String>)> {
    let entities = store
        .list_entities()
        .await?
        .into_iter()
        .map(|entity| {
            format!(
                "{} {} {:?}",
                entity.entity_id, entity.canonical_name, entity.roles
            )
        })
        .collect();
    let edges = store
        .list_relationships()
        .await?
        .into_iter()
        .map(|edge| {
            format!(
                "{}-{} x{}",
                edge.entity_id_a, edge.entity_id_b, edge.shared_permits
            )
        })
        .collect();
    Ok((entities, edges))
}

/// Fails every fetch at or past `fail_at` while armed.
struct FlakySource {
    inner: MemoryRecordSource,
    fail_at: i64,
    armed: AtomicBool,
}

#[async_trait]
impl RecordSource for FlakySource {
    async fn fetch_page(
        &self,
        source_table: SourceTable,
        cursor: i64,
        limit: usize,
    ) -> LedgerResult<RecordPage> {
        if cursor >= self.fail_at && self.armed.load(Ordering::SeqCst) {
            return Err(LedgerError::storage("feed connection reset"));
        }
        self.inner.fetch_page(source_table, cursor, limit).await
    }
}

#[tokio::test]
async fn license_match_merges_contractor_across_feeds() -> LedgerResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = LedgerStore::open(&config(dir.path()), dir.path()).await?;
    let source = MemoryRecordSource::with_records([
        contact(
            SourceTable::Building,
            "B-1",
            ContactRole::Applicant,
            "Jane Owner",
            None,
            Some("12 Main St"),
        ),
        contact(
            SourceTable::Building,
            "B-1",
            ContactRole::Contractor,
            "Acme Builders",
            Some("0C-10"),
            None,
        ),
        contact(
            SourceTable::Electrical,
            "E-7",
            ContactRole::Contractor,
            "ACME BUILDERS INC.",
            Some("c10"),
            None,
        ),
        contact(
            SourceTable::Electrical,
            "E-7",
            ContactRole::Applicant,
            "Jane Owner",
            None,
            Some("12 Main St"),
        ),
    ]);
    let cancel = CancelFlag::new();
    let options = IngestOptions::default();

    let building = store
        .ingest_cycle(&source, SourceTable::Building, &options, &cancel)
        .await?;
    assert_eq!(building.records, 2);
    assert_eq!(building.resolution.created, 2);
    assert_eq!(building.edges_added, 1);
    assert_eq!(building.singleton_rate, 1.0);

    let electrical = store
        .ingest_cycle(&source, SourceTable::Electrical, &options, &cancel)
        .await?;
    assert_eq!(electrical.resolution.license_matches, 1);
    // Name matches never cross feeds.
    assert_eq!(electrical.resolution.created, 1);
    assert!((electrical.singleton_rate - 0.5).abs() < 1e-9);

    let key = MentionKey {
        source_table: SourceTable::Electrical,
        source_record_id: "E-7".to_string(),
        role: ContactRole::Contractor,
    };
    let acme_id = store.resolve_mention(&key).await?.expect("resolved");
    let acme = store.get_entity(acme_id).await?.expect("entity");
    assert_eq!(acme.normalized_license.as_deref(), Some("C10"));
    assert_eq!(acme.canonical_name, "ACME BUILDERS INC.");
    assert_eq!(
        acme.roles,
        BTreeSet::from([
            "building_contractor".to_string(),
            "electrical_contractor".to_string()
        ])
    );
    assert_eq!(store.raw_records_for_entity(acme_id).await?.len(), 2);
    assert_eq!(store.list_entities().await?.len(), 3);

    let neighbors = store.neighborhood(acme_id, 10).await?;
    assert_eq!(neighbors.len(), 2);
    assert!(neighbors.iter().all(|neighbor| neighbor.entity.canonical_name == "Jane Owner"));
    Ok(())
}

#[tokio::test]
async fn name_match_needs_overlapping_address_in_same_feed() -> LedgerResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = LedgerStore::open(&config(dir.path()), dir.path()).await?;
    let source = MemoryRecordSource::with_records([
        contact(
            SourceTable::Building,
            "B-1",
            ContactRole::Applicant,
            "Jane Owner",
            None,
            Some("12 Main St"),
        ),
        contact(
            SourceTable::Building,
            "B-2",
            ContactRole::Applicant,
            "JANE  OWNER",
            None,
            Some("12 Main Street"),
        ),
        contact(
            SourceTable::Building,
            "B-3",
            ContactRole::Applicant,
            "Jane Owner",
            None,
            Some("400 Harbor Blvd"),
        ),
    ]);
    let report = store
        .ingest_cycle(
            &source,
            SourceTable::Building,
            &IngestOptions::default(),
            &CancelFlag::new(),
        )
        .await?;
    assert_eq!(report.resolution.name_matches, 1);
    assert_eq!(report.resolution.created, 2);
    assert_eq!(report.pages_committed, 2);

    let first = MentionKey {
        source_table: SourceTable::Building,
        source_record_id: "B-1".to_string(),
        role: ContactRole::Applicant,
    };
    let second = MentionKey {
        source_record_id: "B-2".to_string(),
        ..first.clone()
    };
    assert_eq!(
        store.resolve_mention(&first).await?,
        store.resolve_mention(&second).await?
    );
    Ok(())
}

#[tokio::test]
async fn reingesting_same_records_changes_nothing() -> LedgerResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = LedgerStore::open(&config(dir.path()), dir.path()).await?;
    let source = MemoryRecordSource::with_records(plumbing_feed());
    let cancel = CancelFlag::new();
    let options = IngestOptions::default();

    let first = store
        .ingest_cycle(&source, SourceTable::Plumbing, &options, &cancel)
        .await?;
    assert_eq!(first.pages_committed, 5);
    assert_eq!(first.final_cursor, 10);
    let before = graph_shape(&store).await?;
    let counts_before = store.row_counts().await?;

    // Nothing past the checkpoint.
    let again = store
        .ingest_cycle(&source, SourceTable::Plumbing, &options, &cancel)
        .await?;
    assert_eq!(again.pages_committed, 0);
    assert_eq!(again.start_cursor, 10);

    // The same page replayed at its original cursor is recognised by its checkpoint.
    let page = source.fetch_page(SourceTable::Plumbing, 0, 2).await?;
    assert_eq!(
        store.commit_page(SourceTable::Plumbing, 0, &page).await?,
        PageOutcome::AlreadyCommitted
    );

    // The same records delivered again further along the feed resolve to existing entities.
    source.extend(plumbing_feed());
    let replay = store
        .ingest_cycle(&source, SourceTable::Plumbing, &options, &cancel)
        .await?;
    assert_eq!(replay.pages_committed, 5);
    assert_eq!(replay.resolution.existing, 10);
    assert_eq!(replay.edges_added, 0);

    assert_eq!(graph_shape(&store).await?, before);
    let counts_after = store.row_counts().await?;
    assert_eq!(counts_after["entities"], counts_before["entities"]);
    assert_eq!(counts_after["relationships"], counts_before["relationships"]);
    assert_eq!(counts_after["raw_contacts"], counts_before["raw_contacts"]);
    assert_eq!(counts_after["ingestion_batches"], 10);
    Ok(())
}

#[tokio::test]
async fn interrupted_cycle_resumes_from_checkpoint() -> LedgerResult<()> {
    let baseline_dir = tempdir().expect("tempdir");
    let baseline = LedgerStore::open(&config(baseline_dir.path()), baseline_dir.path()).await?;
    baseline
        .ingest_cycle(
            &MemoryRecordSource::with_records(plumbing_feed()),
            SourceTable::Plumbing,
            &IngestOptions::default(),
            &CancelFlag::new(),
        )
        .await?;

    let dir = tempdir().expect("tempdir");
    let store = LedgerStore::open(&config(dir.path()), dir.path()).await?;
    let source = FlakySource {
        inner: MemoryRecordSource::with_records(plumbing_feed()),
        fail_at: 6,
        armed: AtomicBool::new(true),
    };
    let options = IngestOptions {
        page_size: Some(2),
        max_pages: None,
    };
    let err = store
        .ingest_cycle(&source, SourceTable::Plumbing, &options, &CancelFlag::new())
        .await
        .expect_err("fourth page fetch fails");
    assert!(matches!(err, LedgerError::Storage { .. }));
    let checkpoint = store
        .last_checkpoint(SourceTable::Plumbing)
        .await?
        .expect("checkpoint");
    assert_eq!(checkpoint.cursor_position, 6);
    assert_eq!(store.list_batches(SourceTable::Plumbing).await?.len(), 3);

    source.armed.store(false, Ordering::SeqCst);
    let resumed = store
        .ingest_cycle(&source, SourceTable::Plumbing, &options, &CancelFlag::new())
        .await?;
    assert_eq!(resumed.start_cursor, 6);
    assert_eq!(resumed.pages_committed, 2);
    assert_eq!(resumed.final_cursor, 10);

    assert_eq!(graph_shape(&store).await?, graph_shape(&baseline).await?);
    Ok(())
}

#[tokio::test]
async fn failpoint_rolls_back_the_whole_page() -> LedgerResult<()> {
    let dir = tempdir().expect("tempdir");
    let failing = LedgerConfig {
        failpoints: Some(vec!["before_page_commit".to_string()]),
        ..config(dir.path())
    };
    let store = LedgerStore::open(&failing, dir.path()).await?;
    let source = MemoryRecordSource::with_records(plumbing_feed());
    let err = store
        .ingest_cycle(
            &source,
            SourceTable::Plumbing,
            &IngestOptions::default(),
            &CancelFlag::new(),
        )
        .await
        .expect_err("failpoint");
    assert!(err.to_string().contains("before_page_commit"));
    let counts = store.row_counts().await?;
    assert!(counts.values().all(|count| *count == 0), "{counts:?}");
    store.close().await?;

    let store = LedgerStore::open(&config(dir.path()), dir.path()).await?;
    let report = store
        .ingest_cycle(
            &source,
            SourceTable::Plumbing,
            &IngestOptions::default(),
            &CancelFlag::new(),
        )
        .await?;
    assert_eq!(report.start_cursor, 0);
    assert_eq!(report.pages_committed, 5);
    Ok(())
}

#[tokio::test]
async fn page_budget_and_cancellation_stop_between_pages() -> LedgerResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = LedgerStore::open(&config(dir.path()), dir.path()).await?;
    let source = MemoryRecordSource::with_records(plumbing_feed());

    let limited = store
        .ingest_cycle(
            &source,
            SourceTable::Plumbing,
            &IngestOptions {
                page_size: Some(50),
                max_pages: Some(2),
            },
            &CancelFlag::new(),
        )
        .await?;
    // Page size is capped by the configured maximum of two records.
    assert_eq!(limited.pages_committed, 2);
    assert_eq!(limited.final_cursor, 4);

    let cancel = CancelFlag::new();
    cancel.cancel();
    let cancelled = store
        .ingest_cycle(&source, SourceTable::Plumbing, &IngestOptions::default(), &cancel)
        .await?;
    assert!(cancelled.cancelled);
    assert_eq!(cancelled.pages_committed, 0);
    assert_eq!(cancelled.start_cursor, 4);

    let rest = store
        .ingest_cycle(
            &source,
            SourceTable::Plumbing,
            &IngestOptions::default(),
            &CancelFlag::new(),
        )
        .await?;
    assert_eq!(rest.pages_committed, 3);
    assert!(!rest.cancelled);
    Ok(())
}

#[tokio::test]
async fn loose_feed_lines_are_ingested_not_dropped() -> LedgerResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = LedgerStore::open(&config(dir.path()), dir.path()).await?;
    let feeds = dir.path().join("feeds");
    std::fs::create_dir_all(&feeds).expect("feeds dir");
    let lines = [
        r#"{"source_table":"building","source_record_id":"B-1","role":"applicant","raw_name":"Jane Owner","address_hint":"12 Main St"}"#,
        r#"{"source_table":"building","source_record_id":"B-1","role":"CONTRACTOR","raw_name":"Acme Builders","raw_license":10}"#,
        r#"{"source_table":"electrical","source_record_id":"E-7","role":"Contractor","raw_name":"Spark Co"}"#,
        "[1, 2, 3]",
        r#"{"source_record_id":"B-2","role":"Engineer","raw_name":"Eng Ltd"}"#,
    ];
    let body = format!("{}\n", lines.join("\n"));
    std::fs::write(feeds.join("building.jsonl"), &body).expect("write feed");
    let source = JsonlRecordSource::new(&feeds);
    let options = IngestOptions::default();

    let report = store
        .ingest_cycle(&source, SourceTable::Building, &options, &CancelFlag::new())
        .await?;
    assert_eq!(report.pages_committed, 3);
    assert_eq!(report.records, 4);
    assert_eq!(report.records_skipped, 1);
    assert_eq!(report.resolution.created, 4);
    assert_eq!(report.edges_added, 1);
    assert_eq!(report.final_cursor, body.len() as i64);

    // A record from another feed resolves under its own table.
    let stray = MentionKey {
        source_table: SourceTable::Electrical,
        source_record_id: "E-7".to_string(),
        role: ContactRole::Contractor,
    };
    assert!(store.resolve_mention(&stray).await?.is_some());
    let contractor = MentionKey {
        source_table: SourceTable::Building,
        source_record_id: "B-1".to_string(),
        role: ContactRole::Contractor,
    };
    let acme_id = store.resolve_mention(&contractor).await?.expect("resolved");
    let acme = store.get_entity(acme_id).await?.expect("entity");
    assert_eq!(acme.normalized_license.as_deref(), Some("10"));
    let engineer = MentionKey {
        source_table: SourceTable::Building,
        source_record_id: "B-2".to_string(),
        role: ContactRole::Engineer,
    };
    assert!(store.resolve_mention(&engineer).await?.is_some());

    let again = store
        .ingest_cycle(&source, SourceTable::Building, &options, &CancelFlag::new())
        .await?;
    assert_eq!(again.pages_committed, 0);
    assert_eq!(again.start_cursor, body.len() as i64);
    assert_eq!(store.list_batches(SourceTable::Building).await?.len(), 3);
    Ok(())
}
