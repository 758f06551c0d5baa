use std::collections::BTreeSet;

use permit_ledger_store::{
    CancelFlag, ContactRole, EntityId, IngestOptions, LedgerError, LedgerReadApi, LedgerResult,
    LedgerStore, MemoryRecordSource, MentionKey, RawContactRecord, SourceTable,
};
use tempfile::tempdir;

fn contact(permit: &str, role: ContactRole, name: &str, address: &str) -> RawContactRecord {
    RawContactRecord {
        source_table: SourceTable::Building,
        source_record_id: permit.to_string(),
        role,
        raw_name: name.to_string(),
        raw_license: None,
        address_hint: Some(address.to_string()),
    }
}

async fn entity_for(store: &LedgerStore, permit: &str, role: ContactRole) -> LedgerResult<EntityId> {
    let key = MentionKey {
        source_table: SourceTable::Building,
        source_record_id: permit.to_string(),
        role,
    };
    Ok(store.resolve_mention(&key).await?.expect("resolved mention"))
}

/// Two spellings of one architect that never matched, each sharing permits
/// with the same owner and with each other.
async fn seeded_store(dir: &std::path::Path) -> LedgerResult<LedgerStore> {
    let store = LedgerStore::open_sqlite(&dir.join("ledger.sqlite")).await?;
    let source = MemoryRecordSource::with_records([
        contact("B-1", ContactRole::Applicant, "Harbor Holdings", "1 Pier Rd"),
        contact("B-1", ContactRole::Architect, "Studio North", "9 Loft Ave"),
        contact("B-2", ContactRole::Applicant, "Harbor Holdings", "1 Pier Rd"),
        contact("B-2", ContactRole::Architect, "Studio North Architects", "77 Canal St"),
        contact("B-2", ContactRole::Engineer, "Studio North", "9 Loft Ave"),
    ]);
    store
        .ingest_cycle(
            &source,
            SourceTable::Building,
            &IngestOptions::default(),
            &CancelFlag::new(),
        )
        .await?;
    Ok(store)
}

#[tokio::test]
async fn merge_rekeys_edges_and_unions_roles() -> LedgerResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = seeded_store(dir.path()).await?;
    let owner = entity_for(&store, "B-1", ContactRole::Applicant).await?;
    let survivor = entity_for(&store, "B-1", ContactRole::Architect).await?;
    let absorbed = entity_for(&store, "B-2", ContactRole::Architect).await?;
    assert_ne!(survivor, absorbed);
    // The B-2 engineer mention name-matched the B-1 architect.
    assert_eq!(entity_for(&store, "B-2", ContactRole::Engineer).await?, survivor);

    let report = store.merge_entities(survivor, absorbed).await?;
    assert_eq!(report.contacts_repointed, 1);

    assert_eq!(store.get_entity(absorbed).await?, None);
    let merged = store.get_entity(survivor).await?.expect("survivor");
    assert_eq!(merged.canonical_name, "Studio North Architects");
    assert_eq!(
        merged.roles,
        BTreeSet::from([
            "building_architect".to_string(),
            "building_engineer".to_string()
        ])
    );
    assert_eq!(entity_for(&store, "B-2", ContactRole::Architect).await?, survivor);
    assert_eq!(store.raw_records_for_entity(survivor).await?.len(), 3);

    // Owner shared B-1 and B-2 with the architect; each permit counts once.
    let neighbors = store.neighborhood(owner, 10).await?;
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].entity.entity_id, survivor);
    assert_eq!(neighbors[0].shared_permits, 2);
    Ok(())
}

#[tokio::test]
async fn merge_leaves_no_orphan_or_self_edges() -> LedgerResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = seeded_store(dir.path()).await?;
    let survivor = entity_for(&store, "B-1", ContactRole::Architect).await?;
    let absorbed = entity_for(&store, "B-2", ContactRole::Architect).await?;
    store.merge_entities(survivor, absorbed).await?;

    let entities: BTreeSet<EntityId> = store
        .list_entities()
        .await?
        .into_iter()
        .map(|entity| entity.entity_id)
        .collect();
    let edges = store.list_relationships().await?;
    assert!(!edges.is_empty());
    for edge in &edges {
        assert!(edge.entity_id_a < edge.entity_id_b);
        assert!(entities.contains(&edge.entity_id_a), "orphan edge {edge:?}");
        assert!(entities.contains(&edge.entity_id_b), "orphan edge {edge:?}");
        assert!(edge.entity_id_a != absorbed && edge.entity_id_b != absorbed);
    }

    let mut cursor = store
        .gateway()
        .execute(
            store.connection(),
            "SELECT COUNT(*) AS n FROM raw_contacts WHERE entity_id NOT IN (SELECT entity_id FROM entities)",
            Vec::new(),
        )
        .await?;
    let dangling: i64 = cursor.fetch_one().expect("count row").try_get("", "n")?;
    assert_eq!(dangling, 0);
    Ok(())
}

#[tokio::test]
async fn merge_rejects_unknown_entities() -> LedgerResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = seeded_store(dir.path()).await?;
    let survivor = entity_for(&store, "B-1", ContactRole::Architect).await?;
    let missing = EntityId::for_mention("building", "B-404", "owner");
    let err = store
        .merge_entities(survivor, missing)
        .await
        .expect_err("missing entity");
    assert!(matches!(err, LedgerError::NotFound { .. }));

    let report = store.merge_entities(survivor, survivor).await?;
    assert_eq!(report.contacts_repointed, 0);
    assert!(store.get_entity(survivor).await?.is_some());
    Ok(())
}
