use std::collections::BTreeSet;

use sea_orm::ConnectionTrait;
use sea_orm::sea_query::{Expr, ExprTrait, OnConflict, Query};

use permit_ledger_core::{EntityId, Hlc, LedgerResult, SourceTable, canonical_pair};

use crate::db::*;
use crate::gateway::{Gateway, Row, exec, query_all};
use crate::resolver::EVIDENCE_KEYS;

/// Entities currently mentioned on one permit record.
pub async fn permit_entities<C: ConnectionTrait>(
    conn: &C,
    source_table: SourceTable,
    permit_record_id: &str,
) -> LedgerResult<BTreeSet<EntityId>> {
    let select = Query::select()
        .column(RawContacts::EntityId)
        .from(RawContacts::Table)
        .and_where(Expr::col(RawContacts::SourceTable).eq(source_table.as_str()))
        .and_where(Expr::col(RawContacts::SourceRecordId).eq(permit_record_id))
        .to_owned();
    query_all(conn, &select)
        .await?
        .iter()
        .map(|row| read_entity_id(row, RawContacts::EntityId))
        .collect()
}

/// Records co-occurrence of `entity_ids` on one permit. Each unordered pair is
/// counted once per permit; repeats are rejected by the evidence key.
/// Returns the number of edges whose count grew.
pub async fn update_edges<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    source_table: SourceTable,
    permit_record_id: &str,
    entity_ids: &BTreeSet<EntityId>,
    at: Hlc,
) -> LedgerResult<u64> {
    let ids: Vec<EntityId> = entity_ids.iter().copied().collect();
    let mut grown = 0;
    for (index, first) in ids.iter().enumerate() {
        for second in &ids[index + 1..] {
            let Some((a, b)) = canonical_pair(*first, *second) else {
                continue;
            };
            let evidence = Row::new()
                .set("source_table", source_table.as_str())
                .set("permit_record_id", permit_record_id.to_string())
                .set("entity_id_a", gateway.entity_value(a))
                .set("entity_id_b", gateway.entity_value(b))
                .set("recorded_at", at.as_i64());
            if gateway
                .insert_if_absent(conn, "relationship_permits", &EVIDENCE_KEYS, &evidence)
                .await?
            {
                bump_edge(gateway, conn, a, b, at).await?;
                grown += 1;
            }
        }
    }
    Ok(grown)
}

async fn bump_edge<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    a: EntityId,
    b: EntityId,
    at: Hlc,
) -> LedgerResult<()> {
    let insert = Query::insert()
        .into_table(Relationships::Table)
        .columns([
            Relationships::EntityIdA,
            Relationships::EntityIdB,
            Relationships::SharedPermits,
            Relationships::LastSharedAt,
        ])
        .values_panic([
            gateway.entity_value(a).into(),
            gateway.entity_value(b).into(),
            1i64.into(),
            at.as_i64().into(),
        ])
        .on_conflict(
            OnConflict::columns([Relationships::EntityIdA, Relationships::EntityIdB])
                .value(
                    Relationships::SharedPermits,
                    Expr::col((Relationships::Table, Relationships::SharedPermits)).add(1),
                )
                .update_column(Relationships::LastSharedAt)
                .to_owned(),
        )
        .to_owned();
    exec(conn, &insert).await?;
    Ok(())
}
