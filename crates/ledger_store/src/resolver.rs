use std::collections::BTreeSet;

use sea_orm::sea_query::{Cond, Expr, ExprTrait, Order, Query, SelectStatement};
use sea_orm::{ConnectionTrait, QueryResult};
use serde::{Deserialize, Serialize};

use permit_ledger_core::{
    Entity, EntityId, Hlc, Id, LedgerError, LedgerResult, MentionKey, NormalizedLicense,
    RawContactRecord, Relationship, ResolutionOutcome, address_overlap, address_tokens,
    canonical_pair, display_name, normalize_name, normalize_optional_license, role_label,
};

use crate::db::*;
use crate::gateway::{DuplicatePolicy, Gateway, Row, exec, query_all, query_one};

const RAW_CONTACT_KEYS: [&str; 3] = ["source_table", "source_record_id", "role"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub entity_id: EntityId,
    pub outcome: ResolutionOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub survivor: EntityId,
    pub absorbed: EntityId,
    pub contacts_repointed: u64,
    pub edges_rekeyed: u64,
}

/// Normalized view of one incoming mention.
struct Mention<'a> {
    record: &'a RawContactRecord,
    key: MentionKey,
    license: Option<NormalizedLicense>,
    name_key: String,
    display_name: String,
    address: BTreeSet<String>,
    role_label: String,
}

impl<'a> Mention<'a> {
    fn new(record: &'a RawContactRecord) -> Self {
        Self {
            record,
            key: record.mention_key(),
            license: normalize_optional_license(record.raw_license.as_deref()),
            name_key: normalize_name(&record.raw_name),
            display_name: display_name(&record.raw_name),
            address: record
                .address_hint
                .as_deref()
                .map(address_tokens)
                .unwrap_or_default(),
            role_label: role_label(record.source_table, record.role),
        }
    }

    fn license_str(&self) -> Option<&str> {
        self.license.as_ref().map(NormalizedLicense::as_str)
    }

    /// Compatible unless both sides carry different licenses.
    fn license_compatible(&self, entity: &Entity) -> bool {
        match (self.license_str(), entity.normalized_license.as_deref()) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

struct StoredMention {
    raw_name: String,
    raw_license: Option<String>,
    address_hint: Option<String>,
    entity_id: EntityId,
}

impl StoredMention {
    fn same_content(&self, record: &RawContactRecord) -> bool {
        self.raw_name == record.raw_name
            && self.raw_license == record.raw_license
            && self.address_hint == record.address_hint
    }
}

/// Attaches raw mentions to canonical entities. Runs on the caller's
/// connection or transaction and never commits on its own.
#[derive(Clone, Copy, Debug)]
pub struct Resolver {
    address_overlap_threshold: f64,
}

impl Resolver {
    pub fn new(address_overlap_threshold: f64) -> Self {
        Self {
            address_overlap_threshold,
        }
    }

    pub fn address_overlap_threshold(&self) -> f64 {
        self.address_overlap_threshold
    }

    pub async fn resolve<C: ConnectionTrait>(
        &self,
        gateway: &Gateway,
        conn: &C,
        record: &RawContactRecord,
        batch_id: &str,
        seen_at: Hlc,
    ) -> LedgerResult<Resolution> {
        let mention = Mention::new(record);
        if let Some(stored) = load_mention(conn, &mention.key).await? {
            if stored.same_content(record) {
                return Ok(Resolution {
                    entity_id: stored.entity_id,
                    outcome: ResolutionOutcome::Existing,
                });
            }
            log::debug!(
                "mention {}/{}/{} changed since it was stored; re-resolving",
                mention.key.source_table,
                mention.key.source_record_id,
                mention.key.role
            );
        }

        let (entity_id, outcome) =
            if let Some(entity) = self.license_candidate(conn, &mention).await? {
                let entity_id = entity.entity_id;
                attach(gateway, conn, entity, &mention, seen_at).await?;
                (entity_id, ResolutionOutcome::LicenseMatch)
            } else if let Some(entity) = self.name_candidate(conn, &mention).await? {
                let entity_id = entity.entity_id;
                attach(gateway, conn, entity, &mention, seen_at).await?;
                (entity_id, ResolutionOutcome::NameMatch)
            } else {
                let entity_id = create_entity(gateway, conn, &mention, seen_at).await?;
                (entity_id, ResolutionOutcome::Created)
            };

        store_mention(gateway, conn, &mention, entity_id, batch_id, seen_at).await?;
        Ok(Resolution { entity_id, outcome })
    }

    async fn license_candidate<C: ConnectionTrait>(
        &self,
        conn: &C,
        mention: &Mention<'_>,
    ) -> LedgerResult<Option<Entity>> {
        let Some(license) = mention.license_str() else {
            return Ok(None);
        };
        let select = entity_select()
            .and_where(Expr::col(Entities::NormalizedLicense).eq(license))
            .order_by(Entities::FirstSeen, Order::Asc)
            .order_by(Entities::EntityId, Order::Asc)
            .limit(1)
            .to_owned();
        query_one(conn, &select)
            .await?
            .map(|row| read_entity(&row))
            .transpose()
    }

    /// Same name key and overlapping address on another mention from the same feed.
    async fn name_candidate<C: ConnectionTrait>(
        &self,
        conn: &C,
        mention: &Mention<'_>,
    ) -> LedgerResult<Option<Entity>> {
        if mention.name_key.is_empty() || mention.address.is_empty() {
            return Ok(None);
        }
        let key = &mention.key;
        let select = Query::select()
            .columns(ENTITY_COLUMNS.map(|column| (Entities::Table, column)))
            .column((RawContacts::Table, RawContacts::AddressHint))
            .from(RawContacts::Table)
            .inner_join(
                Entities::Table,
                Expr::col((RawContacts::Table, RawContacts::EntityId))
                    .equals((Entities::Table, Entities::EntityId)),
            )
            .and_where(
                Expr::col((RawContacts::Table, RawContacts::SourceTable))
                    .eq(key.source_table.as_str()),
            )
            .and_where(Expr::col((RawContacts::Table, RawContacts::NameKey)).eq(mention.name_key.as_str()))
            .cond_where(
                Cond::any()
                    .add(
                        Expr::col((RawContacts::Table, RawContacts::SourceRecordId))
                            .ne(key.source_record_id.as_str()),
                    )
                    .add(Expr::col((RawContacts::Table, RawContacts::Role)).ne(key.role.as_str())),
            )
            .to_owned();
        let rows = query_all(conn, &select).await?;

        let mut best: Option<Entity> = None;
        for row in rows {
            let hint = read_opt_string(&row, RawContacts::AddressHint)?;
            let Some(hint) = hint else {
                continue;
            };
            let overlap = address_overlap(&mention.address, &address_tokens(&hint));
            if overlap < self.address_overlap_threshold {
                continue;
            }
            let entity = read_entity(&row)?;
            if !mention.license_compatible(&entity) {
                continue;
            }
            let better = best.as_ref().is_none_or(|current| {
                (entity.first_seen, entity.entity_id) < (current.first_seen, current.entity_id)
            });
            if better {
                best = Some(entity);
            }
        }
        Ok(best)
    }
}

const ENTITY_COLUMNS: [Entities; 6] = [
    Entities::EntityId,
    Entities::CanonicalName,
    Entities::NormalizedLicense,
    Entities::RolesJson,
    Entities::FirstSeen,
    Entities::LastSeen,
];

pub(crate) fn entity_select() -> SelectStatement {
    Query::select()
        .columns(ENTITY_COLUMNS)
        .from(Entities::Table)
        .to_owned()
}

pub(crate) fn read_entity(row: &QueryResult) -> LedgerResult<Entity> {
    let roles_json = read_string(row, Entities::RolesJson)?;
    let roles: BTreeSet<String> = serde_json::from_str(&roles_json)
        .map_err(|err| LedgerError::storage(format!("invalid roles json: {err}")))?;
    Ok(Entity {
        entity_id: read_entity_id(row, Entities::EntityId)?,
        canonical_name: read_string(row, Entities::CanonicalName)?,
        normalized_license: read_opt_string(row, Entities::NormalizedLicense)?,
        roles,
        first_seen: read_hlc(row, Entities::FirstSeen)?,
        last_seen: read_hlc(row, Entities::LastSeen)?,
    })
}

pub(crate) async fn load_entity<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    entity_id: EntityId,
) -> LedgerResult<Option<Entity>> {
    let select = entity_select()
        .and_where(Expr::col(Entities::EntityId).eq(gateway.entity_value(entity_id)))
        .limit(1)
        .to_owned();
    query_one(conn, &select)
        .await?
        .map(|row| read_entity(&row))
        .transpose()
}

fn roles_json(roles: &BTreeSet<String>) -> LedgerResult<String> {
    serde_json::to_string(roles)
        .map_err(|err| LedgerError::storage(format!("encode roles: {err}")))
}

async fn save_entity<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    entity: &Entity,
) -> LedgerResult<()> {
    let update = Query::update()
        .table(Entities::Table)
        .values([
            (Entities::CanonicalName, entity.canonical_name.clone().into()),
            (
                Entities::NormalizedLicense,
                entity.normalized_license.clone().into(),
            ),
            (Entities::RolesJson, roles_json(&entity.roles)?.into()),
            (Entities::FirstSeen, entity.first_seen.as_i64().into()),
            (Entities::LastSeen, entity.last_seen.as_i64().into()),
        ])
        .and_where(Expr::col(Entities::EntityId).eq(gateway.entity_value(entity.entity_id)))
        .to_owned();
    exec(conn, &update).await?;
    Ok(())
}

/// Longer display name wins; ties keep the current one.
fn refine_name(current: &str, candidate: &str) -> Option<String> {
    (candidate.chars().count() > current.chars().count()).then(|| candidate.to_string())
}

async fn attach<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    mut entity: Entity,
    mention: &Mention<'_>,
    seen_at: Hlc,
) -> LedgerResult<()> {
    let before = entity.clone();
    entity.roles.insert(mention.role_label.clone());
    if let Some(name) = refine_name(&entity.canonical_name, &mention.display_name) {
        entity.canonical_name = name;
    }
    if entity.normalized_license.is_none() {
        entity.normalized_license = mention.license_str().map(str::to_string);
    }
    entity.last_seen = entity.last_seen.max(seen_at);
    if entity != before {
        save_entity(gateway, conn, &entity).await?;
    }
    Ok(())
}

async fn create_entity<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    mention: &Mention<'_>,
    seen_at: Hlc,
) -> LedgerResult<EntityId> {
    // The founding id is taken only when this mention previously founded an
    // entity and has since changed content.
    let mut entity_id = mention.key.founding_entity_id();
    let mut attempt = 0u32;
    while load_entity(gateway, conn, entity_id).await?.is_some() {
        attempt += 1;
        entity_id = EntityId(Id::derived(&format!(
            "entity/{}/{}/{}#{attempt}",
            mention.key.source_table, mention.key.source_record_id, mention.key.role
        )));
    }
    let roles = BTreeSet::from([mention.role_label.clone()]);
    let row = Row::new()
        .set("entity_id", gateway.entity_value(entity_id))
        .set("canonical_name", mention.display_name.clone())
        .set("normalized_license", mention.license_str().map(str::to_string))
        .set("roles_json", roles_json(&roles)?)
        .set("first_seen", seen_at.as_i64())
        .set("last_seen", seen_at.as_i64());
    if !gateway
        .insert_if_absent(conn, "entities", &["entity_id"], &row)
        .await?
    {
        return Err(LedgerError::constraint(format!(
            "entity {entity_id} appeared concurrently"
        )));
    }
    Ok(entity_id)
}

async fn load_mention<C: ConnectionTrait>(
    conn: &C,
    key: &MentionKey,
) -> LedgerResult<Option<StoredMention>> {
    let select = Query::select()
        .columns([
            RawContacts::RawName,
            RawContacts::RawLicense,
            RawContacts::AddressHint,
            RawContacts::EntityId,
        ])
        .from(RawContacts::Table)
        .and_where(Expr::col(RawContacts::SourceTable).eq(key.source_table.as_str()))
        .and_where(Expr::col(RawContacts::SourceRecordId).eq(key.source_record_id.as_str()))
        .and_where(Expr::col(RawContacts::Role).eq(key.role.as_str()))
        .limit(1)
        .to_owned();
    let Some(row) = query_one(conn, &select).await? else {
        return Ok(None);
    };
    Ok(Some(StoredMention {
        raw_name: read_string(&row, RawContacts::RawName)?,
        raw_license: read_opt_string(&row, RawContacts::RawLicense)?,
        address_hint: read_opt_string(&row, RawContacts::AddressHint)?,
        entity_id: read_entity_id(&row, RawContacts::EntityId)?,
    }))
}

async fn store_mention<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    mention: &Mention<'_>,
    entity_id: EntityId,
    batch_id: &str,
    seen_at: Hlc,
) -> LedgerResult<()> {
    let record = mention.record;
    let row = Row::new()
        .set("source_table", record.source_table.as_str())
        .set("source_record_id", record.source_record_id.clone())
        .set("role", record.role.as_str())
        .set("raw_name", record.raw_name.clone())
        .set("raw_license", record.raw_license.clone())
        .set("address_hint", record.address_hint.clone())
        .set("normalized_license", mention.license_str().map(str::to_string))
        .set("name_key", mention.name_key.clone())
        .set("entity_id", gateway.entity_value(entity_id))
        .set("batch_id", batch_id.to_string())
        .set("ingested_at", seen_at.as_i64());
    gateway
        .upsert(conn, "raw_contacts", &RAW_CONTACT_KEYS, &row)
        .await
}

pub(crate) fn read_relationship(row: &QueryResult) -> LedgerResult<Relationship> {
    Ok(Relationship {
        entity_id_a: read_entity_id(row, Relationships::EntityIdA)?,
        entity_id_b: read_entity_id(row, Relationships::EntityIdB)?,
        shared_permits: row.try_get("", &col_name(Relationships::SharedPermits))?,
        last_shared_at: read_hlc(row, Relationships::LastSharedAt)?,
    })
}

pub(crate) fn relationship_select() -> SelectStatement {
    Query::select()
        .columns([
            Relationships::EntityIdA,
            Relationships::EntityIdB,
            Relationships::SharedPermits,
            Relationships::LastSharedAt,
        ])
        .from(Relationships::Table)
        .to_owned()
}

async fn edges_touching<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    entity_id: EntityId,
) -> LedgerResult<Vec<Relationship>> {
    let select = relationship_select()
        .cond_where(
            Cond::any()
                .add(Expr::col(Relationships::EntityIdA).eq(gateway.entity_value(entity_id)))
                .add(Expr::col(Relationships::EntityIdB).eq(gateway.entity_value(entity_id))),
        )
        .to_owned();
    query_all(conn, &select)
        .await?
        .iter()
        .map(read_relationship)
        .collect()
}

async fn load_edge<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    a: EntityId,
    b: EntityId,
) -> LedgerResult<Option<Relationship>> {
    let select = relationship_select()
        .and_where(Expr::col(Relationships::EntityIdA).eq(gateway.entity_value(a)))
        .and_where(Expr::col(Relationships::EntityIdB).eq(gateway.entity_value(b)))
        .limit(1)
        .to_owned();
    query_one(conn, &select)
        .await?
        .map(|row| read_relationship(&row))
        .transpose()
}

/// Moves one edge of the absorbed entity onto the survivor, keeping its
/// per-permit evidence and recounting the merged edge from that evidence.
async fn rekey_edge<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    edge: &Relationship,
    a: EntityId,
    b: EntityId,
) -> LedgerResult<()> {
    let placeholder = Row::new()
        .set("entity_id_a", gateway.entity_value(a))
        .set("entity_id_b", gateway.entity_value(b))
        .set("shared_permits", 0i64)
        .set("last_shared_at", edge.last_shared_at.as_i64());
    gateway
        .insert_if_absent(conn, "relationships", &["entity_id_a", "entity_id_b"], &placeholder)
        .await?;

    let evidence = Query::select()
        .columns([
            RelationshipPermits::SourceTable,
            RelationshipPermits::PermitRecordId,
            RelationshipPermits::RecordedAt,
        ])
        .from(RelationshipPermits::Table)
        .and_where(
            Expr::col(RelationshipPermits::EntityIdA).eq(gateway.entity_value(edge.entity_id_a)),
        )
        .and_where(
            Expr::col(RelationshipPermits::EntityIdB).eq(gateway.entity_value(edge.entity_id_b)),
        )
        .to_owned();
    let rows: Vec<Row> = query_all(conn, &evidence)
        .await?
        .iter()
        .map(|row| {
            Ok(Row::new()
                .set("source_table", read_string(row, RelationshipPermits::SourceTable)?)
                .set(
                    "permit_record_id",
                    read_string(row, RelationshipPermits::PermitRecordId)?,
                )
                .set("entity_id_a", gateway.entity_value(a))
                .set("entity_id_b", gateway.entity_value(b))
                .set(
                    "recorded_at",
                    read_hlc(row, RelationshipPermits::RecordedAt)?.as_i64(),
                ))
        })
        .collect::<LedgerResult<_>>()?;
    gateway
        .batch_insert(
            conn,
            "relationship_permits",
            &EVIDENCE_KEYS,
            &rows,
            DuplicatePolicy::Skip,
        )
        .await?;

    let merged = load_edge(gateway, conn, a, b)
        .await?
        .ok_or_else(|| LedgerError::storage("merged edge vanished"))?;
    let evidence_count = count_evidence(gateway, conn, a, b).await?;
    let shared_permits = Ord::max(Ord::max(evidence_count, merged.shared_permits), edge.shared_permits);
    let last_shared_at = merged.last_shared_at.max(edge.last_shared_at);
    let update = Query::update()
        .table(Relationships::Table)
        .values([
            (Relationships::SharedPermits, shared_permits.into()),
            (Relationships::LastSharedAt, last_shared_at.as_i64().into()),
        ])
        .and_where(Expr::col(Relationships::EntityIdA).eq(gateway.entity_value(a)))
        .and_where(Expr::col(Relationships::EntityIdB).eq(gateway.entity_value(b)))
        .to_owned();
    exec(conn, &update).await?;
    Ok(())
}

pub(crate) const EVIDENCE_KEYS: [&str; 4] = [
    "source_table",
    "permit_record_id",
    "entity_id_a",
    "entity_id_b",
];

async fn count_evidence<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    a: EntityId,
    b: EntityId,
) -> LedgerResult<i64> {
    let mut cursor = gateway
        .execute(
            conn,
            "SELECT COUNT(*) AS n FROM relationship_permits WHERE entity_id_a = ? AND entity_id_b = ?",
            vec![gateway.entity_value(a), gateway.entity_value(b)],
        )
        .await?;
    match cursor.fetch_one() {
        Some(row) => Ok(row.try_get("", "n")?),
        None => Ok(0),
    }
}

/// Folds `absorbed` into `survivor` on the caller's transaction: mentions are
/// re-pointed, edges re-keyed, roles unioned, and the absorbed entity deleted.
pub async fn merge_entities_in<C: ConnectionTrait>(
    gateway: &Gateway,
    conn: &C,
    survivor_id: EntityId,
    absorbed_id: EntityId,
) -> LedgerResult<MergeReport> {
    let mut report = MergeReport {
        survivor: survivor_id,
        absorbed: absorbed_id,
        contacts_repointed: 0,
        edges_rekeyed: 0,
    };
    if survivor_id == absorbed_id {
        return Ok(report);
    }
    let mut survivor = load_entity(gateway, conn, survivor_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("entity {survivor_id}")))?;
    let absorbed = load_entity(gateway, conn, absorbed_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("entity {absorbed_id}")))?;

    let repoint = Query::update()
        .table(RawContacts::Table)
        .value(RawContacts::EntityId, gateway.entity_value(survivor_id))
        .and_where(Expr::col(RawContacts::EntityId).eq(gateway.entity_value(absorbed_id)))
        .to_owned();
    report.contacts_repointed = exec(conn, &repoint).await?;

    for edge in edges_touching(gateway, conn, absorbed_id).await? {
        let Some(other) = edge.other_endpoint(absorbed_id) else {
            continue;
        };
        // Survivor-absorbed edges become self-edges and are dropped with the absorbed entity.
        let Some((a, b)) = canonical_pair(survivor_id, other) else {
            continue;
        };
        rekey_edge(gateway, conn, &edge, a, b).await?;
        report.edges_rekeyed += 1;
    }

    let delete = Query::delete()
        .from_table(Entities::Table)
        .and_where(Expr::col(Entities::EntityId).eq(gateway.entity_value(absorbed_id)))
        .to_owned();
    exec(conn, &delete).await?;

    survivor.roles.extend(absorbed.roles.iter().cloned());
    if let Some(name) = refine_name(&survivor.canonical_name, &absorbed.canonical_name) {
        survivor.canonical_name = name;
    }
    if survivor.normalized_license.is_none() {
        survivor.normalized_license = absorbed.normalized_license.clone();
    }
    survivor.first_seen = survivor.first_seen.min(absorbed.first_seen);
    survivor.last_seen = survivor.last_seen.max(absorbed.last_seen);
    save_entity(gateway, conn, &survivor).await?;

    log::info!(
        "merged entity {absorbed_id} into {survivor_id} ({} mentions, {} edges)",
        report.contacts_repointed,
        report.edges_rekeyed
    );
    Ok(report)
}

/// Groups of entities sharing a normalized license, survivor first
/// (earliest `first_seen`, then smallest id).
pub async fn duplicate_license_groups<C: ConnectionTrait>(
    conn: &C,
) -> LedgerResult<Vec<Vec<EntityId>>> {
    let select = entity_select()
        .and_where(Expr::col(Entities::NormalizedLicense).is_not_null())
        .order_by(Entities::NormalizedLicense, Order::Asc)
        .order_by(Entities::FirstSeen, Order::Asc)
        .order_by(Entities::EntityId, Order::Asc)
        .to_owned();
    let mut groups: Vec<(String, Vec<EntityId>)> = Vec::new();
    for row in query_all(conn, &select).await? {
        let entity = read_entity(&row)?;
        let Some(license) = entity.normalized_license else {
            continue;
        };
        match groups.last_mut() {
            Some((current, members)) if *current == license => members.push(entity.entity_id),
            _ => groups.push((license, vec![entity.entity_id])),
        }
    }
    Ok(groups
        .into_iter()
        .map(|(_, members)| members)
        .filter(|members| members.len() > 1)
        .collect())
}
