use sea_orm::sea_query::{self, ColumnDef, Value as SeaValue};
use sea_orm::{DatabaseBackend, QueryResult};
use sea_orm_migration::prelude::Iden;
use uuid::Uuid;

use permit_ledger_core::{EntityId, Hlc, Id, LedgerError, LedgerResult};

/// Tables reported in health row counts, in dependency order.
pub const LEDGER_TABLES: [&str; 5] = [
    "entities",
    "raw_contacts",
    "relationships",
    "relationship_permits",
    "ingestion_batches",
];

#[derive(Iden, Clone, Copy)]
pub enum RawContacts {
    Table,
    SourceTable,
    SourceRecordId,
    Role,
    RawName,
    RawLicense,
    AddressHint,
    NormalizedLicense,
    NameKey,
    EntityId,
    BatchId,
    IngestedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum Entities {
    Table,
    EntityId,
    CanonicalName,
    NormalizedLicense,
    RolesJson,
    FirstSeen,
    LastSeen,
}

#[derive(Iden, Clone, Copy)]
pub enum Relationships {
    Table,
    EntityIdA,
    EntityIdB,
    SharedPermits,
    LastSharedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum RelationshipPermits {
    Table,
    SourceTable,
    PermitRecordId,
    EntityIdA,
    EntityIdB,
    RecordedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum IngestionBatches {
    Table,
    BatchId,
    SourceTable,
    CursorStart,
    CursorPosition,
    RowCount,
    CommittedAt,
}

pub fn id_value(backend: DatabaseBackend, id: Id) -> SeaValue {
    match backend {
        DatabaseBackend::Postgres => SeaValue::Uuid(Some(Uuid::from_bytes(id.as_bytes()))),
        _ => SeaValue::String(Some(id.to_uuid_string())),
    }
}

pub fn entity_value(backend: DatabaseBackend, entity_id: EntityId) -> SeaValue {
    id_value(backend, entity_id.0)
}

pub fn id_col(backend: DatabaseBackend, col: impl Iden + 'static, nullable: bool) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    match backend {
        DatabaseBackend::Postgres => {
            col_def.uuid();
        }
        _ => {
            col_def.string_len(36);
        }
    }
    if nullable {
        col_def.null();
    } else {
        col_def.not_null();
    }
    col_def.to_owned()
}

pub fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

pub fn read_id(row: &QueryResult, column: impl sea_query::Iden) -> LedgerResult<Id> {
    let name = col_name(column);
    if let Ok(value) = row.try_get::<String>("", &name) {
        return Id::from_uuid_str(&value);
    }
    if let Ok(value) = row.try_get::<Uuid>("", &name) {
        return Ok(Id::from_bytes(*value.as_bytes()));
    }
    Err(LedgerError::storage(format!("unsupported id format in column {name}")))
}

pub fn read_entity_id(row: &QueryResult, column: impl sea_query::Iden) -> LedgerResult<EntityId> {
    read_id(row, column).map(EntityId)
}

pub fn read_hlc(row: &QueryResult, column: impl sea_query::Iden) -> LedgerResult<Hlc> {
    let value: i64 = row.try_get("", &col_name(column))?;
    Ok(Hlc::from_i64(value))
}

pub fn read_string(row: &QueryResult, column: impl sea_query::Iden) -> LedgerResult<String> {
    Ok(row.try_get("", &col_name(column))?)
}

pub fn read_opt_string(
    row: &QueryResult,
    column: impl sea_query::Iden,
) -> LedgerResult<Option<String>> {
    Ok(row.try_get("", &col_name(column))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idens_render_snake_case() {
        assert_eq!(col_name(RawContacts::Table), "raw_contacts");
        assert_eq!(col_name(RelationshipPermits::PermitRecordId), "permit_record_id");
        assert_eq!(col_name(Relationships::EntityIdA), "entity_id_a");
        assert_eq!(col_name(IngestionBatches::Table), "ingestion_batches");
    }

    #[test]
    fn ids_bind_as_uuid_on_postgres_and_text_elsewhere() {
        let id = Id::derived("entity/building/B-1/applicant");
        assert!(matches!(
            id_value(DatabaseBackend::Postgres, id),
            SeaValue::Uuid(Some(_))
        ));
        match id_value(DatabaseBackend::Sqlite, id) {
            SeaValue::String(Some(text)) => assert_eq!(*text, id.to_uuid_string()),
            other => panic!("unexpected value {other:?}"),
        }
    }
}
