use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseConnection;

use permit_ledger_core::{LedgerError, LedgerResult};

use crate::gateway::{Gateway, query_all};

mod m20250101_000001_core_tables;
mod m20250101_000002_dedupe_entity_licenses;
mod m20250101_000003_unique_entity_license;

pub const MIGRATION_TABLE: &str = "migration_steps";

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_core_tables::Migration),
            Box::new(m20250101_000002_dedupe_entity_licenses::Migration),
            Box::new(m20250101_000003_unique_entity_license::Migration),
        ]
    }

    fn migration_table_name() -> DynIden {
        Alias::new(MIGRATION_TABLE).into_iden()
    }
}

pub fn declared_steps() -> Vec<String> {
    Migrator::migrations()
        .iter()
        .map(|migration| migration.name().to_string())
        .collect()
}

/// Applied step names in version order; empty before the first migration.
pub async fn applied_steps(conn: &DatabaseConnection) -> LedgerResult<Vec<String>> {
    let manager = SchemaManager::new(conn);
    if !manager.has_table(MIGRATION_TABLE).await? {
        return Ok(Vec::new());
    }
    let select = Query::select()
        .column(Alias::new("version"))
        .from(Alias::new(MIGRATION_TABLE))
        .order_by(Alias::new("version"), Order::Asc)
        .to_owned();
    let rows = query_all(conn, &select).await?;
    rows.iter()
        .map(|row| Ok(row.try_get::<String>("", "version")?))
        .collect()
}

/// Fails unless the applied steps are exactly a prefix of the declared list.
pub fn verify_prefix(declared: &[String], applied: &[String]) -> LedgerResult<()> {
    if applied.len() > declared.len() {
        return Err(LedgerError::invalid(format!(
            "{} migration steps applied but only {} declared",
            applied.len(),
            declared.len()
        )));
    }
    for (position, (applied, declared)) in applied.iter().zip(declared).enumerate() {
        if applied != declared {
            return Err(LedgerError::invalid(format!(
                "migration step {position} is '{applied}', expected '{declared}'"
            )));
        }
    }
    Ok(())
}

pub async fn pending_steps(conn: &DatabaseConnection) -> LedgerResult<Vec<String>> {
    let declared = declared_steps();
    let applied = applied_steps(conn).await?;
    verify_prefix(&declared, &applied)?;
    Ok(declared[applied.len()..].to_vec())
}

/// Applies every pending step in order and returns their names. Steps commit
/// one at a time, so a failing step keeps the ones before it.
pub async fn migrate_up(conn: &DatabaseConnection) -> LedgerResult<Vec<String>> {
    let pending = pending_steps(conn).await?;
    if pending.is_empty() {
        return Ok(pending);
    }
    log::info!("applying {} migration step(s): {}", pending.len(), pending.join(", "));
    apply_one_by_one(conn, &pending).await?;
    Ok(pending)
}

/// Applies at most `steps` pending steps.
pub async fn migrate_steps(conn: &DatabaseConnection, steps: u32) -> LedgerResult<Vec<String>> {
    let pending = pending_steps(conn).await?;
    let take = (steps as usize).min(pending.len());
    apply_one_by_one(conn, &pending[..take]).await?;
    Ok(pending[..take].to_vec())
}

async fn apply_one_by_one(conn: &DatabaseConnection, steps: &[String]) -> LedgerResult<()> {
    for step in steps {
        if let Err(err) = Migrator::up(conn, Some(1)).await {
            log::error!("migration step {step} failed: {err}");
            return Err(err.into());
        }
        log::debug!("applied migration step {step}");
    }
    Ok(())
}

pub(crate) fn into_db_err(err: LedgerError) -> DbErr {
    DbErr::Custom(err.to_string())
}

pub(crate) fn gateway_for(manager: &SchemaManager) -> Result<Gateway, DbErr> {
    Gateway::for_backend(manager.get_database_backend()).map_err(into_db_err)
}
