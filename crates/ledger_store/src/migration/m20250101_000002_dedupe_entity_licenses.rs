use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::TransactionTrait;

use crate::migration::{gateway_for, into_db_err};
use crate::resolver::{duplicate_license_groups, merge_entities_in};

/// Folds entities that share a normalized license into the earliest one so the
/// unique license index that follows can be built. Each group merges in its own
/// transaction; a failed group leaves its entities untouched.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let gateway = gateway_for(manager)?;
        let conn = manager.get_connection();
        let groups = duplicate_license_groups(conn).await.map_err(into_db_err)?;
        if groups.is_empty() {
            return Ok(());
        }
        let mut merged = 0usize;
        for group in &groups {
            let Some((survivor, absorbed)) = group.split_first() else {
                continue;
            };
            let tx = conn.begin().await?;
            for absorbed in absorbed {
                if let Err(err) = merge_entities_in(&gateway, &tx, *survivor, *absorbed).await {
                    tx.rollback().await?;
                    return Err(into_db_err(err));
                }
                merged += 1;
            }
            tx.commit().await?;
        }
        log::warn!(
            "merged {merged} entities across {} duplicate license group(s)",
            groups.len()
        );
        Ok(())
    }

    async fn down(&self, _manager: &SchemaManager) -> Result<(), DbErr> {
        // Merges are not reversible.
        Ok(())
    }
}
