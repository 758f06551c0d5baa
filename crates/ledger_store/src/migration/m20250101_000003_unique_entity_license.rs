use sea_orm_migration::prelude::*;

use crate::db::Entities;
use crate::migration::{gateway_for, into_db_err};

pub const ENTITY_LICENSE_INDEX: &str = "entities_normalized_license_uq";

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let gateway = gateway_for(manager)?;
        gateway
            .create_unique_index(
                manager.get_connection(),
                ENTITY_LICENSE_INDEX,
                "entities",
                &["normalized_license"],
            )
            .await
            .map_err(into_db_err)
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name(ENTITY_LICENSE_INDEX)
                    .table(Entities::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await
    }
}
