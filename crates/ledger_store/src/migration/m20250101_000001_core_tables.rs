use sea_orm_migration::prelude::*;

use crate::db::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();

        manager
            .create_table(
                Table::create()
                    .table(Entities::Table)
                    .if_not_exists()
                    .col(id_col(backend, Entities::EntityId, false))
                    .col(ColumnDef::new(Entities::CanonicalName).text().not_null())
                    .col(ColumnDef::new(Entities::NormalizedLicense).string_len(20).null())
                    .col(ColumnDef::new(Entities::RolesJson).text().not_null())
                    .col(ColumnDef::new(Entities::FirstSeen).big_integer().not_null())
                    .col(ColumnDef::new(Entities::LastSeen).big_integer().not_null())
                    .primary_key(
                        Index::create()
                            .name("pk_entities")
                            .col(Entities::EntityId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RawContacts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(RawContacts::SourceTable).string_len(16).not_null())
                    .col(ColumnDef::new(RawContacts::SourceRecordId).string().not_null())
                    .col(ColumnDef::new(RawContacts::Role).string_len(16).not_null())
                    .col(ColumnDef::new(RawContacts::RawName).text().not_null())
                    .col(ColumnDef::new(RawContacts::RawLicense).text().null())
                    .col(ColumnDef::new(RawContacts::AddressHint).text().null())
                    .col(ColumnDef::new(RawContacts::NormalizedLicense).string_len(20).null())
                    .col(ColumnDef::new(RawContacts::NameKey).text().not_null())
                    .col(id_col(backend, RawContacts::EntityId, false))
                    .col(ColumnDef::new(RawContacts::BatchId).string().not_null())
                    .col(ColumnDef::new(RawContacts::IngestedAt).big_integer().not_null())
                    .primary_key(
                        Index::create()
                            .name("pk_raw_contacts")
                            .col(RawContacts::SourceTable)
                            .col(RawContacts::SourceRecordId)
                            .col(RawContacts::Role),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_raw_contacts_entity")
                            .from(RawContacts::Table, RawContacts::EntityId)
                            .to(Entities::Table, Entities::EntityId)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Relationships::Table)
                    .if_not_exists()
                    .col(id_col(backend, Relationships::EntityIdA, false))
                    .col(id_col(backend, Relationships::EntityIdB, false))
                    .col(
                        ColumnDef::new(Relationships::SharedPermits)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Relationships::LastSharedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_relationships")
                            .col(Relationships::EntityIdA)
                            .col(Relationships::EntityIdB),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_relationships_a")
                            .from(Relationships::Table, Relationships::EntityIdA)
                            .to(Entities::Table, Entities::EntityId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_relationships_b")
                            .from(Relationships::Table, Relationships::EntityIdB)
                            .to(Entities::Table, Entities::EntityId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .check(Expr::col(Relationships::EntityIdA).lt(Expr::col(Relationships::EntityIdB)))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RelationshipPermits::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RelationshipPermits::SourceTable)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RelationshipPermits::PermitRecordId)
                            .string()
                            .not_null(),
                    )
                    .col(id_col(backend, RelationshipPermits::EntityIdA, false))
                    .col(id_col(backend, RelationshipPermits::EntityIdB, false))
                    .col(
                        ColumnDef::new(RelationshipPermits::RecordedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_relationship_permits")
                            .col(RelationshipPermits::SourceTable)
                            .col(RelationshipPermits::PermitRecordId)
                            .col(RelationshipPermits::EntityIdA)
                            .col(RelationshipPermits::EntityIdB),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_relationship_permits_a")
                            .from(RelationshipPermits::Table, RelationshipPermits::EntityIdA)
                            .to(Entities::Table, Entities::EntityId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_relationship_permits_b")
                            .from(RelationshipPermits::Table, RelationshipPermits::EntityIdB)
                            .to(Entities::Table, Entities::EntityId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(IngestionBatches::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(IngestionBatches::BatchId).string().not_null())
                    .col(
                        ColumnDef::new(IngestionBatches::SourceTable)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IngestionBatches::CursorStart)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IngestionBatches::CursorPosition)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IngestionBatches::RowCount).big_integer().not_null())
                    .col(
                        ColumnDef::new(IngestionBatches::CommittedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_ingestion_batches")
                            .col(IngestionBatches::BatchId),
                    )
                    .to_owned(),
            )
            .await?;

        create_indexes(manager).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(IngestionBatches::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RelationshipPermits::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Relationships::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RawContacts::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Entities::Table).if_exists().to_owned())
            .await?;
        Ok(())
    }
}

async fn create_indexes(manager: &SchemaManager<'_>) -> Result<(), DbErr> {
    manager
        .create_index(
            Index::create()
                .name("entities_normalized_license_idx")
                .table(Entities::Table)
                .col(Entities::NormalizedLicense)
                .if_not_exists()
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("raw_contacts_entity_idx")
                .table(RawContacts::Table)
                .col(RawContacts::EntityId)
                .if_not_exists()
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("raw_contacts_name_key_idx")
                .table(RawContacts::Table)
                .col(RawContacts::SourceTable)
                .col(RawContacts::NameKey)
                .if_not_exists()
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("raw_contacts_permit_idx")
                .table(RawContacts::Table)
                .col(RawContacts::SourceTable)
                .col(RawContacts::SourceRecordId)
                .if_not_exists()
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("relationships_b_idx")
                .table(Relationships::Table)
                .col(Relationships::EntityIdB)
                .if_not_exists()
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("relationship_permits_pair_idx")
                .table(RelationshipPermits::Table)
                .col(RelationshipPermits::EntityIdA)
                .col(RelationshipPermits::EntityIdB)
                .if_not_exists()
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("ingestion_batches_source_idx")
                .table(IngestionBatches::Table)
                .col(IngestionBatches::SourceTable)
                .col(IngestionBatches::CursorPosition)
                .if_not_exists()
                .to_owned(),
        )
        .await?;
    Ok(())
}
