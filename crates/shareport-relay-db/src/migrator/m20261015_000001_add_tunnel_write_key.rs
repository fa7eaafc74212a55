//! Per-session write key on tunnels

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Existing rows keep NULL and can no longer be written through the API
        manager
            .alter_table(
                Table::alter()
                    .table(Tunnel::Table)
                    .add_column(ColumnDef::new(Tunnel::WriteKey).string_len(64).null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .alter_table(
                Table::alter()
                    .table(Tunnel::Table)
                    .drop_column(Tunnel::WriteKey)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum Tunnel {
    #[sea_orm(iden = "tunnels")]
    Table,
    WriteKey,
}
