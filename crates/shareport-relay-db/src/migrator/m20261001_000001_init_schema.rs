//! Initial schema: users, teams, memberships, device requests and tunnels

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. users
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(User::Table)
                    .if_not_exists()
                    .col(uuid(User::Id).primary_key())
                    .col(string_len(User::Email, 255).not_null().unique_key())
                    .col(string_len_null(User::DisplayName, 255))
                    .col(
                        timestamp_with_time_zone(User::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. teams
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Team::Table)
                    .if_not_exists()
                    .col(uuid(Team::Id).primary_key())
                    .col(string_len(Team::Name, 255).not_null())
                    .col(string_len(Team::Slug, 255).not_null().unique_key())
                    .col(uuid(Team::OwnerId).not_null())
                    .col(
                        timestamp_with_time_zone(Team::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_teams_owner_id")
                            .from(Team::Table, Team::OwnerId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_teams_slug")
                    .table(Team::Table)
                    .col(Team::Slug)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. team_members
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(TeamMember::Table)
                    .if_not_exists()
                    .col(uuid(TeamMember::TeamId).not_null())
                    .col(uuid(TeamMember::UserId).not_null())
                    .col(
                        string_len(TeamMember::Role, 32)
                            .not_null()
                            .default("member"),
                    )
                    .col(
                        timestamp_with_time_zone(TeamMember::JoinedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(TeamMember::TeamId)
                            .col(TeamMember::UserId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_team_members_team_id")
                            .from(TeamMember::Table, TeamMember::TeamId)
                            .to(Team::Table, Team::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_team_members_user_id")
                            .from(TeamMember::Table, TeamMember::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_team_members_user_id")
                    .table(TeamMember::Table)
                    .col(TeamMember::UserId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. device_requests
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(DeviceRequest::Table)
                    .if_not_exists()
                    .col(string_len(DeviceRequest::DeviceCode, 32).primary_key())
                    .col(
                        string_len(DeviceRequest::Status, 16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(uuid_null(DeviceRequest::UserId))
                    .col(timestamp_with_time_zone(DeviceRequest::CreatedAt).not_null())
                    .col(timestamp_with_time_zone(DeviceRequest::ExpiresAt).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_requests_created_at")
                    .table(DeviceRequest::Table)
                    .col(DeviceRequest::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 5. tunnels
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Tunnel::Table)
                    .if_not_exists()
                    .col(uuid(Tunnel::Id).primary_key())
                    .col(uuid(Tunnel::UserId).not_null())
                    .col(uuid_null(Tunnel::TeamId))
                    .col(string_len(Tunnel::CurrentUrl, 2048).not_null())
                    .col(integer(Tunnel::LocalPort).not_null())
                    .col(string_len(Tunnel::Status, 16).not_null().default("online"))
                    .col(
                        string_len(Tunnel::Privacy, 16)
                            .not_null()
                            .default("public"),
                    )
                    .col(timestamp_with_time_zone(Tunnel::CreatedAt).not_null())
                    .col(timestamp_with_time_zone(Tunnel::LastHeartbeat).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_user_id")
                    .table(Tunnel::Table)
                    .col(Tunnel::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_team_id")
                    .table(Tunnel::Table)
                    .col(Tunnel::TeamId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_status_heartbeat")
                    .table(Tunnel::Table)
                    .col(Tunnel::Status)
                    .col(Tunnel::LastHeartbeat)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tunnel::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(DeviceRequest::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(TeamMember::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Team::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(User::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum User {
    #[sea_orm(iden = "users")]
    Table,
    Id,
    Email,
    DisplayName,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Team {
    #[sea_orm(iden = "teams")]
    Table,
    Id,
    Name,
    Slug,
    OwnerId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum TeamMember {
    #[sea_orm(iden = "team_members")]
    Table,
    TeamId,
    UserId,
    Role,
    JoinedAt,
}

#[derive(DeriveIden)]
enum DeviceRequest {
    #[sea_orm(iden = "device_requests")]
    Table,
    DeviceCode,
    Status,
    UserId,
    CreatedAt,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum Tunnel {
    #[sea_orm(iden = "tunnels")]
    Table,
    Id,
    UserId,
    TeamId,
    CurrentUrl,
    LocalPort,
    Status,
    Privacy,
    CreatedAt,
    LastHeartbeat,
}
