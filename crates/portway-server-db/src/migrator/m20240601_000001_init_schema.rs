//! Initial schema: clients, client_auths, jobs

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Clients::Table)
                    .if_not_exists()
                    .col(string_len(Clients::Id, 64).primary_key())
                    .col(string_len(Clients::ClientAuthId, 64))
                    .col(timestamp_with_time_zone_null(Clients::DisconnectedAt))
                    .col(json(Clients::Details))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_clients_disconnected_at")
                    .table(Clients::Table)
                    .col(Clients::DisconnectedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ClientAuths::Table)
                    .if_not_exists()
                    .col(string_len(ClientAuths::Id, 64).primary_key())
                    .col(string(ClientAuths::Password))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(uuid(Jobs::Jid).primary_key())
                    .col(string_len(Jobs::ClientId, 64))
                    .col(string_len(Jobs::Status, 16))
                    .col(json(Jobs::Details))
                    .col(timestamp_with_time_zone(Jobs::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_jobs_client_id")
                    .table(Jobs::Table)
                    .col(Jobs::ClientId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ClientAuths::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Clients::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Clients {
    Table,
    Id,
    ClientAuthId,
    DisconnectedAt,
    Details,
}

#[derive(DeriveIden)]
enum ClientAuths {
    Table,
    Id,
    Password,
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Jid,
    ClientId,
    Status,
    Details,
    CreatedAt,
}
