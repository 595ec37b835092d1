//! Job entity: one row per remote command execution

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    /// Job id (primary key).
    #[sea_orm(primary_key, auto_increment = false)]
    pub jid: Uuid,

    /// Client the command ran on.
    pub client_id: String,

    /// running | successful | failed | unknown
    pub status: String,

    /// Command, interpreter, result and timing, as the API-facing JSON.
    pub details: Json,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
