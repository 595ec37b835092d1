//! Client entity: one row per known agent, active or disconnected

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clients")]
pub struct Model {
    /// Client id (primary key), at most 64 characters.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Credential the client authenticated with.
    pub client_auth_id: String,

    /// When the control link closed; NULL while the client is connected.
    pub disconnected_at: Option<ChronoDateTimeUtc>,

    /// Everything else about the client, as the API-facing JSON document.
    pub details: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
