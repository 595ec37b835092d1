//! ClientAuth entity: credentials agents connect with

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "client_auths")]
pub struct Model {
    /// Auth id (primary key).
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Plain password or PHC-formatted argon2id hash.
    pub password: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
