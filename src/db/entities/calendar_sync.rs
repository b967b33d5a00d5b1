use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// OAuth tokens captured from the Google sign-in, one row per (user, calendar instance).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "calendar_sync")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub instance_name: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub calendar_id: Option<String>,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
