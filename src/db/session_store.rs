use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{DatabaseConnection, DbErr, EntityTrait, Set, sea_query::OnConflict};
use thiserror::Error;

use super::entities::{calendar_sync, whatsapp_instance};
use super::models::{CalendarCredentials, CalendarTokens, InstanceRecord, InstanceStatus, calendar_instance_for};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Integration state persisted outside the reconciler, keyed by (user, instance name).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Idempotent insert-or-update of the instance row.
    async fn upsert_instance_status(
        &self,
        user_id: &str,
        instance_name: &str,
        status: InstanceStatus,
    ) -> Result<(), StoreError>;

    async fn find_instance(&self, user_id: &str, instance_name: &str) -> Result<Option<InstanceRecord>, StoreError>;

    /// True once the user has stored a usable calendar access token.
    async fn calendar_connected(&self, user_id: &str) -> Result<bool, StoreError>;

    async fn calendar_credentials(&self, user_id: &str) -> Result<Option<CalendarCredentials>, StoreError>;

    async fn save_calendar_tokens(&self, user_id: &str, tokens: &CalendarTokens) -> Result<(), StoreError>;
}

pub struct DbSessionStore {
    db: DatabaseConnection,
}

impl DbSessionStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn calendar_row(&self, user_id: &str) -> Result<Option<calendar_sync::Model>, StoreError> {
        let key = (user_id.to_owned(), calendar_instance_for(user_id));
        Ok(calendar_sync::Entity::find_by_id(key).one(&self.db).await?)
    }
}

fn to_record(model: whatsapp_instance::Model) -> Result<InstanceRecord, StoreError> {
    let status = model
        .status
        .parse::<InstanceStatus>()
        .map_err(StoreError::Corrupt)?;
    Ok(InstanceRecord {
        user_id: model.user_id,
        instance_name: model.instance_name,
        status,
        last_updated: model.updated_at,
    })
}

#[async_trait]
impl SessionStore for DbSessionStore {
    async fn upsert_instance_status(
        &self,
        user_id: &str,
        instance_name: &str,
        status: InstanceStatus,
    ) -> Result<(), StoreError> {
        let row = whatsapp_instance::ActiveModel {
            user_id: Set(user_id.to_owned()),
            instance_name: Set(instance_name.to_owned()),
            status: Set(status.as_str().to_owned()),
            updated_at: Set(Utc::now()),
        };

        whatsapp_instance::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    whatsapp_instance::Column::UserId,
                    whatsapp_instance::Column::InstanceName,
                ])
                .update_columns([
                    whatsapp_instance::Column::Status,
                    whatsapp_instance::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn find_instance(&self, user_id: &str, instance_name: &str) -> Result<Option<InstanceRecord>, StoreError> {
        whatsapp_instance::Entity::find_by_id((user_id.to_owned(), instance_name.to_owned()))
            .one(&self.db)
            .await?
            .map(to_record)
            .transpose()
    }

    async fn calendar_connected(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .calendar_row(user_id)
            .await?
            .and_then(|row| row.access_token)
            .is_some_and(|token| !token.is_empty()))
    }

    async fn calendar_credentials(&self, user_id: &str) -> Result<Option<CalendarCredentials>, StoreError> {
        Ok(self.calendar_row(user_id).await?.and_then(|row| {
            let access_token = row.access_token.filter(|t| !t.is_empty())?;
            Some(CalendarCredentials {
                access_token,
                calendar_id: row
                    .calendar_id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| "primary".to_string()),
            })
        }))
    }

    async fn save_calendar_tokens(&self, user_id: &str, tokens: &CalendarTokens) -> Result<(), StoreError> {
        let row = calendar_sync::ActiveModel {
            user_id: Set(user_id.to_owned()),
            instance_name: Set(calendar_instance_for(user_id)),
            access_token: Set(Some(tokens.access_token.clone())),
            refresh_token: Set(tokens.refresh_token.clone()),
            calendar_id: Set(tokens.calendar_id.clone()),
            updated_at: Set(Utc::now()),
        };

        // Absent refresh token / calendar id keep whatever was stored before.
        let mut updated = vec![
            calendar_sync::Column::AccessToken,
            calendar_sync::Column::UpdatedAt,
        ];
        if tokens.refresh_token.is_some() {
            updated.push(calendar_sync::Column::RefreshToken);
        }
        if tokens.calendar_id.is_some() {
            updated.push(calendar_sync::Column::CalendarId);
        }

        calendar_sync::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([calendar_sync::Column::UserId, calendar_sync::Column::InstanceName])
                    .update_columns(updated)
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}
