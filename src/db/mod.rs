use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Schema};

pub mod entities;
pub mod models;
pub mod session_store;

pub use session_store::{DbSessionStore, SessionStore, StoreError};

/// Creates the integration tables when they do not exist yet.
pub async fn create_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, entities::whatsapp_instance::Entity).await?;
    create_table(db, entities::calendar_sync::Entity).await?;
    Ok(())
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut statement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(backend.build(&statement)).await?;
    Ok(())
}
