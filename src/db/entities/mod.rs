//! SeaORM entities for the integration tables the dashboard shares with the auth provider.

pub mod calendar_sync;
pub mod whatsapp_instance;
