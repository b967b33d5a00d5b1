pub mod auth_routes;
pub mod calendar_routes;
pub mod whatsapp_routes;
