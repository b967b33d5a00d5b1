use serde::{Deserialize, Serialize};

use crate::db::models::InstanceRecord;
use crate::gateway::{ConnectionState, InstanceSummary};

// JWT Claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub aud: String,
    pub exp: usize,
    #[serde(default)]
    pub email: Option<String>,
}

/// The signed-in user, passed to handlers as a request extension.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub instance_name: String,
    pub record: Option<InstanceRecord>,
    pub gateway_state: ConnectionState,
    pub gateway_entry: Option<InstanceSummary>,
}

#[derive(Debug, Serialize)]
pub struct CalendarStatus {
    pub connected: bool,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub max_results: Option<u32>,
}
