use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const USER_PREFIX_LEN: usize = 8;

fn user_prefix(user_id: &str) -> String {
    user_id.chars().take(USER_PREFIX_LEN).collect()
}

/// Messaging instance owned by `user_id`; stable across sessions.
pub fn instance_name_for(user_id: &str) -> String {
    format!("wa_{}", user_prefix(user_id))
}

/// Row key of the user's calendar credentials.
pub fn calendar_instance_for(user_id: &str) -> String {
    format!("cal_{}", user_prefix(user_id))
}

/// Persisted lifecycle status of a messaging instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    Uninitialized,
    Provisioning,
    AwaitingScan,
    Open,
    Expired,
    Error,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Uninitialized => "uninitialized",
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::AwaitingScan => "awaiting-scan",
            InstanceStatus::Open => "open",
            InstanceStatus::Expired => "expired",
            InstanceStatus::Error => "error",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(InstanceStatus::Uninitialized),
            "provisioning" => Ok(InstanceStatus::Provisioning),
            "awaiting-scan" | "awaiting_scan" => Ok(InstanceStatus::AwaitingScan),
            "open" => Ok(InstanceStatus::Open),
            "expired" => Ok(InstanceStatus::Expired),
            "error" => Ok(InstanceStatus::Error),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub user_id: String,
    pub instance_name: String,
    pub status: InstanceStatus,
    pub last_updated: DateTime<Utc>,
}

/// Tokens needed to call the calendar API on the user's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarCredentials {
    pub access_token: String,
    pub calendar_id: String,
}

/// Provider tokens captured after a Google sign-in.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub calendar_id: Option<String>,
}
