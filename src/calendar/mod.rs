use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::db::models::CalendarCredentials;

#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("Google Calendar not connected")]
    NotConnected,
    #[error("Google token may be expired. Please reconnect.")]
    ReconnectRequired,
    #[error("Calendar API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub start: EventTime,
    #[serde(default)]
    pub end: EventTime,
}

/// Appointment to book, with RFC 3339 start and end.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCalendarEvent {
    pub summary: String,
    pub start: String,
    pub end: String,
    pub description: Option<String>,
}

#[derive(Serialize)]
struct InsertEventBody<'a> {
    summary: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    start: EventTime,
    end: EventTime,
}

#[derive(Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<CalendarEvent>,
}

pub struct GoogleCalendarClient {
    client: Client,
    base_url: String,
}

impl GoogleCalendarClient {
    pub fn new(base_url: &str) -> Result<Self, CalendarError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn events_url(&self, credentials: &CalendarCredentials) -> String {
        format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(&credentials.calendar_id)
        )
    }

    /// Next `max_results` events starting from now, expanded and ordered by start time.
    pub async fn list_upcoming(
        &self,
        credentials: &CalendarCredentials,
        max_results: u32,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        let time_min = Utc::now().to_rfc3339();
        let max_results = max_results.to_string();
        let response = self
            .client
            .get(self.events_url(credentials))
            .bearer_auth(&credentials.access_token)
            .query(&[
                ("timeMin", time_min.as_str()),
                ("maxResults", max_results.as_str()),
                ("orderBy", "startTime"),
                ("singleEvents", "true"),
            ])
            .send()
            .await?;

        let list: EventList = check(response).await?.json().await?;
        Ok(list.items)
    }

    pub async fn create_event(
        &self,
        credentials: &CalendarCredentials,
        event: &NewCalendarEvent,
    ) -> Result<CalendarEvent, CalendarError> {
        let body = InsertEventBody {
            summary: &event.summary,
            description: event.description.as_deref(),
            start: EventTime {
                date_time: Some(event.start.clone()),
                date: None,
            },
            end: EventTime {
                date_time: Some(event.end.clone()),
                date: None,
            },
        };
        let response = self
            .client
            .post(self.events_url(credentials))
            .bearer_auth(&credentials.access_token)
            .json(&body)
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }
}

async fn check(response: Response) -> Result<Response, CalendarError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(CalendarError::ReconnectRequired);
    }
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "Failed to reach calendar".to_string());
    Err(CalendarError::Api {
        status: status.as_u16(),
        message,
    })
}
