//! Calendar adapters. Per the Open Question decision recorded in
//! DESIGN.md, calendar events are never indexed into the vector store or
//! Content Store — these adapters only serve the multiplexer's `calendar`
//! capability directly against the live provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use relay_auth::{AuthBridge, Credential, OAuthConfig, Provider, TokenStore};

use crate::retry::{AdapterError, RetryPolicy};

#[derive(Debug, Clone)]
pub struct CalendarEvent {
    pub event_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub location: Option<String>,
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewCalendarEvent {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub location: Option<String>,
    pub attendees: Vec<String>,
}

#[async_trait]
pub trait CalendarCapability: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn list_events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<CalendarEvent>, AdapterError>;

    async fn create_event(&self, event: &NewCalendarEvent) -> Result<CalendarEvent, AdapterError>;

    async fn update_event(&self, event_id: &str, event: &NewCalendarEvent) -> Result<CalendarEvent, AdapterError>;
}

pub struct GoogleCalendarAdapter {
    user_id: String,
    http: reqwest::Client,
    token_store: TokenStore,
    auth_bridge: AuthBridge,
    oauth: OAuthConfig,
    retry: RetryPolicy,
}

impl GoogleCalendarAdapter {
    pub fn new(user_id: impl Into<String>, token_store: TokenStore, oauth: OAuthConfig) -> Self {
        Self {
            user_id: user_id.into(),
            http: reqwest::Client::new(),
            token_store,
            auth_bridge: AuthBridge::new(),
            oauth,
            retry: RetryPolicy::default(),
        }
    }

    async fn bearer_token(&self) -> Result<String, AdapterError> {
        let oauth = self.oauth.clone();
        let bridge = self.auth_bridge.clone();
        let check = self
            .token_store
            .check(&self.user_id, Provider::Google, move |cred: Credential| {
                let oauth = oauth.clone();
                async move {
                    let refresh_token = cred
                        .refresh_token
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("google credential has no refresh token"))?;
                    bridge.refresh_token(Provider::Google, &refresh_token, &oauth).await
                }
            })
            .await;

        if !check.valid {
            return Err(AdapterError::AuthFailed(
                check.error.unwrap_or_else(|| "google credential invalid or expired".to_string()),
            ));
        }
        self.token_store
            .load_credential(&self.user_id, Provider::Google)
            .map(|c| c.access_token)
            .ok_or_else(|| AdapterError::AuthFailed("google credential missing after check".to_string()))
    }
}

#[async_trait]
impl CalendarCapability for GoogleCalendarAdapter {
    fn provider_id(&self) -> &str {
        "google_calendar"
    }

    async fn list_events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<CalendarEvent>, AdapterError> {
        let token = self.bearer_token().await?;
        let params = vec![
            ("timeMin", from.to_rfc3339()),
            ("timeMax", to.to_rfc3339()),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
        ];

        let response = self
            .retry
            .call("gcal:list", || {
                self.http
                    .get("https://www.googleapis.com/calendar/v3/calendars/primary/events")
                    .query(&params)
                    .bearer_auth(&token)
            })
            .await?;

        let list: GoogleEventList = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("gcal list decode: {e}")))?;

        Ok(list.items.into_iter().filter_map(google_event_to_calendar_event).collect())
    }

    async fn create_event(&self, event: &NewCalendarEvent) -> Result<CalendarEvent, AdapterError> {
        let token = self.bearer_token().await?;
        let body = google_event_body(event);

        let response = self
            .retry
            .call("gcal:create", || {
                self.http
                    .post("https://www.googleapis.com/calendar/v3/calendars/primary/events")
                    .bearer_auth(&token)
                    .json(&body)
            })
            .await?;

        let created: GoogleEvent = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("gcal create decode: {e}")))?;
        google_event_to_calendar_event(created).ok_or_else(|| AdapterError::PermanentUpstream("gcal: malformed event in create response".to_string()))
    }

    async fn update_event(&self, event_id: &str, event: &NewCalendarEvent) -> Result<CalendarEvent, AdapterError> {
        let token = self.bearer_token().await?;
        let body = google_event_body(event);

        let response = self
            .retry
            .call("gcal:update", || {
                self.http
                    .patch(format!("https://www.googleapis.com/calendar/v3/calendars/primary/events/{event_id}"))
                    .bearer_auth(&token)
                    .json(&body)
            })
            .await?;

        let updated: GoogleEvent = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("gcal update decode: {e}")))?;
        google_event_to_calendar_event(updated).ok_or_else(|| AdapterError::PermanentUpstream("gcal: malformed event in update response".to_string()))
    }
}

fn google_event_body(event: &NewCalendarEvent) -> serde_json::Value {
    serde_json::json!({
        "summary": event.title,
        "location": event.location,
        "start": { "dateTime": event.start.to_rfc3339() },
        "end": { "dateTime": event.end.to_rfc3339() },
        "attendees": event.attendees.iter().map(|a| serde_json::json!({ "email": a })).collect::<Vec<_>>(),
    })
}

fn google_event_to_calendar_event(event: GoogleEvent) -> Option<CalendarEvent> {
    let start = event.start.date_time.as_deref().and_then(|s| DateTime::parse_from_rfc3339(s).ok())?.with_timezone(&Utc);
    let end = event.end.date_time.as_deref().and_then(|s| DateTime::parse_from_rfc3339(s).ok())?.with_timezone(&Utc);
    Some(CalendarEvent {
        event_id: event.id,
        title: event.summary.unwrap_or_default(),
        start,
        end,
        location: event.location,
        attendees: event.attendees.unwrap_or_default().into_iter().map(|a| a.email).collect(),
    })
}

pub struct OutlookCalendarAdapter {
    user_id: String,
    http: reqwest::Client,
    token_store: TokenStore,
    auth_bridge: AuthBridge,
    oauth: OAuthConfig,
    retry: RetryPolicy,
}

impl OutlookCalendarAdapter {
    pub fn new(user_id: impl Into<String>, token_store: TokenStore, oauth: OAuthConfig) -> Self {
        Self {
            user_id: user_id.into(),
            http: reqwest::Client::new(),
            token_store,
            auth_bridge: AuthBridge::new(),
            oauth,
            retry: RetryPolicy::default(),
        }
    }

    async fn bearer_token(&self) -> Result<String, AdapterError> {
        let oauth = self.oauth.clone();
        let bridge = self.auth_bridge.clone();
        let check = self
            .token_store
            .check(&self.user_id, Provider::Microsoft, move |cred: Credential| {
                let oauth = oauth.clone();
                async move {
                    let refresh_token = cred
                        .refresh_token
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("microsoft credential has no refresh token"))?;
                    bridge.refresh_token(Provider::Microsoft, &refresh_token, &oauth).await
                }
            })
            .await;

        if !check.valid {
            return Err(AdapterError::AuthFailed(
                check.error.unwrap_or_else(|| "microsoft credential invalid or expired".to_string()),
            ));
        }
        self.token_store
            .load_credential(&self.user_id, Provider::Microsoft)
            .map(|c| c.access_token)
            .ok_or_else(|| AdapterError::AuthFailed("microsoft credential missing after check".to_string()))
    }
}

#[async_trait]
impl CalendarCapability for OutlookCalendarAdapter {
    fn provider_id(&self) -> &str {
        "outlook_calendar"
    }

    async fn list_events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<CalendarEvent>, AdapterError> {
        let token = self.bearer_token().await?;
        let params = vec![("startDateTime", from.to_rfc3339()), ("endDateTime", to.to_rfc3339())];

        let response = self
            .retry
            .call("outlook_cal:list", || {
                self.http.get("https://graph.microsoft.com/v1.0/me/calendarView").query(&params).bearer_auth(&token)
            })
            .await?;

        let list: GraphEventList = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("outlook cal list decode: {e}")))?;

        Ok(list.value.into_iter().filter_map(graph_event_to_calendar_event).collect())
    }

    async fn create_event(&self, event: &NewCalendarEvent) -> Result<CalendarEvent, AdapterError> {
        let token = self.bearer_token().await?;
        let body = graph_event_body(event);

        let response = self
            .retry
            .call("outlook_cal:create", || {
                self.http.post("https://graph.microsoft.com/v1.0/me/events").bearer_auth(&token).json(&body)
            })
            .await?;

        let created: GraphEvent = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("outlook cal create decode: {e}")))?;
        graph_event_to_calendar_event(created).ok_or_else(|| AdapterError::PermanentUpstream("outlook cal: malformed event in create response".to_string()))
    }

    async fn update_event(&self, event_id: &str, event: &NewCalendarEvent) -> Result<CalendarEvent, AdapterError> {
        let token = self.bearer_token().await?;
        let body = graph_event_body(event);

        let response = self
            .retry
            .call("outlook_cal:update", || {
                self.http.patch(format!("https://graph.microsoft.com/v1.0/me/events/{event_id}")).bearer_auth(&token).json(&body)
            })
            .await?;

        let updated: GraphEvent = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("outlook cal update decode: {e}")))?;
        graph_event_to_calendar_event(updated).ok_or_else(|| AdapterError::PermanentUpstream("outlook cal: malformed event in update response".to_string()))
    }
}

fn graph_event_body(event: &NewCalendarEvent) -> serde_json::Value {
    serde_json::json!({
        "subject": event.title,
        "location": { "displayName": event.location.clone().unwrap_or_default() },
        "start": { "dateTime": event.start.to_rfc3339(), "timeZone": "UTC" },
        "end": { "dateTime": event.end.to_rfc3339(), "timeZone": "UTC" },
        "attendees": event.attendees.iter().map(|a| serde_json::json!({ "emailAddress": { "address": a } })).collect::<Vec<_>>(),
    })
}

fn graph_event_to_calendar_event(event: GraphEvent) -> Option<CalendarEvent> {
    let start = DateTime::parse_from_rfc3339(&event.start.date_time).ok()?.with_timezone(&Utc);
    let end = DateTime::parse_from_rfc3339(&event.end.date_time).ok()?.with_timezone(&Utc);
    Some(CalendarEvent {
        event_id: event.id,
        title: event.subject.unwrap_or_default(),
        start,
        end,
        location: event.location.and_then(|l| l.display_name),
        attendees: event
            .attendees
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| a.email_address.map(|e| e.address))
            .collect(),
    })
}

#[derive(Debug, Deserialize)]
struct GoogleEventList {
    items: Vec<GoogleEvent>,
}

#[derive(Debug, Deserialize)]
struct GoogleEvent {
    id: String,
    summary: Option<String>,
    location: Option<String>,
    start: GoogleEventTime,
    end: GoogleEventTime,
    attendees: Option<Vec<GoogleAttendee>>,
}

#[derive(Debug, Deserialize)]
struct GoogleEventTime {
    #[serde(rename = "dateTime")]
    date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleAttendee {
    email: String,
}

#[derive(Debug, Deserialize)]
struct GraphEventList {
    value: Vec<GraphEvent>,
}

#[derive(Debug, Deserialize)]
struct GraphEvent {
    id: String,
    subject: Option<String>,
    location: Option<GraphLocation>,
    start: GraphEventTime,
    end: GraphEventTime,
    attendees: Option<Vec<GraphAttendeeEntry>>,
}

#[derive(Debug, Deserialize)]
struct GraphLocation {
    #[serde(rename = "displayName")]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphEventTime {
    #[serde(rename = "dateTime")]
    date_time: String,
}

#[derive(Debug, Deserialize)]
struct GraphAttendeeEntry {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphAttendeeAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphAttendeeAddress {
    address: String,
}
