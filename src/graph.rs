use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::{Authenticator, IdentityProvider};
use crate::error::SyncError;

const GRAPH_API: &str = "https://graph.microsoft.com/v1.0";

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub display_name: Option<String>,
    pub user_principal_name: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    pub id: String,
    pub display_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Calendar {
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeTimeZone {
    pub date_time: String,
    pub time_zone: String,
}

impl DateTimeTimeZone {
    pub fn utc(date_time: &str) -> Self {
        Self {
            date_time: date_time.to_string(),
            time_zone: "UTC".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TodoTask {
    pub id: String,
    pub title: Option<String>,
    /// Graph omits the flag on some task variants, hence the tri-state.
    pub is_reminder_on: Option<bool>,
    pub completed_date_time: Option<DateTimeTimeZone>,
    pub reminder_date_time: Option<DateTimeTimeZone>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub subject: Option<String>,
    pub body: Option<ItemBody>,
    pub start: Option<DateTimeTimeZone>,
    pub end: Option<DateTimeTimeZone>,
    pub is_reminder_on: Option<bool>,
}

/// Outbound body for event creation and overwrite.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub subject: String,
    pub body: ItemBody,
    pub start: DateTimeTimeZone,
    pub end: DateTimeTimeZone,
    pub is_reminder_on: bool,
}

/// One page of a Graph collection plus its continuation link.
#[derive(Deserialize, Debug)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

pub struct GraphClient<P: IdentityProvider> {
    http: Client,
    auth: Authenticator<P>,
}

impl<P: IdentityProvider> GraphClient<P> {
    pub fn new(auth: Authenticator<P>) -> Self {
        Self {
            http: Client::new(),
            auth,
        }
    }

    /// Every request fetches its bearer token through the authenticator;
    /// token reuse lives in the on-disk cache, not here.
    fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, SyncError> {
        let token = self.auth.access_token()?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            // Normalize event times so start comparison is stable.
            .header("Prefer", "outlook.timezone=\"UTC\"")
            .send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(SyncError::Request(request_error("GET", url, status, &body)));
        }
        resp.json().map_err(|e| SyncError::Request(e.to_string()))
    }

    pub fn me(&self) -> Result<User, SyncError> {
        self.get(&format!("{GRAPH_API}/me"))
    }

    pub fn list_task_lists(&self) -> Result<Page<TaskList>, SyncError> {
        self.get(&format!("{GRAPH_API}/me/todo/lists"))
    }

    pub fn list_tasks(&self, list_id: &str) -> Result<Page<TodoTask>, SyncError> {
        self.get(&format!("{GRAPH_API}/me/todo/lists/{list_id}/tasks"))
    }

    pub fn list_calendars(&self) -> Result<Page<Calendar>, SyncError> {
        self.get(&format!("{GRAPH_API}/me/calendars"))
    }

    pub fn list_events(&self, calendar_id: &str) -> Result<Page<Event>, SyncError> {
        self.get(&format!("{GRAPH_API}/me/calendars/{calendar_id}/events"))
    }

    /// Follows an @odata.nextLink continuation returned by any of the list
    /// calls above.
    pub fn fetch_page<T: DeserializeOwned>(&self, next_link: &str) -> Result<Page<T>, SyncError> {
        self.get(next_link)
    }

    pub fn create_event(
        &self,
        calendar_id: &str,
        payload: &EventPayload,
    ) -> Result<Event, SyncError> {
        let url = format!("{GRAPH_API}/me/calendars/{calendar_id}/events");
        let token = self.auth.access_token()?;
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(payload)
            .send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(SyncError::Request(request_error(
                "POST", &url, status, &body,
            )));
        }
        resp.json().map_err(|e| SyncError::Request(e.to_string()))
    }

    pub fn update_event(&self, event_id: &str, payload: &EventPayload) -> Result<Event, SyncError> {
        let url = format!("{GRAPH_API}/me/events/{event_id}");
        let token = self.auth.access_token()?;
        let resp = self
            .http
            .patch(&url)
            .bearer_auth(token)
            .json(payload)
            .send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(SyncError::Request(request_error(
                "PATCH", &url, status, &body,
            )));
        }
        resp.json().map_err(|e| SyncError::Request(e.to_string()))
    }
}

fn request_error(method: &str, url: &str, status: reqwest::StatusCode, body: &str) -> String {
    let mut snippet = body.trim().replace(['\n', '\r'], " ");
    if snippet.len() > 240 {
        snippet.truncate(240);
        snippet.push_str("...");
    }
    if snippet.is_empty() {
        format!("{method} {url} failed: HTTP {status}")
    } else {
        format!("{method} {url} failed: HTTP {status}: {snippet}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_deserializes_continuation_link() {
        let json = r#"{
            "value": [
                {"id": "AAA", "displayName": "Tasks"},
                {"id": "BBB", "displayName": "Groceries"}
            ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/me/todo/lists?$skip=10"
        }"#;
        let page: Page<TaskList> = serde_json::from_str(json).expect("page");
        assert_eq!(page.value.len(), 2);
        assert_eq!(page.value[1].display_name, "Groceries");
        assert!(page.next_link.as_deref().unwrap().contains("$skip=10"));
    }

    #[test]
    fn page_without_value_is_empty() {
        let page: Page<TaskList> = serde_json::from_str("{}").expect("page");
        assert!(page.value.is_empty());
        assert!(page.next_link.is_none());
    }

    #[test]
    fn task_reminder_flag_is_tri_state() {
        let task: TodoTask = serde_json::from_str(
            r#"{"id": "t1", "title": "Buy milk", "isReminderOn": true,
                "reminderDateTime": {"dateTime": "2024-05-01T09:00:00.0000000", "timeZone": "UTC"}}"#,
        )
        .expect("task");
        assert_eq!(task.is_reminder_on, Some(true));
        assert!(task.completed_date_time.is_none());

        let bare: TodoTask = serde_json::from_str(r#"{"id": "t2"}"#).expect("task");
        assert_eq!(bare.is_reminder_on, None);
    }

    #[test]
    fn event_payload_uses_graph_field_names() {
        let payload = EventPayload {
            subject: "Buy milk".to_string(),
            body: ItemBody {
                content_type: Some("text".to_string()),
                content: Some("Microsoft To Do Reminder".to_string()),
            },
            start: DateTimeTimeZone::utc("2024-05-01T09:00:00"),
            end: DateTimeTimeZone::utc("2024-05-01T09:00:00"),
            is_reminder_on: false,
        };
        let json = serde_json::to_value(&payload).expect("json");
        assert_eq!(json["subject"], "Buy milk");
        assert_eq!(json["body"]["contentType"], "text");
        assert_eq!(json["start"]["timeZone"], "UTC");
        assert_eq!(json["isReminderOn"], false);
    }
}
