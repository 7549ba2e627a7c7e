//! Inbound history shapes.
//!
//! Events arrive in the orchestration service's JSON form: an `eventType`
//! discriminator, an `eventId`, a timestamp, and one `<eventType>EventAttributes`
//! object. Only the attributes the replayer consumes are modelled; everything
//! else is ignored on deserialization.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::DeciderError;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub event_type: String,
    pub event_id: i64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub event_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_execution_started_event_attributes: Option<WorkflowExecutionStartedAttributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_task_scheduled_event_attributes: Option<ActivityTaskScheduledAttributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_task_completed_event_attributes: Option<ActivityTaskCompletedAttributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_task_failed_event_attributes: Option<ActivityTaskClosedAttributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_task_timed_out_event_attributes: Option<ActivityTaskClosedAttributes>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionStartedAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityTaskScheduledAttributes {
    pub activity_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityTaskCompletedAttributes {
    pub scheduled_event_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Shared by `ActivityTaskFailed` and `ActivityTaskTimedOut`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityTaskClosedAttributes {
    pub scheduled_event_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_type: Option<String>,
}

/// The event types the replayer acts on, with their attributes resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind<'a> {
    WorkflowExecutionStarted {
        input: Option<&'a str>,
    },
    ActivityTaskScheduled {
        activity_id: &'a str,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        result: Option<&'a str>,
    },
    ActivityTaskFailed {
        scheduled_event_id: i64,
    },
    ActivityTaskTimedOut {
        scheduled_event_id: i64,
    },
    Ignored,
}

impl HistoryEvent {
    /// Resolve the event into the typed form the replayer consumes.
    ///
    /// A known event type without its attributes object is a malformed history.
    pub fn kind(&self) -> Result<EventKind<'_>, DeciderError> {
        let missing = || DeciderError::MissingAttributes {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
        };

        let kind = match self.event_type.as_str() {
            "WorkflowExecutionStarted" => EventKind::WorkflowExecutionStarted {
                input: self
                    .workflow_execution_started_event_attributes
                    .as_ref()
                    .and_then(|a| a.input.as_deref()),
            },
            "ActivityTaskScheduled" => {
                let attrs = self
                    .activity_task_scheduled_event_attributes
                    .as_ref()
                    .ok_or_else(missing)?;
                EventKind::ActivityTaskScheduled {
                    activity_id: &attrs.activity_id,
                }
            }
            "ActivityTaskCompleted" => {
                let attrs = self
                    .activity_task_completed_event_attributes
                    .as_ref()
                    .ok_or_else(missing)?;
                EventKind::ActivityTaskCompleted {
                    scheduled_event_id: attrs.scheduled_event_id,
                    result: attrs.result.as_deref(),
                }
            }
            "ActivityTaskFailed" => {
                let attrs = self
                    .activity_task_failed_event_attributes
                    .as_ref()
                    .ok_or_else(missing)?;
                EventKind::ActivityTaskFailed {
                    scheduled_event_id: attrs.scheduled_event_id,
                }
            }
            "ActivityTaskTimedOut" => {
                let attrs = self
                    .activity_task_timed_out_event_attributes
                    .as_ref()
                    .ok_or_else(missing)?;
                EventKind::ActivityTaskTimedOut {
                    scheduled_event_id: attrs.scheduled_event_id,
                }
            }
            _ => EventKind::Ignored,
        };
        Ok(kind)
    }
}

/// One page of history. No `next_page_token` means the history is complete.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub events: Vec<HistoryEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl HistoryPage {
    /// Normalizes an empty continuation token to `None`.
    pub fn continuation(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Parse a saved history: either a bare JSON array of events, or an object
/// with an `events` array as returned by the history API.
pub fn parse_history_document(contents: &str) -> Result<Vec<HistoryEvent>, DeciderError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HistoryDocument {
        Events(Vec<HistoryEvent>),
        Page(HistoryPage),
    }

    match serde_json::from_str::<HistoryDocument>(contents)? {
        HistoryDocument::Events(events) => Ok(events),
        HistoryDocument::Page(page) => Ok(page.events),
    }
}

/// Decode an opaque payload string.
///
/// JSON text decodes to its value; anything else is kept as a JSON string;
/// an absent payload is `null`.
pub fn decode_payload(raw: Option<&str>) -> Value {
    match raw {
        None => Value::Null,
        Some(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
    }
}

/// Accepts epoch seconds (number) or an RFC 3339 string; the command-line
/// client emits either depending on its timestamp setting.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Epoch(f64),
        Text(String),
    }

    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Epoch(secs) => epoch_to_datetime(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", secs))),
        RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| serde::de::Error::custom(format!("invalid timestamp '{}': {}", text, e))),
    }
}

fn epoch_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let millis = (secs * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}
