#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use divide_merge_decider::history::{
    ActivityTaskClosedAttributes, ActivityTaskCompletedAttributes, ActivityTaskScheduledAttributes,
    HistoryEvent, HistoryPage, WorkflowExecutionStartedAttributes,
};
use divide_merge_decider::transport::DecisionTask;

/// Base epoch for generated event timestamps (2023-11-14T22:13:20Z).
pub const BASE_EPOCH: i64 = 1_700_000_000;

/// Creates a bare event with no attributes. The timestamp is `BASE_EPOCH + event_id`.
pub fn event(event_id: i64, event_type: &str) -> HistoryEvent {
    HistoryEvent {
        event_type: event_type.to_string(),
        event_id,
        event_timestamp: Utc
            .timestamp_opt(BASE_EPOCH + event_id, 0)
            .single()
            .expect("valid timestamp"),
        workflow_execution_started_event_attributes: None,
        activity_task_scheduled_event_attributes: None,
        activity_task_completed_event_attributes: None,
        activity_task_failed_event_attributes: None,
        activity_task_timed_out_event_attributes: None,
    }
}

/// Builds a history one event at a time, numbering events from 1 and
/// correlating closing events with the latest schedule of the same activity.
#[derive(Default)]
pub struct HistoryBuilder {
    events: Vec<HistoryEvent>,
    latest_schedule: HashMap<String, i64>,
}

impl HistoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        self.events.len() as i64 + 1
    }

    fn scheduled_id(&self, activity_id: &str) -> i64 {
        *self
            .latest_schedule
            .get(activity_id)
            .unwrap_or_else(|| panic!("'{}' was never scheduled", activity_id))
    }

    pub fn started(&mut self, input: Option<&str>) -> &mut Self {
        let mut e = event(self.next_id(), "WorkflowExecutionStarted");
        e.workflow_execution_started_event_attributes = Some(WorkflowExecutionStartedAttributes {
            input: input.map(str::to_string),
        });
        self.events.push(e);
        self
    }

    pub fn scheduled(&mut self, activity_id: &str) -> &mut Self {
        let id = self.next_id();
        let mut e = event(id, "ActivityTaskScheduled");
        e.activity_task_scheduled_event_attributes = Some(ActivityTaskScheduledAttributes {
            activity_id: activity_id.to_string(),
        });
        self.events.push(e);
        self.latest_schedule.insert(activity_id.to_string(), id);
        self
    }

    /// Schedule several activities in order.
    pub fn scheduled_all(&mut self, activity_ids: &[&str]) -> &mut Self {
        for id in activity_ids {
            self.scheduled(id);
        }
        self
    }

    pub fn completed(&mut self, activity_id: &str, result: &str) -> &mut Self {
        let scheduled_event_id = self.scheduled_id(activity_id);
        let mut e = event(self.next_id(), "ActivityTaskCompleted");
        e.activity_task_completed_event_attributes = Some(ActivityTaskCompletedAttributes {
            scheduled_event_id,
            result: Some(result.to_string()),
        });
        self.events.push(e);
        self
    }

    pub fn failed(&mut self, activity_id: &str) -> &mut Self {
        let scheduled_event_id = self.scheduled_id(activity_id);
        let mut e = event(self.next_id(), "ActivityTaskFailed");
        e.activity_task_failed_event_attributes = Some(ActivityTaskClosedAttributes {
            scheduled_event_id,
            reason: Some("worker crashed".to_string()),
            timeout_type: None,
        });
        self.events.push(e);
        self
    }

    pub fn timed_out(&mut self, activity_id: &str) -> &mut Self {
        let scheduled_event_id = self.scheduled_id(activity_id);
        let mut e = event(self.next_id(), "ActivityTaskTimedOut");
        e.activity_task_timed_out_event_attributes = Some(ActivityTaskClosedAttributes {
            scheduled_event_id,
            reason: None,
            timeout_type: Some("START_TO_CLOSE".to_string()),
        });
        self.events.push(e);
        self
    }

    /// Append an arbitrary event (e.g. one the replayer ignores).
    pub fn push(&mut self, event_type: &str) -> &mut Self {
        let e = event(self.next_id(), event_type);
        self.events.push(e);
        self
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    pub fn build(&self) -> Vec<HistoryEvent> {
        self.events.clone()
    }
}

/// Division result JSON for a node with the given children. Each child gets
/// input `{"part": <child id>}` and path segment `<child id>`.
pub fn division(children: &[&str], merge_task_id: &str) -> String {
    let inputs: Vec<Value> = children.iter().map(|c| json!({ "part": c })).collect();
    let paths: Vec<Value> = children.iter().map(|c| json!(c)).collect();
    json!({
        "divide_task_ids": children,
        "divide_inputs": inputs,
        "divide_paths": paths,
        "merge_task_id": merge_task_id,
        "merge_input": { "merge": merge_task_id },
        "merge_path": [],
    })
    .to_string()
}

/// Division result JSON for a leaf node whose only task is a build.
pub fn leaf_division(build_task_id: &str) -> String {
    json!({
        "divide_task_ids": [],
        "merge_task_id": build_task_id,
        "merge_input": { "build": build_task_id },
    })
    .to_string()
}

/// History for the binary split scenario up to (not including) the root merge
/// being scheduled: begin -> {d1, d2}, each building b1/b2, both builds done.
pub fn binary_split_ready_to_merge() -> HistoryBuilder {
    let mut h = HistoryBuilder::new();
    h.started(Some(r#"{"repo": "main"}"#))
        .scheduled("begin")
        .completed("begin", &division(&["d1", "d2"], "m1"))
        .scheduled_all(&["d1", "d2"])
        .completed("d1", &leaf_division("b1"))
        .completed("d2", &leaf_division("b2"))
        .scheduled_all(&["b1", "b2"])
        .completed("b1", r#""out-1""#)
        .completed("b2", r#""out-2""#);
    h
}

pub fn page(events: Vec<HistoryEvent>, next_page_token: Option<&str>) -> HistoryPage {
    HistoryPage {
        events,
        next_page_token: next_page_token.map(str::to_string),
    }
}

pub fn decision_task(
    token: &str,
    events: Vec<HistoryEvent>,
    next_page_token: Option<&str>,
) -> DecisionTask {
    DecisionTask {
        task_token: token.to_string(),
        workflow_id: "wf-1".to_string(),
        run_id: "run-1".to_string(),
        first_page: page(events, next_page_token),
    }
}

const FAKE_AWS: &str = include_str!("../fixtures/fake_aws.sh");

/// Install the fake command-line client into `dir` and return its path.
///
/// Canned responses are read from `dir` (`poll.json`, `page-<token>.json`,
/// `fleet.json`); every invocation is appended to `dir/calls.log`.
pub fn install_fake_aws(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("aws");
    fs::write(&path, FAKE_AWS).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Lines of `dir/calls.log`, one per fake client invocation.
pub fn fake_aws_calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
