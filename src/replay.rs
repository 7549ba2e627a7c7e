//! History replay.
//!
//! Rebuilds the full dependency state of one workflow execution from its event
//! history, from event zero, on every decision task. Nothing survives between
//! invocations: the `Replayer` is created fresh, fed every page in order, and
//! consumed into an immutable `ReplaySnapshot`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::DeciderError;
use crate::history::{decode_payload, EventKind, HistoryEvent, HistoryPage};
use crate::log_debug;
use crate::types::{
    DivisionResult, FailedTask, ProcessingNode, Task, TaskCounts, TaskState, TaskType,
    ROOT_TASK_ID,
};

/// Reconstructed state of one workflow execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplaySnapshot {
    pub all_tasks: HashMap<String, Task>,
    pub all_nodes: HashMap<String, ProcessingNode>,
    /// Frontier nodes, in the order they were discovered.
    pub leaf_nodes: Vec<String>,
    /// Nodes whose children are all complete and whose merge is not yet dispatched.
    pub ready_merge_nodes: Vec<String>,
    pub open_task_count: u32,
    pub counts: TaskCounts,
    pub failed_tasks: Vec<FailedTask>,
    pub events_replayed: usize,
}

impl ReplaySnapshot {
    pub fn task(&self, id: &str) -> Result<&Task, DeciderError> {
        self.all_tasks
            .get(id)
            .ok_or_else(|| DeciderError::UnknownTask(id.to_string()))
    }

    pub fn node(&self, id: &str) -> Result<&ProcessingNode, DeciderError> {
        self.all_nodes.get(id).ok_or_else(|| {
            DeciderError::InconsistentSnapshot(format!("node '{}' is not in the node table", id))
        })
    }

    pub fn root_task(&self) -> Option<&Task> {
        self.all_tasks.get(ROOT_TASK_ID)
    }

    /// Ids of tasks still waiting to be dispatched, sorted for stable output.
    pub fn initial_task_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .all_tasks
            .values()
            .filter(|t| t.is_initial())
            .map(|t| t.id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Streaming replayer. Feed events oldest first, then call `finish`.
#[derive(Debug, Default)]
pub struct Replayer {
    state: ReplaySnapshot,
    /// `scheduledEventId` -> activity id, for correlating closing events.
    scheduled_activities: HashMap<i64, String>,
}

impl Replayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_page(&mut self, page: &HistoryPage) -> Result<(), DeciderError> {
        self.apply_all(&page.events)
    }

    pub fn apply_all(&mut self, events: &[HistoryEvent]) -> Result<(), DeciderError> {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    /// Apply one event. Any error leaves the replayer unusable for this cycle.
    pub fn apply(&mut self, event: &HistoryEvent) -> Result<(), DeciderError> {
        self.state.events_replayed += 1;

        match event.kind()? {
            EventKind::WorkflowExecutionStarted { input } => self.on_started(input),
            EventKind::ActivityTaskScheduled { activity_id } => {
                self.on_scheduled(event.event_id, activity_id)
            }
            EventKind::ActivityTaskCompleted {
                scheduled_event_id,
                result,
            } => self.on_completed(scheduled_event_id, result),
            EventKind::ActivityTaskFailed { scheduled_event_id }
            | EventKind::ActivityTaskTimedOut { scheduled_event_id } => {
                self.on_closed_unsuccessfully(scheduled_event_id, event.event_timestamp)
            }
            EventKind::Ignored => Ok(()),
        }
    }

    pub fn finish(self) -> ReplaySnapshot {
        self.state
    }

    // --- Event handlers ---

    fn on_started(&mut self, input: Option<&str>) -> Result<(), DeciderError> {
        self.insert_task(Task::root(decode_payload(input)))?;
        log_debug!("[replay] workflow started, root task '{}' synthesized", ROOT_TASK_ID);
        Ok(())
    }

    fn on_scheduled(&mut self, event_id: i64, activity_id: &str) -> Result<(), DeciderError> {
        self.scheduled_activities
            .insert(event_id, activity_id.to_string());

        let task = self.task_mut(activity_id)?;
        task.transition(TaskState::Running)?;
        let task_type = task.task_type;
        let owning_node = task.owning_node.clone();

        self.state.open_task_count += 1;
        self.state.counts.get_mut(task_type).scheduled += 1;

        if task_type == TaskType::Merge {
            if let Some(node_id) = owning_node {
                remove_id(&mut self.state.ready_merge_nodes, &node_id);
            }
        }

        log_debug!("[replay] scheduled {} '{}'", task_type, activity_id);
        Ok(())
    }

    fn on_completed(
        &mut self,
        scheduled_event_id: i64,
        result: Option<&str>,
    ) -> Result<(), DeciderError> {
        let task_id = self.resolve_scheduled(scheduled_event_id)?;
        let task = self.task_mut(&task_id)?;
        task.transition(TaskState::Completed)?;
        let task_type = task.task_type;
        let owning_node = task.owning_node.clone();

        self.close_open_task(&task_id)?;
        self.state.counts.get_mut(task_type).completed += 1;

        log_debug!("[replay] completed {} '{}'", task_type, task_id);

        match task_type {
            TaskType::Divide => self.on_division(&task_id, owning_node.as_deref(), result),
            TaskType::Merge | TaskType::Build => {
                let node_id = owning_node.ok_or_else(|| DeciderError::OrphanTask(task_id.clone()))?;
                self.on_node_combined(&node_id, result)
            }
        }
    }

    /// A divide task completed: its result defines a new node.
    fn on_division(
        &mut self,
        task_id: &str,
        parent: Option<&str>,
        result: Option<&str>,
    ) -> Result<(), DeciderError> {
        let division = DivisionResult::parse(task_id, result)?;
        if self.state.all_nodes.contains_key(task_id) {
            return Err(DeciderError::InconsistentSnapshot(format!(
                "node '{}' was already created",
                task_id
            )));
        }

        let node = ProcessingNode::from_division(task_id, parent, division);
        for task in node.spawn_tasks() {
            self.insert_task(task)?;
        }

        log_debug!(
            "[replay] node '{}' discovered: {} children, {} task '{}'",
            node.id,
            node.divide_task_ids.len(),
            node.merge_task_type(),
            node.merge_task_id
        );

        self.state.all_nodes.insert(node.id.clone(), node);
        insert_id(&mut self.state.leaf_nodes, task_id);
        if let Some(parent_id) = parent {
            remove_id(&mut self.state.leaf_nodes, parent_id);
        }
        Ok(())
    }

    /// A node's merge or build task completed: its output feeds the parent.
    fn on_node_combined(
        &mut self,
        node_id: &str,
        result: Option<&str>,
    ) -> Result<(), DeciderError> {
        remove_id(&mut self.state.leaf_nodes, node_id);

        let parent_id = match self.node_mut(node_id)?.parent.clone() {
            Some(parent_id) => parent_id,
            None => return Ok(()),
        };

        let parent = self.node_mut(&parent_id)?;
        parent.record_child_completion()?;
        let ready = parent.is_ready_to_merge();
        let parent_merge_id = parent.merge_task_id.clone();

        self.task_mut(&parent_merge_id)?
            .child_input
            .push(decode_payload(result));

        if ready {
            insert_id(&mut self.state.ready_merge_nodes, &parent_id);
            log_debug!("[replay] node '{}' ready to merge", parent_id);
        }
        Ok(())
    }

    /// Failed or timed out: reset for rescheduling and keep the task reachable.
    fn on_closed_unsuccessfully(
        &mut self,
        scheduled_event_id: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DeciderError> {
        let task_id = self.resolve_scheduled(scheduled_event_id)?;
        let task = self.task_mut(&task_id)?;
        task.transition(TaskState::Initial)?;
        let task_type = task.task_type;
        let owning_node = task.owning_node.clone();

        self.close_open_task(&task_id)?;
        self.state.failed_tasks.push(FailedTask {
            task_id: task_id.clone(),
            timestamp,
        });

        if let Some(node_id) = owning_node {
            match task_type {
                // The owning node may have left the frontier when a sibling
                // finished dividing.
                TaskType::Divide => insert_id(&mut self.state.leaf_nodes, &node_id),
                TaskType::Merge => {
                    if self.node_mut(&node_id)?.is_ready_to_merge() {
                        insert_id(&mut self.state.ready_merge_nodes, &node_id);
                    }
                }
                // A build's node stays a leaf until the build completes.
                TaskType::Build => {}
            }
        }

        log_debug!("[replay] {} '{}' reset for retry", task_type, task_id);
        Ok(())
    }

    // --- Helpers ---

    fn resolve_scheduled(&self, scheduled_event_id: i64) -> Result<String, DeciderError> {
        self.scheduled_activities
            .get(&scheduled_event_id)
            .cloned()
            .ok_or(DeciderError::UnknownScheduledEvent(scheduled_event_id))
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task, DeciderError> {
        self.state
            .all_tasks
            .get_mut(id)
            .ok_or_else(|| DeciderError::UnknownTask(id.to_string()))
    }

    fn node_mut(&mut self, id: &str) -> Result<&mut ProcessingNode, DeciderError> {
        self.state.all_nodes.get_mut(id).ok_or_else(|| {
            DeciderError::InconsistentSnapshot(format!("node '{}' is not in the node table", id))
        })
    }

    fn insert_task(&mut self, task: Task) -> Result<(), DeciderError> {
        if self.state.all_tasks.contains_key(&task.id) {
            return Err(DeciderError::DuplicateTask(task.id));
        }
        self.state.all_tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn close_open_task(&mut self, task_id: &str) -> Result<(), DeciderError> {
        self.state.open_task_count = self.state.open_task_count.checked_sub(1).ok_or_else(|| {
            DeciderError::InconsistentSnapshot(format!(
                "task '{}' closed with no tasks open",
                task_id
            ))
        })?;
        Ok(())
    }
}

/// Replay a complete, already-fetched history.
pub fn replay_events(events: &[HistoryEvent]) -> Result<ReplaySnapshot, DeciderError> {
    let mut replayer = Replayer::new();
    replayer.apply_all(events)?;
    Ok(replayer.finish())
}

/// Insert preserving order; inserting a present id is a no-op.
fn insert_id(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

/// Remove preserving order; removing an absent id is a no-op.
fn remove_id(ids: &mut Vec<String>, id: &str) {
    ids.retain(|existing| existing != id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_id_is_idempotent() {
        let mut ids = Vec::new();
        insert_id(&mut ids, "a");
        insert_id(&mut ids, "b");
        insert_id(&mut ids, "a");
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn remove_id_ignores_missing() {
        let mut ids = vec!["a".to_string(), "b".to_string()];
        remove_id(&mut ids, "z");
        assert_eq!(ids, vec!["a", "b"]);
        remove_id(&mut ids, "a");
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn empty_history_yields_empty_snapshot() {
        let snapshot = replay_events(&[]).unwrap();
        assert_eq!(snapshot, ReplaySnapshot::default());
        assert!(snapshot.root_task().is_none());
    }
}
