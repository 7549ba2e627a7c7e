use crate::error::DeciderError;
use crate::log_debug;
use crate::replay::ReplaySnapshot;
use crate::types::ROOT_TASK_ID;

// --- Public types ---

/// What the decider should do for this decision task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleStep {
    /// Schedule these task ids, in order. Never empty.
    Dispatch(Vec<String>),
    /// Work is in flight and nothing new is eligible.
    Wait,
    /// No work remains anywhere in the tree.
    Complete,
}

impl ScheduleStep {
    pub fn task_ids(&self) -> &[String] {
        match self {
            ScheduleStep::Dispatch(ids) => ids,
            ScheduleStep::Wait | ScheduleStep::Complete => &[],
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ScheduleStep::Complete)
    }
}

// --- select_step: pure function ---

/// Select the tasks that are eligible to run right now.
///
/// This is a pure function: it only reads the snapshot.
///
/// Rules:
/// 1. While there are frontier or ready-to-merge nodes:
///    - a frontier node with children offers every child divide task still INITIAL
///    - a frontier node without children offers its build task if INITIAL
///    - a ready node offers its merge task, which must be INITIAL
/// 2. Otherwise, if the root divide task is INITIAL, offer it (first decision)
/// 3. Otherwise complete when nothing is in flight, else wait
///
/// Emission order follows frontier discovery order, then ready order, then
/// child declaration order. A task id is never emitted twice.
pub fn select_step(snapshot: &ReplaySnapshot) -> Result<ScheduleStep, DeciderError> {
    if !snapshot.leaf_nodes.is_empty() || !snapshot.ready_merge_nodes.is_empty() {
        let runnable = runnable_tasks(snapshot)?;
        if !runnable.is_empty() {
            return Ok(ScheduleStep::Dispatch(runnable));
        }
        if snapshot.open_task_count == 0 {
            return Err(DeciderError::InconsistentSnapshot(format!(
                "frontier {:?} has no runnable task and nothing is in flight",
                snapshot.leaf_nodes
            )));
        }
        return Ok(ScheduleStep::Wait);
    }

    let root = snapshot.root_task().ok_or_else(|| {
        DeciderError::InconsistentSnapshot(format!(
            "history has no workflow start (root task '{}' missing)",
            ROOT_TASK_ID
        ))
    })?;
    if root.is_initial() {
        return Ok(ScheduleStep::Dispatch(vec![root.id.clone()]));
    }

    if snapshot.open_task_count > 0 {
        return Ok(ScheduleStep::Wait);
    }

    let stranded = snapshot.initial_task_ids();
    if !stranded.is_empty() {
        return Err(DeciderError::InconsistentSnapshot(format!(
            "no work in flight but tasks never dispatched: {}",
            stranded.join(", ")
        )));
    }
    Ok(ScheduleStep::Complete)
}

fn runnable_tasks(snapshot: &ReplaySnapshot) -> Result<Vec<String>, DeciderError> {
    let mut runnable: Vec<String> = Vec::new();

    for node_id in &snapshot.leaf_nodes {
        let node = snapshot.node(node_id)?;
        if node.has_children() {
            for child_id in &node.divide_task_ids {
                if snapshot.task(child_id)?.is_initial() {
                    push_unique(&mut runnable, child_id);
                }
            }
        } else if snapshot.task(&node.merge_task_id)?.is_initial() {
            push_unique(&mut runnable, &node.merge_task_id);
        }
    }

    for node_id in &snapshot.ready_merge_nodes {
        let node = snapshot.node(node_id)?;
        let merge = snapshot.task(&node.merge_task_id)?;
        if !merge.is_initial() {
            return Err(DeciderError::InconsistentSnapshot(format!(
                "ready node '{}' has merge task '{}' in state {:?}",
                node_id, merge.id, merge.state
            )));
        }
        push_unique(&mut runnable, &merge.id);
    }

    log_debug!(
        "[scheduler] {} leaf node(s), {} ready merge(s) -> {} runnable",
        snapshot.leaf_nodes.len(),
        snapshot.ready_merge_nodes.len(),
        runnable.len()
    );
    Ok(runnable)
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DivisionResult, ProcessingNode, Task, TaskState, TaskType};
    use serde_json::{json, Value};

    fn leaf_snapshot(build_state: TaskState) -> ReplaySnapshot {
        let mut snapshot = ReplaySnapshot::default();
        let mut root = Task::root(Value::Null);
        root.state = TaskState::Completed;
        snapshot.all_tasks.insert(root.id.clone(), root);

        let node = ProcessingNode::from_division(
            ROOT_TASK_ID,
            None,
            DivisionResult {
                divide_task_ids: vec![],
                divide_inputs: vec![],
                divide_paths: vec![],
                merge_task_id: "t1".to_string(),
                merge_input: json!("x"),
                merge_path: vec![],
            },
        );
        let mut build = Task::new("t1", TaskType::Build, Some(ROOT_TASK_ID), vec![], json!("x"));
        build.state = build_state;
        snapshot.all_tasks.insert(build.id.clone(), build);
        snapshot.all_nodes.insert(node.id.clone(), node);
        snapshot.leaf_nodes.push(ROOT_TASK_ID.to_string());
        snapshot
    }

    #[test]
    fn leaf_build_is_dispatched_when_initial() {
        let snapshot = leaf_snapshot(TaskState::Initial);
        assert_eq!(
            select_step(&snapshot).unwrap(),
            ScheduleStep::Dispatch(vec!["t1".to_string()])
        );
    }

    #[test]
    fn running_leaf_build_waits() {
        let mut snapshot = leaf_snapshot(TaskState::Running);
        snapshot.open_task_count = 1;
        assert_eq!(select_step(&snapshot).unwrap(), ScheduleStep::Wait);
    }

    #[test]
    fn frontier_with_nothing_in_flight_is_inconsistent() {
        let snapshot = leaf_snapshot(TaskState::Running);
        assert!(matches!(
            select_step(&snapshot),
            Err(DeciderError::InconsistentSnapshot(_))
        ));
    }

    #[test]
    fn missing_root_is_inconsistent() {
        assert!(select_step(&ReplaySnapshot::default()).is_err());
    }

    #[test]
    fn ready_merge_not_initial_is_inconsistent() {
        let mut snapshot = leaf_snapshot(TaskState::Completed);
        snapshot.leaf_nodes.clear();
        snapshot.ready_merge_nodes.push(ROOT_TASK_ID.to_string());
        let err = select_step(&snapshot).unwrap_err();
        assert!(err.to_string().contains("ready node 'begin'"));
    }

    #[test]
    fn push_unique_skips_duplicates() {
        let mut ids = vec!["a".to_string()];
        push_unique(&mut ids, "a");
        push_unique(&mut ids, "b");
        assert_eq!(ids, vec!["a", "b"]);
    }
}
