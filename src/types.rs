use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DeciderError;

/// Identifier of the synthesized root divide task.
pub const ROOT_TASK_ID: &str = "begin";

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Divide,
    Merge,
    Build,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [TaskType::Divide, TaskType::Merge, TaskType::Build];

    /// The combining task type for a node with `child_count` children.
    ///
    /// Decided solely by whether the division produced children, never by depth.
    pub fn for_node(child_count: usize) -> TaskType {
        if child_count == 0 {
            TaskType::Build
        } else {
            TaskType::Merge
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Divide => write!(f, "divide"),
            TaskType::Merge => write!(f, "merge"),
            TaskType::Build => write!(f, "build"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Initial,
    Running,
    Completed,
}

impl TaskState {
    /// Validates whether a transition from this state to `to` is allowed.
    ///
    /// Rules:
    /// - Initial -> Running (scheduled)
    /// - Running -> Completed (completed)
    /// - Running -> Initial (failed or timed out, must be rescheduled)
    /// - Completed is terminal
    pub fn is_valid_transition(&self, to: &TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Initial, Running) | (Running, Completed) | (Running, Initial)
        )
    }
}

// --- Structs ---

/// A schedulable unit of work.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub state: TaskState,
    /// Node this task belongs to; `None` only for the root divide task.
    pub owning_node: Option<String>,
    pub task_path: Vec<Value>,
    pub task_input: Value,
    /// Outputs of completed child nodes, in completion order. Merge tasks only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_input: Vec<Value>,
}

impl Task {
    pub fn new(
        id: &str,
        task_type: TaskType,
        owning_node: Option<&str>,
        task_path: Vec<Value>,
        task_input: Value,
    ) -> Self {
        Self {
            id: id.to_string(),
            task_type,
            state: TaskState::Initial,
            owning_node: owning_node.map(str::to_string),
            task_path,
            task_input,
            child_input: Vec::new(),
        }
    }

    pub fn root(input: Value) -> Self {
        Self::new(ROOT_TASK_ID, TaskType::Divide, None, Vec::new(), input)
    }

    pub fn is_initial(&self) -> bool {
        self.state == TaskState::Initial
    }

    /// Move to `to`, rejecting anything outside the task lifecycle.
    pub fn transition(&mut self, to: TaskState) -> Result<(), DeciderError> {
        if !self.state.is_valid_transition(&to) {
            return Err(DeciderError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Output of a completed divide task. This is the definition of a node.
///
/// Closed schema: unknown fields are rejected so a drifting worker cannot
/// silently corrupt the dependency graph.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DivisionResult {
    pub divide_task_ids: Vec<String>,
    #[serde(default)]
    pub divide_inputs: Vec<Value>,
    #[serde(default)]
    pub divide_paths: Vec<Value>,
    pub merge_task_id: String,
    #[serde(default)]
    pub merge_input: Value,
    #[serde(default)]
    pub merge_path: Vec<Value>,
}

impl DivisionResult {
    /// Decode a divide task's raw result text.
    pub fn parse(task_id: &str, raw: Option<&str>) -> Result<Self, DeciderError> {
        let raw = raw.ok_or_else(|| DeciderError::MalformedDivision {
            task_id: task_id.to_string(),
            reason: "completion carries no result".to_string(),
        })?;
        let result: DivisionResult =
            serde_json::from_str(raw).map_err(|e| DeciderError::MalformedDivision {
                task_id: task_id.to_string(),
                reason: e.to_string(),
            })?;
        result.validate(task_id)?;
        Ok(result)
    }

    fn validate(&self, task_id: &str) -> Result<(), DeciderError> {
        let mut problems = Vec::new();
        let children = self.divide_task_ids.len();

        if self.merge_task_id.is_empty() {
            problems.push("merge_task_id is empty".to_string());
        }
        if self.divide_inputs.len() != children {
            problems.push(format!(
                "{} divide_inputs for {} divide_task_ids",
                self.divide_inputs.len(),
                children
            ));
        }
        if self.divide_paths.len() != children {
            problems.push(format!(
                "{} divide_paths for {} divide_task_ids",
                self.divide_paths.len(),
                children
            ));
        }
        if self.divide_task_ids.iter().any(|id| id.is_empty()) {
            problems.push("divide_task_ids contains an empty id".to_string());
        }
        if self.divide_task_ids.contains(&self.merge_task_id) {
            problems.push(format!(
                "merge_task_id '{}' is also a divide task id",
                self.merge_task_id
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DeciderError::MalformedDivision {
                task_id: task_id.to_string(),
                reason: problems.join("; "),
            })
        }
    }
}

/// One internal node of the division tree.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProcessingNode {
    /// Id of the divide task whose completion created this node.
    pub id: String,
    pub parent: Option<String>,
    pub divide_task_ids: Vec<String>,
    pub divide_inputs: Vec<Value>,
    pub divide_paths: Vec<Value>,
    pub merge_task_id: String,
    pub merge_input: Value,
    pub merge_path: Vec<Value>,
    pub merge_dependency_count: usize,
}

impl ProcessingNode {
    pub fn from_division(id: &str, parent: Option<&str>, division: DivisionResult) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            divide_task_ids: division.divide_task_ids,
            divide_inputs: division.divide_inputs,
            divide_paths: division.divide_paths,
            merge_task_id: division.merge_task_id,
            merge_input: division.merge_input,
            merge_path: division.merge_path,
            merge_dependency_count: 0,
        }
    }

    pub fn has_children(&self) -> bool {
        !self.divide_task_ids.is_empty()
    }

    pub fn merge_task_type(&self) -> TaskType {
        TaskType::for_node(self.divide_task_ids.len())
    }

    pub fn is_ready_to_merge(&self) -> bool {
        self.has_children() && self.merge_dependency_count == self.divide_task_ids.len()
    }

    /// The tasks this node's division creates: its merge/build task first,
    /// then one divide task per child, in declaration order.
    pub fn spawn_tasks(&self) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(self.divide_task_ids.len() + 1);
        tasks.push(Task::new(
            &self.merge_task_id,
            self.merge_task_type(),
            Some(&self.id),
            self.merge_path.clone(),
            self.merge_input.clone(),
        ));
        for ((child_id, input), segment) in self
            .divide_task_ids
            .iter()
            .zip(&self.divide_inputs)
            .zip(&self.divide_paths)
        {
            let mut path = self.merge_path.clone();
            path.push(segment.clone());
            tasks.push(Task::new(
                child_id,
                TaskType::Divide,
                Some(&self.id),
                path,
                input.clone(),
            ));
        }
        tasks
    }

    /// Record one child's completion. Fails if the count would pass the
    /// number of children.
    pub fn record_child_completion(&mut self) -> Result<(), DeciderError> {
        if self.merge_dependency_count >= self.divide_task_ids.len() {
            return Err(DeciderError::DependencyOverflow {
                node_id: self.id.clone(),
            });
        }
        self.merge_dependency_count += 1;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TypeCount {
    pub completed: u32,
    pub scheduled: u32,
}

/// Per-type progress counters, keyed by `TaskType` rather than by name.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub divide: TypeCount,
    pub merge: TypeCount,
    pub build: TypeCount,
}

impl TaskCounts {
    pub fn get(&self, task_type: TaskType) -> &TypeCount {
        match task_type {
            TaskType::Divide => &self.divide,
            TaskType::Merge => &self.merge,
            TaskType::Build => &self.build,
        }
    }

    pub fn get_mut(&mut self, task_type: TaskType) -> &mut TypeCount {
        match task_type {
            TaskType::Divide => &mut self.divide,
            TaskType::Merge => &mut self.merge,
            TaskType::Build => &mut self.build,
        }
    }

    pub fn total_scheduled(&self) -> u32 {
        TaskType::ALL.iter().map(|t| self.get(*t).scheduled).sum()
    }

    pub fn total_completed(&self) -> u32 {
        TaskType::ALL.iter().map(|t| self.get(*t).completed).sum()
    }
}

/// A failed or timed-out attempt, kept for diagnostics only.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FailedTask {
    pub task_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
