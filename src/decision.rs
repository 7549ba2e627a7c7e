//! Outbound decision shapes and the replay-snapshot-to-decisions step.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ActivityConfig;
use crate::error::DeciderError;
use crate::replay::ReplaySnapshot;
use crate::log_warn;
use crate::scheduler::{select_step, ScheduleStep};
use crate::types::{FailedTask, Task, TaskCounts};

/// Maximum execution context length accepted by the orchestration service.
pub const MAX_EXECUTION_CONTEXT_LEN: usize = 32_768;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "decisionType")]
pub enum Decision {
    ScheduleActivityTask {
        #[serde(rename = "scheduleActivityTaskDecisionAttributes")]
        attributes: ScheduleActivityTaskAttributes,
    },
    CompleteWorkflowExecution {
        #[serde(rename = "completeWorkflowExecutionDecisionAttributes")]
        attributes: CompleteWorkflowExecutionAttributes,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleActivityTaskAttributes {
    pub activity_type: ActivityType,
    pub activity_id: String,
    /// JSON-encoded `TaskPayload`.
    pub input: String,
    pub task_list: TaskList,
    pub schedule_to_close_timeout: String,
    pub schedule_to_start_timeout: String,
    pub start_to_close_timeout: String,
    pub heartbeat_timeout: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ActivityType {
    pub name: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskList {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct CompleteWorkflowExecutionAttributes {
    pub result: String,
}

/// What a worker receives as activity input.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskPayload {
    pub main: Value,
    pub path: Vec<Value>,
    pub merge: Vec<Value>,
}

impl Decision {
    pub fn schedule(task: &Task, activities: &ActivityConfig) -> Result<Self, DeciderError> {
        let payload = TaskPayload {
            main: task.task_input.clone(),
            path: task.task_path.clone(),
            merge: task.child_input.clone(),
        };
        Ok(Decision::ScheduleActivityTask {
            attributes: ScheduleActivityTaskAttributes {
                activity_type: ActivityType {
                    name: activities.activity_name(task.task_type).to_string(),
                    version: activities.version.clone(),
                },
                activity_id: task.id.clone(),
                input: serde_json::to_string(&payload)?,
                task_list: TaskList {
                    name: activities.task_list.clone(),
                },
                schedule_to_close_timeout: activities.schedule_to_close_timeout.clone(),
                schedule_to_start_timeout: activities.schedule_to_start_timeout.clone(),
                start_to_close_timeout: activities.start_to_close_timeout.clone(),
                heartbeat_timeout: activities.heartbeat_timeout.clone(),
            },
        })
    }

    pub fn complete() -> Self {
        Decision::CompleteWorkflowExecution {
            attributes: CompleteWorkflowExecutionAttributes::default(),
        }
    }

    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Decision::ScheduleActivityTask { attributes } => Some(&attributes.activity_id),
            Decision::CompleteWorkflowExecution { .. } => None,
        }
    }

    /// Decode the activity input back into its payload.
    pub fn payload(&self) -> Option<Result<TaskPayload, DeciderError>> {
        match self {
            Decision::ScheduleActivityTask { attributes } => {
                Some(serde_json::from_str(&attributes.input).map_err(DeciderError::from))
            }
            Decision::CompleteWorkflowExecution { .. } => None,
        }
    }
}

/// Advisory progress summary attached to every decision response.
/// Never read back by the decider.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ExecutionContext {
    pub progress: TaskCounts,
    pub failed: Vec<FailedTask>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failed_truncated: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl ExecutionContext {
    pub fn from_snapshot(snapshot: &ReplaySnapshot) -> Self {
        Self {
            progress: snapshot.counts,
            failed: snapshot.failed_tasks.clone(),
            failed_truncated: 0,
        }
    }

    /// Serialize, dropping the oldest failure entries until the result fits
    /// in `limit` characters.
    pub fn to_bounded_json(&self, limit: usize) -> Result<String, DeciderError> {
        let mut context = self.clone();
        let mut encoded = serde_json::to_string(&context)?;
        while encoded.len() > limit && !context.failed.is_empty() {
            let excess = encoded.len() - limit;
            // Cut just enough of the oldest entries (plus separating comma) to
            // cover the excess, then re-measure: the truncation count itself
            // adds a few characters.
            let mut freed = 0;
            let mut cut = 0;
            for entry in &context.failed {
                if freed >= excess {
                    break;
                }
                freed += serde_json::to_string(entry)?.len() + 1;
                cut += 1;
            }
            context.failed.drain(..cut);
            context.failed_truncated += cut;
            encoded = serde_json::to_string(&context)?;
        }
        if context.failed_truncated > 0 {
            log_warn!(
                "[decision] execution context truncated: dropped {} oldest failure record(s)",
                context.failed_truncated
            );
        }
        Ok(encoded)
    }
}

/// Everything one decision cycle submits.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    pub step: ScheduleStep,
    pub decisions: Vec<Decision>,
    pub workflow_complete: bool,
    pub execution_context: ExecutionContext,
}

impl DecisionOutcome {
    pub fn scheduled_ids(&self) -> Vec<&str> {
        self.decisions.iter().filter_map(|d| d.activity_id()).collect()
    }
}

/// Turn a selected step into wire decisions.
///
/// Never emits a schedule decision for a task that is not INITIAL.
pub fn build_decisions(
    step: &ScheduleStep,
    snapshot: &ReplaySnapshot,
    activities: &ActivityConfig,
) -> Result<Vec<Decision>, DeciderError> {
    match step {
        ScheduleStep::Dispatch(ids) => ids
            .iter()
            .map(|id| {
                let task = snapshot.task(id)?;
                if !task.is_initial() {
                    return Err(DeciderError::InconsistentSnapshot(format!(
                        "refusing to schedule '{}' in state {:?}",
                        id, task.state
                    )));
                }
                Decision::schedule(task, activities)
            })
            .collect(),
        ScheduleStep::Wait => Ok(Vec::new()),
        ScheduleStep::Complete => Ok(vec![Decision::complete()]),
    }
}

/// Decide what to submit for a fully replayed history.
pub fn decide(
    snapshot: &ReplaySnapshot,
    activities: &ActivityConfig,
) -> Result<DecisionOutcome, DeciderError> {
    let step = select_step(snapshot)?;
    let decisions = build_decisions(&step, snapshot, activities)?;
    Ok(DecisionOutcome {
        workflow_complete: step.is_complete(),
        step,
        decisions,
        execution_context: ExecutionContext::from_snapshot(snapshot),
    })
}
