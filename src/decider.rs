use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{self, ActivityConfig, DeciderConfig};
use crate::decision::{decide, DecisionOutcome, MAX_EXECUTION_CONTEXT_LEN};
use crate::error::DeciderError;
use crate::fleet::{take_down_fleet, FleetHook, TakeDownOutcome};
use crate::replay::{ReplaySnapshot, Replayer};
use crate::transport::{DecisionTask, WorkflowTransport};
use crate::{log_debug, log_error, log_info, log_warn};

// --- Public types ---

/// What one decision cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The long poll expired without a decision task.
    Idle,
    /// Decisions were submitted for the task.
    Responded {
        workflow: String,
        decisions: usize,
        workflow_complete: bool,
        fleet: Option<TakeDownOutcome>,
    },
    /// History could not be replayed consistently; nothing was submitted.
    /// The service will hand the task out again after its timeout.
    Abandoned { workflow: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub decision_tasks: u32,
    pub decisions_emitted: u32,
    pub workflows_completed: u32,
    pub cycles_abandoned: u32,
    pub halt_reason: HaltReason,
}

impl RunSummary {
    /// Lines for the end-of-run report, one log record each.
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = vec![
            "--- Run Summary ---".to_string(),
            format!("Decision tasks: {}", self.decision_tasks),
            format!("Decisions emitted: {}", self.decisions_emitted),
        ];
        if self.workflows_completed > 0 {
            lines.push(format!("Workflows completed: {}", self.workflows_completed));
        }
        if self.cycles_abandoned > 0 {
            lines.push(format!("Cycles abandoned: {}", self.cycles_abandoned));
        }
        lines.push(format!("Halt reason: {:?}", self.halt_reason));
        lines
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HaltReason {
    ShutdownRequested,
    DecisionTaskCapReached,
    FatalError(String),
}

// --- One decision cycle ---

/// Fetch every remaining history page for `task` and replay it from scratch.
///
/// Pages are applied as they arrive; nothing but the snapshot under
/// construction is retained between pages.
pub async fn replay_task<T: WorkflowTransport>(
    transport: &T,
    task: &DecisionTask,
) -> Result<ReplaySnapshot, DeciderError> {
    let mut replayer = Replayer::new();
    replayer.apply_page(&task.first_page)?;

    let mut token = task.first_page.continuation().map(str::to_string);
    let mut pages = 1u32;
    while let Some(next) = token {
        let page = transport.fetch_history_page(&next).await?;
        replayer.apply_page(&page)?;
        pages += 1;
        token = page.continuation().map(str::to_string);
    }

    let snapshot = replayer.finish();
    log_debug!(
        "[{}] Replayed {} event(s) from {} page(s)",
        task.label(),
        snapshot.events_replayed,
        pages
    );
    Ok(snapshot)
}

/// Poll once and, if a decision task arrives, answer it.
///
/// Replay inconsistencies abandon the task without responding. Transport
/// failures are returned to the caller, which owns retry policy.
pub async fn run_cycle<T: WorkflowTransport, F: FleetHook>(
    transport: &T,
    fleet: &F,
    activities: &ActivityConfig,
) -> Result<CycleOutcome, DeciderError> {
    match transport.poll_decision_task().await? {
        Some(task) => handle_task(transport, fleet, activities, &task).await,
        None => Ok(CycleOutcome::Idle),
    }
}

/// Replay, decide and respond for one decision task already in hand.
pub async fn handle_task<T: WorkflowTransport, F: FleetHook>(
    transport: &T,
    fleet: &F,
    activities: &ActivityConfig,
    task: &DecisionTask,
) -> Result<CycleOutcome, DeciderError> {
    let workflow = task.label();

    let outcome = match replay_task(transport, task)
        .await
        .and_then(|snapshot| decide(&snapshot, activities))
    {
        Ok(outcome) => outcome,
        Err(e) if e.is_replay_inconsistency() => {
            log_error!("[{}] Abandoning decision task: {}", workflow, e);
            return Ok(CycleOutcome::Abandoned {
                workflow,
                reason: e.to_string(),
            });
        }
        Err(e) => return Err(e),
    };

    respond(transport, task, &outcome).await?;

    let fleet_outcome = if outcome.workflow_complete {
        log_info!("[{}] Workflow complete", workflow);
        Some(take_down_fleet(fleet).await)
    } else {
        None
    };

    Ok(CycleOutcome::Responded {
        workflow,
        decisions: outcome.decisions.len(),
        workflow_complete: outcome.workflow_complete,
        fleet: fleet_outcome,
    })
}

async fn respond<T: WorkflowTransport>(
    transport: &T,
    task: &DecisionTask,
    outcome: &DecisionOutcome,
) -> Result<(), DeciderError> {
    let context = outcome
        .execution_context
        .to_bounded_json(MAX_EXECUTION_CONTEXT_LEN)?;

    let scheduled = outcome.scheduled_ids();
    if scheduled.is_empty() && !outcome.workflow_complete {
        log_info!("[{}] Nothing eligible; waiting on work in flight", task.label());
    } else if !scheduled.is_empty() {
        log_info!(
            "[{}] Scheduling {} task(s): {}",
            task.label(),
            scheduled.len(),
            scheduled.join(", ")
        );
    }

    transport
        .respond_decision_task_completed(&task.task_token, &outcome.decisions, &context)
        .await
}

// --- Poll loop ---

#[derive(Default)]
struct Tally {
    decision_tasks: AtomicU32,
    decisions_emitted: AtomicU32,
    workflows_completed: AtomicU32,
    cycles_abandoned: AtomicU32,
}

impl Tally {
    fn record(&self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Idle => {}
            CycleOutcome::Responded {
                decisions,
                workflow_complete,
                ..
            } => {
                self.decision_tasks.fetch_add(1, Ordering::SeqCst);
                self.decisions_emitted
                    .fetch_add(*decisions as u32, Ordering::SeqCst);
                if *workflow_complete {
                    self.workflows_completed.fetch_add(1, Ordering::SeqCst);
                }
            }
            CycleOutcome::Abandoned { .. } => {
                self.decision_tasks.fetch_add(1, Ordering::SeqCst);
                self.cycles_abandoned.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn summary(&self, halt_reason: HaltReason) -> RunSummary {
        RunSummary {
            decision_tasks: self.decision_tasks.load(Ordering::SeqCst),
            decisions_emitted: self.decisions_emitted.load(Ordering::SeqCst),
            workflows_completed: self.workflows_completed.load(Ordering::SeqCst),
            cycles_abandoned: self.cycles_abandoned.load(Ordering::SeqCst),
            halt_reason,
        }
    }
}

/// Why a single worker stopped.
#[derive(Debug)]
enum WorkerStop {
    Cancelled,
    CapReached,
    Fatal(String),
}

/// Run `execution.workers` independent poll loops until cancelled, the
/// decision task cap is reached, or a fatal error occurs.
///
/// The cap is checked before each poll; with several workers, cycles already
/// in flight when it is reached still finish.
pub async fn run_decider<T, F>(
    transport: Arc<T>,
    fleet: Arc<F>,
    config: DeciderConfig,
    cancel: CancellationToken,
) -> Result<RunSummary, String>
where
    T: WorkflowTransport + 'static,
    F: FleetHook + 'static,
{
    config::validate(&config)
        .map_err(|errors| DeciderError::Config(errors.join("; ")))?;

    let workers = config.execution.workers.max(1);
    let config = Arc::new(config);
    let tally = Arc::new(Tally::default());
    let stop = cancel.child_token();

    log_info!(
        "Decider started (domain={}, task_list={}, workers={}).",
        config.workflow.domain,
        config.workflow.task_list,
        workers
    );

    let mut join_set: JoinSet<WorkerStop> = JoinSet::new();
    for worker in 0..workers {
        join_set.spawn(worker_loop(
            worker,
            Arc::clone(&transport),
            Arc::clone(&fleet),
            Arc::clone(&config),
            stop.clone(),
            Arc::clone(&tally),
        ));
    }

    let mut fatal: Option<String> = None;
    let mut cap_reached = false;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(WorkerStop::Cancelled) => {}
            Ok(WorkerStop::CapReached) => cap_reached = true,
            Ok(WorkerStop::Fatal(message)) => {
                stop.cancel();
                fatal.get_or_insert(message);
            }
            Err(e) => {
                stop.cancel();
                fatal.get_or_insert(format!("worker task panicked: {}", e));
            }
        }
    }

    let halt_reason = match fatal {
        Some(message) => HaltReason::FatalError(message),
        None if cap_reached => HaltReason::DecisionTaskCapReached,
        None => HaltReason::ShutdownRequested,
    };
    Ok(tally.summary(halt_reason))
}

async fn worker_loop<T: WorkflowTransport, F: FleetHook>(
    worker: u32,
    transport: Arc<T>,
    fleet: Arc<F>,
    config: Arc<DeciderConfig>,
    stop: CancellationToken,
    tally: Arc<Tally>,
) -> WorkerStop {
    let cap = config.execution.max_decision_tasks;
    log_debug!("[worker-{}] Started", worker);

    loop {
        if stop.is_cancelled() {
            return WorkerStop::Cancelled;
        }
        if cap > 0 && tally.decision_tasks.load(Ordering::SeqCst) >= cap {
            log_info!("[worker-{}] Decision task cap ({}) reached", worker, cap);
            stop.cancel();
            return WorkerStop::CapReached;
        }

        // Cancellation interrupts a pending poll; once a task is held, the
        // cycle runs to completion so its decisions are not lost.
        let polled = tokio::select! {
            _ = stop.cancelled() => return WorkerStop::Cancelled,
            polled = transport.poll_decision_task() => polled,
        };
        let result = match polled {
            Ok(Some(task)) => {
                handle_task(transport.as_ref(), fleet.as_ref(), &config.activities, &task).await
            }
            Ok(None) => Ok(CycleOutcome::Idle),
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => tally.record(&outcome),
            Err(e) if e.is_fatal() => {
                log_error!("[worker-{}] Fatal: {}", worker, e);
                return WorkerStop::Fatal(e.to_string());
            }
            Err(e) => {
                if e.is_retryable() {
                    log_warn!(
                        "[worker-{}] {}; retrying in {}s",
                        worker,
                        e,
                        config.execution.error_backoff_seconds
                    );
                } else {
                    log_error!("[worker-{}] Decision cycle failed: {}", worker, e);
                }
                tokio::select! {
                    _ = stop.cancelled() => return WorkerStop::Cancelled,
                    _ = tokio::time::sleep(config.execution.error_backoff()) => {}
                }
            }
        }
    }
}
