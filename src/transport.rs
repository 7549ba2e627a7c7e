use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{DeciderConfig, TransportConfig, WorkflowConfig};
use crate::decision::Decision;
use crate::error::DeciderError;
use crate::history::{HistoryEvent, HistoryPage};
use crate::log_debug;
use crate::process::run_command;

/// One decision task handed out by the orchestration service, carrying the
/// first page of its history.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionTask {
    pub task_token: String,
    pub workflow_id: String,
    pub run_id: String,
    pub first_page: HistoryPage,
}

impl DecisionTask {
    /// Short label for log lines.
    pub fn label(&self) -> String {
        if self.run_id.is_empty() {
            self.workflow_id.clone()
        } else {
            format!("{}/{}", self.workflow_id, self.run_id)
        }
    }
}

/// Boundary with the orchestration service.
///
/// `poll_decision_task` long-polls and returns `None` when the poll expired
/// with nothing to do.
pub trait WorkflowTransport: Send + Sync {
    fn poll_decision_task(
        &self,
    ) -> impl Future<Output = Result<Option<DecisionTask>, DeciderError>> + Send;

    fn fetch_history_page(
        &self,
        next_page_token: &str,
    ) -> impl Future<Output = Result<HistoryPage, DeciderError>> + Send;

    fn respond_decision_task_completed(
        &self,
        task_token: &str,
        decisions: &[Decision],
        execution_context: &str,
    ) -> impl Future<Output = Result<(), DeciderError>> + Send;
}

// --- Wire shapes ---

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct PollResponse {
    #[serde(default)]
    task_token: String,
    #[serde(default)]
    workflow_execution: Option<WorkflowExecution>,
    #[serde(default)]
    events: Vec<HistoryEvent>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WorkflowExecution {
    workflow_id: String,
    run_id: String,
}

impl PollResponse {
    fn into_page(self) -> HistoryPage {
        HistoryPage {
            events: self.events,
            next_page_token: self.next_page_token.filter(|t| !t.is_empty()),
        }
    }
}

/// Parse `poll-for-decision-task` output. An empty token (or empty output)
/// means the long poll expired.
pub fn parse_poll_response(stdout: &str) -> Result<Option<DecisionTask>, DeciderError> {
    if stdout.trim().is_empty() {
        return Ok(None);
    }
    let response: PollResponse = serde_json::from_str(stdout)
        .map_err(|e| DeciderError::Transport(format!("Unreadable poll response: {}", e)))?;
    if response.task_token.is_empty() {
        return Ok(None);
    }

    let task_token = response.task_token.clone();
    let (workflow_id, run_id) = match &response.workflow_execution {
        Some(execution) => (execution.workflow_id.clone(), execution.run_id.clone()),
        None => (String::new(), String::new()),
    };
    Ok(Some(DecisionTask {
        task_token,
        workflow_id,
        run_id,
        first_page: response.into_page(),
    }))
}

/// Parse a follow-up history page returned for a continuation token.
pub fn parse_history_page(stdout: &str) -> Result<HistoryPage, DeciderError> {
    let response: PollResponse = serde_json::from_str(stdout)
        .map_err(|e| DeciderError::Transport(format!("Unreadable history page: {}", e)))?;
    Ok(response.into_page())
}

// --- CLI transport ---

/// Transport driving the orchestration service through its command-line client.
pub struct CliTransport {
    workflow: WorkflowConfig,
    transport: TransportConfig,
    timeout: Duration,
}

impl CliTransport {
    pub fn new(workflow: WorkflowConfig, transport: TransportConfig, timeout: Duration) -> Self {
        Self {
            workflow,
            transport,
            timeout,
        }
    }

    pub fn from_config(config: &DeciderConfig) -> Self {
        Self::new(
            config.workflow.clone(),
            config.transport.clone(),
            config.execution.command_timeout(),
        )
    }

    fn swf_command(&self, operation: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.transport.aws_binary);
        cmd.args(["swf", operation]);
        if !self.transport.region.is_empty() {
            cmd.args(["--region", self.transport.region.as_str()]);
        }
        cmd.args(["--output", "json"]);
        cmd
    }

    fn poll_command(&self) -> tokio::process::Command {
        let mut cmd = self.swf_command("poll-for-decision-task");
        cmd.args(["--domain", self.workflow.domain.as_str()])
            .arg("--task-list")
            .arg(format!("name={}", self.workflow.task_list))
            .args(["--identity", self.workflow.identity.as_str()])
            .arg("--no-paginate");
        cmd
    }
}

impl WorkflowTransport for CliTransport {
    async fn poll_decision_task(&self) -> Result<Option<DecisionTask>, DeciderError> {
        log_debug!(
            "[transport] Polling {} for decision tasks",
            self.workflow.task_list
        );
        let stdout = run_command(self.poll_command(), self.timeout).await?;
        parse_poll_response(&stdout)
    }

    async fn fetch_history_page(&self, next_page_token: &str) -> Result<HistoryPage, DeciderError> {
        let mut cmd = self.poll_command();
        cmd.args(["--next-page-token", next_page_token]);
        let stdout = run_command(cmd, self.timeout).await?;
        parse_history_page(&stdout)
    }

    async fn respond_decision_task_completed(
        &self,
        task_token: &str,
        decisions: &[Decision],
        execution_context: &str,
    ) -> Result<(), DeciderError> {
        let decisions_json = serde_json::to_string(decisions)?;
        let mut cmd = self.swf_command("respond-decision-task-completed");
        cmd.args(["--task-token", task_token])
            .args(["--decisions", decisions_json.as_str()])
            .args(["--execution-context", execution_context]);
        run_command(cmd, self.timeout).await.map(|_| ())
    }
}

// --- Mock transport ---

/// One scripted poll result for `MockTransport`.
#[derive(Debug, Clone)]
pub enum MockPoll {
    Task(DecisionTask),
    /// Long poll expired.
    Empty,
    /// Poll failed with a transport error carrying this message.
    Error(String),
}

/// A decision response captured by `MockTransport`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedResponse {
    pub task_token: String,
    pub decisions: Vec<Decision>,
    pub execution_context: String,
}

/// Mock transport for decider loop tests.
///
/// Polls return the scripted results in order, then `None` forever.
/// Continuation tokens resolve against a fixed page table. Responses are recorded.
pub struct MockTransport {
    polls: tokio::sync::Mutex<Vec<MockPoll>>,
    pages: HashMap<String, HistoryPage>,
    respond_failures: tokio::sync::Mutex<u32>,
    responses: tokio::sync::Mutex<Vec<RecordedResponse>>,
    poll_count: tokio::sync::Mutex<u32>,
}

impl MockTransport {
    pub fn new(polls: Vec<MockPoll>) -> Self {
        let mut reversed = polls;
        reversed.reverse();
        Self {
            polls: tokio::sync::Mutex::new(reversed),
            pages: HashMap::new(),
            respond_failures: tokio::sync::Mutex::new(0),
            responses: tokio::sync::Mutex::new(Vec::new()),
            poll_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Serve `page` for continuation token `token`.
    pub fn with_page(mut self, token: &str, page: HistoryPage) -> Self {
        self.pages.insert(token.to_string(), page);
        self
    }

    /// Fail the next `count` responses with a transport error.
    pub fn with_respond_failures(self, count: u32) -> Self {
        Self {
            respond_failures: tokio::sync::Mutex::new(count),
            ..self
        }
    }

    pub async fn responses(&self) -> Vec<RecordedResponse> {
        self.responses.lock().await.clone()
    }

    pub async fn poll_count(&self) -> u32 {
        *self.poll_count.lock().await
    }
}

impl WorkflowTransport for MockTransport {
    async fn poll_decision_task(&self) -> Result<Option<DecisionTask>, DeciderError> {
        *self.poll_count.lock().await += 1;
        let next = self.polls.lock().await.pop();
        match next {
            Some(MockPoll::Task(task)) => Ok(Some(task)),
            Some(MockPoll::Empty) => Ok(None),
            Some(MockPoll::Error(message)) => Err(DeciderError::Transport(message)),
            None => {
                // Stand in for a long poll so an idle loop does not spin.
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(None)
            }
        }
    }

    async fn fetch_history_page(&self, next_page_token: &str) -> Result<HistoryPage, DeciderError> {
        self.pages.get(next_page_token).cloned().ok_or_else(|| {
            DeciderError::Transport(format!(
                "MockTransport: unknown page token '{}'",
                next_page_token
            ))
        })
    }

    async fn respond_decision_task_completed(
        &self,
        task_token: &str,
        decisions: &[Decision],
        execution_context: &str,
    ) -> Result<(), DeciderError> {
        {
            let mut failures = self.respond_failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(DeciderError::Transport(
                    "MockTransport: respond rejected".to_string(),
                ));
            }
        }
        self.responses.lock().await.push(RecordedResponse {
            task_token: task_token.to_string(),
            decisions: decisions.to_vec(),
            execution_context: execution_context.to_string(),
        });
        Ok(())
    }
}
