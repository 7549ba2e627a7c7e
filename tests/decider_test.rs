mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{
    binary_split_ready_to_merge, decision_task, division, leaf_division, page, HistoryBuilder,
};
use divide_merge_decider::config::{ActivityConfig, DeciderConfig};
use divide_merge_decider::decider::{
    run_cycle, run_decider, CycleOutcome, HaltReason, RunSummary,
};
use divide_merge_decider::decision::{Decision, ExecutionContext};
use divide_merge_decider::fleet::{FleetConfig, MockFleetHook, TakeDownOutcome};
use divide_merge_decider::transport::{MockPoll, MockTransport};

fn no_fleet() -> MockFleetHook {
    MockFleetHook::new(None)
}

fn finished_history() -> HistoryBuilder {
    let mut h = binary_split_ready_to_merge();
    h.scheduled("m1").completed("m1", r#""final""#);
    h
}

fn single_task(token: &str, h: &HistoryBuilder) -> MockTransport {
    MockTransport::new(vec![MockPoll::Task(decision_task(token, h.build(), None))])
}

fn fast_config() -> DeciderConfig {
    let mut config = DeciderConfig::default();
    config.execution.error_backoff_seconds = 0;
    config
}

// --- run_cycle ---

#[tokio::test]
async fn idle_poll_does_nothing() {
    let transport = MockTransport::new(vec![MockPoll::Empty]);
    let outcome = run_cycle(&transport, &no_fleet(), &ActivityConfig::default())
        .await
        .unwrap();
    assert_eq!(outcome, CycleOutcome::Idle);
    assert_eq!(transport.poll_count().await, 1);
    assert!(transport.responses().await.is_empty());
}

#[tokio::test]
async fn first_cycle_schedules_root_divide() {
    let mut h = HistoryBuilder::new();
    h.started(Some(r#"{"repo": "main"}"#));
    let transport = single_task("tok-1", &h);

    let outcome = run_cycle(&transport, &no_fleet(), &ActivityConfig::default())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::Responded {
            decisions: 1,
            workflow_complete: false,
            fleet: None,
            ..
        }
    ));

    let responses = transport.responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].task_token, "tok-1");
    assert_eq!(responses[0].decisions[0].activity_id(), Some("begin"));
    let context: ExecutionContext = serde_json::from_str(&responses[0].execution_context).unwrap();
    assert_eq!(context.progress.total_scheduled(), 0);
}

#[tokio::test]
async fn waiting_cycle_responds_with_no_decisions() {
    let mut h = HistoryBuilder::new();
    h.started(Some("{}")).scheduled("begin");
    let transport = single_task("tok-1", &h);

    run_cycle(&transport, &no_fleet(), &ActivityConfig::default())
        .await
        .unwrap();
    let responses = transport.responses().await;
    assert_eq!(responses.len(), 1);
    assert!(responses[0].decisions.is_empty());
}

#[tokio::test]
async fn history_is_fetched_across_pages() {
    let events = binary_split_ready_to_merge().build();
    let (first, rest) = events.split_at(4);
    let (second, third) = rest.split_at(5);

    let transport = MockTransport::new(vec![MockPoll::Task(decision_task(
        "tok-1",
        first.to_vec(),
        Some("p2"),
    ))])
    .with_page("p2", page(second.to_vec(), Some("p3")))
    .with_page("p3", page(third.to_vec(), None));

    run_cycle(&transport, &no_fleet(), &ActivityConfig::default())
        .await
        .unwrap();
    let responses = transport.responses().await;
    assert_eq!(responses.len(), 1);
    let ids: Vec<&str> = responses[0]
        .decisions
        .iter()
        .filter_map(Decision::activity_id)
        .collect();
    assert_eq!(ids, vec!["m1"]);
}

#[tokio::test]
async fn missing_page_fails_the_cycle_without_responding() {
    let events = binary_split_ready_to_merge().build();
    let transport = MockTransport::new(vec![MockPoll::Task(decision_task(
        "tok-1",
        events[..3].to_vec(),
        Some("gone"),
    ))]);

    let err = run_cycle(&transport, &no_fleet(), &ActivityConfig::default())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(transport.responses().await.is_empty());
}

#[tokio::test]
async fn inconsistent_history_is_abandoned_without_responding() {
    let mut h = HistoryBuilder::new();
    h.started(Some("{}"))
        .scheduled("begin")
        .completed("begin", r#"{"divide_task_ids": ["d1"]}"#);
    let transport = single_task("tok-1", &h);

    let outcome = run_cycle(&transport, &no_fleet(), &ActivityConfig::default())
        .await
        .unwrap();
    match outcome {
        CycleOutcome::Abandoned { workflow, reason } => {
            assert_eq!(workflow, "wf-1/run-1");
            assert!(reason.contains("Malformed division"), "{}", reason);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(transport.responses().await.is_empty());
}

#[tokio::test]
async fn completion_submits_terminal_decision_then_takes_down_fleet() {
    let transport = MockTransport::new(vec![MockPoll::Task(decision_task(
        "tok-9",
        finished_history().build(),
        None,
    ))]);
    let fleet = MockFleetHook::new(Some(FleetConfig {
        automatically_take_down: true,
        auto_scaling_group_name: "builders".to_string(),
    }));

    let outcome = run_cycle(&transport, &fleet, &ActivityConfig::default())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Responded {
            workflow: "wf-1/run-1".to_string(),
            decisions: 1,
            workflow_complete: true,
            fleet: Some(TakeDownOutcome::ScaledDown("builders".to_string())),
        }
    );
    assert_eq!(transport.responses().await[0].decisions, vec![Decision::complete()]);
    assert_eq!(fleet.scaled_groups().await, vec!["builders"]);
}

#[tokio::test]
async fn fleet_failure_does_not_block_completion() {
    let transport = MockTransport::new(vec![MockPoll::Task(decision_task(
        "tok-9",
        finished_history().build(),
        None,
    ))]);
    let fleet = MockFleetHook::failing_load("no such key");

    let outcome = run_cycle(&transport, &fleet, &ActivityConfig::default())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::Responded {
            workflow_complete: true,
            fleet: Some(TakeDownOutcome::Failed(_)),
            ..
        }
    ));
    assert_eq!(transport.responses().await.len(), 1);
}

#[tokio::test]
async fn unfinished_workflow_never_touches_fleet() {
    let transport = MockTransport::new(vec![MockPoll::Task(decision_task(
        "tok-1",
        binary_split_ready_to_merge().build(),
        None,
    ))]);
    let fleet = MockFleetHook::new(Some(FleetConfig {
        automatically_take_down: true,
        auto_scaling_group_name: "builders".to_string(),
    }));

    run_cycle(&transport, &fleet, &ActivityConfig::default())
        .await
        .unwrap();
    assert!(fleet.scaled_groups().await.is_empty());
}

// --- run_decider ---

#[tokio::test]
async fn decider_stops_at_decision_task_cap() {
    let mut started = HistoryBuilder::new();
    started.started(Some("{}"));
    let mut divided = HistoryBuilder::new();
    divided
        .started(Some("{}"))
        .scheduled("begin")
        .completed("begin", &division(&["d1", "d2"], "m1"));

    let transport = Arc::new(MockTransport::new(vec![
        MockPoll::Empty,
        MockPoll::Task(decision_task("tok-1", started.build(), None)),
        MockPoll::Task(decision_task("tok-2", divided.build(), None)),
        MockPoll::Task(decision_task("tok-3", finished_history().build(), None)),
    ]));
    let mut config = fast_config();
    config.execution.max_decision_tasks = 2;

    let summary = run_decider(
        Arc::clone(&transport),
        Arc::new(no_fleet()),
        config,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::DecisionTaskCapReached);
    assert_eq!(summary.decision_tasks, 2);
    assert_eq!(summary.decisions_emitted, 3);
    assert_eq!(summary.workflows_completed, 0);
    let tokens: Vec<String> = transport
        .responses()
        .await
        .into_iter()
        .map(|r| r.task_token)
        .collect();
    assert_eq!(tokens, vec!["tok-1", "tok-2"]);
}

#[tokio::test]
async fn decider_retries_after_transport_errors() {
    let mut single = HistoryBuilder::new();
    single
        .started(Some("{}"))
        .scheduled("begin")
        .completed("begin", &leaf_division("t1"));

    let transport = Arc::new(
        MockTransport::new(vec![
            MockPoll::Error("ThrottlingException".to_string()),
            MockPoll::Task(decision_task("tok-1", single.build(), None)),
            MockPoll::Task(decision_task("tok-2", single.build(), None)),
        ])
        .with_respond_failures(1),
    );
    let mut config = fast_config();
    config.execution.max_decision_tasks = 1;

    let summary = run_decider(
        Arc::clone(&transport),
        Arc::new(no_fleet()),
        config,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::DecisionTaskCapReached);
    assert_eq!(summary.decision_tasks, 1);
    let responses = transport.responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].task_token, "tok-2");
    assert_eq!(transport.poll_count().await, 3);
}

#[tokio::test]
async fn decider_counts_abandoned_cycles_and_completions() {
    let mut broken = HistoryBuilder::new();
    broken.started(Some("{}")).scheduled("ghost");

    let transport = Arc::new(MockTransport::new(vec![
        MockPoll::Task(decision_task("tok-1", broken.build(), None)),
        MockPoll::Task(decision_task("tok-2", finished_history().build(), None)),
    ]));
    let mut config = fast_config();
    config.execution.max_decision_tasks = 2;

    let summary = run_decider(
        Arc::clone(&transport),
        Arc::new(no_fleet()),
        config,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.decision_tasks, 2);
    assert_eq!(summary.cycles_abandoned, 1);
    assert_eq!(summary.workflows_completed, 1);
    assert_eq!(transport.responses().await.len(), 1);
}

#[test]
fn run_summary_report_is_one_record_per_line() {
    let summary = RunSummary {
        decision_tasks: 4,
        decisions_emitted: 7,
        workflows_completed: 1,
        cycles_abandoned: 2,
        halt_reason: HaltReason::ShutdownRequested,
    };
    let lines = summary.report_lines();

    assert_eq!(lines[0], "--- Run Summary ---");
    assert!(lines.contains(&"Workflows completed: 1".to_string()));
    assert!(lines.contains(&"Cycles abandoned: 2".to_string()));
    assert_eq!(lines.last().unwrap(), "Halt reason: ShutdownRequested");
    for line in &lines {
        assert!(!line.contains('\n'), "{:?}", line);
    }
}

#[test]
fn run_summary_report_omits_zero_optional_counts() {
    let summary = RunSummary {
        decision_tasks: 0,
        decisions_emitted: 0,
        workflows_completed: 0,
        cycles_abandoned: 0,
        halt_reason: HaltReason::DecisionTaskCapReached,
    };
    assert_eq!(summary.report_lines().len(), 4);
}

#[tokio::test]
async fn decider_stops_on_cancellation() {
    let transport = Arc::new(MockTransport::new(Vec::new()));
    let cancel = CancellationToken::new();
    let mut config = fast_config();
    config.execution.workers = 3;

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        run_decider(Arc::clone(&transport), Arc::new(no_fleet()), config, cancel),
    )
    .await
    .expect("decider did not stop")
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::ShutdownRequested);
    assert_eq!(summary.decision_tasks, 0);
    assert!(transport.poll_count().await >= 3);
}

#[tokio::test]
async fn decider_rejects_invalid_config() {
    let mut config = fast_config();
    config.execution.workers = 0;
    let err = run_decider(
        Arc::new(MockTransport::new(Vec::new())),
        Arc::new(no_fleet()),
        config,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(err.contains("execution.workers"), "{}", err);
}
