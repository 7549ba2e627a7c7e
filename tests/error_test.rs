use std::time::Duration;

use divide_merge_decider::error::DeciderError;
use divide_merge_decider::types::TaskState;

fn replay_errors() -> Vec<DeciderError> {
    vec![
        DeciderError::UnknownScheduledEvent(7),
        DeciderError::UnknownTask("t1".to_string()),
        DeciderError::DuplicateTask("t1".to_string()),
        DeciderError::MissingAttributes {
            event_id: 3,
            event_type: "ActivityTaskCompleted".to_string(),
        },
        DeciderError::MalformedDivision {
            task_id: "begin".to_string(),
            reason: "missing field".to_string(),
        },
        DeciderError::InvalidTransition {
            task_id: "t1".to_string(),
            from: TaskState::Completed,
            to: TaskState::Running,
        },
        DeciderError::DependencyOverflow {
            node_id: "begin".to_string(),
        },
        DeciderError::OrphanTask("m1".to_string()),
        DeciderError::InconsistentSnapshot("stranded".to_string()),
    ]
}

// --- Classification ---

#[test]
fn replay_errors_abandon_the_cycle_only() {
    for err in replay_errors() {
        assert!(err.is_replay_inconsistency(), "{}", err);
        assert!(!err.is_retryable(), "{}", err);
        assert!(!err.is_fatal(), "{}", err);
    }
}

#[test]
fn transport_errors_are_retryable() {
    for err in [
        DeciderError::Transport("throttled".to_string()),
        DeciderError::CommandTimeout(Duration::from_secs(90)),
    ] {
        assert!(err.is_retryable(), "{}", err);
        assert!(!err.is_replay_inconsistency());
        assert!(!err.is_fatal());
    }
}

#[test]
fn config_and_io_errors_are_fatal() {
    for err in [
        DeciderError::Config("workers must be >= 1".to_string()),
        DeciderError::Io("Failed to spawn aws".to_string()),
    ] {
        assert!(err.is_fatal(), "{}", err);
        assert!(!err.is_retryable());
    }
}

#[test]
fn fleet_errors_are_neither_retried_nor_fatal() {
    let err = DeciderError::Fleet("access denied".to_string());
    assert!(!err.is_retryable());
    assert!(!err.is_fatal());
    assert!(!err.is_replay_inconsistency());
}

// --- Display ---

#[test]
fn messages_name_the_offending_item() {
    assert_eq!(
        DeciderError::UnknownScheduledEvent(42).to_string(),
        "Event references unknown scheduledEventId 42"
    );
    let msg = DeciderError::MalformedDivision {
        task_id: "d7".to_string(),
        reason: "2 divide_inputs for 3 divide_task_ids".to_string(),
    }
    .to_string();
    assert!(msg.contains("'d7'"), "{}", msg);
    assert!(msg.contains("2 divide_inputs"), "{}", msg);
}

#[test]
fn json_errors_convert() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err = DeciderError::from(json_err);
    assert!(matches!(err, DeciderError::Json(_)));
}

#[test]
fn converts_to_string_for_cli_handlers() {
    let message: String = DeciderError::OrphanTask("m1".to_string()).into();
    assert_eq!(message, "Task 'm1' has no owning node");
}
