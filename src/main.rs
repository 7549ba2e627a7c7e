use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use divide_merge_decider::config::{self, DeciderConfig};
use divide_merge_decider::decider::{self, HaltReason};
use divide_merge_decider::decision::{decide, MAX_EXECUTION_CONTEXT_LEN};
use divide_merge_decider::fleet::CliFleetHook;
use divide_merge_decider::history::parse_history_document;
use divide_merge_decider::log::parse_log_level;
use divide_merge_decider::process::{
    install_signal_handlers, is_shutdown_requested, kill_all_children,
};
use divide_merge_decider::replay::replay_events;
use divide_merge_decider::transport::CliTransport;
use divide_merge_decider::log_info;

#[derive(Parser)]
#[command(
    name = "divide-merge-decider",
    about = "Stateless decider for divide/build/merge workflows"
)]
struct Cli {
    /// Working directory holding decider.toml (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/decider.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default decider.toml
    Init,
    /// Poll for decision tasks and answer them until interrupted
    Run {
        /// Override execution.workers
        #[arg(long)]
        workers: Option<u32>,
        /// Stop after this many decision tasks (overrides execution.max_decision_tasks)
        #[arg(long)]
        cap: Option<u32>,
    },
    /// Replay a saved history file and print what a live cycle would submit
    Replay {
        /// JSON file: an array of events, or an object with an `events` array
        history: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => divide_merge_decider::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = &cli.root;
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Init => handle_init(root, config_path),
        Commands::Run { workers, cap } => handle_run(root, config_path, workers, cap).await,
        Commands::Replay { history } => handle_replay(root, config_path, &history),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_init(root: &Path, config_path: Option<&Path>) -> Result<(), String> {
    let path = config::resolve_config_path(config_path, root);
    if path.exists() {
        println!("{} already exists; leaving it untouched", path.display());
        return Ok(());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    fs::write(&path, config::default_config_toml())
        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;

    println!("Created {}", path.display());
    Ok(())
}

async fn handle_run(
    root: &Path,
    config_path: Option<&Path>,
    workers: Option<u32>,
    cap: Option<u32>,
) -> Result<(), String> {
    install_signal_handlers()?;

    log_info!("--- divide-merge-decider ---");

    let mut config = config::load_config_from(config_path, root)?;
    if let Some(workers) = workers {
        config.execution.workers = workers;
    }
    if let Some(cap) = cap {
        config.execution.max_decision_tasks = cap;
    }
    config::validate(&config).map_err(|errors| {
        format!("Invalid command-line overrides:\n  - {}", errors.join("\n  - "))
    })?;
    log_config_summary(&config);

    let transport = Arc::new(CliTransport::from_config(&config));
    let fleet = Arc::new(CliFleetHook::from_config(&config));

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Spawn shutdown monitor that watches for signal and cancels
    tokio::spawn(async move {
        loop {
            if is_shutdown_requested() {
                cancel_clone.cancel();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    });

    let summary = decider::run_decider(transport, fleet, config, cancel).await?;

    // Kill any command still running (an interrupted long poll)
    kill_all_children();

    for line in summary.report_lines() {
        log_info!("{}", line);
    }

    match summary.halt_reason {
        HaltReason::FatalError(message) => Err(message),
        HaltReason::ShutdownRequested | HaltReason::DecisionTaskCapReached => Ok(()),
    }
}

fn log_config_summary(config: &DeciderConfig) {
    log_info!(
        "[config] Workflow: domain={}, task_list={}, identity={}",
        config.workflow.domain,
        config.workflow.task_list,
        config.workflow.identity
    );
    log_info!(
        "[config] Activities: task_list={}, version={}, names={}/{}/{}",
        config.activities.task_list,
        config.activities.version,
        config.activities.divide_name,
        config.activities.merge_name,
        config.activities.build_name
    );
    log_info!(
        "[config] Execution: workers={}, cap={}, backoff={}s, command_timeout={}s",
        config.execution.workers,
        config.execution.max_decision_tasks,
        config.execution.error_backoff_seconds,
        config.execution.command_timeout_seconds
    );
    if config.fleet.is_enabled() {
        log_info!("[config] Fleet: {}", config.fleet.config_source);
    } else {
        log_info!("[config] Fleet: scale-down on completion disabled");
    }
}

fn handle_replay(root: &Path, config_path: Option<&Path>, history: &Path) -> Result<(), String> {
    let config = config::load_config_from(config_path, root)?;

    let contents = fs::read_to_string(history)
        .map_err(|e| format!("Failed to read {}: {}", history.display(), e))?;
    let events = parse_history_document(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", history.display(), e))?;

    let snapshot = replay_events(&events)?;
    let outcome = decide(&snapshot, &config.activities)?;
    let context = outcome
        .execution_context
        .to_bounded_json(MAX_EXECUTION_CONTEXT_LEN)?;

    let report = serde_json::json!({
        "eventsReplayed": snapshot.events_replayed,
        "openTaskCount": snapshot.open_task_count,
        "leafNodes": snapshot.leaf_nodes,
        "readyMergeNodes": snapshot.ready_merge_nodes,
        "workflowComplete": outcome.workflow_complete,
        "decisions": outcome.decisions,
        "executionContext": context,
    });
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|e| format!("Failed to render replay report: {}", e))?;
    println!("{}", rendered);
    Ok(())
}
