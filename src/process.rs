use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;

use crate::error::DeciderError;
use crate::{log_debug, log_warn};

/// Grace period between SIGTERM and SIGKILL for a command's process group.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// How often to check whether a signalled process group has exited.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Set by SIGINT/SIGTERM; the run loop's shutdown monitor watches it.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Route SIGTERM and SIGINT to the shutdown flag instead of killing the
/// process, so workers can finish the decision task in hand.
///
/// Safe to call more than once; each call registers the handlers again.
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Command registry ---

/// Process groups of client commands currently running.
///
/// A `std::sync::Mutex` is enough: the lock only guards set insert, remove
/// and copy-out, never I/O or an await point.
fn command_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

fn track(pgid: Pid) {
    if let Ok(mut registry) = command_registry().lock() {
        registry.insert(pgid);
    }
}

fn untrack(pgid: Pid) {
    if let Ok(mut registry) = command_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Terminate every command still running, typically an interrupted long
/// poll on the way out of `run`. Blocks for at most the grace period.
pub fn kill_all_children() {
    let pgids: Vec<Pid> = {
        let Ok(mut registry) = command_registry().lock() else {
            return;
        };
        registry.drain().collect()
    };

    if !pgids.is_empty() {
        log_debug!("[process] terminating {} running command(s)", pgids.len());
        terminate_groups(&pgids);
    }
}

/// SIGTERM each group, wait until all have exited or the grace period ends,
/// then SIGKILL whatever is left.
fn terminate_groups(pgids: &[Pid]) {
    use nix::sys::signal::{killpg, Signal};

    for &pgid in pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);
    while std::time::Instant::now() < deadline {
        // A null signal only probes for existence; ESRCH means the group is gone.
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            return;
        }
        std::thread::sleep(poll_interval);
    }

    // Grace period over
    for &pgid in pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

/// Run a command to completion in its own process group and return stdout.
///
/// Non-zero exit maps to `DeciderError::Transport` carrying stderr; running
/// past `timeout` kills the whole group and maps to `CommandTimeout`. A
/// binary that cannot be spawned is `Io`.
pub async fn run_command(
    mut cmd: tokio::process::Command,
    timeout: Duration,
) -> Result<String, DeciderError> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();

    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only async-signal-safe
    // functions are permitted. setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    // A client that cannot be started will not start on retry either.
    let child = cmd
        .spawn()
        .map_err(|e| DeciderError::Io(format!("Failed to spawn {}: {}", program, e)))?;
    let child_pid = child
        .id()
        .ok_or_else(|| DeciderError::Transport(format!("Failed to get PID of {}", program)))?
        as i32;
    let pgid = Pid::from_raw(child_pid);
    track(pgid);
    log_debug!("[process] {} spawned (pid={})", program, child_pid);

    let wait_result = tokio::time::timeout(timeout, child.wait_with_output()).await;
    untrack(pgid);

    let output = match wait_result {
        Err(_) => {
            log_debug!(
                "[process] {} timed out after {}s, killing process group",
                program,
                timeout.as_secs()
            );
            kill_process_group(pgid).await;
            return Err(DeciderError::CommandTimeout(timeout));
        }
        Ok(result) => result
            .map_err(|e| DeciderError::Transport(format!("Error waiting for {}: {}", program, e)))?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeciderError::Transport(format!(
            "{} exited with {:?}: {}",
            program,
            output.status.code(),
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| DeciderError::Transport(format!("{} wrote non-UTF-8 output: {}", program, e)))
}

/// Terminate one timed-out command's process group.
///
/// The sleep-and-probe loop blocks, so it runs on the blocking pool rather
/// than stalling a runtime worker.
async fn kill_process_group(pgid: Pid) {
    tokio::task::spawn_blocking(move || terminate_groups(&[pgid]))
        .await
        .unwrap_or_else(|e| log_warn!("[process] kill task for {} panicked: {}", pgid, e));
}
