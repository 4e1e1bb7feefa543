//! Local child-process backend.
//!
//! The payload command runs directly on the host inside a throwaway working
//! directory. Memory is enforced by a watchdog that samples the resident set of the
//! process tree; GPU visibility is enforced through `CUDA_VISIBLE_DEVICES`. There is no
//! network namespace here, so hosts that need egress isolation should use the
//! container backend.
//!
//! On Unix the payload leads its own process group. Termination and kills are sent
//! to the whole group, and whatever is left of the group is killed once the leader
//! exits, so no descendant outlives its job.

use async_trait::async_trait;
use hypernode_types::{JobResult, TerminalOutcome};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::workdir::{sanitize, JobWorkdir};
use crate::{Sandbox, SandboxError, SandboxHandle, SandboxSpec};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Requests from the sandbox to the supervisor owning a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Terminate,
    Kill,
}

struct Entry {
    workdir: JobWorkdir,
    stop_tx: mpsc::Sender<Stop>,
    outcome: watch::Receiver<Option<TerminalOutcome>>,
}

pub struct ProcessSandbox {
    root: PathBuf,
    poll_interval: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProcessSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn send_stop(&self, handle: &SandboxHandle, stop: Stop) -> Result<(), SandboxError> {
        let stop_tx = {
            let entries = self.entries.lock().await;
            entries
                .get(&handle.sandbox_id)
                .map(|e| e.stop_tx.clone())
                .ok_or_else(|| SandboxError::UnknownHandle(handle.sandbox_id.clone()))?
        };
        // A closed channel means the supervisor already reported an outcome.
        let _ = stop_tx.send(stop).await;
        Ok(())
    }

    async fn outcome_rx(
        &self,
        handle: &SandboxHandle,
    ) -> Option<watch::Receiver<Option<TerminalOutcome>>> {
        let entries = self.entries.lock().await;
        entries.get(&handle.sandbox_id).map(|e| e.outcome.clone())
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn backend(&self) -> &'static str {
        "process"
    }

    async fn run(&self, spec: SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let startup = |reason: String| SandboxError::Startup {
            job_id: spec.job_id.clone(),
            reason,
        };

        let (program, args) = spec
            .payload
            .command
            .split_first()
            .ok_or_else(|| startup("payload has no command".to_string()))?;

        let workdir = JobWorkdir::create(&self.root, &spec.job_id)
            .map_err(|e| startup(format!("cannot create job directory: {}", e)))?;
        let stdout = std::fs::File::create(workdir.stdout_path())?;
        let stderr = std::fs::File::create(workdir.stderr_path())?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HN_JOB_DIR", workdir.path())
            .env("HN_RESULT_PATH", workdir.result_path())
            .env("CUDA_VISIBLE_DEVICES", spec.limits.visible_devices())
            .env(
                "HN_EGRESS_ALLOWLIST",
                spec.limits.network.allowed_hosts().join(","),
            )
            .envs(&spec.payload.env)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| startup(format!("spawn {}: {}", program, e)))?;
        let pid = child.id().unwrap_or_default();
        let sandbox_id = format!("hn-{}-{}", sanitize(spec.job_id.as_str()), pid);

        let (stop_tx, stop_rx) = mpsc::channel(2);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        tokio::spawn(supervise(
            child,
            spec.limits.memory_bytes(),
            self.poll_interval,
            stop_rx,
            outcome_tx,
        ));

        let handle = SandboxHandle {
            job_id: spec.job_id.clone(),
            sandbox_id: sandbox_id.clone(),
            data_dir: workdir.path().to_path_buf(),
        };
        info!(job_id = %spec.job_id, pid, memory_mb = spec.limits.memory_mb, "Started job process");

        self.entries.lock().await.insert(
            sandbox_id,
            Entry {
                workdir,
                stop_tx,
                outcome: outcome_rx,
            },
        );
        Ok(handle)
    }

    async fn wait(&self, handle: &SandboxHandle) -> TerminalOutcome {
        let Some(mut rx) = self.outcome_rx(handle).await else {
            return TerminalOutcome::RuntimeError {
                exit_code: None,
                message: format!("unknown sandbox {}", handle.sandbox_id),
            };
        };
        let outcome = match rx.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(TerminalOutcome::Killed),
            Err(_) => TerminalOutcome::RuntimeError {
                exit_code: None,
                message: "process supervisor exited without an outcome".to_string(),
            },
        };
        outcome
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.send_stop(handle, Stop::Terminate).await
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.send_stop(handle, Stop::Kill).await
    }

    async fn release(&self, handle: &SandboxHandle) -> Result<JobResult, SandboxError> {
        let entry = self
            .entries
            .lock()
            .await
            .remove(&handle.sandbox_id)
            .ok_or_else(|| SandboxError::UnknownHandle(handle.sandbox_id.clone()))?;

        let mut rx = entry.outcome.clone();
        if rx.borrow().is_none() {
            let _ = entry.stop_tx.send(Stop::Kill).await;
            let _ = rx.wait_for(|o| o.is_some()).await;
        }
        let exit_code = match &*rx.borrow() {
            Some(TerminalOutcome::Exited { exit_code }) => Some(*exit_code),
            Some(TerminalOutcome::RuntimeError { exit_code, .. }) => *exit_code,
            _ => None,
        };

        let extracted = entry.workdir.extract();
        entry.workdir.discard()?;
        let mut result = extracted?;
        result.exit_code = exit_code;
        debug!(job_id = %handle.job_id, "Released job directory");
        Ok(result)
    }
}

/// Owns the child until it ends, whichever way that happens.
async fn supervise(
    mut child: Child,
    memory_limit: u64,
    poll: Duration,
    mut stop_rx: mpsc::Receiver<Stop>,
    outcome_tx: watch::Sender<Option<TerminalOutcome>>,
) {
    let root = child.id();
    let mut sys = System::new();
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => outcome_from_status(status),
                    Err(e) => TerminalOutcome::RuntimeError {
                        exit_code: None,
                        message: format!("wait failed: {}", e),
                    },
                };
            }
            Some(stop) = stop_rx.recv() => {
                if stop == Stop::Terminate && terminate_group(root) {
                    debug!(pid = ?root, "Sent SIGTERM to job process group");
                    continue;
                }
                kill_tree(&mut child, root).await;
                break TerminalOutcome::Killed;
            }
            _ = ticker.tick() => {
                let Some(root) = root else { continue };
                let used = resident_bytes(&mut sys, Pid::from_u32(root));
                if used > memory_limit {
                    warn!(pid = root, used_mb = used >> 20, limit_mb = memory_limit >> 20, "Job process exceeded memory limit");
                    kill_tree(&mut child, Some(root)).await;
                    break TerminalOutcome::ResourceExceeded {
                        resource: "memory".to_string(),
                        detail: format!(
                            "resident set {} MB over limit {} MB",
                            used >> 20,
                            memory_limit >> 20
                        ),
                    };
                }
            }
        }
    };
    // Descendants that outlived the leader still hold the group.
    reap_group(root);
    let _ = outcome_tx.send(Some(outcome));
}

/// Kill the child and, on Unix, every process in its group.
async fn kill_tree(child: &mut Child, group: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = group {
        if let Err(e) = signal_group(pgid, libc::SIGKILL) {
            warn!(pgid, error = %e, "Failed to kill job process group");
        }
    }
    #[cfg(not(unix))]
    let _ = group;
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill job process");
    }
}

/// Ask the process group to stop. False when there is no graceful path.
fn terminate_group(group: Option<u32>) -> bool {
    #[cfg(unix)]
    if let Some(pgid) = group {
        return match signal_group(pgid, libc::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                warn!(pgid, error = %e, "Failed to signal job process group");
                false
            }
        };
    }
    #[cfg(not(unix))]
    let _ = group;
    false
}

fn reap_group(group: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = group {
        if let Err(e) = signal_group(pgid, libc::SIGKILL) {
            warn!(pgid, error = %e, "Failed to clean up job process group");
        }
    }
    #[cfg(not(unix))]
    let _ = group;
}

/// Signal every member of process group `pgid`. An empty group is not an error.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pgid out of range"))?;
    // SAFETY: killpg has no memory-safety preconditions; it only sends a signal.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

fn outcome_from_status(status: ExitStatus) -> TerminalOutcome {
    match status.code() {
        Some(code) => TerminalOutcome::Exited { exit_code: code },
        None => TerminalOutcome::RuntimeError {
            exit_code: None,
            message: format!("terminated by signal ({})", status),
        },
    }
}

/// Resident memory of `root` and all of its descendants.
fn resident_bytes(sys: &mut System, root: Pid) -> u64 {
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );

    let mut tree = HashSet::from([root]);
    let mut grew = true;
    while grew {
        grew = false;
        for (pid, process) in sys.processes() {
            if tree.contains(pid) {
                continue;
            }
            if process.parent().is_some_and(|p| tree.contains(&p)) {
                tree.insert(*pid);
                grew = true;
            }
        }
    }

    tree.iter()
        .filter_map(|pid| sys.process(*pid))
        .map(|p| p.memory())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn exit_codes_are_preserved() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(
            outcome_from_status(ExitStatus::from_raw(0)),
            TerminalOutcome::Exited { exit_code: 0 }
        );
        assert_eq!(
            outcome_from_status(ExitStatus::from_raw(3 << 8)),
            TerminalOutcome::Exited { exit_code: 3 }
        );
        assert!(matches!(
            outcome_from_status(ExitStatus::from_raw(9)),
            TerminalOutcome::RuntimeError { exit_code: None, .. }
        ));
    }

    #[test]
    fn own_process_has_resident_memory() {
        let mut sys = System::new();
        let me = Pid::from_u32(std::process::id());
        assert!(resident_bytes(&mut sys, me) > 0);
    }
}
