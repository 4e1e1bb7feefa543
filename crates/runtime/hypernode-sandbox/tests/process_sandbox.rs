#![cfg(unix)]

use hypernode_sandbox::{ProcessSandbox, Sandbox, SandboxLimits, SandboxPolicy, SandboxSpec};
use hypernode_types::{JobId, PayloadRef, ResourceProfile, ResourceRequirements, TerminalOutcome};
use std::collections::BTreeMap;
use std::time::Duration;

fn spec(job: &str, ram_mb: u64, command: &[&str]) -> SandboxSpec {
    let req = ResourceRequirements {
        profile: ResourceProfile::CpuOnly,
        gpu_count: 0,
        vram_mb: 0,
        ram_mb,
        cpu_cores: 1.0,
        capability: None,
    };
    SandboxSpec {
        job_id: JobId::new(job),
        payload: PayloadRef {
            image: String::new(),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
        },
        limits: SandboxLimits::for_requirements(&req, &SandboxPolicy::default()),
    }
}

#[tokio::test]
async fn successful_job_leaves_result_and_no_residue() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let sandbox = ProcessSandbox::new(root.path());

    let script = r#"echo "$GREETING"; printf '{"answer": 42}' > "$HN_RESULT_PATH""#;
    let handle = sandbox.run(spec("ok-1", 512, &["sh", "-c", script])).await?;
    assert!(handle.data_dir.starts_with(root.path()));

    let outcome = sandbox.wait(&handle).await;
    assert_eq!(outcome, TerminalOutcome::Exited { exit_code: 0 });

    let result = sandbox.release(&handle).await?;
    assert_eq!(result.output, Some(serde_json::json!({"answer": 42})));
    assert_eq!(result.logs, vec!["hello".to_string()]);
    assert_eq!(result.exit_code, Some(0));

    assert!(!handle.data_dir.exists());
    assert_eq!(std::fs::read_dir(root.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn nonzero_exit_is_reported() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let sandbox = ProcessSandbox::new(root.path());
    let handle = sandbox.run(spec("fail-1", 512, &["sh", "-c", "exit 3"])).await?;
    assert_eq!(
        sandbox.wait(&handle).await,
        TerminalOutcome::Exited { exit_code: 3 }
    );
    assert_eq!(sandbox.release(&handle).await?.exit_code, Some(3));
    Ok(())
}

#[tokio::test]
async fn memory_hog_is_stopped() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let sandbox = ProcessSandbox::new(root.path()).with_poll_interval(Duration::from_millis(50));

    // tail buffers an endless line, so its resident set grows without bound
    let handle = sandbox.run(spec("hog-1", 64, &["tail", "/dev/zero"])).await?;
    let outcome = tokio::time::timeout(Duration::from_secs(30), sandbox.wait(&handle)).await?;
    match outcome {
        TerminalOutcome::ResourceExceeded { resource, .. } => assert_eq!(resource, "memory"),
        other => panic!("expected memory limit, got {:?}", other),
    }
    sandbox.release(&handle).await?;
    assert!(!handle.data_dir.exists());
    Ok(())
}

#[tokio::test]
async fn kill_stops_a_running_job() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let sandbox = ProcessSandbox::new(root.path());
    let handle = sandbox.run(spec("sleep-1", 512, &["sleep", "30"])).await?;

    sandbox.kill(&handle).await?;
    let outcome = tokio::time::timeout(Duration::from_secs(5), sandbox.wait(&handle)).await?;
    assert_eq!(outcome, TerminalOutcome::Killed);

    // wait is repeatable
    assert_eq!(sandbox.wait(&handle).await, TerminalOutcome::Killed);
    sandbox.release(&handle).await?;
    Ok(())
}

#[tokio::test]
async fn empty_command_fails_at_startup() {
    let root = tempfile::tempdir().unwrap();
    let sandbox = ProcessSandbox::new(root.path());
    let err = sandbox.run(spec("empty-1", 512, &[])).await.unwrap_err();
    assert!(matches!(
        err,
        hypernode_sandbox::SandboxError::Startup { .. }
    ));
}

#[tokio::test]
async fn missing_binary_fails_at_startup() {
    let root = tempfile::tempdir().unwrap();
    let sandbox = ProcessSandbox::new(root.path());
    let err = sandbox
        .run(spec("nobin-1", 512, &["/nonexistent/hn-binary"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to start"));
}

/// Wait until the job has printed the pid of its background child.
async fn background_pid(handle: &hypernode_sandbox::SandboxHandle) -> anyhow::Result<u32> {
    let stdout = handle.data_dir.join(hypernode_sandbox::workdir::STDOUT_FILE);
    for _ in 0..100 {
        if let Ok(text) = std::fs::read_to_string(&stdout) {
            if let Some(pid) = text.lines().next().and_then(|l| l.trim().parse().ok()) {
                return Ok(pid);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("job never reported its background pid")
}

fn is_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    sys.process(pid)
        .is_some_and(|p| p.status() != ProcessStatus::Zombie)
}

async fn assert_gone(pid: u32) {
    for _ in 0..100 {
        if !is_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("background process {} outlived its job", pid);
}

#[tokio::test]
async fn kill_takes_down_background_children() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let sandbox = ProcessSandbox::new(root.path());
    let handle = sandbox
        .run(spec("tree-1", 512, &["sh", "-c", "sleep 30 & echo $!; wait"]))
        .await?;
    let child = background_pid(&handle).await?;
    assert!(is_alive(child));

    sandbox.kill(&handle).await?;
    let outcome = tokio::time::timeout(Duration::from_secs(5), sandbox.wait(&handle)).await?;
    assert_eq!(outcome, TerminalOutcome::Killed);
    sandbox.release(&handle).await?;
    assert_gone(child).await;
    Ok(())
}

#[tokio::test]
async fn terminate_reaches_the_whole_group() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let sandbox = ProcessSandbox::new(root.path());
    let handle = sandbox
        .run(spec("tree-2", 512, &["sh", "-c", "sleep 30 & echo $!; wait"]))
        .await?;
    let child = background_pid(&handle).await?;

    sandbox.terminate(&handle).await?;
    let outcome = tokio::time::timeout(Duration::from_secs(5), sandbox.wait(&handle)).await?;
    assert!(
        matches!(outcome, TerminalOutcome::RuntimeError { exit_code: None, .. }),
        "expected a signal exit, got {:?}",
        outcome
    );
    sandbox.release(&handle).await?;
    assert_gone(child).await;
    Ok(())
}

#[tokio::test]
async fn memory_trip_kills_the_offending_child() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let sandbox = ProcessSandbox::new(root.path()).with_poll_interval(Duration::from_millis(50));
    let handle = sandbox
        .run(spec("tree-3", 64, &["sh", "-c", "tail /dev/zero & echo $!; wait"]))
        .await?;
    let child = background_pid(&handle).await?;

    let outcome = tokio::time::timeout(Duration::from_secs(30), sandbox.wait(&handle)).await?;
    assert!(matches!(outcome, TerminalOutcome::ResourceExceeded { .. }));
    sandbox.release(&handle).await?;
    assert_gone(child).await;
    Ok(())
}

#[tokio::test]
async fn leftovers_are_cleaned_up_after_a_normal_exit() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let sandbox = ProcessSandbox::new(root.path());
    let handle = sandbox
        .run(spec("tree-4", 512, &["sh", "-c", "sleep 30 & echo $!"]))
        .await?;
    let child = background_pid(&handle).await?;

    let outcome = tokio::time::timeout(Duration::from_secs(5), sandbox.wait(&handle)).await?;
    assert_eq!(outcome, TerminalOutcome::Exited { exit_code: 0 });
    sandbox.release(&handle).await?;
    assert_gone(child).await;
    Ok(())
}
