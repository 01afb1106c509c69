//! Lifecycle tests against the supervisor handle
#![cfg(unix)]

use assert_matches::assert_matches;
use mining_supervisor::{
    ConfigValidator, Error, HostLimits, MiningConfig, RawMiningConfig, StateTag,
    SupervisorHandle, SupervisorSettings, ValidationDefaults,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::timeout;

const WALLET: &str = "44AFFq5kSiGBoZ4NMDwYtN18obc8AemS33DBLWs3H7otXft3XjrpDtQGv7SqSsaBYBb98uNbr2VBBEt7f2wfn3RVGQBEP3A";

fn config(cores: i64) -> MiningConfig {
    let validator = ConfigValidator::new(HostLimits::new(8, None), ValidationDefaults::default());
    validator
        .validate(&RawMiningConfig {
            cpu_cores_num: Some(cores),
            pool_url: Some("pool.supportxmr.com:443".to_string()),
            wallet_address: Some(WALLET.to_string()),
            worker_id: Some("lifecycle".to_string()),
            ..RawMiningConfig::default()
        })
        .unwrap()
}

fn shell(script: &str) -> SupervisorSettings {
    SupervisorSettings {
        miner_path: PathBuf::from("/bin/sh"),
        launcher_args: vec!["-c".to_string(), script.to_string(), "xmrig".to_string()],
        grace_period: Duration::from_secs(2),
        spawn_check: Duration::from_millis(100),
        kill_timeout: Duration::from_secs(2),
        ..SupervisorSettings::default()
    }
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Running or stopped, but not a zombie awaiting its reaper
#[cfg(target_os = "linux")]
fn process_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .map(|(_, rest)| !rest.starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

async fn wait_for(supervisor: &SupervisorHandle, state: StateTag) {
    let mut updates = supervisor.subscribe();
    timeout(Duration::from_secs(5), updates.wait_for(|s| s.state == state))
        .await
        .expect("timed out waiting for state")
        .expect("supervisor stopped");
}

#[tokio::test]
async fn test_concurrent_start_exactly_one_runs() {
    let supervisor = SupervisorHandle::spawn(shell("exec sleep 30"));
    let other = supervisor.clone();

    let (a, b) = tokio::join!(supervisor.start(config(1)), other.start(config(2)));

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let conflict = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_matches!(conflict, Error::Conflict { .. });
    assert_eq!(supervisor.status().state, StateTag::Running);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_each_run_gets_fresh_id() {
    let supervisor = SupervisorHandle::spawn(shell("exec sleep 30"));

    let first = supervisor.start(config(1)).await.unwrap();
    supervisor.stop().await.unwrap();
    let second = supervisor.start(config(1)).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(supervisor.status().exit, None);

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let supervisor = SupervisorHandle::spawn(shell("exec sleep 30"));
    supervisor.start(config(1)).await.unwrap();

    let first = supervisor.stop().await.unwrap();
    let second = supervisor.stop().await.unwrap();

    assert!(first.was_running);
    assert!(!second.was_running);
    assert_eq!(second.previous_state, StateTag::Idle);
}

#[tokio::test]
async fn test_external_kill_detected() {
    let supervisor = SupervisorHandle::spawn(shell("exec sleep 30"));
    let started = supervisor.start(config(1)).await.unwrap();
    let pid = started.pid.unwrap();

    // SAFETY: pid is the worker started above
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };

    wait_for(&supervisor, StateTag::Failed).await;
    let status = supervisor.status();
    assert_eq!(status.state, StateTag::Failed);
    assert_eq!(status.pid, None);
    assert_eq!(status.exit.unwrap().signal, Some(libc::SIGKILL));
}

#[tokio::test]
async fn test_clean_self_exit_still_failed() {
    let supervisor = SupervisorHandle::spawn(shell("sleep 0.3; exit 0"));
    supervisor.start(config(1)).await.unwrap();

    wait_for(&supervisor, StateTag::Failed).await;
    let exit = supervisor.status().exit.unwrap();
    assert!(exit.success);
    assert_eq!(exit.code, Some(0));
}

#[tokio::test]
async fn test_stop_forces_stubborn_worker() {
    let mut settings = shell("trap '' TERM; while :; do sleep 0.1; done");
    settings.grace_period = Duration::from_millis(300);
    let supervisor = SupervisorHandle::spawn(settings);

    let started = supervisor.start(config(1)).await.unwrap();
    // Let the shell install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = supervisor.stop().await.unwrap();
    assert!(outcome.was_running);
    assert!(outcome.forced);
    assert_eq!(outcome.exit.unwrap().signal, Some(libc::SIGKILL));
    assert!(!process_alive(started.pid.unwrap()));
}

#[tokio::test]
async fn test_transitional_states_are_visible() {
    let mut settings = shell("trap '' TERM; while :; do sleep 0.1; done");
    settings.spawn_check = Duration::from_millis(500);
    settings.grace_period = Duration::from_millis(500);
    let supervisor = SupervisorHandle::spawn(settings);
    let mut updates = supervisor.subscribe();

    let start = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.start(config(1)).await }
    });
    timeout(
        Duration::from_secs(5),
        updates.wait_for(|s| s.state == StateTag::Starting),
    )
    .await
    .unwrap()
    .unwrap();
    let status = supervisor.status();
    assert_eq!(status.state, StateTag::Starting);
    assert!(status.run_id.is_some());

    let started = start.await.unwrap().unwrap();
    assert_eq!(supervisor.status().state, StateTag::Running);

    let stop = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.stop().await }
    });
    timeout(
        Duration::from_secs(5),
        updates.wait_for(|s| s.state == StateTag::Stopping),
    )
    .await
    .unwrap()
    .unwrap();
    let status = supervisor.status();
    assert_eq!(status.state, StateTag::Stopping);
    assert_eq!(status.pid, started.pid);
    assert_eq!(status.run_id, Some(started.run_id));

    let outcome = stop.await.unwrap().unwrap();
    assert!(outcome.forced);
    assert_eq!(outcome.previous_state, StateTag::Running);
    assert_eq!(supervisor.status().state, StateTag::Idle);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_stop_reaches_processes_started_by_wrapper() {
    // The wrapper does not exec, so the long-running process is a grandchild
    let supervisor = SupervisorHandle::spawn(shell("sleep 30 & echo $!; wait"));
    let started = supervisor.start(config(1)).await.unwrap();

    let mut grandchild = None;
    for _ in 0..100 {
        if let Some(line) = supervisor.logs(1).first() {
            grandchild = line.line.trim().parse::<u32>().ok();
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let grandchild = grandchild.expect("worker never printed its child pid");
    assert_ne!(Some(grandchild), started.pid);
    assert!(process_running(grandchild));

    let outcome = supervisor.stop().await.unwrap();
    assert!(outcome.was_running);

    let mut gone = false;
    for _ in 0..100 {
        if !process_running(grandchild) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "process {} outlived stop", grandchild);
}

#[tokio::test]
async fn test_stop_from_failed_resets() {
    let supervisor = SupervisorHandle::spawn(SupervisorSettings {
        miner_path: PathBuf::from("/nonexistent/xmrig"),
        ..SupervisorSettings::default()
    });
    assert_matches!(supervisor.start(config(1)).await, Err(Error::Spawn { .. }));

    let outcome = supervisor.stop().await.unwrap();
    assert!(!outcome.was_running);
    assert_eq!(outcome.previous_state, StateTag::Failed);
    assert_eq!(supervisor.status().state, StateTag::Idle);
}

#[tokio::test]
async fn test_shutdown_terminates_worker() {
    let supervisor = SupervisorHandle::spawn(shell("exec sleep 30"));
    let started = supervisor.start(config(1)).await.unwrap();
    let pid = started.pid.unwrap();
    assert!(process_alive(pid));

    supervisor.shutdown().await.unwrap();
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn test_status_reports_uptime() {
    let supervisor = SupervisorHandle::spawn(shell("exec sleep 30"));
    supervisor.start(config(1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let status = supervisor.status();
    assert!(status.uptime_seconds.unwrap() >= 1);

    supervisor.shutdown().await.unwrap();
}
