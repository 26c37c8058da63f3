//! Tracker restarts over the same persistent store.

use std::time::Duration;

use chrono::Utc;
use jobkit_core::{
    JobAction, JobError, JobInfo, JobState, JobTemplate, JobTracker, SessionCloser,
};
use jobkit_process::{JobStore, PersistentJobStore, ProcessTracker, ProcessTrackerConfig};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(30);

fn shell(script: &str) -> JobTemplate {
    JobTemplate::new("/bin/sh", ["-c", script])
}

fn config(dir: &TempDir) -> ProcessTrackerConfig {
    ProcessTrackerConfig {
        recovery_poll_interval: Duration::from_millis(50),
        ..ProcessTrackerConfig::persistent(dir.path().join("jobs.redb"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_done_job_survives_restart() {
    let dir = TempDir::new().expect("tempdir");

    let first = ProcessTracker::with_config(config(&dir)).expect("tracker");
    let job_id = first.add_job(shell("exit 0")).await.expect("submit");
    first
        .wait(&job_id, WAIT, JobState::TERMINATED)
        .await
        .expect("finished");
    let before = first.job_info(&job_id).await.expect("info");
    first.close().await.expect("close");
    drop(first);

    let second = ProcessTracker::with_config(config(&dir)).expect("reopen");
    assert_eq!(
        second.job_state(&job_id).await.expect("state").0,
        JobState::Done
    );
    let after = second.job_info(&job_id).await.expect("info");
    assert_eq!(after.exit_status, Some(0));
    assert_eq!(after.submission_time, before.submission_time);
    assert_eq!(after.dispatch_time, before.dispatch_time);

    let next = second.add_job(shell("exit 0")).await.expect("submit");
    assert!(next.parse::<u64>().expect("id") > job_id.parse::<u64>().expect("id"));
    second.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_running_job_survives_restart() {
    let dir = TempDir::new().expect("tempdir");

    let first = ProcessTracker::with_config(config(&dir)).expect("tracker");
    let job_id = first.add_job(shell("sleep 10")).await.expect("submit");
    first
        .wait(&job_id, WAIT, &[JobState::Running])
        .await
        .expect("running");
    let dispatched = first
        .job_info(&job_id)
        .await
        .expect("info")
        .dispatch_time;
    first.close().await.expect("close");
    drop(first);

    let second = ProcessTracker::with_config(config(&dir)).expect("reopen");
    assert_eq!(
        second.job_state(&job_id).await.expect("state").0,
        JobState::Running
    );
    assert_eq!(
        second.job_info(&job_id).await.expect("info").dispatch_time,
        dispatched
    );

    second
        .job_control(&job_id, JobAction::Terminate)
        .await
        .expect("terminate");
    second
        .wait(&job_id, WAIT, JobState::TERMINATED)
        .await
        .expect("recovered job finishes");
    assert_eq!(
        second.job_state(&job_id).await.expect("state").0,
        JobState::Failed
    );
    second.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_array_job_survives_restart() {
    let dir = TempDir::new().expect("tempdir");

    let first = ProcessTracker::with_config(config(&dir)).expect("tracker");
    let array_id = first
        .add_array_job(shell("exit 0"), 1, 3, 1, 0)
        .await
        .expect("submit");
    for task in first.list_array_jobs(&array_id).await.expect("tasks") {
        first
            .wait(&task, WAIT, JobState::TERMINATED)
            .await
            .expect("finished");
    }
    first.close().await.expect("close");
    drop(first);

    let second = ProcessTracker::with_config(config(&dir)).expect("reopen");
    let tasks = second.list_array_jobs(&array_id).await.expect("tasks");
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        assert_eq!(
            second.job_state(task).await.expect("state").0,
            JobState::Done
        );
    }
    second.delete_job(&array_id).await.expect("delete");
    assert!(second.list_jobs().await.expect("list").is_empty());
    second.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_finishing_while_closed_keeps_exit_status() {
    let dir = TempDir::new().expect("tempdir");

    let first = ProcessTracker::with_config(config(&dir)).expect("tracker");
    let job_id = first
        .add_job(shell("sleep 1; exit 0"))
        .await
        .expect("submit");
    first
        .wait(&job_id, WAIT, &[JobState::Running])
        .await
        .expect("running");
    first.close().await.expect("close");
    drop(first);

    let second = ProcessTracker::with_config(config(&dir)).expect("reopen");
    second
        .wait(&job_id, WAIT, JobState::TERMINATED)
        .await
        .expect("finished");
    let info = second.job_info(&job_id).await.expect("info");
    assert_eq!(info.state, JobState::Done);
    assert_eq!(info.exit_status, Some(0));
    assert!(info.annotation.is_empty());
    assert!(info.extensions.contains_key("ru_maxrss"));
    second.close().await.expect("close");
    drop(second);

    let third = ProcessTracker::with_config(config(&dir)).expect("reopen");
    assert_eq!(
        third.job_state(&job_id).await.expect("state").0,
        JobState::Done
    );
    third.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_gone_while_down_keeps_last_state() {
    let dir = TempDir::new().expect("tempdir");
    let mut child = std::process::Command::new("/bin/true")
        .spawn()
        .expect("spawn");
    let dead_pid = child.id();
    child.wait().expect("reap");

    let dispatched = Utc::now();
    {
        let store = PersistentJobStore::open(dir.path().join("jobs.redb")).expect("open");
        store
            .save_job("7", &shell("sleep 10"), dead_pid)
            .expect("save");
        let mut running = JobInfo::new("7", JobState::Running);
        running.dispatch_time = Some(dispatched);
        store
            .save_job_state("7", JobState::Running, &running)
            .expect("state");
        store.close().expect("close");
    }

    let tracker = ProcessTracker::with_config(config(&dir)).expect("reopen");
    // Several recovery poll intervals pass without a synthesized outcome.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let info = tracker.job_info("7").await.expect("info");
    assert_eq!(info.state, JobState::Running);
    assert_eq!(info.dispatch_time, Some(dispatched));
    assert!(info.finish_time.is_none());
    assert!(matches!(
        tracker.delete_job("7").await,
        Err(JobError::InvalidState(_))
    ));

    let next = tracker.add_job(shell("exit 0")).await.expect("submit");
    assert_eq!(next, "8");
    tracker.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_suspended_job_stays_suspended_after_restart() {
    let dir = TempDir::new().expect("tempdir");

    let first = ProcessTracker::with_config(config(&dir)).expect("tracker");
    let job_id = first.add_job(shell("sleep 10")).await.expect("submit");
    first
        .wait(&job_id, WAIT, &[JobState::Running])
        .await
        .expect("running");
    first
        .job_control(&job_id, JobAction::Suspend)
        .await
        .expect("suspend");
    first.close().await.expect("close");
    drop(first);

    let second = ProcessTracker::with_config(config(&dir)).expect("reopen");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        second.job_state(&job_id).await.expect("state").0,
        JobState::Suspended
    );

    second
        .job_control(&job_id, JobAction::Resume)
        .await
        .expect("resume");
    assert_eq!(
        second.job_state(&job_id).await.expect("state").0,
        JobState::Running
    );
    second
        .job_control(&job_id, JobAction::Terminate)
        .await
        .expect("terminate");
    second
        .wait(&job_id, WAIT, JobState::TERMINATED)
        .await
        .expect("finished");
    let info = second.job_info(&job_id).await.expect("info");
    assert_eq!(info.state, JobState::Failed);
    assert_eq!(info.terminating_signal.as_deref(), Some("SIGKILL"));
    second.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_start_is_not_persisted() {
    let dir = TempDir::new().expect("tempdir");

    let first = ProcessTracker::with_config(config(&dir)).expect("tracker");
    let missing = first
        .add_job(JobTemplate::new(
            "/nonexistent/jobkit-binary",
            Vec::<String>::new(),
        ))
        .await;
    assert!(matches!(missing, Err(JobError::Internal(_))));
    first.close().await.expect("close");
    drop(first);

    let second = ProcessTracker::with_config(config(&dir)).expect("reopen");
    assert!(second.list_jobs().await.expect("list").is_empty());
    second.close().await.expect("close");
}
