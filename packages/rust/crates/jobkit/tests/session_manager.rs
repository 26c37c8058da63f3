//! Session lifecycle through the session manager.

mod common;

use std::sync::Arc;
use std::time::Duration;

use jobkit::{
    JobError, JobState, SessionManager, SessionStore, SessionType, TrackerRegistry,
};
use tempfile::TempDir;

use common::{MockAllocator, shell};

fn registry_with_mock() -> (TrackerRegistry, Arc<MockAllocator>) {
    let mut registry = TrackerRegistry::new();
    jobkit_process::register(&mut registry);
    let mock = Arc::new(MockAllocator::default());
    registry.register(SessionType::LegacyLibrary, mock.clone());
    (registry, mock)
}

#[tokio::test]
async fn test_legacy_contact_is_persisted_and_handed_back() {
    let dir = TempDir::new().expect("tempdir");
    let (registry, mock) = registry_with_mock();
    let manager =
        SessionManager::new(registry, dir.path().join("sessions.redb")).expect("manager");

    let session = manager
        .create_job_session("legacy", SessionType::LegacyLibrary, None)
        .expect("create");
    assert_eq!(
        session.contact().expect("contact").as_deref(),
        Some("mock://legacy")
    );

    let reopened = manager.open_job_session("legacy", None).expect("open");
    assert_eq!(reopened.name(), "legacy");
    let contexts = mock.contexts.lock().expect("contexts");
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].contact, None);
    assert_eq!(contexts[1].contact.as_deref(), Some("mock://legacy"));
}

#[tokio::test]
async fn test_process_sessions_store_no_contact() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("sessions.redb");
    {
        let (registry, _mock) = registry_with_mock();
        let manager = SessionManager::new(registry, &path).expect("manager");
        let session = manager
            .create_job_session("local", SessionType::Process, None)
            .expect("create");
        session.close().await.expect("close");
    }

    let store = SessionStore::open(&path).expect("store");
    let record = store.get("local").expect("get").expect("record");
    assert_eq!(record.session_type, SessionType::Process);
    assert_eq!(record.contact, None);
}

#[tokio::test]
async fn test_session_name_rules() {
    let dir = TempDir::new().expect("tempdir");
    let (registry, _mock) = registry_with_mock();
    let manager =
        SessionManager::new(registry, dir.path().join("sessions.redb")).expect("manager");

    manager
        .create_job_session("b", SessionType::LegacyLibrary, None)
        .expect("create");
    manager
        .create_job_session("a", SessionType::LegacyLibrary, None)
        .expect("create");
    assert!(matches!(
        manager.create_job_session("a", SessionType::LegacyLibrary, None),
        Err(JobError::InvalidArgument(_))
    ));
    assert_eq!(manager.job_session_names().expect("names"), vec!["a", "b"]);

    assert!(matches!(
        manager.open_job_session("missing", None),
        Err(JobError::NotFound(_))
    ));
    manager.destroy_job_session("a").expect("destroy");
    assert!(matches!(
        manager.destroy_job_session("a"),
        Err(JobError::NotFound(_))
    ));
    assert_eq!(manager.job_session_names().expect("names"), vec!["b"]);

    assert!(matches!(
        manager.create_job_session("c", SessionType::Cluster, None),
        Err(JobError::NotFound(_))
    ));
    assert!(!manager.job_session_names().expect("names").contains(&"c".to_string()));
}

#[tokio::test]
async fn test_monitoring_requires_capability() {
    let dir = TempDir::new().expect("tempdir");
    let (registry, _mock) = registry_with_mock();
    let manager =
        SessionManager::new(registry, dir.path().join("sessions.redb")).expect("manager");

    assert!(matches!(
        manager.open_monitoring_session("m", SessionType::LegacyLibrary, None),
        Err(JobError::UnsupportedOperation(_))
    ));
}

#[tokio::test]
async fn test_monitoring_jobs_are_read_only() {
    let dir = TempDir::new().expect("tempdir");
    let store_dir = dir.path().join("stores");
    let mut registry = TrackerRegistry::new();
    jobkit_process::register_with(
        &mut registry,
        jobkit_process::ProcessTrackerConfig {
            store_dir: Some(store_dir.clone()),
            ..jobkit_process::ProcessTrackerConfig::default()
        },
    );
    let manager =
        SessionManager::new(registry, dir.path().join("sessions.redb")).expect("manager");

    let session = manager
        .create_job_session("work", SessionType::Process, None)
        .expect("create");
    let job = session.run_job(shell("exit 0")).await.expect("run");
    job.wait_terminated(Duration::from_secs(30))
        .await
        .expect("terminated");
    let job_id = job.id().to_string();
    session.close().await.expect("close");
    assert!(store_dir.join("work.redb").exists());

    // A monitoring session named after the job session sees its persisted jobs.
    let monitoring = manager
        .open_monitoring_session("work", SessionType::Process, None)
        .expect("monitoring");
    let jobs = monitoring.all_jobs(None).await.expect("jobs");
    let seen = jobs.iter().find(|j| j.id() == job_id).expect("job visible");
    assert!(seen.is_read_only());
    assert_eq!(seen.template().remote_command, "/bin/sh");
    assert!(matches!(
        seen.terminate().await,
        Err(JobError::UnsupportedOperation(_))
    ));
    assert!(matches!(
        seen.reap().await,
        Err(JobError::UnsupportedOperation(_))
    ));
    assert_eq!(
        seen.state().await.expect("state").0,
        JobState::Done
    );
    assert_eq!(
        monitoring.job_info(&job_id).await.expect("info").exit_status,
        Some(0)
    );
    assert!(!monitoring.all_machines(&[]).await.expect("machines").is_empty());
    monitoring.close().await.expect("close");
}

#[tokio::test]
async fn test_manager_from_settings_uses_default_backend() {
    jobkit::init_tracing("jobkit=debug");
    let dir = TempDir::new().expect("tempdir");
    let settings_path = dir.path().join("settings.yaml");
    std::fs::write(
        &settings_path,
        format!(
            "session:\n  metadata_path: {}\n  default_session_type: legacy-library\n",
            dir.path().join("meta/sessions.redb").display()
        ),
    )
    .expect("write settings");
    let settings =
        jobkit::settings::load_settings_from_paths(&dir.path().join("absent.yaml"), &settings_path);

    let (registry, mock) = registry_with_mock();
    let manager = SessionManager::from_settings(registry, &settings).expect("manager");
    assert_eq!(manager.default_session_type(), SessionType::LegacyLibrary);

    let session = manager
        .create_default_job_session("defaulted", None)
        .expect("create");
    assert_eq!(
        session.contact().expect("contact").as_deref(),
        Some("mock://defaulted")
    );
    assert_eq!(mock.contexts.lock().expect("contexts").len(), 1);
    assert!(dir.path().join("meta/sessions.redb").exists());
}
