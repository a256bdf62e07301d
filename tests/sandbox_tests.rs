//! Pool lifecycle tests against the local provider.

use std::sync::Arc;
use std::time::Duration;

use cowork::error::SandboxError;
use cowork::sandbox::local::LocalProvider;
use cowork::sandbox::{
    AdmissionPolicy, BusyPolicy, PoolConfig, SandboxConfig, SandboxManager, SandboxState,
};

fn manager_with(config: PoolConfig) -> (tempfile::TempDir, Arc<SandboxManager>) {
    let root = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalProvider::new(Some(root.path().to_path_buf())).unwrap());
    (root, Arc::new(SandboxManager::new(provider, config)))
}

fn manager() -> (tempfile::TempDir, Arc<SandboxManager>) {
    manager_with(PoolConfig::default())
}

#[tokio::test]
async fn start_execute_stop_round_trip() {
    let (_root, manager) = manager();

    let id = manager.start(SandboxConfig::default(), None).await.unwrap();
    assert_eq!(
        manager.instance_state(&id).await,
        Some(SandboxState::Ready)
    );

    let result = manager.execute(&id, "echo hello", None).await.unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.trim(), "hello");
    assert!(!result.timed_out);

    manager.stop(&id).await.unwrap();
    assert_eq!(
        manager.instance_state(&id).await,
        Some(SandboxState::Terminated)
    );
}

#[tokio::test]
async fn nonzero_exit_is_reported_not_an_error() {
    let (_root, manager) = manager();
    let id = manager.start(SandboxConfig::default(), None).await.unwrap();

    let result = manager.execute(&id, "exit 7", None).await.unwrap();
    assert_eq!(result.exit_code, 7);
}

#[tokio::test]
async fn timed_out_commands_are_killed_and_flagged() {
    let (_root, manager) = manager();
    let id = manager.start(SandboxConfig::default(), None).await.unwrap();

    let result = manager
        .execute(&id, "echo part; sleep 30", Some(Duration::from_millis(300)))
        .await
        .unwrap();

    assert!(result.timed_out);
    assert_eq!(result.exit_code, -1);
    assert_eq!(result.stdout.trim(), "part");
    // The instance survives a timeout.
    assert_eq!(manager.instance_state(&id).await, Some(SandboxState::Ready));
}

#[tokio::test]
async fn file_transfer_round_trip() {
    let (_root, manager) = manager();
    let id = manager.start(SandboxConfig::default(), None).await.unwrap();

    let staging = tempfile::tempdir().unwrap();
    let src = staging.path().join("in.bin");
    let dst = staging.path().join("out.bin");
    let payload: Vec<u8> = (0..=255u8).collect();
    tokio::fs::write(&src, &payload).await.unwrap();

    manager.upload_file(&id, &src, "/work/data.bin").await.unwrap();
    manager
        .download_file(&id, "/work/data.bin", &dst)
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&dst).await.unwrap(), payload);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (_root, manager) = manager();
    let id = manager.start(SandboxConfig::default(), None).await.unwrap();

    manager.stop(&id).await.unwrap();
    manager.stop(&id).await.unwrap();
    manager.stop("sb-never-existed").await.unwrap();
}

#[tokio::test]
async fn execute_after_stop_is_rejected() {
    let (_root, manager) = manager();
    let id = manager.start(SandboxConfig::default(), None).await.unwrap();
    manager.stop(&id).await.unwrap();

    let err = manager.execute(&id, "echo hi", None).await.unwrap_err();
    assert!(matches!(err, SandboxError::Terminated(_)));
}

#[tokio::test]
async fn fail_fast_admission_rejects_at_capacity() {
    let config = PoolConfig {
        max_instances: 1,
        admission: AdmissionPolicy::FailFast,
        ..PoolConfig::default()
    };
    let (_root, manager) = manager_with(config);

    let profile = SandboxConfig {
        reusable: false,
        ..SandboxConfig::default()
    };
    let _id = manager.start(profile.clone(), None).await.unwrap();

    let err = manager.start(profile, None).await.unwrap_err();
    assert!(matches!(err, SandboxError::Provision(_)));
}

#[tokio::test]
async fn blocking_admission_times_out() {
    let config = PoolConfig {
        max_instances: 1,
        admission: AdmissionPolicy::Block {
            wait: Duration::from_millis(200),
        },
        ..PoolConfig::default()
    };
    let (_root, manager) = manager_with(config);

    let _id = manager.start(SandboxConfig::default(), None).await.unwrap();
    let err = manager.start(SandboxConfig::default(), None).await.unwrap_err();
    assert!(matches!(err, SandboxError::Provision(_)));
}

#[tokio::test]
async fn release_parks_warm_and_start_reuses() {
    let (_root, manager) = manager();
    let profile = SandboxConfig::default();

    let id = manager.start(profile.clone(), None).await.unwrap();
    manager.release(&id).await.unwrap();
    assert_eq!(manager.stats().await.warm_count, 1);

    let again = manager.start(profile, None).await.unwrap();
    assert_eq!(again, id);
    assert_eq!(manager.stats().await.warm_count, 0);
}

#[tokio::test]
async fn warm_reuse_requires_matching_profile() {
    let (_root, manager) = manager();

    let id = manager.start(SandboxConfig::default(), None).await.unwrap();
    manager.release(&id).await.unwrap();

    let bigger = SandboxConfig {
        memory_mib: 1024,
        ..SandboxConfig::default()
    };
    let other = manager.start(bigger, None).await.unwrap();
    assert_ne!(other, id);
}

#[tokio::test]
async fn non_reusable_instances_are_destroyed_on_release() {
    let (_root, manager) = manager();
    let profile = SandboxConfig {
        reusable: false,
        ..SandboxConfig::default()
    };

    let id = manager.start(profile, None).await.unwrap();
    manager.release(&id).await.unwrap();

    assert_eq!(
        manager.instance_state(&id).await,
        Some(SandboxState::Terminated)
    );
    assert_eq!(manager.stats().await.warm_count, 0);
}

#[tokio::test]
async fn idle_sweep_evicts_cold_instances() {
    let config = PoolConfig {
        idle_ttl: Duration::from_millis(50),
        ..PoolConfig::default()
    };
    let (_root, manager) = manager_with(config);

    let id = manager.start(SandboxConfig::default(), None).await.unwrap();
    manager.release(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(manager.sweep_idle().await, 1);
    assert_eq!(
        manager.instance_state(&id).await,
        Some(SandboxState::Terminated)
    );
}

#[tokio::test]
async fn start_tokens_are_idempotent() {
    let (_root, manager) = manager();

    let first = manager
        .start(SandboxConfig::default(), Some("req-1"))
        .await
        .unwrap();
    let second = manager
        .start(SandboxConfig::default(), Some("req-1"))
        .await
        .unwrap();
    assert_eq!(first, second);

    // A different token gets its own instance.
    let third = manager
        .start(SandboxConfig::default(), Some("req-2"))
        .await
        .unwrap();
    assert_ne!(third, first);
}

#[tokio::test]
async fn concurrent_starts_with_one_token_share_an_instance() {
    let (_root, manager) = manager();

    let (a, b) = tokio::join!(
        manager.start(SandboxConfig::default(), Some("req-race")),
        manager.start(SandboxConfig::default(), Some("req-race")),
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(manager.stats().await.live_count, 1);
}

#[tokio::test]
async fn sweep_prunes_long_terminated_records() {
    let config = PoolConfig {
        idle_ttl: Duration::from_millis(50),
        ..PoolConfig::default()
    };
    let (_root, manager) = manager_with(config);

    let id = manager.start(SandboxConfig::default(), None).await.unwrap();
    manager.stop(&id).await.unwrap();
    assert_eq!(
        manager.instance_state(&id).await,
        Some(SandboxState::Terminated)
    );

    tokio::time::sleep(Duration::from_millis(120)).await;
    manager.sweep_idle().await;

    // The record is gone; the map does not grow by one per instance ever
    // created.
    assert_eq!(manager.instance_state(&id).await, None);
}

#[tokio::test]
async fn release_never_parks_a_busy_instance() {
    let (_root, manager) = manager();
    let id = manager.start(SandboxConfig::default(), None).await.unwrap();

    let slow = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.execute(&id, "sleep 0.3", None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.instance_state(&id).await, Some(SandboxState::Busy));

    manager.release(&id).await.unwrap();

    assert_eq!(manager.stats().await.warm_count, 0);
    assert_eq!(
        manager.instance_state(&id).await,
        Some(SandboxState::Terminated)
    );
    let _ = slow.await.unwrap();
}

#[tokio::test]
async fn busy_reject_policy_surfaces_busy() {
    let config = PoolConfig {
        busy: BusyPolicy::Reject,
        ..PoolConfig::default()
    };
    let (_root, manager) = manager_with(config);
    let id = manager.start(SandboxConfig::default(), None).await.unwrap();

    let slow = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.execute(&id, "sleep 1", None).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = manager.execute(&id, "echo hi", None).await.unwrap_err();
    assert!(matches!(err, SandboxError::Busy(_)));

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.exit_code, 0);
}

#[tokio::test]
async fn busy_wait_policy_queues_the_second_command() {
    let (_root, manager) = manager();
    let id = manager.start(SandboxConfig::default(), None).await.unwrap();

    let slow = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.execute(&id, "sleep 0.3; echo first", None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = manager.execute(&id, "echo second", None).await.unwrap();
    assert_eq!(second.stdout.trim(), "second");
    assert_eq!(slow.await.unwrap().unwrap().stdout.trim(), "first");
}

#[tokio::test]
async fn shutdown_terminates_everything() {
    let (_root, manager) = manager();
    let a = manager.start(SandboxConfig::default(), None).await.unwrap();
    let b = manager
        .start(
            SandboxConfig {
                memory_mib: 512,
                ..SandboxConfig::default()
            },
            None,
        )
        .await
        .unwrap();

    manager.shutdown().await;

    assert_eq!(manager.stats().await.live_count, 0);
    for id in [a, b] {
        assert_eq!(
            manager.instance_state(&id).await,
            Some(SandboxState::Terminated)
        );
    }
}
