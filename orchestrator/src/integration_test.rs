use std::collections::HashMap;

use anyhow::Result;
use data_model::{
    ContainerId,
    ContainerState,
    FunctionDescriptor,
    LABEL_CREATED_BY,
    LABEL_CREATED_BY_VALUE,
    LABEL_FUNCTION,
    get_epoch_time_in_ms,
};
use runtime_driver::{InjectedFailure, RuntimeDriver, RuntimeState};

use crate::{
    ensure::EnsureError,
    testing::{TestService, test_config},
};

fn hello() -> FunctionDescriptor {
    FunctionDescriptor::new("hello", "hello:latest")
}

fn seeded_labels(function: &str) -> HashMap<String, String> {
    let mut labels = data_model::esb_labels(function);
    labels.insert(runtime_driver::LABEL_PORT.to_string(), "8080".to_string());
    labels
}

#[tokio::test]
async fn test_cold_start_creates_ready_container() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;

    let response = test_srv.service.provisioner.ensure("hello").await?;
    assert!(test_srv.driver.contains(&response.container_id));
    assert_eq!(test_srv.driver.create_calls(), 1);
    assert!(!response.address.ip.is_empty());

    let state = test_srv
        .service
        .store
        .with_function("hello", |fc| fc.get(&response.container_id).unwrap().state)
        .await;
    assert_eq!(state, ContainerState::Ready);
    Ok(())
}

#[tokio::test]
async fn test_ensure_is_idempotent() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;

    let first = test_srv.service.provisioner.ensure("hello").await?;
    let second = test_srv.service.provisioner.ensure("hello").await?;
    assert_eq!(first.container_id, second.container_id);
    assert_eq!(test_srv.driver.create_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_ensures_coalesce_to_one_create() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    let provisioner = test_srv.service.provisioner.clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let provisioner = provisioner.clone();
        handles.push(tokio::spawn(async move { provisioner.ensure("hello").await }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await?.unwrap().container_id);
    }

    assert_eq!(test_srv.driver.create_calls(), 1);
    assert!(ids.iter().all(|id| id == &ids[0]));
    Ok(())
}

#[tokio::test]
async fn test_ensure_at_capacity() -> Result<()> {
    let mut descriptor = hello();
    descriptor.max_capacity = 1;
    let test_srv = TestService::new(vec![descriptor])?;

    let response = test_srv.service.provisioner.ensure("hello").await?;

    // Simulate the gateway checking the only container out.
    test_srv
        .service
        .store
        .with_function("hello", |fc| {
            fc.get_mut(&response.container_id)
                .unwrap()
                .set_state(ContainerState::Busy)
                .unwrap();
        })
        .await;

    let err = test_srv.service.provisioner.ensure("hello").await.unwrap_err();
    assert!(matches!(err, EnsureError::AtCapacity(_)));
    assert_eq!(test_srv.driver.create_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_ensure_disabled_function() -> Result<()> {
    let mut descriptor = hello();
    descriptor.max_capacity = 0;
    let test_srv = TestService::new(vec![descriptor])?;

    let err = test_srv.service.provisioner.ensure("hello").await.unwrap_err();
    assert!(matches!(err, EnsureError::AtCapacity(_)));
    assert_eq!(test_srv.driver.create_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_ensure_unknown_function() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    let err = test_srv.service.provisioner.ensure("missing").await.unwrap_err();
    assert!(matches!(err, EnsureError::UnknownFunction(_)));
    Ok(())
}

#[tokio::test]
async fn test_failed_start_rolls_back() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    test_srv.driver.fail_next_start();

    let err = test_srv.service.provisioner.ensure("hello").await.unwrap_err();
    assert!(matches!(err, EnsureError::ContainerStartFailed { .. }));

    // Neither a runtime container nor a record is left behind.
    assert!(test_srv.driver.container_ids().is_empty());
    assert!(test_srv.service.store.snapshot().await.is_empty());

    // The next ensure recovers.
    let response = test_srv.service.provisioner.ensure("hello").await?;
    assert!(test_srv.driver.contains(&response.container_id));
    Ok(())
}

#[tokio::test]
async fn test_injected_create_failure_surfaces() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    test_srv.driver.fail_next_create(InjectedFailure::Opaque);

    let err = test_srv.service.provisioner.ensure("hello").await.unwrap_err();
    assert!(matches!(err, EnsureError::ContainerStartFailed { .. }));
    assert!(test_srv.service.store.snapshot().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_evict_removes_container_and_record() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    let response = test_srv.service.provisioner.ensure("hello").await?;

    test_srv
        .service
        .provisioner
        .teardown(&response.container_id, "test")
        .await?;

    assert!(!test_srv.driver.contains(&response.container_id));
    assert!(test_srv.service.store.snapshot().await.is_empty());

    // Evicting an already-gone container is not an error.
    test_srv
        .service
        .provisioner
        .teardown(&response.container_id, "test")
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_reaper_removes_idle_containers() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    let response = test_srv.service.provisioner.ensure("hello").await?;

    // Mark idle far in the past.
    test_srv
        .service
        .store
        .with_function("hello", |fc| {
            let record = fc.get_mut(&response.container_id).unwrap();
            record.set_state(ContainerState::Busy).unwrap();
            record.set_state(ContainerState::Idle).unwrap();
            record.last_used_at = get_epoch_time_in_ms() - 10 * 60 * 1000;
        })
        .await;

    let reaped = test_srv.service.reaper.sweep().await?;
    assert_eq!(reaped, 1);
    assert!(!test_srv.driver.contains(&response.container_id));
    assert!(test_srv.service.store.snapshot().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reaper_leaves_fresh_idle_containers() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    let response = test_srv.service.provisioner.ensure("hello").await?;

    test_srv
        .service
        .store
        .with_function("hello", |fc| {
            let record = fc.get_mut(&response.container_id).unwrap();
            record.set_state(ContainerState::Busy).unwrap();
            record.set_state(ContainerState::Idle).unwrap();
        })
        .await;

    let reaped = test_srv.service.reaper.sweep().await?;
    assert_eq!(reaped, 0);
    assert!(test_srv.driver.contains(&response.container_id));
    Ok(())
}

#[tokio::test]
async fn test_heartbeat_defers_reaping() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    let response = test_srv.service.provisioner.ensure("hello").await?;

    test_srv
        .service
        .store
        .with_function("hello", |fc| {
            let record = fc.get_mut(&response.container_id).unwrap();
            record.set_state(ContainerState::Busy).unwrap();
            record.set_state(ContainerState::Idle).unwrap();
            record.last_used_at = get_epoch_time_in_ms() - 10 * 60 * 1000;
        })
        .await;

    // A heartbeat arrives before the sweep.
    test_srv
        .service
        .store
        .touch_containers(&[response.container_id.clone()], get_epoch_time_in_ms())
        .await;

    let reaped = test_srv.service.reaper.sweep().await?;
    assert_eq!(reaped, 0);
    assert!(test_srv.driver.contains(&response.container_id));
    Ok(())
}

#[tokio::test]
async fn test_reaper_tears_down_stuck_busy_container() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    let response = test_srv.service.provisioner.ensure("hello").await?;

    test_srv
        .service
        .store
        .with_function("hello", |fc| {
            let record = fc.get_mut(&response.container_id).unwrap();
            record.set_state(ContainerState::Busy).unwrap();
            // Stale beyond 4x the 5 minute idle timeout.
            record.last_used_at = get_epoch_time_in_ms() - 25 * 60 * 1000;
        })
        .await;

    let reaped = test_srv.service.reaper.sweep().await?;
    assert_eq!(reaped, 1);
    assert!(test_srv.service.store.snapshot().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reaper_zero_idle_timeout_reaps_on_next_sweep() -> Result<()> {
    let mut config = test_config();
    config.idle_timeout_minutes = 0;
    let test_srv = TestService::with_config(vec![hello()], config)?;
    let response = test_srv.service.provisioner.ensure("hello").await?;

    test_srv
        .service
        .store
        .with_function("hello", |fc| {
            let record = fc.get_mut(&response.container_id).unwrap();
            record.set_state(ContainerState::Busy).unwrap();
            record.set_state(ContainerState::Idle).unwrap();
            record.last_used_at -= 1;
        })
        .await;

    let reaped = test_srv.service.reaper.sweep().await?;
    assert_eq!(reaped, 1);
    Ok(())
}

#[tokio::test]
async fn test_adopt_sync_adopts_running_removes_exited() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;

    test_srv
        .driver
        .seed_container("esb-hello-aaaa", seeded_labels("hello"), RuntimeState::Running);
    test_srv
        .driver
        .seed_container("esb-hello-bbbb", seeded_labels("hello"), RuntimeState::Exited);

    test_srv.adopt_sync().await?;

    let records = test_srv.service.store.snapshot().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id.get(), "esb-hello-aaaa");
    assert_eq!(records[0].state, ContainerState::Ready);

    // The exited container is removed from the runtime too.
    assert_eq!(test_srv.driver.container_ids(), vec!["esb-hello-aaaa"]);
    Ok(())
}

#[tokio::test]
async fn test_adopt_sync_ignores_foreign_containers() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;

    let mut foreign = HashMap::new();
    foreign.insert(LABEL_CREATED_BY.to_string(), "someone-else".to_string());
    test_srv
        .driver
        .seed_container("other-tool-1", foreign, RuntimeState::Running);

    test_srv.adopt_sync().await?;

    assert!(test_srv.service.store.snapshot().await.is_empty());
    assert!(test_srv.driver.contains(&ContainerId::from("other-tool-1")));
    Ok(())
}

#[tokio::test]
async fn test_ensure_after_adopt_hits_warm_path() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    test_srv
        .driver
        .seed_container("esb-hello-aaaa", seeded_labels("hello"), RuntimeState::Running);
    test_srv.adopt_sync().await?;

    let response = test_srv.service.provisioner.ensure("hello").await?;
    assert_eq!(response.container_id.get(), "esb-hello-aaaa");
    assert_eq!(test_srv.driver.create_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_adopt_sync_adopts_paused_container() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    test_srv
        .driver
        .seed_container("esb-hello-aaaa", seeded_labels("hello"), RuntimeState::Paused);
    test_srv.adopt_sync().await?;

    let records = test_srv.service.store.snapshot().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, ContainerState::Paused);

    // Ensure resumes it instead of creating a new one.
    let response = test_srv.service.provisioner.ensure("hello").await?;
    assert_eq!(response.container_id.get(), "esb-hello-aaaa");
    assert_eq!(test_srv.driver.create_calls(), 0);
    assert_eq!(
        test_srv
            .driver
            .inspect(&response.container_id)
            .await?
            .state,
        RuntimeState::Running
    );
    Ok(())
}

#[tokio::test]
async fn test_labelled_container_with_missing_function_label_is_removed() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;

    let mut labels = HashMap::new();
    labels.insert(
        LABEL_CREATED_BY.to_string(),
        LABEL_CREATED_BY_VALUE.to_string(),
    );
    test_srv
        .driver
        .seed_container("esb-mystery", labels, RuntimeState::Running);

    test_srv.adopt_sync().await?;
    assert!(test_srv.service.store.snapshot().await.is_empty());
    assert!(!test_srv.driver.contains(&ContainerId::from("esb-mystery")));
    Ok(())
}

#[tokio::test]
async fn test_adopted_container_keeps_function_label() -> Result<()> {
    let test_srv = TestService::new(vec![hello()])?;
    test_srv
        .driver
        .seed_container("esb-hello-aaaa", seeded_labels("hello"), RuntimeState::Running);
    test_srv.adopt_sync().await?;

    let records = test_srv.service.store.snapshot().await;
    assert_eq!(
        records[0].labels.get(LABEL_FUNCTION).map(String::as_str),
        Some("hello")
    );
    Ok(())
}
