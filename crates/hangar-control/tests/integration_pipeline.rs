//! Integration tests for the deployment pipeline.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{fixtures::RequestBuilder, TestControl};
use hangar_control::logs::DeploymentLog;
use hangar_control::provisioner::MockDriver;
use hangar_control::remote::{MockTransportMode, RemoteExecutor};
use hangar_control::types::{DeploymentData, DeploymentRecord, StatusPatch};
use hangar_control::{
    ControlError, DeploymentKind, DeploymentStatus, DeploymentStore, Framework,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn container_deployment_reaches_running() {
    let control = TestControl::new();

    let id = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();

    // Recorded before the pipeline gets anywhere
    let view = control.manager.get(&id).await.unwrap();
    assert_eq!(view.record.data.name, "shop");

    let view = control.settle(&id).await;
    assert_eq!(view.record.status, DeploymentStatus::Running);

    let resource_id = view.record.data.resource_id.unwrap();
    assert!((100..=999).contains(&resource_id));

    let address = MockDriver::address_for(resource_id);
    assert_eq!(view.record.data.address.as_deref(), Some(address.as_str()));
    assert_eq!(view.access_url, Some(format!("http://{address}:3000")));
    assert!(view.record.data.deployed_at.is_some());
    assert!(view.record.data.error.is_none());

    assert_eq!(control.driver.apply_count(), 1);
    assert_eq!(
        control.transport.units(&address),
        BTreeSet::from(["hangar-app.service".to_owned()])
    );

    let logs = control.manager.logs(&id).await.unwrap();
    assert!(logs.contains("[pipeline] provisioning started"));
    assert!(logs.contains("[service] starting"));
    assert!(logs.contains("[pipeline] application running"));
}

#[tokio::test]
async fn vm_defaults_apply_when_sizing_is_absent() {
    let control = TestControl::new();

    let id = control
        .manager
        .create(
            RequestBuilder::new("cms")
                .with_kind(DeploymentKind::Vm)
                .with_framework(Framework::Django)
                .default_sizing()
                .build(),
        )
        .await
        .unwrap();

    let view = control.settle(&id).await;
    assert_eq!(view.record.status, DeploymentStatus::Running);
    assert_eq!(view.record.data.resources.cores, 2);
    assert_eq!(view.record.data.resources.memory_mb, 2048);
    assert_eq!(view.record.data.resources.disk_gb, 20);
    assert!(view.access_url.unwrap().ends_with(":8000"));
}

#[tokio::test]
async fn store_rejects_transition_outside_table() {
    let control = TestControl::new();

    let record = DeploymentRecord::new(DeploymentData::new(
        RequestBuilder::new("idle").build(),
        hangar_control::ResourceSpec {
            cores: 1,
            memory_mb: 1024,
            disk_gb: 10,
        },
    ));
    control.store.insert(&record).await.unwrap();

    let err = control
        .store
        .transition(
            &record.data.id,
            DeploymentStatus::Pending,
            DeploymentStatus::Running,
            StatusPatch::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::InvalidStateTransition {
            from: "pending",
            to: "running"
        }
    ));

    let stored = control.store.get(&record.data.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Pending);
}

#[tokio::test]
async fn reconfiguring_a_guest_keeps_one_service() {
    let control = TestControl::new();
    let dir = tempfile::tempdir().unwrap();
    let log = DeploymentLog::at(dir.path().join("reconfigure.log"));

    let executor = RemoteExecutor::with_retry(
        Arc::new(control.transport.clone()),
        Duration::from_millis(10),
        Duration::from_millis(200),
    );
    let data = DeploymentData::new(
        RequestBuilder::new("api")
            .with_framework(Framework::Fastapi)
            .with_env("DEBUG", "false")
            .build(),
        hangar_control::ResourceSpec {
            cores: 1,
            memory_mb: 1024,
            disk_gb: 10,
        },
    );

    for _ in 0..2 {
        executor
            .configure("10.0.0.9", &data, &log, &CancellationToken::new())
            .await
            .unwrap();
    }

    assert_eq!(control.transport.units("10.0.0.9").len(), 1);
}

#[tokio::test]
async fn unreachable_guest_fails_deployment() {
    let control = TestControl::builder()
        .with_transport(MockTransportMode::Refuse)
        .with_retry_ceiling(Duration::from_millis(200))
        .build();

    let started = std::time::Instant::now();
    let id = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();

    let view = control.settle(&id).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(view.record.status, DeploymentStatus::Failed);
    assert!(view
        .record
        .data
        .error
        .as_deref()
        .unwrap()
        .starts_with("[remote_unreachable]"));

    // Provisioned infrastructure is kept for inspection
    assert!(view.record.data.address.is_some());
    assert_eq!(control.driver.destroy_count(), 0);
}

#[tokio::test]
async fn failed_setup_step_names_the_step() {
    let control = TestControl::builder()
        .with_transport(MockTransportMode::FailCommand("npm install".to_owned()))
        .build();

    let id = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();

    let view = control.settle(&id).await;
    assert_eq!(view.record.status, DeploymentStatus::Failed);
    let error = view.record.data.error.unwrap();
    assert!(error.starts_with("[remote_command_failed]"), "{error}");
    assert!(error.contains("'dependencies'"), "{error}");
}

#[tokio::test]
async fn apply_failure_fails_without_destroying() {
    let control = TestControl::new();
    control.driver.fail_next_applies(1);

    let id = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();

    let view = control.settle(&id).await;
    assert_eq!(view.record.status, DeploymentStatus::Failed);
    assert!(view
        .record
        .data
        .error
        .unwrap()
        .starts_with("[provisioning_failed]"));
    assert!(view.record.data.address.is_none());
    assert_eq!(control.driver.destroy_count(), 0);
}

#[tokio::test]
async fn deleting_failed_deployment_survives_destroy_failure() {
    let control = TestControl::new();
    control.driver.fail_next_applies(1);
    control.driver.fail_destroy("state lock held");

    let id = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();
    assert_eq!(
        control.settle(&id).await.record.status,
        DeploymentStatus::Failed
    );

    control.manager.delete(&id).await.unwrap();

    let view = control.manager.get(&id).await.unwrap();
    assert_eq!(view.record.status, DeploymentStatus::Deleted);
    assert!(view.record.data.deleted_at.is_some());
    assert_eq!(control.driver.destroy_count(), 1);

    let logs = control.manager.logs(&id).await.unwrap();
    assert!(logs.contains("destroy failed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_deletes_destroy_once() {
    let control = TestControl::new();
    control.driver.fail_next_applies(1);
    control.driver.set_destroy_delay(Duration::from_millis(100));

    let id = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();
    assert_eq!(
        control.settle(&id).await.record.status,
        DeploymentStatus::Failed
    );

    let (first, second) = tokio::join!(control.manager.delete(&id), control.manager.delete(&id));
    first.unwrap();
    second.unwrap();

    let view = control.settle(&id).await;
    assert_eq!(view.record.status, DeploymentStatus::Deleted);
    assert_eq!(control.driver.destroy_count(), 1);
}

#[tokio::test]
async fn delete_after_teardown_is_a_conflict() {
    let control = TestControl::new();
    control.driver.fail_next_applies(1);

    let id = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();
    control.settle(&id).await;

    control.manager.delete(&id).await.unwrap();
    assert!(!control.manager.is_in_flight(&id));

    let err = control.manager.delete(&id).await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidStateTransition { .. }));
    assert_eq!(control.driver.destroy_count(), 1);
}

#[tokio::test]
async fn last_free_identifier_is_allocated_then_exhausted() {
    let control = TestControl::builder()
        .with_range(100, 104)
        .with_live_ids([100, 101, 102, 103])
        .build();

    let first = control
        .manager
        .create(RequestBuilder::new("first").build())
        .await
        .unwrap();
    let view = control.settle(&first).await;
    assert_eq!(view.record.status, DeploymentStatus::Running);
    assert_eq!(view.record.data.resource_id, Some(104));

    let second = control
        .manager
        .create(RequestBuilder::new("second").build())
        .await
        .unwrap();
    let view = control.settle(&second).await;
    assert_eq!(view.record.status, DeploymentStatus::Failed);
    assert!(view
        .record
        .data
        .error
        .unwrap()
        .starts_with("[allocation_exhausted]"));
    assert_eq!(control.driver.apply_count(), 1);
}

#[tokio::test]
async fn concurrent_deployments_get_distinct_identifiers() {
    let control = TestControl::builder().with_range(100, 119).build();

    let mut ids = Vec::new();
    for i in 0..12 {
        let id = control
            .manager
            .create(RequestBuilder::new(&format!("app-{i}")).build())
            .await
            .unwrap();
        ids.push(id);
    }

    let mut allocated = BTreeSet::new();
    for id in &ids {
        let view = control.settle(id).await;
        assert_eq!(view.record.status, DeploymentStatus::Running);
        allocated.insert(view.record.data.resource_id.unwrap());
    }
    assert_eq!(allocated.len(), ids.len());
}

#[tokio::test]
async fn delete_during_connect_wait_tears_down() {
    let control = TestControl::builder()
        .with_transport(MockTransportMode::Refuse)
        .with_retry_ceiling(Duration::from_secs(60))
        .build();

    let id = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();
    control
        .wait_for_status(&id, DeploymentStatus::Deploying)
        .await;

    control.manager.delete(&id).await.unwrap();

    let view = control.settle(&id).await;
    assert_eq!(view.record.status, DeploymentStatus::Deleted);
    assert_eq!(control.driver.destroy_count(), 1);
    assert!(view.record.data.error.is_none());
}

#[tokio::test]
async fn delete_during_apply_waits_for_the_stage() {
    let control = TestControl::new();
    control.driver.set_apply_delay(Duration::from_millis(200));

    let id = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();
    control
        .wait_for_status(&id, DeploymentStatus::Provisioning)
        .await;

    control.manager.delete(&id).await.unwrap();
    assert!(control.manager.is_in_flight(&id));

    let view = control.settle(&id).await;
    assert_eq!(view.record.status, DeploymentStatus::Deleted);
    assert_eq!(control.driver.apply_count(), 1);
    assert_eq!(control.driver.destroy_count(), 1);
    assert!(control.transport.commands().is_empty());
}

#[tokio::test]
async fn name_is_reusable_after_delete() {
    let control = TestControl::new();

    let id = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();
    control.settle(&id).await;

    let err = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::DuplicateName(_)));

    control.manager.delete(&id).await.unwrap();
    assert_eq!(control.live_count().await, 0);

    let again = control
        .manager
        .create(RequestBuilder::new("shop").build())
        .await
        .unwrap();
    assert_ne!(again, id);
    assert_eq!(
        control.settle(&again).await.record.status,
        DeploymentStatus::Running
    );
}

#[tokio::test]
async fn pipelines_wait_for_a_free_slot() {
    let control = TestControl::builder().with_max_concurrent(1).build();
    control.driver.set_apply_delay(Duration::from_millis(150));

    let first = control
        .manager
        .create(RequestBuilder::new("first").build())
        .await
        .unwrap();
    let second = control
        .manager
        .create(RequestBuilder::new("second").build())
        .await
        .unwrap();

    control
        .wait_for_status(&first, DeploymentStatus::Provisioning)
        .await;
    let waiting = control.manager.get(&second).await.unwrap();
    assert_eq!(waiting.record.status, DeploymentStatus::Pending);

    assert_eq!(
        control.settle(&second).await.record.status,
        DeploymentStatus::Running
    );
    assert_eq!(
        control.settle(&first).await.record.status,
        DeploymentStatus::Running
    );
}

#[tokio::test]
async fn stop_then_delete_running_deployment() {
    let control = TestControl::new();

    let id = control
        .manager
        .create(
            RequestBuilder::new("site")
                .with_framework(Framework::React)
                .build(),
        )
        .await
        .unwrap();
    let view = control.settle(&id).await;
    assert_eq!(view.record.status, DeploymentStatus::Running);

    let stopped = control.manager.stop(&id).await.unwrap();
    assert_eq!(stopped.record.status, DeploymentStatus::Stopped);
    let (_, last) = control.transport.commands().pop().unwrap();
    assert_eq!(last, "systemctl stop nginx");

    control.manager.delete(&id).await.unwrap();
    let view = control.manager.get(&id).await.unwrap();
    assert_eq!(view.record.status, DeploymentStatus::Deleted);
    assert!(view.access_url.is_none());
}
