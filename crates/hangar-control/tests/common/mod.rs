//! Common test utilities for control integration tests.

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use hangar_control::{
    api::AppState,
    credentials::ManagedKey,
    inventory::StaticInventory,
    provisioner::MockDriver,
    remote::{MockTransport, MockTransportMode, RemoteExecutor},
    Collaborators, ControlConfig, DeploymentId, DeploymentManager, DeploymentStatus,
    DeploymentStore, DeploymentView, MemoryStore,
};
use tempfile::TempDir;

/// Public key handed to descriptors in tests.
pub const TEST_PUBLIC_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAItest hangar-test";

/// Complete test control plane with every collaborator mocked.
pub struct TestControl {
    pub config: ControlConfig,
    pub store: Arc<MemoryStore>,
    pub inventory: Arc<StaticInventory>,
    pub driver: Arc<MockDriver>,
    pub transport: MockTransport,
    pub manager: DeploymentManager,
    _dir: TempDir,
}

impl TestControl {
    /// Creates a control plane with an empty platform and a reachable network.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts a customised control plane.
    pub fn builder() -> TestControlBuilder {
        TestControlBuilder::default()
    }

    /// Router state sharing this control plane.
    pub fn app_state(&self) -> AppState {
        AppState {
            manager: self.manager.clone(),
            store: self.store.clone(),
        }
    }

    /// Waits for the deployment's pipeline to finish and returns the record.
    pub async fn settle(&self, id: &DeploymentId) -> DeploymentView {
        for _ in 0..1000 {
            if !self.manager.is_in_flight(id) {
                return self.manager.get(id).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline for {id} did not finish");
    }

    /// Waits until the deployment reaches `status`.
    pub async fn wait_for_status(&self, id: &DeploymentId, status: DeploymentStatus) {
        for _ in 0..1000 {
            let view = self.manager.get(id).await.unwrap();
            if view.record.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("deployment {id} never reached {status}");
    }

    /// Records that are not deleted, as the store sees them.
    pub async fn live_count(&self) -> usize {
        self.store
            .list(&hangar_control::DeploymentFilter::new())
            .await
            .unwrap()
            .len()
    }
}

impl Default for TestControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`TestControl`].
pub struct TestControlBuilder {
    range: (u32, u32),
    live_ids: Vec<u32>,
    mode: MockTransportMode,
    retry_ceiling: Duration,
    max_concurrent: usize,
}

impl Default for TestControlBuilder {
    fn default() -> Self {
        Self {
            range: (100, 999),
            live_ids: Vec::new(),
            mode: MockTransportMode::Accept,
            retry_ceiling: Duration::from_millis(300),
            max_concurrent: 4,
        }
    }
}

impl TestControlBuilder {
    /// Restricts the identifier range.
    pub fn with_range(mut self, start: u32, end: u32) -> Self {
        self.range = (start, end);
        self
    }

    /// Reports these identifiers as existing on the platform.
    pub fn with_live_ids(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.live_ids = ids.into_iter().collect();
        self
    }

    /// Sets how the remote transport answers.
    pub fn with_transport(mut self, mode: MockTransportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets how long connection attempts are retried for.
    pub fn with_retry_ceiling(mut self, ceiling: Duration) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    /// Sets how many pipelines may run at once.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn build(self) -> TestControl {
        let dir = tempfile::tempdir().unwrap();

        let mut config = ControlConfig::default();
        config.allocator.range_start = self.range.0;
        config.allocator.range_end = self.range.1;
        config.pipeline.max_concurrent = self.max_concurrent;
        config.terraform.workspace_root = dir.path().join("workspaces");
        config.logs.dir = dir.path().join("logs");

        let store = Arc::new(MemoryStore::new());
        let inventory = Arc::new(StaticInventory::with_ids(self.live_ids));
        let driver = Arc::new(MockDriver::new());
        let transport = MockTransport::new(self.mode);

        let manager = DeploymentManager::new(
            &config,
            Collaborators {
                store: store.clone(),
                inventory: inventory.clone(),
                driver: driver.clone(),
                executor: RemoteExecutor::with_retry(
                    Arc::new(transport.clone()),
                    Duration::from_millis(10),
                    self.retry_ceiling,
                ),
                key: ManagedKey::from_parts(dir.path().join("id_ed25519"), TEST_PUBLIC_KEY),
            },
        )
        .unwrap();

        TestControl {
            config,
            store,
            inventory,
            driver,
            transport,
            manager,
            _dir: dir,
        }
    }
}
