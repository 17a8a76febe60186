//! Core deployment orchestration logic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::allocator::ResourceAllocator;
use crate::config::{ControlConfig, DefaultsConfig, LimitsConfig, PipelineConfig};
use crate::credentials::ManagedKey;
use crate::descriptor::{self, DescriptorSettings, Workspace};
use crate::error::{ControlError, ControlResult};
use crate::inventory::{PlatformInventory, PlatformResource};
use crate::logs::{DeploymentLog, DeploymentLogs};
use crate::provisioner::{ApplyRequest, ProvisionResult, ProvisioningDriver};
use crate::remote::RemoteExecutor;
use crate::state::{DeploymentStatus, Deploying, Pending, Provisioning, Stage};
use crate::store::{DeploymentFilter, DeploymentStore};
use crate::types::{
    DeploymentData, DeploymentId, DeploymentRecord, DeploymentRequest, DeploymentStats,
    DeploymentView, Framework, ResourceSpec, StatusPatch,
};
use crate::validation::validate_request;

/// Repository recorded for deployments imported from the platform.
pub const IMPORTED_REPOSITORY: &str = "imported";

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// The external systems a manager drives.
pub struct Collaborators {
    /// Deployment records.
    pub store: Arc<dyn DeploymentStore>,
    /// Platform view of existing guests.
    pub inventory: Arc<dyn PlatformInventory>,
    /// Infrastructure tool driver.
    pub driver: Arc<dyn ProvisioningDriver>,
    /// Remote setup.
    pub executor: RemoteExecutor,
    /// Key pair injected into guests.
    pub key: ManagedKey,
}

/// Outcome of a platform sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Platform objects imported as new records.
    pub imported: usize,
    /// Platform objects already tracked or not importable.
    pub skipped: usize,
}

/// Pipeline bookkeeping for one deployment.
#[derive(Debug)]
struct InFlight {
    cancel: CancellationToken,
    delete_requested: bool,
}

struct Inner {
    store: Arc<dyn DeploymentStore>,
    inventory: Arc<dyn PlatformInventory>,
    allocator: ResourceAllocator,
    driver: Arc<dyn ProvisioningDriver>,
    executor: RemoteExecutor,
    key: ManagedKey,
    logs: DeploymentLogs,
    descriptor: DescriptorSettings,
    workspace_root: PathBuf,
    limits: LimitsConfig,
    defaults: DefaultsConfig,
    pipeline: PipelineConfig,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<DeploymentId, InFlight>>,
    shutdown: CancellationToken,
}

/// Orchestrates deployment lifecycle operations.
///
/// Each created deployment runs its pipeline as a background task. Cloning
/// the manager is cheap and every clone shares the same pipelines.
#[derive(Clone)]
pub struct DeploymentManager {
    inner: Arc<Inner>,
}

impl DeploymentManager {
    /// Create a new deployment manager.
    pub fn new(config: &ControlConfig, collaborators: Collaborators) -> ControlResult<Self> {
        let Collaborators {
            store,
            inventory,
            driver,
            executor,
            key,
        } = collaborators;

        let allocator = ResourceAllocator::new(
            Arc::clone(&store),
            Arc::clone(&inventory),
            config.allocator.clone(),
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                inventory,
                allocator,
                driver,
                executor,
                key,
                logs: DeploymentLogs::new(config.logs.dir.clone()),
                descriptor: DescriptorSettings::from_config(config),
                workspace_root: config.terraform.workspace_root.clone(),
                limits: config.limits.clone(),
                defaults: config.defaults.clone(),
                pipeline: config.pipeline.clone(),
                permits: Arc::new(Semaphore::new(config.pipeline.max_concurrent.max(1))),
                in_flight: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Validate and record a deployment, then start its pipeline.
    ///
    /// Returns as soon as the record exists in `pending`.
    pub async fn create(&self, request: DeploymentRequest) -> ControlResult<DeploymentId> {
        let resources = validate_request(&request, &self.inner.limits, &self.inner.defaults)?;
        let record = DeploymentRecord::new(DeploymentData::new(request, resources));
        let deployment_id = record.data.id.clone();

        self.inner.store.insert(&record).await?;

        info!(
            deployment_id = %deployment_id,
            name = %record.data.name,
            kind = %record.data.kind,
            framework = %record.data.framework,
            "deployment created"
        );

        let cancel = self.inner.shutdown.child_token();
        self.inner.register(&deployment_id, cancel.clone())?;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_pipeline(record, cancel).await;
        });

        Ok(deployment_id)
    }

    /// Get a deployment.
    pub async fn get(&self, id: &DeploymentId) -> ControlResult<DeploymentView> {
        self.inner.record(id).await.map(DeploymentView::from)
    }

    /// List deployments, newest first.
    pub async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentView>> {
        let records = self.inner.store.list(filter).await?;
        Ok(records.into_iter().map(DeploymentView::from).collect())
    }

    /// Delete a deployment.
    ///
    /// A deployment whose pipeline or teardown is still running is flagged;
    /// the pipeline finishes its current stage and then tears the deployment
    /// down. Any other deployment is claimed, destroyed and marked deleted
    /// before this returns, whether or not the destroy succeeds.
    #[instrument(skip(self), fields(deployment_id = %id))]
    pub async fn delete(&self, id: &DeploymentId) -> ControlResult<()> {
        if self.inner.claim_for_delete(id)? {
            info!("delete requested for in-flight deployment");
            self.inner
                .logs
                .sink(id)
                .append("delete", "delete requested, waiting for the current work")
                .await;
            return Ok(());
        }

        let result = self.inner.delete_settled(id).await;
        self.inner.forget(id);
        result
    }

    /// Stop the application of a running deployment.
    #[instrument(skip(self), fields(deployment_id = %id))]
    pub async fn stop(&self, id: &DeploymentId) -> ControlResult<DeploymentView> {
        let record = self.inner.record(id).await?;
        if record.status != DeploymentStatus::Running {
            return Err(ControlError::InvalidStateTransition {
                from: record.status.as_str(),
                to: DeploymentStatus::Stopped.as_str(),
            });
        }

        let address = record.data.address.clone().ok_or_else(|| {
            ControlError::internal(format!("running deployment {id} has no address"))
        })?;

        let log = self.inner.logs.sink(id);
        self.inner
            .executor
            .stop(&address, record.data.framework, &log)
            .await?;

        let record = self
            .inner
            .store
            .transition(
                id,
                DeploymentStatus::Running,
                DeploymentStatus::Stopped,
                StatusPatch::default(),
            )
            .await?;
        info!("deployment stopped");
        Ok(record.into())
    }

    /// Full log text of a deployment.
    pub async fn logs(&self, id: &DeploymentId) -> ControlResult<String> {
        self.inner.record(id).await?;
        self.inner.logs.read(id).await
    }

    /// Counts per status over every record.
    pub async fn stats(&self) -> ControlResult<DeploymentStats> {
        let records = self
            .inner
            .store
            .list(&DeploymentFilter::new().including_deleted())
            .await?;
        Ok(DeploymentStats::from_records(&records))
    }

    /// Guests that exist on the platform.
    pub async fn platform_resources(&self) -> ControlResult<Vec<PlatformResource>> {
        self.inner.inventory.list_resources().await
    }

    /// Import platform guests that no live deployment tracks.
    #[instrument(skip(self))]
    pub async fn sync_platform(&self) -> ControlResult<SyncReport> {
        let resources = self.inner.inventory.list_resources().await?;
        let tracked = self.inner.store.used_resource_ids().await?;
        let mut report = SyncReport::default();

        for resource in resources {
            if tracked.contains(&resource.id) {
                report.skipped += 1;
                continue;
            }

            let record = self.inner.imported_record(&resource).await;
            match self.inner.store.insert(&record).await {
                Ok(()) => {
                    info!(
                        resource_id = resource.id,
                        deployment_id = %record.data.id,
                        "imported platform resource"
                    );
                    report.imported += 1;
                }
                Err(e) => {
                    warn!(resource_id = resource.id, error = %e, "could not import platform resource");
                    report.skipped += 1;
                }
            }
        }

        info!(imported = report.imported, skipped = report.skipped, "platform sync finished");
        Ok(report)
    }

    /// Whether a pipeline or teardown still holds the deployment.
    #[must_use]
    pub fn is_in_flight(&self, id: &DeploymentId) -> bool {
        self.inner
            .in_flight
            .lock()
            .map(|map| map.contains_key(id))
            .unwrap_or(false)
    }

    /// Cancel every pending wait. Pipelines leave their records in the last
    /// committed status.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

/// Where a pipeline stopped.
type PipelineResult = Result<DeploymentStatus, (DeploymentStatus, ControlError)>;

impl Inner {
    async fn record(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))
    }

    fn register(&self, id: &DeploymentId, cancel: CancellationToken) -> ControlResult<()> {
        let mut map = self
            .in_flight
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        map.insert(
            id.clone(),
            InFlight {
                cancel,
                delete_requested: false,
            },
        );
        Ok(())
    }

    /// Flag the deployment for deletion. Returns true when a pipeline or
    /// teardown already holds it; otherwise the caller now holds it and must
    /// `forget` it when done.
    fn claim_for_delete(&self, id: &DeploymentId) -> ControlResult<bool> {
        let mut map = self
            .in_flight
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        if let Some(entry) = map.get_mut(id) {
            entry.delete_requested = true;
            entry.cancel.cancel();
            return Ok(true);
        }

        map.insert(
            id.clone(),
            InFlight {
                cancel: CancellationToken::new(),
                delete_requested: true,
            },
        );
        Ok(false)
    }

    fn delete_requested(&self, id: &DeploymentId) -> bool {
        self.in_flight
            .lock()
            .ok()
            .and_then(|map| map.get(id).map(|entry| entry.delete_requested))
            .unwrap_or(false)
    }

    /// Drop the pipeline's bookkeeping unless a delete arrived. A flagged
    /// entry stays in place until the teardown finishes.
    fn release(&self, id: &DeploymentId) -> bool {
        let Ok(mut map) = self.in_flight.lock() else {
            return false;
        };
        if map.get(id).is_some_and(|entry| entry.delete_requested) {
            return true;
        }
        map.remove(id);
        false
    }

    fn forget(&self, id: &DeploymentId) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.remove(id);
        }
    }

    /// Tear down a deployment held by the caller, from its stored status.
    async fn delete_settled(&self, id: &DeploymentId) -> ControlResult<()> {
        let record = self.record(id).await?;
        if record.status == DeploymentStatus::Deleted {
            return Err(ControlError::InvalidStateTransition {
                from: DeploymentStatus::Deleted.as_str(),
                to: DeploymentStatus::Deleted.as_str(),
            });
        }

        self.teardown(id, record.status).await
    }

    #[instrument(skip_all, fields(deployment_id = %record.data.id))]
    async fn run_pipeline(self: Arc<Self>, record: DeploymentRecord, cancel: CancellationToken) {
        let id = record.data.id.clone();
        let log = self.logs.sink(&id);

        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            () = cancel.cancelled() => None,
        };

        let outcome = match permit {
            Some(_permit) => self.execute(record, &log, &cancel).await,
            None => Ok(DeploymentStatus::Pending),
        };

        if self.delete_requested(&id) {
            match &outcome {
                Ok(status) => info!(%status, "stage ended, delete requested"),
                Err((status, e)) => info!(%status, error = %e, "stage ended by delete request"),
            }
        } else {
            match outcome {
                Ok(DeploymentStatus::Running) => {}
                Ok(status) => warn!(%status, "pipeline interrupted"),
                Err((status, ControlError::Cancelled(reason))) => {
                    warn!(%status, %reason, "pipeline cancelled");
                }
                Err((status, e)) => self.fail(&id, status, &e, &log).await,
            }
        }

        // A delete may also land while a failure is being recorded
        if self.release(&id) {
            info!("tearing down after delete request");
            if let Err(e) = self.delete_settled(&id).await {
                error!(error = %e, "teardown after delete request failed");
            }
            self.forget(&id);
        }
    }

    async fn execute(
        &self,
        record: DeploymentRecord,
        log: &DeploymentLog,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let pending =
            Stage::<Pending>::begin(record).map_err(|e| (DeploymentStatus::Pending, e))?;
        if self.delete_requested(pending.id()) {
            return Ok(DeploymentStatus::Pending);
        }

        let (provisioning, patch) = pending.start_provisioning();
        self.commit(provisioning.id(), DeploymentStatus::Pending, provisioning.status(), patch)
            .await
            .map_err(|e| (DeploymentStatus::Pending, e))?;
        log.append("pipeline", "provisioning started").await;

        let at = |e: ControlError| (DeploymentStatus::Provisioning, e);
        let result = self.provision(&provisioning, log, cancel).await.map_err(at)?;

        let (deploying, patch) = provisioning.provisioned(result.address, result.platform_id);
        self.commit(
            deploying.id(),
            DeploymentStatus::Provisioning,
            deploying.status(),
            patch,
        )
        .await
        .map_err(at)?;
        log.append(
            "pipeline",
            &format!(
                "provisioned {} {} at {}",
                deploying.data().kind,
                result.platform_id,
                deploying.address()
            ),
        )
        .await;

        if self.delete_requested(deploying.id()) {
            return Ok(DeploymentStatus::Deploying);
        }

        let at = |e: ControlError| (DeploymentStatus::Deploying, e);
        self.configure(&deploying, log, cancel).await.map_err(at)?;

        let (running, patch) = deploying.configured();
        self.commit(running.id(), DeploymentStatus::Deploying, running.status(), patch)
            .await
            .map_err(at)?;
        log.append("pipeline", "application running").await;

        info!(deployment_id = %running.id(), "deployment running");
        Ok(DeploymentStatus::Running)
    }

    async fn commit(
        &self,
        id: &DeploymentId,
        from: DeploymentStatus,
        to: DeploymentStatus,
        patch: StatusPatch,
    ) -> ControlResult<()> {
        self.store.transition(id, from, to, patch).await?;
        debug!(deployment_id = %id, %from, %to, "status committed");
        Ok(())
    }

    /// Allocate, render and apply.
    async fn provision(
        &self,
        stage: &Stage<Provisioning>,
        log: &DeploymentLog,
        cancel: &CancellationToken,
    ) -> ControlResult<ProvisionResult> {
        let data = stage.data();

        let resource_id = self.allocator.allocate(&data.id).await.map_err(|e| match e {
            ControlError::Inventory(msg) => {
                ControlError::provisioning(format!("resource allocation failed: {msg}"))
            }
            other => other,
        })?;
        log.append("allocate", &format!("resource id {resource_id}"))
            .await;

        let rendered =
            descriptor::render(&self.descriptor, data, resource_id, self.key.public_key())?;
        let workspace = Workspace::for_deployment(&self.workspace_root, &data.id);
        workspace.write_descriptor(&rendered).await?;

        let request = ApplyRequest {
            deployment_id: data.id.clone(),
            kind: data.kind,
            resource_id,
            workspace,
            log: log.clone(),
        };

        let attempts = self.pipeline.apply_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.driver.apply(&request, cancel).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < attempts && retryable(&e) => {
                    warn!(attempt, error = %e, "apply failed, retrying");
                    log.append("apply", &format!("attempt {attempt} failed: {e}"))
                        .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn configure(
        &self,
        stage: &Stage<Deploying>,
        log: &DeploymentLog,
        cancel: &CancellationToken,
    ) -> ControlResult<()> {
        let attempts = self.pipeline.configure_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .executor
                .configure(stage.address(), stage.data(), log, cancel)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && retryable(&e) => {
                    warn!(attempt, error = %e, "configure failed, retrying");
                    log.append("configure", &format!("attempt {attempt} failed: {e}"))
                        .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        cause: &ControlError,
        log: &DeploymentLog,
    ) {
        error!(deployment_id = %id, %status, error = %cause, "deployment failed");
        log.append("pipeline", &format!("failed: {cause}")).await;

        if !status.can_transition_to(DeploymentStatus::Failed) {
            return;
        }

        if let Err(e) = self
            .store
            .transition(
                id,
                status,
                DeploymentStatus::Failed,
                StatusPatch::error(cause.failure_message()),
            )
            .await
        {
            error!(deployment_id = %id, error = %e, "could not record failure");
        }
    }

    /// Destroy the infrastructure and mark the record deleted. A destroy
    /// failure is logged and does not stop the record from being deleted.
    async fn teardown(&self, id: &DeploymentId, status: DeploymentStatus) -> ControlResult<()> {
        let log = self.logs.sink(id);
        let workspace = Workspace::for_deployment(&self.workspace_root, id);

        if let Err(e) = self.driver.destroy(&workspace, &log).await {
            warn!(deployment_id = %id, error = %e, "destroy failed, infrastructure may need manual cleanup");
            log.append("destroy", &format!("destroy failed: {e}")).await;
        }

        self.store
            .transition(
                id,
                status,
                DeploymentStatus::Deleted,
                StatusPatch {
                    deleted_at: Some(chrono::Utc::now()),
                    ..StatusPatch::default()
                },
            )
            .await?;

        log.append("pipeline", "deployment deleted").await;
        info!(deployment_id = %id, "deployment deleted");
        Ok(())
    }

    async fn imported_record(&self, resource: &PlatformResource) -> DeploymentRecord {
        let defaults = self.defaults.for_kind(resource.kind);
        let resources = ResourceSpec {
            cores: resource.cores.unwrap_or(defaults.cores),
            memory_mb: resource
                .memory_bytes
                .and_then(|b| u32::try_from(b / MIB).ok())
                .unwrap_or(defaults.memory_mb),
            disk_gb: resource
                .disk_bytes
                .and_then(|b| u32::try_from(b / GIB).ok())
                .unwrap_or(defaults.disk_gb),
        };

        let mut data = DeploymentData::new(
            DeploymentRequest {
                name: resource.name.clone(),
                kind: resource.kind,
                framework: Framework::Unknown,
                repo_url: IMPORTED_REPOSITORY.to_owned(),
                cores: None,
                memory_mb: None,
                disk_gb: None,
                env_vars: Default::default(),
            },
            resources,
        );
        data.resource_id = Some(resource.id);

        let status = if resource.is_running() {
            data.address = self
                .inventory
                .resource_address(resource.id, resource.kind)
                .await
                .ok()
                .flatten();
            DeploymentStatus::Running
        } else {
            DeploymentStatus::Stopped
        };

        DeploymentRecord { data, status }
    }
}

/// Cancellation and check-and-set conflicts are never retried.
const fn retryable(error: &ControlError) -> bool {
    !matches!(
        error,
        ControlError::Cancelled(_)
            | ControlError::StaleState { .. }
            | ControlError::Template(_)
            | ControlError::AllocationExhausted { .. }
    )
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager").finish_non_exhaustive()
    }
}
