use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stratus_core::block::{BlockDevice, BlockState, StorageAttachment};
use stratus_core::error::{Error, Result};
use stratus_core::instance::{Instance, InstanceState};
use stratus_core::naming;
use stratus_core::payloads::{
    CnciEndpoint, InstanceMetadata, Networking, NodeStatsReport, StartFailureReason, StartPayload,
    StorageReference,
};
use stratus_core::tenant::Tenant;
use stratus_core::time::utc_now;
use stratus_core::workload::{ResourceKind, ResourceRequest, Workload};

use crate::cnci::{CnciInfo, CnciManager, CnciOps};
use crate::config::ControllerConfig;
use crate::datastore::{DataStore, EventLevel, NodeStatsRow};
use crate::extip::{MappedIp, PoolManager};
use crate::ledger::QuotaLedger;
use crate::netalloc::{AllocatedIp, NetworkAllocator};
use crate::stats::{SampleLevels, UsageCollector};
use crate::transport::Transport;

/// A request to launch one or more instances of a workload.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub tenant_id: String,
    pub workload_id: Uuid,
    pub count: usize,
    pub name: Option<String>,
    /// Pin placement to one of the tenant's existing subnets.
    pub subnet: Option<String>,
    pub trace_label: Option<String>,
    /// Existing volumes to attach at boot. Only valid with count == 1.
    pub volumes: Vec<Uuid>,
}

impl StartRequest {
    pub fn new(tenant_id: &str, workload_id: Uuid, count: usize) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            workload_id,
            count,
            name: None,
            subnet: None,
            trace_label: None,
            volumes: Vec::new(),
        }
    }
}

/// Outcome of a bulk launch: every instance that was created, plus the
/// first error hit. Fan-out continues past failures; each failed slot runs
/// its own cleanup.
#[derive(Debug)]
pub struct StartResult {
    pub instances: Vec<Instance>,
    pub error: Option<Error>,
}

type CreationSignal = watch::Receiver<Option<std::result::Result<(), String>>>;

/// Admission, launch, reconciliation, and teardown of instances, and the
/// glue between the quota ledger, the network allocator, the CNCI managers,
/// the datastore, and the transport.
pub struct Coordinator {
    store: Arc<DataStore>,
    ledger: Arc<QuotaLedger>,
    netalloc: Arc<NetworkAllocator>,
    pools: Arc<PoolManager>,
    collector: Arc<UsageCollector>,
    transport: Arc<Transport>,
    cnci_managers: Mutex<HashMap<String, CnciManager>>,
    /// In-flight tenant provisioning, memoized so N concurrent confirms of
    /// an unknown tenant run exactly one creation.
    tenant_creations: Mutex<HashMap<String, CreationSignal>>,
    cnci_event_timeout: Duration,
    cnci_teardown_delay: Duration,
    sync_delete_timeout: Duration,
    launch_parallelism: usize,
    self_ref: Weak<Coordinator>,
}

/// Adapter handing the coordinator to CNCI managers without an Arc cycle.
struct ManagerOps {
    coordinator: Weak<Coordinator>,
}

impl ManagerOps {
    fn get(&self) -> Result<Arc<Coordinator>> {
        self.coordinator
            .upgrade()
            .ok_or_else(|| Error::Transport("controller shutting down".to_string()))
    }
}

#[async_trait]
impl CnciOps for ManagerOps {
    async fn launch_cnci(&self, tenant_id: &str, subnet: &str, instance_id: Uuid) -> Result<()> {
        self.get()?
            .launch_cnci_instance(tenant_id, subnet, instance_id)
            .await
    }

    async fn restart_cnci(&self, tenant_id: &str, instance_id: Uuid) -> Result<()> {
        self.get()?
            .restart_cnci_instance(tenant_id, instance_id)
            .await
    }

    async fn remove_cnci(&self, tenant_id: &str, instance_id: Uuid) -> Result<()> {
        self.get()?
            .remove_cnci_instance(tenant_id, instance_id)
            .await
    }

    async fn send_refresh(&self, cnci_id: Uuid, endpoints: Vec<CnciEndpoint>) -> Result<()> {
        self.get()?.transport.refresh_cnci(cnci_id, endpoints).await
    }
}

impl Coordinator {
    pub fn new(
        store: Arc<DataStore>,
        ledger: Arc<QuotaLedger>,
        netalloc: Arc<NetworkAllocator>,
        pools: Arc<PoolManager>,
        collector: Arc<UsageCollector>,
        transport: Arc<Transport>,
        config: &ControllerConfig,
    ) -> Arc<Self> {
        let launch_parallelism = config.launch_parallelism();
        Arc::new_cyclic(|weak| Self {
            store,
            ledger,
            netalloc,
            pools,
            collector,
            transport,
            cnci_managers: Mutex::new(HashMap::new()),
            tenant_creations: Mutex::new(HashMap::new()),
            cnci_event_timeout: Duration::from_secs(config.cnci.event_timeout_secs),
            cnci_teardown_delay: Duration::from_secs(config.cnci.teardown_delay_secs),
            sync_delete_timeout: Duration::from_secs(config.controller.sync_delete_timeout_secs),
            launch_parallelism,
            self_ref: weak.clone(),
        })
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn usage(&self) -> &Arc<UsageCollector> {
        &self.collector
    }

    /// The per-tenant CNCI manager, created on first use.
    pub async fn cnci_manager(&self, tenant_id: &str) -> CnciManager {
        let mut managers = self.cnci_managers.lock().await;
        managers
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                CnciManager::new(
                    tenant_id,
                    Arc::new(ManagerOps {
                        coordinator: self.self_ref.clone(),
                    }),
                    self.cnci_event_timeout,
                    self.cnci_teardown_delay,
                )
            })
            .clone()
    }

    /// Cancel every pending CNCI teardown timer.
    pub async fn shutdown(&self) {
        let managers: Vec<CnciManager> =
            self.cnci_managers.lock().await.values().cloned().collect();
        for manager in managers {
            manager.shutdown().await;
        }
    }

    // ========================================================================
    // Tenant confirmation
    // ========================================================================

    /// Ensure the tenant exists, creating it with default config on first
    /// use. Concurrent confirms of the same unknown tenant serialize on a
    /// single provisioning run; the rest await its outcome.
    pub async fn confirm_tenant(&self, tenant_id: &str) -> Result<Tenant> {
        if let Some(tenant) = self.store.get_tenant(tenant_id).await {
            return Ok(tenant);
        }
        naming::validate_id(tenant_id, "Tenant")?;

        enum Role {
            Creator(watch::Sender<Option<std::result::Result<(), String>>>),
            Waiter(CreationSignal),
        }

        let role = {
            let mut creations = self.tenant_creations.lock().await;
            if let Some(rx) = creations.get(tenant_id) {
                Role::Waiter(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                creations.insert(tenant_id.to_string(), rx);
                Role::Creator(tx)
            }
        };

        match role {
            Role::Creator(tx) => {
                let result = self.provision_tenant(tenant_id).await;
                // Dropping the entry lets a retry attempt again on failure;
                // on success the store lookup satisfies future confirms.
                self.tenant_creations.lock().await.remove(tenant_id);
                let _ = tx.send(Some(
                    result.as_ref().map(|_| ()).map_err(|e| e.to_string()),
                ));
                result
            }
            Role::Waiter(mut rx) => {
                loop {
                    let outcome = rx.borrow().clone();
                    if let Some(outcome) = outcome {
                        outcome.map_err(|e| {
                            Error::InvalidInput(format!("tenant creation failed: {}", e))
                        })?;
                        break;
                    }
                    rx.changed().await.map_err(|_| {
                        Error::InvalidInput("tenant creation abandoned".to_string())
                    })?;
                }
                self.store
                    .get_tenant(tenant_id)
                    .await
                    .ok_or_else(|| Error::NotFound {
                        kind: "tenant",
                        id: tenant_id.to_string(),
                    })
            }
        }
    }

    async fn provision_tenant(&self, tenant_id: &str) -> Result<Tenant> {
        let tenant = Tenant::new(tenant_id, tenant_id);
        self.store.add_tenant(tenant.clone()).await?;
        info!(tenant = %tenant_id, "Tenant created with default config");
        Ok(tenant)
    }

    // ========================================================================
    // Launch
    // ========================================================================

    /// Launch `count` instances of a workload, in parallel bounded by the
    /// host CPU count. Returns every created instance and the first error;
    /// each failed slot is fully cleaned (IP, quota, storage, record).
    pub async fn start_workload(self: &Arc<Self>, request: StartRequest) -> StartResult {
        let fail = |error: Error| StartResult {
            instances: Vec::new(),
            error: Some(error),
        };

        if request.count == 0 {
            return fail(Error::InvalidInput("count must be at least 1".to_string()));
        }
        if !request.volumes.is_empty() && request.count != 1 {
            return fail(Error::InvalidInput(
                "attached volumes require count == 1".to_string(),
            ));
        }

        let tenant = match self.confirm_tenant(&request.tenant_id).await {
            Ok(t) => t,
            Err(e) => return fail(e),
        };
        let workload = match self.store.get_workload(request.workload_id).await {
            Ok(w) => w,
            Err(e) => return fail(e),
        };
        if workload.is_cnci {
            return fail(Error::InvalidInput(
                "the concentrator workload cannot be launched directly".to_string(),
            ));
        }
        if let Some(scope) = &workload.tenant_id {
            if scope != &tenant.id {
                return fail(Error::NotFound {
                    kind: "workload",
                    id: request.workload_id.to_string(),
                });
            }
        }

        // One batch of IPs up front, so a mid-batch allocator failure is a
        // whole-call failure instead of a half-built fleet.
        let ips = match &request.subnet {
            Some(subnet) => {
                self.netalloc
                    .allocate_in_subnet(&tenant.id, subnet, request.count)
                    .await
            }
            None => {
                self.netalloc
                    .allocate_pool(&tenant.id, tenant.host_bits(), request.count)
                    .await
            }
        };
        let ips = match ips {
            Ok(ips) => ips,
            Err(e) => return fail(e),
        };

        let semaphore = Arc::new(Semaphore::new(self.launch_parallelism));
        let mut set = JoinSet::new();
        for (index, ip) in ips.into_iter().enumerate() {
            let this = Arc::clone(self);
            let tenant = tenant.clone();
            let workload = workload.clone();
            let semaphore = Arc::clone(&semaphore);
            let name = request.name.as_ref().map(|n| {
                if request.count > 1 {
                    format!("{}-{}", n, index)
                } else {
                    n.clone()
                }
            });
            let trace_label = request.trace_label.clone();
            let volumes = request.volumes.clone();

            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let outcome = this
                    .launch_one(&tenant, &workload, ip, name, trace_label, volumes)
                    .await;
                (index, outcome)
            });
        }

        let mut slots: Vec<(usize, Result<Instance>)> = Vec::with_capacity(request.count);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(slot) => slots.push(slot),
                Err(e) => error!(error = %e, "Launch task panicked"),
            }
        }
        slots.sort_by_key(|(index, _)| *index);

        let mut result = StartResult {
            instances: Vec::new(),
            error: None,
        };
        for (_, outcome) in slots {
            match outcome {
                Ok(instance) => result.instances.push(instance),
                Err(e) => {
                    if result.error.is_none() {
                        result.error = Some(e);
                    }
                }
            }
        }
        result
    }

    /// One instance end to end: name check, quota, CNCI, storage, record,
    /// payload, emit. Any failure unwinds everything this slot acquired.
    async fn launch_one(
        self: Arc<Self>,
        tenant: &Tenant,
        workload: &Workload,
        ip: AllocatedIp,
        name: Option<String>,
        trace_label: Option<String>,
        volumes: Vec<Uuid>,
    ) -> Result<Instance> {
        let demands = workload.resource_demands();
        let instance_id = Uuid::new_v4();

        let mut quota_held = false;
        let mut created_blocks: Vec<Uuid> = Vec::new();
        let mut reverted_blocks: Vec<Uuid> = Vec::new();
        let mut attachments: Vec<Uuid> = Vec::new();

        let outcome = async {
            if let Some(n) = &name {
                if self.store.instance_name_in_use(&tenant.id, n).await {
                    return Err(Error::NameInUse(n.clone()));
                }
            }

            self.ledger.consume(&tenant.id, &demands).await?;
            quota_held = true;

            let manager = self.cnci_manager(&tenant.id).await;
            let cnci = manager.wait_for_active(&ip.subnet).await?;

            let storage = self
                .prepare_storage(
                    &tenant.id,
                    workload,
                    instance_id,
                    &volumes,
                    &mut created_blocks,
                    &mut reverted_blocks,
                    &mut attachments,
                )
                .await?;

            let instance = Instance {
                id: instance_id,
                tenant_id: tenant.id.clone(),
                workload_id: workload.id,
                state: InstanceState::Pending,
                node_id: None,
                mac: naming::mac_for_ip(ip.ip),
                private_ip: Some(ip.ip.to_string()),
                subnet: Some(ip.subnet.clone()),
                vnic_id: Uuid::new_v4(),
                is_cnci: false,
                name,
                created_at: utc_now(),
                ssh_ip: None,
                ssh_port: None,
            };
            self.store.add_instance(instance.clone()).await?;

            let payload = compose_payload(workload, &instance, Some(&cnci), storage);
            match &trace_label {
                Some(label) => self.transport.start_traced(payload, label).await?,
                None => self.transport.start(payload).await?,
            }

            info!(
                tenant = %tenant.id,
                instance = %instance_id,
                ip = %ip.ip,
                "Instance launch emitted"
            );
            Ok(instance)
        }
        .await;

        if let Err(e) = &outcome {
            warn!(
                tenant = %tenant.id,
                instance = %instance_id,
                error = %e,
                "Launch failed, cleaning up"
            );
            self.store
                .log_event(
                    &tenant.id,
                    EventLevel::Error,
                    format!("launch of instance {} failed: {}", instance_id, e),
                )
                .await;
            let _ = self.store.remove_instance(instance_id).await;
            for id in attachments {
                let _ = self.store.remove_attachment(id).await;
            }
            for id in created_blocks {
                let _ = self.store.remove_block(id).await;
            }
            for id in reverted_blocks {
                let _ = self
                    .store
                    .update_block(id, |b| {
                        b.state = BlockState::Available;
                        Ok(())
                    })
                    .await;
            }
            if quota_held {
                self.ledger.release(&tenant.id, &demands).await;
            }
            let _ = self.netalloc.release(&tenant.id, ip.ip).await;
        }

        outcome
    }

    /// Create the workload's storage and bind requested volumes, recording
    /// everything acquired for the caller's rollback.
    #[allow(clippy::too_many_arguments)]
    async fn prepare_storage(
        &self,
        tenant_id: &str,
        workload: &Workload,
        instance_id: Uuid,
        volumes: &[Uuid],
        created_blocks: &mut Vec<Uuid>,
        reverted_blocks: &mut Vec<Uuid>,
        attachments: &mut Vec<Uuid>,
    ) -> Result<Vec<StorageReference>> {
        let mut refs = Vec::new();

        for spec in &workload.storage {
            let block_id = match spec.existing {
                Some(existing) => {
                    self.store
                        .update_block(existing, |b| {
                            if b.state != BlockState::Available {
                                return Err(Error::VolumeBusy {
                                    id: existing.to_string(),
                                    state: b.state.to_string(),
                                    op: "attach",
                                });
                            }
                            b.state = BlockState::InUse;
                            Ok(())
                        })
                        .await?;
                    reverted_blocks.push(existing);
                    existing
                }
                None => {
                    let block = BlockDevice {
                        id: Uuid::new_v4(),
                        tenant_id: tenant_id.to_string(),
                        size_gb: spec.size_gb,
                        state: BlockState::InUse,
                        internal: false,
                        created_at: utc_now(),
                        name: None,
                    };
                    let id = block.id;
                    self.store.add_block(block).await?;
                    created_blocks.push(id);
                    id
                }
            };
            let attachment =
                StorageAttachment::new(instance_id, block_id, spec.bootable, spec.ephemeral);
            attachments.push(attachment.id);
            self.store.add_attachment(attachment).await?;
            refs.push(StorageReference {
                block_id,
                bootable: spec.bootable,
                ephemeral: spec.ephemeral,
            });
        }

        for volume_id in volumes {
            self.store
                .update_block(*volume_id, |b| {
                    if b.state != BlockState::Available {
                        return Err(Error::VolumeBusy {
                            id: volume_id.to_string(),
                            state: b.state.to_string(),
                            op: "attach",
                        });
                    }
                    b.state = BlockState::InUse;
                    Ok(())
                })
                .await?;
            reverted_blocks.push(*volume_id);
            let attachment = StorageAttachment::new(instance_id, *volume_id, false, false);
            attachments.push(attachment.id);
            self.store.add_attachment(attachment).await?;
            refs.push(StorageReference {
                block_id: *volume_id,
                bootable: false,
                ephemeral: false,
            });
        }

        Ok(refs)
    }

    // ========================================================================
    // CNCI instance plumbing (called by the managers)
    // ========================================================================

    /// Launch the cluster CNCI workload for one tenant subnet. CNCIs bypass
    /// the quota ledger and the tenant IP pool.
    async fn launch_cnci_instance(
        &self,
        tenant_id: &str,
        subnet: &str,
        instance_id: Uuid,
    ) -> Result<()> {
        let workload = self.store.cnci_workload().await?;
        let instance = Instance {
            id: instance_id,
            tenant_id: tenant_id.to_string(),
            workload_id: workload.id,
            state: InstanceState::Pending,
            node_id: None,
            mac: naming::random_mac(),
            private_ip: None,
            subnet: Some(subnet.to_string()),
            vnic_id: Uuid::new_v4(),
            is_cnci: true,
            name: None,
            created_at: utc_now(),
            ssh_ip: None,
            ssh_port: None,
        };
        self.store.add_instance(instance.clone()).await?;
        let payload = compose_payload(&workload, &instance, None, Vec::new());
        self.transport.start(payload).await
    }

    async fn restart_cnci_instance(&self, _tenant_id: &str, instance_id: Uuid) -> Result<()> {
        let handle = self.store.get_instance(instance_id).await?;
        let instance = handle.snapshot().await;
        let workload = self.store.cnci_workload().await?;
        // The exited event already moved the record; a restart walks it
        // back to pending for the new boot.
        let _ = handle.transition(InstanceState::Pending).await;
        let payload = compose_payload(&workload, &instance, None, Vec::new());
        self.transport.restart(payload).await
    }

    async fn remove_cnci_instance(&self, tenant_id: &str, instance_id: Uuid) -> Result<()> {
        let handle = self.store.get_instance(instance_id).await?;
        let instance = handle.snapshot().await;
        match &instance.node_id {
            Some(node) => self.transport.delete(instance_id, node).await,
            None => {
                // Never scheduled: nothing to tell a worker, finish locally.
                let _ = handle.transition(InstanceState::Deleted).await;
                self.store.remove_instance(instance_id).await?;
                self.cnci_manager(tenant_id).await.cnci_removed(instance_id).await;
                Ok(())
            }
        }
    }

    // ========================================================================
    // Delete / stop / restart
    // ========================================================================

    /// Asynchronous delete. Instances holding a mapped external IP are
    /// refused, as are pending instances that have not yet landed on a
    /// node. Unassigned instances in other states are cleaned up locally.
    pub async fn delete_instance(&self, instance_id: Uuid) -> Result<()> {
        let handle = self.store.get_instance(instance_id).await?;
        let instance = handle.snapshot().await;
        if instance.is_cnci {
            return Err(Error::InvalidInput(
                "concentrator instances are managed internally".to_string(),
            ));
        }
        if self.pools.mapped_for_instance(instance_id).await.is_some() {
            return Err(Error::ExternalIpMapped(instance_id.to_string()));
        }

        match &instance.node_id {
            Some(node) => self.transport.delete(instance_id, node).await,
            None if instance.state == InstanceState::Pending => Err(Error::InvalidInput(
                "instance is not yet assigned to a node".to_string(),
            )),
            None => {
                self.release_instance_resources(&instance).await;
                let _ = handle.transition(InstanceState::Deleted).await;
                Ok(())
            }
        }
    }

    /// Delete and block until the instance reaches `deleted`. After the
    /// timeout the instance is declared `hung` and the call fails.
    pub async fn delete_instance_sync(&self, instance_id: Uuid) -> Result<()> {
        let handle = self.store.get_instance(instance_id).await?;
        let mut rx = handle.watch_state();
        self.delete_instance(instance_id).await?;

        let wait = async {
            loop {
                let state = *rx.borrow();
                match state {
                    InstanceState::Deleted => return Ok(()),
                    InstanceState::Hung => return Err(Error::Timeout("instance delete")),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    // Sender gone means the record was dropped post-delete.
                    return Ok(());
                }
            }
        };
        match tokio::time::timeout(self.sync_delete_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(instance = %instance_id, "Sync delete timed out, marking hung");
                let _ = handle.transition(InstanceState::Hung).await;
                Err(Error::Timeout("instance delete"))
            }
        }
    }

    /// Stop a running instance: transition to `stopping`, emit the stop.
    pub async fn stop_instance(&self, instance_id: Uuid) -> Result<()> {
        let handle = self.store.get_instance(instance_id).await?;
        let instance = handle.snapshot().await;
        if instance.is_cnci {
            return Err(Error::InvalidInput(
                "concentrator instances are managed internally".to_string(),
            ));
        }
        let node = instance.node_id.clone().ok_or_else(|| {
            Error::InvalidInput("instance is not assigned to a node".to_string())
        })?;
        handle.transition(InstanceState::Stopping).await?;
        self.transport.stop(instance_id, &node).await
    }

    /// Restart an exited instance with its original wiring. The subnet's
    /// CNCI must be active; this waits for it up to the event timeout.
    pub async fn restart_instance(&self, instance_id: Uuid) -> Result<()> {
        let handle = self.store.get_instance(instance_id).await?;
        let instance = handle.snapshot().await;
        if instance.state != InstanceState::Exited {
            return Err(Error::InvalidTransition {
                from: instance.state,
                to: InstanceState::Pending,
            });
        }
        let subnet = instance.subnet.clone().ok_or_else(|| {
            Error::InvalidInput("instance has no subnet".to_string())
        })?;
        let workload = self.store.get_workload(instance.workload_id).await?;

        let manager = self.cnci_manager(&instance.tenant_id).await;
        let cnci = manager.wait_for_active(&subnet).await?;

        handle.transition(InstanceState::Pending).await?;
        let storage = self
            .store
            .attachments_for_instance(instance_id)
            .await
            .into_iter()
            .map(|a| StorageReference {
                block_id: a.block_id,
                bootable: a.boot,
                ephemeral: a.ephemeral,
            })
            .collect();
        let payload = compose_payload(&workload, &instance, Some(&cnci), storage);
        self.transport.restart(payload).await
    }

    /// Release everything a dead instance held: storage, quota, IP, and
    /// the record itself. Arms the subnet teardown when it empties.
    ///
    /// Quota goes back for the instance slot, its defaults, and the
    /// ephemeral storage destroyed here; non-ephemeral volumes survive the
    /// instance and keep their quota until deleted themselves.
    async fn release_instance_resources(&self, instance: &Instance) {
        let mut returned: Vec<ResourceRequest> = Vec::new();
        if let Ok(workload) = self.store.get_workload(instance.workload_id).await {
            returned.push(ResourceRequest::new(ResourceKind::Instances, 1));
            returned.push(ResourceRequest::new(
                ResourceKind::Vcpus,
                workload.defaults.vcpus as u64,
            ));
            returned.push(ResourceRequest::new(
                ResourceKind::MemMb,
                workload.defaults.mem_mb,
            ));
            returned.push(ResourceRequest::new(
                ResourceKind::DiskGb,
                workload.defaults.disk_gb,
            ));
        }

        for attachment in self.store.attachments_for_instance(instance.id).await {
            let _ = self.store.remove_attachment(attachment.id).await;
            if attachment.ephemeral {
                if let Ok(block) = self.store.get_block(attachment.block_id).await {
                    returned.push(ResourceRequest::new(ResourceKind::Volumes, 1));
                    returned.push(ResourceRequest::new(ResourceKind::DiskGb, block.size_gb));
                }
                let _ = self.store.remove_block(attachment.block_id).await;
            } else {
                let _ = self
                    .store
                    .update_block(attachment.block_id, |b| {
                        b.state = BlockState::Available;
                        Ok(())
                    })
                    .await;
            }
        }

        if !instance.is_cnci {
            self.ledger.release(&instance.tenant_id, &returned).await;
            if let Some(ip) = instance.private_ip.as_deref().and_then(|s| s.parse::<Ipv4Addr>().ok())
            {
                let _ = self.netalloc.release(&instance.tenant_id, ip).await;
            }
            if let Some(subnet) = &instance.subnet {
                if self.subnet_population(&instance.tenant_id, subnet, instance.id).await == 0 {
                    self.cnci_manager(&instance.tenant_id)
                        .await
                        .schedule_remove_subnet(subnet)
                        .await;
                }
            }
        }

        let _ = self.store.remove_instance(instance.id).await;
        self.collector.forget_instance(instance.id).await;
    }

    /// Live (non-deleted) tenant instances on a subnet, excluding one id.
    async fn subnet_population(&self, tenant_id: &str, subnet: &str, exclude: Uuid) -> usize {
        self.store
            .list_instances(tenant_id, false)
            .await
            .into_iter()
            .filter(|i| {
                i.id != exclude
                    && i.subnet.as_deref() == Some(subnet)
                    && i.state != InstanceState::Deleted
            })
            .count()
    }

    // ========================================================================
    // Node maintenance
    // ========================================================================

    pub async fn evacuate_node(&self, node_id: &str) -> Result<()> {
        self.transport.evacuate(node_id).await
    }

    pub async fn restore_node(&self, node_id: &str) -> Result<()> {
        self.transport.restore(node_id).await
    }

    // ========================================================================
    // Volumes
    // ========================================================================

    /// Create a tenant block device under quota.
    pub async fn create_volume(
        &self,
        tenant_id: &str,
        size_gb: u64,
        name: Option<String>,
    ) -> Result<BlockDevice> {
        self.confirm_tenant(tenant_id).await?;
        let demands = [
            ResourceRequest::new(ResourceKind::Volumes, 1),
            ResourceRequest::new(ResourceKind::DiskGb, size_gb),
        ];
        self.ledger.consume(tenant_id, &demands).await?;

        let block = BlockDevice {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            size_gb,
            state: BlockState::Available,
            internal: false,
            created_at: utc_now(),
            name,
        };
        if let Err(e) = self.store.add_block(block.clone()).await {
            self.ledger.release(tenant_id, &demands).await;
            return Err(e);
        }
        Ok(block)
    }

    /// Delete an unattached block device and return its quota.
    pub async fn delete_volume(&self, volume_id: Uuid) -> Result<()> {
        let block = self.store.get_block(volume_id).await?;
        if block.state != BlockState::Available {
            return Err(Error::VolumeBusy {
                id: volume_id.to_string(),
                state: block.state.to_string(),
                op: "delete",
            });
        }
        self.store.remove_block(volume_id).await?;
        if !block.internal {
            self.ledger
                .release(
                    &block.tenant_id,
                    &[
                        ResourceRequest::new(ResourceKind::Volumes, 1),
                        ResourceRequest::new(ResourceKind::DiskGb, block.size_gb),
                    ],
                )
                .await;
        }
        Ok(())
    }

    /// Attach an available volume to a running instance.
    pub async fn attach_volume(&self, volume_id: Uuid, instance_id: Uuid) -> Result<()> {
        let handle = self.store.get_instance(instance_id).await?;
        let instance = handle.snapshot().await;
        let node = instance.node_id.clone().ok_or_else(|| {
            Error::InvalidInput("instance is not assigned to a node".to_string())
        })?;

        self.store
            .update_block(volume_id, |b| b.begin_attach())
            .await?;
        let attachment = StorageAttachment::new(instance_id, volume_id, false, false);
        let attachment_id = attachment.id;
        self.store.add_attachment(attachment).await?;

        if let Err(e) = self
            .transport
            .attach_volume(volume_id, instance_id, &node)
            .await
        {
            let _ = self.store.remove_attachment(attachment_id).await;
            let _ = self
                .store
                .update_block(volume_id, |b| {
                    b.state = BlockState::Available;
                    Ok(())
                })
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Detach an in-use volume. Only exited instances may detach.
    pub async fn detach_volume(&self, volume_id: Uuid) -> Result<()> {
        let attachment = self
            .store
            .attachment_for_block(volume_id)
            .await
            .ok_or_else(|| Error::InvalidInput("volume is not attached".to_string()))?;
        let handle = self.store.get_instance(attachment.instance_id).await?;
        let instance = handle.snapshot().await;
        let node = instance.node_id.clone().ok_or_else(|| {
            Error::InvalidInput("instance is not assigned to a node".to_string())
        })?;

        self.store
            .update_block(volume_id, |b| b.begin_detach(instance.state))
            .await?;
        self.transport
            .detach_volume(volume_id, attachment.instance_id, &node)
            .await
    }

    // ========================================================================
    // External IPs
    // ========================================================================

    /// Reserve a pool address for an instance and command its CNCI to
    /// assign it.
    pub async fn map_external_ip(&self, tenant_id: &str, instance_id: Uuid) -> Result<MappedIp> {
        let handle = self.store.get_instance(instance_id).await?;
        let instance = handle.snapshot().await;
        let private_ip = instance.private_ip.clone().ok_or_else(|| {
            Error::InvalidInput("instance has no private IP".to_string())
        })?;
        let subnet = instance.subnet.clone().ok_or_else(|| {
            Error::InvalidInput("instance has no subnet".to_string())
        })?;

        let mapping = self.pools.reserve(tenant_id, instance_id, &private_ip).await?;
        let quota = [ResourceRequest::new(ResourceKind::ExternalIps, 1)];
        if let Err(e) = self.ledger.consume(tenant_id, &quota).await {
            let _ = self.pools.release(mapping.public_ip).await;
            return Err(e);
        }

        let manager = self.cnci_manager(tenant_id).await;
        let cnci = match manager.get_subnet_cnci(&subnet).await {
            Some(c) => c,
            None => {
                let _ = self.pools.release(mapping.public_ip).await;
                self.ledger.release(tenant_id, &quota).await;
                return Err(Error::CnciUnavailable(subnet));
            }
        };

        if let Err(e) = self
            .transport
            .assign_public_ip(
                cnci.instance_id,
                tenant_id,
                instance_id,
                &mapping.public_ip.to_string(),
                &private_ip,
            )
            .await
        {
            let _ = self.pools.release(mapping.public_ip).await;
            self.ledger.release(tenant_id, &quota).await;
            return Err(e);
        }
        Ok(mapping)
    }

    /// Command the CNCI to release an instance's external IP. The pool
    /// reservation and quota are returned when the unassign event lands.
    pub async fn unmap_external_ip(&self, instance_id: Uuid) -> Result<()> {
        let mapping = self
            .pools
            .mapped_for_instance(instance_id)
            .await
            .ok_or_else(|| Error::NotFound {
                kind: "mapped IP",
                id: instance_id.to_string(),
            })?;
        let handle = self.store.get_instance(instance_id).await?;
        let instance = handle.snapshot().await;
        let subnet = instance.subnet.clone().ok_or_else(|| {
            Error::InvalidInput("instance has no subnet".to_string())
        })?;
        let manager = self.cnci_manager(&mapping.tenant_id).await;
        let cnci = manager
            .get_subnet_cnci(&subnet)
            .await
            .ok_or(Error::CnciUnavailable(subnet))?;

        self.transport
            .release_public_ip(
                cnci.instance_id,
                &mapping.tenant_id,
                instance_id,
                &mapping.public_ip.to_string(),
                &mapping.private_ip,
            )
            .await
    }

    // ========================================================================
    // Inbound event handlers
    // ========================================================================

    /// Periodic worker telemetry: refresh the instance cache, append the
    /// node series, reconcile volume attachments, and post usage deltas.
    pub async fn handle_stats(&self, report: NodeStatsReport) {
        self.store
            .append_node_stats(
                &report.node_id,
                NodeStatsRow {
                    timestamp: utc_now(),
                    mem_total_mb: report.mem_total_mb,
                    mem_available_mb: report.mem_available_mb,
                    load: report.load,
                    instance_count: report.instances.len(),
                },
            )
            .await;

        for sample in report.instances {
            let Ok(handle) = self.store.get_instance(sample.instance_id).await else {
                continue;
            };
            let instance = handle.snapshot().await;
            handle
                .update(|i| {
                    i.node_id = Some(report.node_id.clone());
                    i.ssh_ip = sample.ssh_ip.clone();
                    i.ssh_port = sample.ssh_port;
                })
                .await;

            if instance.state == InstanceState::Pending
                && sample.state == InstanceState::Running
            {
                let _ = handle.transition(InstanceState::Running).await;
            }

            for attachment in self.store.attachments_for_instance(instance.id).await {
                let Ok(block) = self.store.get_block(attachment.block_id).await else {
                    continue;
                };
                let seen = sample.attached_volumes.contains(&attachment.block_id);
                match block.state {
                    BlockState::Attaching if seen => {
                        let _ = self
                            .store
                            .update_block(attachment.block_id, |b| {
                                b.state = BlockState::InUse;
                                Ok(())
                            })
                            .await;
                    }
                    BlockState::Detaching if !seen => {
                        let _ = self
                            .store
                            .update_block(attachment.block_id, |b| {
                                b.state = BlockState::Available;
                                Ok(())
                            })
                            .await;
                        let _ = self.store.remove_attachment(attachment.id).await;
                    }
                    _ => {}
                }
            }

            if !instance.is_cnci {
                self.collector
                    .record_sample(
                        &instance.tenant_id,
                        instance.id,
                        SampleLevels {
                            vcpus: sample.vcpus as i64,
                            mem_mb: sample.mem_mb as i64,
                            disk_mb: sample.disk_mb as i64,
                        },
                    )
                    .await;
            }
        }
    }

    pub async fn handle_trace_report(&self, label: &str, frames: Vec<serde_json::Value>) {
        self.store.append_trace(label, frames).await;
    }

    /// A worker confirmed an instance is gone.
    pub async fn instance_deleted(&self, instance_id: Uuid) {
        let Ok(handle) = self.store.get_instance(instance_id).await else {
            debug!(instance = %instance_id, "Deleted event for unknown instance");
            return;
        };
        let instance = handle.snapshot().await;
        if instance.is_cnci {
            self.cnci_manager(&instance.tenant_id)
                .await
                .cnci_removed(instance_id)
                .await;
            let _ = self.store.remove_instance(instance_id).await;
        } else {
            self.release_instance_resources(&instance).await;
        }
        // Terminal transition last, so sync waiters wake to a fully
        // released instance.
        let _ = handle.transition(InstanceState::Deleted).await;
    }

    /// A worker reported an instance exit, commanded or not.
    pub async fn instance_stopped(&self, instance_id: Uuid) {
        let Ok(handle) = self.store.get_instance(instance_id).await else {
            debug!(instance = %instance_id, "Stopped event for unknown instance");
            return;
        };
        let instance = handle.snapshot().await;
        if let Err(e) = handle.transition(InstanceState::Exited).await {
            debug!(instance = %instance_id, error = %e, "Stopped event ignored");
            return;
        }
        if instance.is_cnci {
            self.cnci_manager(&instance.tenant_id)
                .await
                .cnci_stopped(instance_id)
                .await;
        }
    }

    /// A concentrator reported in with its addresses.
    pub async fn concentrator_added(
        &self,
        instance_id: Uuid,
        tenant_id: &str,
        _subnet: &str,
        ip: &str,
        mac: &str,
    ) {
        if let Ok(handle) = self.store.get_instance(instance_id).await {
            handle
                .update(|i| {
                    i.private_ip = Some(ip.to_string());
                })
                .await;
            let _ = handle.transition(InstanceState::Running).await;
        }
        self.cnci_manager(tenant_id)
            .await
            .cnci_added(instance_id, ip, mac)
            .await;
    }

    /// A worker refused a start. Fatal reasons tear the instance down;
    /// non-fatal ones leave it for the caller to retry.
    pub async fn start_failure(
        &self,
        instance_id: Uuid,
        reason: StartFailureReason,
        restart: bool,
    ) {
        let Ok(handle) = self.store.get_instance(instance_id).await else {
            debug!(instance = %instance_id, "Start failure for unknown instance");
            return;
        };
        let instance = handle.snapshot().await;
        self.store
            .log_event(
                &instance.tenant_id,
                EventLevel::Error,
                format!(
                    "start of instance {} failed: {} (restart={})",
                    instance_id, reason, restart
                ),
            )
            .await;

        if instance.is_cnci {
            self.cnci_manager(&instance.tenant_id)
                .await
                .start_failure(instance_id)
                .await;
            let _ = self.store.remove_instance(instance_id).await;
            return;
        }

        if reason.is_fatal() {
            self.release_instance_resources(&instance).await;
            let _ = handle.transition(InstanceState::Deleted).await;
        }
    }

    pub async fn attach_volume_failure(&self, instance_id: Uuid, volume_id: Uuid, message: &str) {
        let tenant_id = match self.store.get_block(volume_id).await {
            Ok(block) => block.tenant_id,
            Err(_) => return,
        };
        self.store
            .log_event(
                &tenant_id,
                EventLevel::Error,
                format!(
                    "attach of volume {} to instance {} failed: {}",
                    volume_id, instance_id, message
                ),
            )
            .await;
        let _ = self
            .store
            .update_block(volume_id, |b| {
                if b.state == BlockState::Attaching {
                    b.state = BlockState::Available;
                }
                Ok(())
            })
            .await;
        if let Some(attachment) = self.store.attachment_for_block(volume_id).await {
            if attachment.instance_id == instance_id {
                let _ = self.store.remove_attachment(attachment.id).await;
            }
        }
    }

    pub async fn node_connected(&self, node_id: &str, hostname: &str) {
        self.store.node_connected(node_id, hostname).await;
    }

    /// Remove the node and unbind its instances so a later delete retry
    /// can finish locally.
    pub async fn node_disconnected(&self, node_id: &str) {
        self.store.node_disconnected(node_id).await;
        for handle in self.store.all_instances().await {
            let instance = handle.snapshot().await;
            if instance.node_id.as_deref() == Some(node_id) {
                handle.update(|i| i.node_id = None).await;
            }
        }
    }

    pub async fn public_ip_assigned(&self, instance_id: Uuid, public_ip: &str) {
        let Ok(ip) = public_ip.parse::<Ipv4Addr>() else {
            return;
        };
        self.pools.mark_active(ip).await;
        if let Some(mapping) = self.pools.mapped_for_instance(instance_id).await {
            self.store
                .log_event(
                    &mapping.tenant_id,
                    EventLevel::Info,
                    format!("external IP {} mapped to instance {}", public_ip, instance_id),
                )
                .await;
        }
    }

    pub async fn public_ip_unassigned(&self, instance_id: Uuid, public_ip: &str) {
        let Ok(ip) = public_ip.parse::<Ipv4Addr>() else {
            return;
        };
        if let Ok(mapping) = self.pools.release(ip).await {
            self.ledger
                .release(
                    &mapping.tenant_id,
                    &[ResourceRequest::new(ResourceKind::ExternalIps, 1)],
                )
                .await;
            self.store
                .log_event(
                    &mapping.tenant_id,
                    EventLevel::Info,
                    format!(
                        "external IP {} unmapped from instance {}",
                        public_ip, instance_id
                    ),
                )
                .await;
        }
    }

    pub async fn assign_public_ip_failure(
        &self,
        instance_id: Uuid,
        public_ip: &str,
        message: &str,
    ) {
        let Ok(ip) = public_ip.parse::<Ipv4Addr>() else {
            return;
        };
        if let Ok(mapping) = self.pools.release(ip).await {
            self.ledger
                .release(
                    &mapping.tenant_id,
                    &[ResourceRequest::new(ResourceKind::ExternalIps, 1)],
                )
                .await;
            self.store
                .log_event(
                    &mapping.tenant_id,
                    EventLevel::Error,
                    format!(
                        "assigning external IP {} to instance {} failed: {}",
                        public_ip, instance_id, message
                    ),
                )
                .await;
        }
    }
}

/// Everything a worker needs to boot this instance, in one blob. CNCIs get
/// MAC-only networking; tenant instances get the full overlay wiring.
fn compose_payload(
    workload: &Workload,
    instance: &Instance,
    cnci: Option<&CnciInfo>,
    storage: Vec<StorageReference>,
) -> StartPayload {
    let networking = if instance.is_cnci {
        Networking::Concentrator {
            vnic_mac: instance.mac.clone(),
        }
    } else {
        let cnci = cnci.expect("tenant instances launch behind a CNCI");
        Networking::Tenant {
            vnic_id: instance.vnic_id,
            vnic_mac: instance.mac.clone(),
            subnet: instance.subnet.clone().unwrap_or_default(),
            private_ip: instance.private_ip.clone().unwrap_or_default(),
            concentrator_id: cnci.instance_id,
            concentrator_ip: cnci.ip.clone().unwrap_or_default(),
        }
    };

    StartPayload {
        tenant_id: instance.tenant_id.clone(),
        instance_id: instance.id,
        firmware: workload.firmware,
        vm_type: workload.vm_type,
        persistence: "host".to_string(),
        vcpus: workload.defaults.vcpus,
        mem_mb: workload.defaults.mem_mb,
        disk_gb: workload.defaults.disk_gb,
        networking,
        storage,
        docker_image: workload.docker_image.clone(),
        restart: false,
        metadata: InstanceMetadata {
            uuid: instance.id,
            hostname: naming::hostname_for(&instance.id),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::payloads::{Command, Event, Failure, Frame, InstanceSample};
    use stratus_core::workload::{Firmware, StorageSpec, VmType, WorkloadDefaults};
    use tokio::sync::mpsc;

    use crate::ledger::LimitUpdate;
    use crate::transport::{ChannelBus, dispatch};

    /// How the simulated worker answers commands from the bus.
    #[derive(Clone, Copy, Default)]
    struct WorkerBehavior {
        /// Never answer CNCI launches (CNCI event timeout path).
        ignore_cnci: bool,
        /// Never answer delete commands (sync delete timeout path).
        ignore_delete: bool,
        fail_start: Option<StartFailureReason>,
        fail_attach: bool,
    }

    fn running_sample(payload: &StartPayload) -> InstanceSample {
        InstanceSample {
            instance_id: payload.instance_id,
            state: InstanceState::Running,
            ssh_ip: Some("198.51.100.1".to_string()),
            ssh_port: Some(33002),
            vcpus: payload.vcpus,
            mem_mb: payload.mem_mb,
            disk_mb: 1024,
            attached_volumes: payload.storage.iter().map(|s| s.block_id).collect(),
        }
    }

    fn stats_frame(instances: Vec<InstanceSample>) -> Frame {
        Frame::Event(Event::Stats(NodeStatsReport {
            node_id: "node-1".to_string(),
            mem_total_mb: 32768,
            mem_available_mb: 16384,
            load: 0.5,
            instances,
        }))
    }

    /// A one-node cluster answering from the other side of the bus.
    fn spawn_worker(
        coordinator: Arc<Coordinator>,
        mut rx: mpsc::Receiver<Frame>,
        behavior: WorkerBehavior,
    ) {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Frame::Command(command) = frame else {
                    continue;
                };
                match command {
                    Command::Start { payload, .. } => match &payload.networking {
                        Networking::Concentrator { vnic_mac } => {
                            if behavior.ignore_cnci {
                                continue;
                            }
                            let subnet = coordinator
                                .datastore()
                                .get_instance(payload.instance_id)
                                .await
                                .unwrap()
                                .snapshot()
                                .await
                                .subnet
                                .unwrap_or_default();
                            dispatch(
                                &coordinator,
                                Frame::Event(Event::ConcentratorAdded {
                                    instance_id: payload.instance_id,
                                    tenant_id: payload.tenant_id.clone(),
                                    subnet,
                                    ip: "203.0.113.9".to_string(),
                                    mac: vnic_mac.clone(),
                                }),
                            )
                            .await;
                        }
                        Networking::Tenant { .. } => {
                            if let Some(reason) = behavior.fail_start {
                                dispatch(
                                    &coordinator,
                                    Frame::Failure(Failure::StartFailure {
                                        instance_id: payload.instance_id,
                                        reason,
                                        restart: payload.restart,
                                    }),
                                )
                                .await;
                            } else {
                                dispatch(
                                    &coordinator,
                                    stats_frame(vec![running_sample(&payload)]),
                                )
                                .await;
                            }
                        }
                    },
                    Command::Delete {
                        instance_id,
                        node_id,
                        stop,
                    } => {
                        if behavior.ignore_delete {
                            continue;
                        }
                        let event = if stop {
                            Event::InstanceStopped {
                                instance_id,
                                node_id,
                            }
                        } else {
                            Event::InstanceDeleted {
                                instance_id,
                                node_id,
                            }
                        };
                        dispatch(&coordinator, Frame::Event(event)).await;
                    }
                    Command::AttachVolume {
                        volume_id,
                        instance_id,
                        ..
                    } => {
                        if behavior.fail_attach {
                            dispatch(
                                &coordinator,
                                Frame::Failure(Failure::AttachVolumeFailure {
                                    instance_id,
                                    volume_id,
                                    message: "no such device".to_string(),
                                }),
                            )
                            .await;
                        } else if let Ok(handle) =
                            coordinator.datastore().get_instance(instance_id).await
                        {
                            let instance = handle.snapshot().await;
                            let mut volumes: Vec<Uuid> = coordinator
                                .datastore()
                                .attachments_for_instance(instance_id)
                                .await
                                .iter()
                                .map(|a| a.block_id)
                                .collect();
                            if !volumes.contains(&volume_id) {
                                volumes.push(volume_id);
                            }
                            dispatch(
                                &coordinator,
                                stats_frame(vec![InstanceSample {
                                    instance_id,
                                    state: instance.state,
                                    ssh_ip: instance.ssh_ip.clone(),
                                    ssh_port: instance.ssh_port,
                                    vcpus: 1,
                                    mem_mb: 512,
                                    disk_mb: 1024,
                                    attached_volumes: volumes,
                                }]),
                            )
                            .await;
                        }
                    }
                    Command::DetachVolume {
                        volume_id,
                        instance_id,
                        ..
                    } => {
                        if let Ok(handle) =
                            coordinator.datastore().get_instance(instance_id).await
                        {
                            let instance = handle.snapshot().await;
                            let volumes: Vec<Uuid> = coordinator
                                .datastore()
                                .attachments_for_instance(instance_id)
                                .await
                                .iter()
                                .map(|a| a.block_id)
                                .filter(|id| *id != volume_id)
                                .collect();
                            dispatch(
                                &coordinator,
                                stats_frame(vec![InstanceSample {
                                    instance_id,
                                    state: instance.state,
                                    ssh_ip: instance.ssh_ip.clone(),
                                    ssh_port: instance.ssh_port,
                                    vcpus: 1,
                                    mem_mb: 512,
                                    disk_mb: 1024,
                                    attached_volumes: volumes,
                                }]),
                            )
                            .await;
                        }
                    }
                    Command::AssignPublicIp {
                        instance_id,
                        public_ip,
                        private_ip,
                        ..
                    } => {
                        dispatch(
                            &coordinator,
                            Frame::Event(Event::PublicIpAssigned {
                                instance_id,
                                public_ip,
                                private_ip,
                            }),
                        )
                        .await;
                    }
                    Command::ReleasePublicIp {
                        instance_id,
                        public_ip,
                        private_ip,
                        ..
                    } => {
                        dispatch(
                            &coordinator,
                            Frame::Event(Event::PublicIpUnassigned {
                                instance_id,
                                public_ip,
                                private_ip,
                            }),
                        )
                        .await;
                    }
                    _ => {}
                }
            }
        });
    }

    struct Harness {
        coordinator: Arc<Coordinator>,
        workload_id: Uuid,
    }

    async fn harness(behavior: WorkerBehavior) -> Harness {
        harness_with_timeouts(behavior, 2, 2).await
    }

    async fn harness_with_timeouts(
        behavior: WorkerBehavior,
        cnci_timeout_secs: u64,
        sync_timeout_secs: u64,
    ) -> Harness {
        let config = ControllerConfig::parse(&format!(
            r#"
[controller]
bus_address = "127.0.0.1:9000"
sync_delete_timeout_secs = {sync_timeout_secs}
launch_parallelism = 4

[cnci]
event_timeout_secs = {cnci_timeout_secs}
teardown_delay_secs = 300
"#
        ))
        .unwrap();

        let (bus, rx) = ChannelBus::new(256);
        let store = Arc::new(DataStore::in_memory());
        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(QuotaLedger::new()),
            Arc::new(NetworkAllocator::new()),
            Arc::new(PoolManager::new()),
            Arc::new(UsageCollector::new()),
            Arc::new(Transport::new(bus)),
            &config,
        );
        spawn_worker(coordinator.clone(), rx, behavior);

        store
            .add_workload(Workload {
                id: Uuid::new_v4(),
                tenant_id: None,
                description: "concentrator".to_string(),
                firmware: Firmware::Efi,
                vm_type: VmType::FullVm,
                image_name: "cnci".to_string(),
                docker_image: None,
                config: String::new(),
                defaults: WorkloadDefaults {
                    vcpus: 2,
                    mem_mb: 128,
                    disk_gb: 2,
                },
                storage: vec![],
                is_cnci: true,
            })
            .await
            .unwrap();

        let workload = Workload {
            id: Uuid::new_v4(),
            tenant_id: None,
            description: "small server".to_string(),
            firmware: Firmware::Legacy,
            vm_type: VmType::FullVm,
            image_name: "ubuntu-server".to_string(),
            docker_image: None,
            config: "#cloud-config\n".to_string(),
            defaults: WorkloadDefaults {
                vcpus: 1,
                mem_mb: 512,
                disk_gb: 0,
            },
            storage: vec![StorageSpec {
                existing: None,
                bootable: true,
                ephemeral: true,
                size_gb: 10,
            }],
            is_cnci: false,
        };
        let workload_id = workload.id;
        store.add_workload(workload).await.unwrap();

        Harness {
            coordinator,
            workload_id,
        }
    }

    /// Poll a predicate until it holds or two seconds pass.
    async fn wait_until<F, Fut>(mut pred: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if pred().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn instance_state(coordinator: &Coordinator, id: Uuid) -> Option<InstanceState> {
        match coordinator.datastore().get_instance(id).await {
            Ok(handle) => Some(handle.state().await),
            Err(_) => None,
        }
    }

    #[tokio::test]
    async fn test_launch_single_instance_end_to_end() {
        let h = harness(WorkerBehavior::default()).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.instances.len(), 1);
        let instance = &result.instances[0];
        assert_eq!(instance.private_ip.as_deref(), Some("172.0.0.2"));
        assert_eq!(instance.subnet.as_deref(), Some("172.0.0.0/24"));

        let id = instance.id;
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Running) }
        })
        .await;

        // The worker's stats bound the instance to its node.
        let bound = h
            .coordinator
            .datastore()
            .get_instance(id)
            .await
            .unwrap()
            .snapshot()
            .await;
        assert_eq!(bound.node_id.as_deref(), Some("node-1"));
        assert_eq!(bound.ssh_port, Some(33002));

        // One running CNCI serves the subnet; it is hidden from listings.
        let manager = h.coordinator.cnci_manager("acme").await;
        let cnci = manager.get_subnet_cnci("172.0.0.0/24").await.unwrap();
        assert_eq!(cnci.state, crate::cnci::CnciState::Running);
        assert_eq!(
            h.coordinator.datastore().list_instances("acme", false).await.len(),
            1
        );

        // Quota: instance + defaults + the ephemeral boot volume.
        let ledger = h.coordinator.ledger();
        assert_eq!(ledger.usage("acme", ResourceKind::Instances).await, 1);
        assert_eq!(ledger.usage("acme", ResourceKind::Vcpus).await, 1);
        assert_eq!(ledger.usage("acme", ResourceKind::MemMb).await, 512);
        assert_eq!(ledger.usage("acme", ResourceKind::Volumes).await, 1);
    }

    #[tokio::test]
    async fn test_quota_exceeded_slot_is_fully_cleaned() {
        let h = harness(WorkerBehavior::default()).await;
        h.coordinator.confirm_tenant("acme").await.unwrap();
        h.coordinator
            .ledger()
            .update(
                "acme",
                &[LimitUpdate {
                    kind: ResourceKind::Instances,
                    limit: 1,
                }],
            )
            .await;

        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 2))
            .await;
        assert_eq!(result.instances.len(), 1);
        assert!(matches!(result.error, Some(Error::QuotaExceeded { .. })));

        // The refused slot holds nothing: no row, no quota, and its IP is
        // back in the pool.
        assert_eq!(
            h.coordinator.datastore().list_instances("acme", false).await.len(),
            1
        );
        assert_eq!(
            h.coordinator.ledger().usage("acme", ResourceKind::Instances).await,
            1
        );
        wait_until(|| async {
            h.coordinator
                .datastore()
                .list_instances("acme", false)
                .await
                .len()
                == 1
        })
        .await;
    }

    #[tokio::test]
    async fn test_name_collision_rejected() {
        let h = harness(WorkerBehavior::default()).await;
        let mut request = StartRequest::new("acme", h.workload_id, 1);
        request.name = Some("web".to_string());
        let first = h.coordinator.start_workload(request.clone()).await;
        assert!(first.error.is_none());

        let second = h.coordinator.start_workload(request).await;
        assert!(matches!(second.error, Some(Error::NameInUse(_))));
        assert_eq!(
            h.coordinator.ledger().usage("acme", ResourceKind::Instances).await,
            1
        );
    }

    #[tokio::test]
    async fn test_delete_releases_ip_quota_and_storage() {
        let h = harness(WorkerBehavior::default()).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        let instance = result.instances[0].clone();
        let c = h.coordinator.clone();
        let id = instance.id;
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Running) }
        })
        .await;

        let attachments = h.coordinator.datastore().attachments_for_instance(id).await;
        assert_eq!(attachments.len(), 1);
        let block_id = attachments[0].block_id;

        h.coordinator.delete_instance(id).await.unwrap();
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await.is_none() }
        })
        .await;

        let ledger = h.coordinator.ledger();
        assert_eq!(ledger.usage("acme", ResourceKind::Instances).await, 0);
        assert_eq!(ledger.usage("acme", ResourceKind::Vcpus).await, 0);
        assert_eq!(ledger.usage("acme", ResourceKind::MemMb).await, 0);
        assert_eq!(ledger.usage("acme", ResourceKind::Volumes).await, 0);
        assert!(h.coordinator.datastore().get_block(block_id).await.is_err());
        assert!(
            h.coordinator
                .datastore()
                .attachments_for_instance(id)
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_stop_then_restart_reuses_wiring() {
        let h = harness(WorkerBehavior::default()).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        let instance = result.instances[0].clone();
        let id = instance.id;
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Running) }
        })
        .await;

        h.coordinator.stop_instance(id).await.unwrap();
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Exited) }
        })
        .await;

        // Stop is legal only from running.
        assert!(matches!(
            h.coordinator.stop_instance(id).await,
            Err(Error::InvalidTransition { .. })
        ));

        h.coordinator.restart_instance(id).await.unwrap();
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Running) }
        })
        .await;

        let after = h
            .coordinator
            .datastore()
            .get_instance(id)
            .await
            .unwrap()
            .snapshot()
            .await;
        assert_eq!(after.private_ip, instance.private_ip);
        assert_eq!(after.mac, instance.mac);
    }

    #[tokio::test]
    async fn test_restart_requires_exited() {
        let h = harness(WorkerBehavior::default()).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        let id = result.instances[0].id;
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Running) }
        })
        .await;
        assert!(matches!(
            h.coordinator.restart_instance(id).await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_delete_times_out_to_hung() {
        let behavior = WorkerBehavior {
            ignore_delete: true,
            ..Default::default()
        };
        let h = harness_with_timeouts(behavior, 2, 1).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        let id = result.instances[0].id;
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Running) }
        })
        .await;

        let err = h.coordinator.delete_instance_sync(id).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(
            instance_state(&h.coordinator, id).await,
            Some(InstanceState::Hung)
        );
    }

    #[tokio::test]
    async fn test_fatal_start_failure_cleans_instance() {
        let behavior = WorkerBehavior {
            fail_start: Some(StartFailureReason::FullCloud),
            ..Default::default()
        };
        let h = harness(behavior).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        // Emission itself succeeded; the failure arrives as an event.
        assert!(result.error.is_none());
        let id = result.instances[0].id;

        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await.is_none() }
        })
        .await;
        assert_eq!(
            h.coordinator.ledger().usage("acme", ResourceKind::Instances).await,
            0
        );
        let events = h.coordinator.datastore().tenant_events("acme").await;
        assert!(events.iter().any(|e| e.level == EventLevel::Error));
    }

    #[tokio::test]
    async fn test_nonfatal_start_failure_leaves_instance() {
        let behavior = WorkerBehavior {
            fail_start: Some(StartFailureReason::LaunchFailure),
            ..Default::default()
        };
        let h = harness(behavior).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        let id = result.instances[0].id;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            instance_state(&h.coordinator, id).await,
            Some(InstanceState::Pending)
        );
        assert_eq!(
            h.coordinator.ledger().usage("acme", ResourceKind::Instances).await,
            1
        );
    }

    #[tokio::test]
    async fn test_cnci_timeout_cleans_launch() {
        let behavior = WorkerBehavior {
            ignore_cnci: true,
            ..Default::default()
        };
        let h = harness_with_timeouts(behavior, 1, 2).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        assert!(result.instances.is_empty());
        assert!(matches!(result.error, Some(Error::Timeout(_))));

        // Nothing held: no rows (the abandoned CNCI included), no quota.
        assert!(
            h.coordinator
                .datastore()
                .list_instances("acme", true)
                .await
                .is_empty()
        );
        assert_eq!(
            h.coordinator.ledger().usage("acme", ResourceKind::Instances).await,
            0
        );
        let manager = h.coordinator.cnci_manager("acme").await;
        assert!(manager.get_subnet_cnci("172.0.0.0/24").await.is_none());
    }

    #[tokio::test]
    async fn test_attach_detach_volume_lifecycle() {
        let h = harness(WorkerBehavior::default()).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        let id = result.instances[0].id;
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Running) }
        })
        .await;

        let volume = h
            .coordinator
            .create_volume("acme", 8, Some("data".to_string()))
            .await
            .unwrap();
        h.coordinator.attach_volume(volume.id, id).await.unwrap();

        // Stats from the worker confirm the attach.
        let c = h.coordinator.clone();
        let vid = volume.id;
        wait_until(|| {
            let c = c.clone();
            async move {
                c.datastore().get_block(vid).await.unwrap().state == BlockState::InUse
            }
        })
        .await;

        // Detach refused while running.
        assert!(matches!(
            h.coordinator.detach_volume(volume.id).await,
            Err(Error::InstanceNotExited)
        ));

        h.coordinator.stop_instance(id).await.unwrap();
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Exited) }
        })
        .await;

        h.coordinator.detach_volume(volume.id).await.unwrap();
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move {
                c.datastore().get_block(vid).await.unwrap().state == BlockState::Available
            }
        })
        .await;
        assert!(h.coordinator.datastore().attachment_for_block(volume.id).await.is_none());
    }

    #[tokio::test]
    async fn test_attach_failure_reverts_volume() {
        let behavior = WorkerBehavior {
            fail_attach: true,
            ..Default::default()
        };
        let h = harness(behavior).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        let id = result.instances[0].id;
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Running) }
        })
        .await;

        let volume = h.coordinator.create_volume("acme", 8, None).await.unwrap();
        h.coordinator.attach_volume(volume.id, id).await.unwrap();

        let c = h.coordinator.clone();
        let vid = volume.id;
        wait_until(|| {
            let c = c.clone();
            async move {
                c.datastore().get_block(vid).await.unwrap().state == BlockState::Available
            }
        })
        .await;
        assert!(h.coordinator.datastore().attachment_for_block(vid).await.is_none());
    }

    #[tokio::test]
    async fn test_map_unmap_external_ip() {
        let h = harness(WorkerBehavior::default()).await;
        let pool = h.coordinator.pools().create_pool("default").await;
        h.coordinator
            .pools()
            .add_subnet(pool.id, "203.0.113.0/29")
            .await
            .unwrap();

        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        let id = result.instances[0].id;
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Running) }
        })
        .await;

        h.coordinator.map_external_ip("acme", id).await.unwrap();
        assert_eq!(
            h.coordinator.ledger().usage("acme", ResourceKind::ExternalIps).await,
            1
        );

        // The CNCI confirms; the mapping turns active.
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move {
                c.pools()
                    .mapped_for_instance(id)
                    .await
                    .map(|m| m.active)
                    .unwrap_or(false)
            }
        })
        .await;

        // Deleting a mapped instance is refused.
        assert!(matches!(
            h.coordinator.delete_instance(id).await,
            Err(Error::ExternalIpMapped(_))
        ));

        h.coordinator.unmap_external_ip(id).await.unwrap();
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { c.pools().mapped_for_instance(id).await.is_none() }
        })
        .await;
        assert_eq!(
            h.coordinator.ledger().usage("acme", ResourceKind::ExternalIps).await,
            0
        );
    }

    #[tokio::test]
    async fn test_concurrent_confirms_create_one_tenant() {
        let h = harness(WorkerBehavior::default()).await;
        let mut set = JoinSet::new();
        for _ in 0..8 {
            let c = h.coordinator.clone();
            set.spawn(async move { c.confirm_tenant("acme").await });
        }
        while let Some(result) = set.join_next().await {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(h.coordinator.datastore().list_tenants().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delete_events_are_tolerated() {
        let h = harness(WorkerBehavior::default()).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 1))
            .await;
        let id = result.instances[0].id;
        let c = h.coordinator.clone();
        wait_until(|| {
            let c = c.clone();
            async move { instance_state(&c, id).await == Some(InstanceState::Running) }
        })
        .await;

        h.coordinator.instance_deleted(id).await;
        // Replay: must be a no-op, not a double release.
        h.coordinator.instance_deleted(id).await;
        assert_eq!(
            h.coordinator.ledger().usage("acme", ResourceKind::Instances).await,
            0
        );
    }

    #[tokio::test]
    async fn test_batch_instances_share_subnet_with_distinct_ips() {
        let h = harness(WorkerBehavior::default()).await;
        let result = h
            .coordinator
            .start_workload(StartRequest::new("acme", h.workload_id, 3))
            .await;
        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.instances.len(), 3);

        let subnets: std::collections::HashSet<_> = result
            .instances
            .iter()
            .map(|i| i.subnet.clone().unwrap())
            .collect();
        assert_eq!(subnets.len(), 1);
        let ips: std::collections::HashSet<_> = result
            .instances
            .iter()
            .map(|i| i.private_ip.clone().unwrap())
            .collect();
        assert_eq!(ips.len(), 3);

        // One CNCI for the whole batch.
        let manager = h.coordinator.cnci_manager("acme").await;
        assert!(manager.get_subnet_cnci("172.0.0.0/24").await.is_some());
    }
}
