use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};
use uuid::Uuid;

use stratus_core::block::{BlockDevice, StorageAttachment};
use stratus_core::error::{Error, Result};
use stratus_core::instance::{Instance, InstanceState};
use stratus_core::tenant::Tenant;
use stratus_core::workload::Workload;

// ============================================================================
// Instance handle: record + state broadcast
// ============================================================================

/// An instance record behind a write lock, with every state transition
/// broadcast on a watch channel so waiters (sync delete, tests) wake on
/// each change.
pub struct InstanceHandle {
    record: RwLock<Instance>,
    state_tx: watch::Sender<InstanceState>,
}

impl InstanceHandle {
    fn new(instance: Instance) -> Arc<Self> {
        let (tx, _) = watch::channel(instance.state);
        Arc::new(Self {
            record: RwLock::new(instance),
            state_tx: tx,
        })
    }

    pub async fn snapshot(&self) -> Instance {
        self.record.read().await.clone()
    }

    pub async fn id(&self) -> Uuid {
        self.record.read().await.id
    }

    pub async fn state(&self) -> InstanceState {
        self.record.read().await.state
    }

    /// Apply a state transition under the write lock and broadcast it.
    /// Illegal edges error without changing state.
    pub async fn transition(&self, to: InstanceState) -> Result<InstanceState> {
        let mut record = self.record.write().await;
        record.transition(to)?;
        self.state_tx.send_replace(to);
        Ok(to)
    }

    /// Subscribe to state changes. The receiver sees the current state
    /// immediately and every transition after it.
    pub fn watch_state(&self) -> watch::Receiver<InstanceState> {
        self.state_tx.subscribe()
    }

    /// Mutate non-state fields (node id, ssh endpoint, addresses).
    pub async fn update<F: FnOnce(&mut Instance)>(&self, f: F) {
        let mut record = self.record.write().await;
        f(&mut record);
    }
}

// ============================================================================
// Per-tenant event log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One row of the user-visible trail of asynchronous outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantEvent {
    pub tenant_id: String,
    pub level: EventLevel,
    pub message: String,
    pub timestamp: String,
}

// ============================================================================
// Worker node bookkeeping
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    pub node_id: String,
    pub hostname: String,
    pub connected_at: String,
}

/// One appended row of a node's telemetry series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatsRow {
    pub timestamp: String,
    pub mem_total_mb: u64,
    pub mem_available_mb: u64,
    pub load: f64,
    pub instance_count: usize,
}

/// Rows kept per node before the series is trimmed from the front.
const NODE_STATS_CAP: usize = 1000;

/// A batch of trace frames reported by a worker for one traced launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub label: String,
    pub frames: Vec<serde_json::Value>,
    pub received_at: String,
}

// ============================================================================
// Persistence seam
// ============================================================================

/// Serialized form of the authoritative state. Everything the cache holds
/// about tenants, workloads, instances (CNCIs included), and block devices
/// survives the round-trip.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub tenants: Vec<Tenant>,
    pub workloads: Vec<Workload>,
    pub instances: Vec<Instance>,
    pub blocks: Vec<BlockDevice>,
    pub attachments: Vec<StorageAttachment>,
    pub events: Vec<TenantEvent>,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
    async fn load(&self) -> Result<Option<Snapshot>>;
}

/// No-op persistence for tests and in-memory deployments.
#[derive(Default)]
pub struct MemoryPersistence;

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save(&self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }
    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(None)
    }
}

/// Whole-state JSON snapshot on disk.
pub struct JsonPersistence {
    path: PathBuf,
}

impl JsonPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Persistence for JsonPersistence {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// The facade
// ============================================================================

/// Authoritative cluster state: an in-memory cache with one read/write
/// lock per coarse category and write-through persistence. Readers never
/// hold a lock across an external call.
pub struct DataStore {
    tenants: RwLock<HashMap<String, Tenant>>,
    workloads: RwLock<HashMap<Uuid, Workload>>,
    instances: RwLock<HashMap<Uuid, Arc<InstanceHandle>>>,
    nodes: RwLock<HashMap<String, WorkerNode>>,
    blocks: RwLock<HashMap<Uuid, BlockDevice>>,
    attachments: RwLock<HashMap<Uuid, StorageAttachment>>,
    events: RwLock<Vec<TenantEvent>>,
    node_stats: RwLock<HashMap<String, Vec<NodeStatsRow>>>,
    traces: RwLock<Vec<TraceRecord>>,
    persistence: Arc<dyn Persistence>,
}

impl DataStore {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            workloads: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashMap::new()),
            attachments: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            node_stats: RwLock::new(HashMap::new()),
            traces: RwLock::new(Vec::new()),
            persistence,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPersistence))
    }

    /// Restore the cache from the persisted snapshot, if one exists.
    pub async fn restore(&self) -> Result<()> {
        let Some(snapshot) = self.persistence.load().await? else {
            return Ok(());
        };
        {
            let mut tenants = self.tenants.write().await;
            for t in snapshot.tenants {
                tenants.insert(t.id.clone(), t);
            }
        }
        {
            let mut workloads = self.workloads.write().await;
            for w in snapshot.workloads {
                workloads.insert(w.id, w);
            }
        }
        {
            let mut instances = self.instances.write().await;
            for i in snapshot.instances {
                instances.insert(i.id, InstanceHandle::new(i));
            }
        }
        {
            let mut blocks = self.blocks.write().await;
            for b in snapshot.blocks {
                blocks.insert(b.id, b);
            }
        }
        {
            let mut attachments = self.attachments.write().await;
            for a in snapshot.attachments {
                attachments.insert(a.id, a);
            }
        }
        *self.events.write().await = snapshot.events;
        info!("Datastore restored from snapshot");
        Ok(())
    }

    /// Build a snapshot of the current cache and write it through.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = {
            let tenants = self.tenants.read().await;
            let workloads = self.workloads.read().await;
            let instances = self.instances.read().await;
            let blocks = self.blocks.read().await;
            let attachments = self.attachments.read().await;
            let events = self.events.read().await;

            let mut inst_rows = Vec::with_capacity(instances.len());
            for handle in instances.values() {
                inst_rows.push(handle.snapshot().await);
            }
            Snapshot {
                tenants: tenants.values().cloned().collect(),
                workloads: workloads.values().cloned().collect(),
                instances: inst_rows,
                blocks: blocks.values().cloned().collect(),
                attachments: attachments.values().cloned().collect(),
                events: events.clone(),
            }
        };
        self.persistence.save(&snapshot).await
    }

    // --- tenants ---

    pub async fn add_tenant(&self, tenant: Tenant) -> Result<()> {
        self.tenants
            .write()
            .await
            .insert(tenant.id.clone(), tenant);
        self.persist().await
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Option<Tenant> {
        self.tenants.read().await.get(tenant_id).cloned()
    }

    pub async fn tenant_exists(&self, tenant_id: &str) -> bool {
        self.tenants.read().await.contains_key(tenant_id)
    }

    pub async fn list_tenants(&self) -> Vec<Tenant> {
        self.tenants.read().await.values().cloned().collect()
    }

    // --- workloads ---

    pub async fn add_workload(&self, workload: Workload) -> Result<()> {
        self.workloads.write().await.insert(workload.id, workload);
        self.persist().await
    }

    pub async fn get_workload(&self, id: Uuid) -> Result<Workload> {
        self.workloads
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "workload",
                id: id.to_string(),
            })
    }

    /// Workloads visible to a tenant: its own plus cluster-wide ones,
    /// minus the CNCI workload.
    pub async fn list_workloads(&self, tenant_id: &str) -> Vec<Workload> {
        self.workloads
            .read()
            .await
            .values()
            .filter(|w| !w.is_cnci)
            .filter(|w| {
                w.tenant_id.is_none() || w.tenant_id.as_deref() == Some(tenant_id)
            })
            .cloned()
            .collect()
    }

    /// The distinguished cluster-wide CNCI workload.
    pub async fn cnci_workload(&self) -> Result<Workload> {
        self.workloads
            .read()
            .await
            .values()
            .find(|w| w.is_cnci)
            .cloned()
            .ok_or(Error::NotFound {
                kind: "workload",
                id: "cnci".to_string(),
            })
    }

    // --- instances ---

    pub async fn add_instance(&self, instance: Instance) -> Result<Arc<InstanceHandle>> {
        let handle = InstanceHandle::new(instance.clone());
        self.instances.write().await.insert(instance.id, handle.clone());
        self.persist().await?;
        Ok(handle)
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<Arc<InstanceHandle>> {
        self.instances
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "instance",
                id: id.to_string(),
            })
    }

    /// Drop the record entirely. Used when an instance reaches `deleted`
    /// or its launch is rolled back.
    pub async fn remove_instance(&self, id: Uuid) -> Result<()> {
        let removed = self.instances.write().await.remove(&id);
        if removed.is_some() {
            debug!(instance = %id, "Instance record removed");
            self.persist().await?;
        }
        Ok(())
    }

    /// Instances owned by a tenant. CNCIs are invisible unless asked for.
    pub async fn list_instances(&self, tenant_id: &str, include_cnci: bool) -> Vec<Instance> {
        let handles: Vec<Arc<InstanceHandle>> =
            self.instances.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for handle in handles {
            let inst = handle.snapshot().await;
            if inst.tenant_id == tenant_id && (include_cnci || !inst.is_cnci) {
                out.push(inst);
            }
        }
        out
    }

    /// Every instance handle in the cache, for cross-tenant sweeps.
    pub async fn all_instances(&self) -> Vec<Arc<InstanceHandle>> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn instance_name_in_use(&self, tenant_id: &str, name: &str) -> bool {
        for inst in self.list_instances(tenant_id, false).await {
            if inst.name.as_deref() == Some(name) {
                return true;
            }
        }
        false
    }

    // --- worker nodes ---

    pub async fn node_connected(&self, node_id: &str, hostname: &str) {
        self.nodes.write().await.insert(
            node_id.to_string(),
            WorkerNode {
                node_id: node_id.to_string(),
                hostname: hostname.to_string(),
                connected_at: stratus_core::time::utc_now(),
            },
        );
    }

    pub async fn node_disconnected(&self, node_id: &str) {
        self.nodes.write().await.remove(node_id);
        self.node_stats.write().await.remove(node_id);
    }

    pub async fn list_nodes(&self) -> Vec<WorkerNode> {
        self.nodes.read().await.values().cloned().collect()
    }

    // --- block devices ---

    pub async fn add_block(&self, block: BlockDevice) -> Result<()> {
        self.blocks.write().await.insert(block.id, block);
        self.persist().await
    }

    pub async fn get_block(&self, id: Uuid) -> Result<BlockDevice> {
        self.blocks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "block device",
                id: id.to_string(),
            })
    }

    /// Mutate a block device under the category lock.
    pub async fn update_block<F, T>(&self, id: Uuid, f: F) -> Result<T>
    where
        F: FnOnce(&mut BlockDevice) -> Result<T>,
    {
        let result = {
            let mut blocks = self.blocks.write().await;
            let block = blocks.get_mut(&id).ok_or_else(|| Error::NotFound {
                kind: "block device",
                id: id.to_string(),
            })?;
            f(block)?
        };
        self.persist().await?;
        Ok(result)
    }

    pub async fn remove_block(&self, id: Uuid) -> Result<()> {
        self.blocks.write().await.remove(&id);
        self.persist().await
    }

    pub async fn list_blocks(&self, tenant_id: &str) -> Vec<BlockDevice> {
        self.blocks
            .read()
            .await
            .values()
            .filter(|b| b.tenant_id == tenant_id && !b.internal)
            .cloned()
            .collect()
    }

    // --- attachments ---

    pub async fn add_attachment(&self, attachment: StorageAttachment) -> Result<()> {
        self.attachments
            .write()
            .await
            .insert(attachment.id, attachment);
        self.persist().await
    }

    pub async fn attachments_for_instance(&self, instance_id: Uuid) -> Vec<StorageAttachment> {
        self.attachments
            .read()
            .await
            .values()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect()
    }

    pub async fn attachment_for_block(&self, block_id: Uuid) -> Option<StorageAttachment> {
        self.attachments
            .read()
            .await
            .values()
            .find(|a| a.block_id == block_id)
            .cloned()
    }

    pub async fn remove_attachment(&self, id: Uuid) -> Result<()> {
        self.attachments.write().await.remove(&id);
        self.persist().await
    }

    // --- event log ---

    pub async fn log_event(&self, tenant_id: &str, level: EventLevel, message: String) {
        self.events.write().await.push(TenantEvent {
            tenant_id: tenant_id.to_string(),
            level,
            message,
            timestamp: stratus_core::time::utc_now(),
        });
    }

    pub async fn tenant_events(&self, tenant_id: &str) -> Vec<TenantEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    // --- node stats series ---

    pub async fn append_node_stats(&self, node_id: &str, row: NodeStatsRow) {
        let mut series = self.node_stats.write().await;
        let rows = series.entry(node_id.to_string()).or_default();
        rows.push(row);
        if rows.len() > NODE_STATS_CAP {
            let excess = rows.len() - NODE_STATS_CAP;
            rows.drain(..excess);
        }
    }

    pub async fn node_stats(&self, node_id: &str) -> Vec<NodeStatsRow> {
        self.node_stats
            .read()
            .await
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    // --- trace frames ---

    pub async fn append_trace(&self, label: &str, frames: Vec<serde_json::Value>) {
        self.traces.write().await.push(TraceRecord {
            label: label.to_string(),
            frames,
            received_at: stratus_core::time::utc_now(),
        });
    }

    pub async fn traces(&self, label: &str) -> Vec<TraceRecord> {
        self.traces
            .read()
            .await
            .iter()
            .filter(|t| t.label == label)
            .cloned()
            .collect()
    }
}
