use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stratus_core::error::{Error, Result};
use stratus_core::payloads::CnciEndpoint;

/// CNCI lifecycle state, as driven by worker events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CnciState {
    Pending,
    Running,
    Stopping,
    Exited,
}

impl std::fmt::Display for CnciState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Terminal signals published on a CNCI's event channel. Every waiter
/// observes the signal (watch semantics: broadcast, last value sticks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CnciSignal {
    Added,
    Removed,
    Failed,
}

/// Snapshot of a managed CNCI, for payload composition and listings.
#[derive(Debug, Clone)]
pub struct CnciInfo {
    pub instance_id: Uuid,
    pub tenant_id: String,
    pub subnet: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub state: CnciState,
}

struct CnciRecord {
    instance_id: Uuid,
    subnet: String,
    ip: Option<String>,
    mac: Option<String>,
    state: CnciState,
    signal_tx: watch::Sender<Option<CnciSignal>>,
    signal_rx: watch::Receiver<Option<CnciSignal>>,
    /// Armed teardown task, if any. Guarded by the same lock as the
    /// indexes so reclaim can clear it atomically.
    teardown: Option<tokio::task::JoinHandle<()>>,
}

impl CnciRecord {
    fn new(instance_id: Uuid, subnet: &str) -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            instance_id,
            subnet: subnet.to_string(),
            ip: None,
            mac: None,
            state: CnciState::Pending,
            signal_tx: tx,
            signal_rx: rx,
            teardown: None,
        }
    }

    fn info(&self, tenant_id: &str) -> CnciInfo {
        CnciInfo {
            instance_id: self.instance_id,
            tenant_id: tenant_id.to_string(),
            subnet: self.subnet.clone(),
            ip: self.ip.clone(),
            mac: self.mac.clone(),
            state: self.state,
        }
    }
}

struct Indexes {
    cncis: HashMap<Uuid, CnciRecord>,
    subnets: HashMap<String, Uuid>,
}

/// The operations a CNCI manager needs from the rest of the controller:
/// launching and restarting the concentrator workload and emitting refresh
/// broadcasts. Implemented by the coordinator; mocked in tests.
#[async_trait]
pub trait CnciOps: Send + Sync {
    /// Launch a CNCI workload instance with the given id for `subnet`.
    async fn launch_cnci(&self, tenant_id: &str, subnet: &str, instance_id: Uuid) -> Result<()>;
    /// Re-launch a previously exited CNCI instance.
    async fn restart_cnci(&self, tenant_id: &str, instance_id: Uuid) -> Result<()>;
    /// Tear down the CNCI instance (delete toward the worker).
    async fn remove_cnci(&self, tenant_id: &str, instance_id: Uuid) -> Result<()>;
    /// Push a refreshed endpoint list to one CNCI.
    async fn send_refresh(&self, cnci_id: Uuid, endpoints: Vec<CnciEndpoint>) -> Result<()>;
}

struct Shared {
    tenant_id: String,
    /// CRC32 of the tenant id; keys the tenant's tunnels on the overlay.
    tunnel_id: u32,
    indexes: RwLock<Indexes>,
    ops: Arc<dyn CnciOps>,
    event_timeout: Duration,
    teardown_delay: Duration,
}

/// Per-tenant CNCI state machine: lazy create with coalesced readiness
/// waits, delayed teardown of empty subnets, and event-driven transitions.
#[derive(Clone)]
pub struct CnciManager {
    shared: Arc<Shared>,
}

impl CnciManager {
    pub fn new(
        tenant_id: &str,
        ops: Arc<dyn CnciOps>,
        event_timeout: Duration,
        teardown_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tenant_id: tenant_id.to_string(),
                tunnel_id: crc32fast::hash(tenant_id.as_bytes()),
                indexes: RwLock::new(Indexes {
                    cncis: HashMap::new(),
                    subnets: HashMap::new(),
                }),
                ops,
                event_timeout,
                teardown_delay,
            }),
        }
    }

    pub fn tunnel_id(&self) -> u32 {
        self.shared.tunnel_id
    }

    /// Ensure a running CNCI exists for `subnet` and return it.
    ///
    /// Reclaims any pending teardown. If a CNCI is already running this
    /// returns immediately; if one is coming up, this joins its waiter
    /// group; otherwise it creates the record, launches the concentrator
    /// workload, and waits for the added event up to the event timeout.
    pub async fn wait_for_active(&self, subnet: &str) -> Result<CnciInfo> {
        let (rx, launch_id) = {
            let mut idx = self.shared.indexes.write().await;
            if let Some(id) = idx.subnets.get(subnet).copied() {
                let rec = idx.cncis.get_mut(&id).expect("subnet index names a cnci");
                if let Some(timer) = rec.teardown.take() {
                    timer.abort();
                    debug!(
                        tenant = %self.shared.tenant_id,
                        subnet = %subnet,
                        "Reclaimed CNCI, teardown cancelled"
                    );
                }
                if rec.state == CnciState::Running {
                    return Ok(rec.info(&self.shared.tenant_id));
                }
                // Coming up (or restarting): join the waiter group.
                (rec.signal_rx.clone(), None)
            } else {
                let instance_id = Uuid::new_v4();
                let rec = CnciRecord::new(instance_id, subnet);
                let rx = rec.signal_rx.clone();
                idx.cncis.insert(instance_id, rec);
                idx.subnets.insert(subnet.to_string(), instance_id);
                info!(
                    tenant = %self.shared.tenant_id,
                    subnet = %subnet,
                    cnci = %instance_id,
                    "Launching CNCI for fresh subnet"
                );
                (rx, Some(instance_id))
            }
        };

        if let Some(instance_id) = launch_id {
            if let Err(e) = self
                .shared
                .ops
                .launch_cnci(&self.shared.tenant_id, subnet, instance_id)
                .await
            {
                self.drop_record(instance_id).await;
                return Err(e);
            }
        }

        match self.wait_for_signal(rx, CnciSignal::Added, subnet).await {
            Ok(()) => {}
            Err(e) => {
                // The creator owns cleanup; joined waiters just report.
                if let Some(instance_id) = launch_id {
                    self.drop_record(instance_id).await;
                    if let Err(cleanup) = self
                        .shared
                        .ops
                        .remove_cnci(&self.shared.tenant_id, instance_id)
                        .await
                    {
                        debug!(
                            cnci = %instance_id,
                            error = %cleanup,
                            "CNCI instance cleanup after failed start"
                        );
                    }
                }
                return Err(e);
            }
        }

        let info = self
            .get_subnet_cnci(subnet)
            .await
            .ok_or_else(|| Error::CnciUnavailable(subnet.to_string()))?;
        if launch_id.is_some() {
            self.refresh().await;
        }
        Ok(info)
    }

    /// Arm the delayed teardown for `subnet`'s CNCI. Idempotent: an armed
    /// timer is left alone.
    pub async fn schedule_remove_subnet(&self, subnet: &str) {
        let mut idx = self.shared.indexes.write().await;
        let Some(id) = idx.subnets.get(subnet).copied() else {
            return;
        };
        let Some(rec) = idx.cncis.get_mut(&id) else {
            return;
        };
        if rec.teardown.is_some() {
            return;
        }
        let mgr = self.clone();
        let subnet = subnet.to_string();
        let delay = self.shared.teardown_delay;
        let spawned_subnet = subnet.clone();
        rec.teardown = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = mgr.remove_subnet(&spawned_subnet).await {
                warn!(subnet = %spawned_subnet, error = %e, "Delayed CNCI teardown failed");
            }
        }));
        debug!(
            tenant = %self.shared.tenant_id,
            subnet = %subnet,
            delay_secs = delay.as_secs(),
            "CNCI teardown scheduled"
        );
    }

    /// Tear down the CNCI serving `subnet`: drive it to stopping, issue the
    /// delete, wait for the removed event, then refresh the survivors.
    pub async fn remove_subnet(&self, subnet: &str) -> Result<()> {
        let (instance_id, rx) = {
            let mut idx = self.shared.indexes.write().await;
            let Some(id) = idx.subnets.remove(subnet) else {
                return Err(Error::NotFound {
                    kind: "CNCI subnet",
                    id: subnet.to_string(),
                });
            };
            let rec = idx.cncis.get_mut(&id).expect("subnet index names a cnci");
            rec.state = CnciState::Stopping;
            if let Some(timer) = rec.teardown.take() {
                timer.abort();
            }
            (id, rec.signal_rx.clone())
        };

        info!(
            tenant = %self.shared.tenant_id,
            subnet = %subnet,
            cnci = %instance_id,
            "Removing CNCI"
        );
        self.shared
            .ops
            .remove_cnci(&self.shared.tenant_id, instance_id)
            .await?;
        self.wait_for_signal(rx, CnciSignal::Removed, subnet).await?;
        self.refresh().await;
        Ok(())
    }

    /// Inbound: the concentrator reported in. Late arrivals for a CNCI
    /// already dropped are discarded.
    pub async fn cnci_added(&self, instance_id: Uuid, ip: &str, mac: &str) {
        let mut idx = self.shared.indexes.write().await;
        let Some(rec) = idx.cncis.get_mut(&instance_id) else {
            debug!(cnci = %instance_id, "Added event for unknown CNCI, discarding");
            return;
        };
        rec.ip = Some(ip.to_string());
        rec.mac = Some(mac.to_string());
        rec.state = CnciState::Running;
        let _ = rec.signal_tx.send(Some(CnciSignal::Added));
        info!(
            tenant = %self.shared.tenant_id,
            cnci = %instance_id,
            ip = %ip,
            "CNCI active"
        );
    }

    /// Inbound: the CNCI instance stopped. Interpreted as an unexpected
    /// exit; the instance is restarted in place.
    pub async fn cnci_stopped(&self, instance_id: Uuid) {
        {
            let mut idx = self.shared.indexes.write().await;
            let Some(rec) = idx.cncis.get_mut(&instance_id) else {
                debug!(cnci = %instance_id, "Stopped event for unknown CNCI, discarding");
                return;
            };
            if rec.state == CnciState::Stopping {
                // Teardown in flight; the removed event finishes the job.
                return;
            }
            warn!(
                tenant = %self.shared.tenant_id,
                cnci = %instance_id,
                "CNCI exited unexpectedly, restarting"
            );
            rec.state = CnciState::Pending;
            // Fresh channel for the new boot cycle so stale added signals
            // cannot satisfy new waiters.
            let (tx, rx) = watch::channel(None);
            rec.signal_tx = tx;
            rec.signal_rx = rx;
        }
        if let Err(e) = self
            .shared
            .ops
            .restart_cnci(&self.shared.tenant_id, instance_id)
            .await
        {
            error!(cnci = %instance_id, error = %e, "CNCI restart emission failed");
        }
    }

    /// Inbound: the worker confirmed deletion.
    pub async fn cnci_removed(&self, instance_id: Uuid) {
        let mut idx = self.shared.indexes.write().await;
        let Some(rec) = idx.cncis.remove(&instance_id) else {
            return;
        };
        idx.subnets.retain(|_, id| *id != instance_id);
        let _ = rec.signal_tx.send(Some(CnciSignal::Removed));
        info!(tenant = %self.shared.tenant_id, cnci = %instance_id, "CNCI removed");
    }

    /// Inbound: the CNCI never came up. Not retryable from here; the
    /// record is dropped and every waiter fails.
    pub async fn start_failure(&self, instance_id: Uuid) {
        let mut idx = self.shared.indexes.write().await;
        let Some(rec) = idx.cncis.remove(&instance_id) else {
            return;
        };
        idx.subnets.retain(|_, id| *id != instance_id);
        let _ = rec.signal_tx.send(Some(CnciSignal::Failed));
        error!(
            tenant = %self.shared.tenant_id,
            cnci = %instance_id,
            subnet = %rec.subnet,
            "CNCI failed to start"
        );
    }

    pub async fn get_instance_cnci(&self, instance_id: Uuid) -> Option<CnciInfo> {
        let idx = self.shared.indexes.read().await;
        idx.cncis
            .get(&instance_id)
            .map(|r| r.info(&self.shared.tenant_id))
    }

    pub async fn get_subnet_cnci(&self, subnet: &str) -> Option<CnciInfo> {
        let idx = self.shared.indexes.read().await;
        idx.subnets
            .get(subnet)
            .and_then(|id| idx.cncis.get(id))
            .map(|r| r.info(&self.shared.tenant_id))
    }

    /// Whether this manager still tracks the instance as a CNCI.
    pub async fn is_cnci(&self, instance_id: Uuid) -> bool {
        let idx = self.shared.indexes.read().await;
        idx.cncis.contains_key(&instance_id)
    }

    /// Broadcast the tenant's full endpoint list to every managed CNCI.
    /// Emission failures are logged, not raised.
    pub async fn refresh(&self) {
        let (targets, endpoints) = {
            let idx = self.shared.indexes.read().await;
            let targets: Vec<Uuid> = idx.cncis.keys().copied().collect();
            let endpoints: Vec<CnciEndpoint> = idx
                .cncis
                .values()
                .map(|rec| CnciEndpoint {
                    subnet: rec.subnet.clone(),
                    tunnel_ip: tunnel_ip(&rec.subnet).to_string(),
                    tunnel_id: self.shared.tunnel_id,
                })
                .collect();
            (targets, endpoints)
        };

        for cnci_id in targets {
            if let Err(e) = self
                .shared
                .ops
                .send_refresh(cnci_id, endpoints.clone())
                .await
            {
                warn!(cnci = %cnci_id, error = %e, "CNCI refresh emission failed");
            }
        }
    }

    /// Cancel all pending teardown timers.
    pub async fn shutdown(&self) {
        let mut idx = self.shared.indexes.write().await;
        for rec in idx.cncis.values_mut() {
            if let Some(timer) = rec.teardown.take() {
                timer.abort();
            }
        }
    }

    async fn drop_record(&self, instance_id: Uuid) {
        let mut idx = self.shared.indexes.write().await;
        if idx.cncis.remove(&instance_id).is_some() {
            idx.subnets.retain(|_, id| *id != instance_id);
        }
    }

    async fn wait_for_signal(
        &self,
        mut rx: watch::Receiver<Option<CnciSignal>>,
        want: CnciSignal,
        subnet: &str,
    ) -> Result<()> {
        let wait = async {
            loop {
                let current = *rx.borrow();
                match current {
                    Some(CnciSignal::Failed) => {
                        return Err(Error::CnciUnavailable(subnet.to_string()));
                    }
                    Some(sig) if sig == want => return Ok(()),
                    _ => {}
                }
                rx.changed()
                    .await
                    .map_err(|_| Error::CnciUnavailable(subnet.to_string()))?;
            }
        };
        match tokio::time::timeout(self.shared.event_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("CNCI event")),
        }
    }
}

/// Tunnel endpoint address for a tenant subnet: the subnet int mapped into
/// 192.168.0.0/16, stable for as long as the subnet exists.
pub fn tunnel_ip(subnet: &str) -> Ipv4Addr {
    let base: Ipv4Addr = subnet
        .split('/')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    let octets = base.octets();
    Ipv4Addr::new(192, 168, octets[1], octets[2])
}
