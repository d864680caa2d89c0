use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use stratus_core::error::{Error, Result};
use stratus_core::workload::{ResourceKind, ResourceRequest};

/// Per-tenant counted resource reservations.
///
/// The ledger is the sole admission gate: a consume request either
/// increments every requested kind or none of them. Operations on one
/// tenant serialize on that tenant's account mutex; CNCI instances and
/// internal volumes bypass the ledger explicitly at their call sites.
pub struct QuotaLedger {
    accounts: Mutex<HashMap<String, Arc<Mutex<QuotaAccount>>>>,
}

#[derive(Debug, Default)]
struct QuotaAccount {
    /// Absent or negative limit means unlimited.
    limits: HashMap<ResourceKind, i64>,
    usage: HashMap<ResourceKind, u64>,
}

/// One row of a quota snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaEntry {
    pub kind: ResourceKind,
    /// -1 means unlimited.
    pub limit: i64,
    pub usage: u64,
}

/// An administrative limit update; -1 removes the limit.
#[derive(Debug, Clone, Copy)]
pub struct LimitUpdate {
    pub kind: ResourceKind,
    pub limit: i64,
}

impl Default for QuotaLedger {
    fn default() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
        }
    }
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn account(&self, tenant_id: &str) -> Arc<Mutex<QuotaAccount>> {
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(QuotaAccount::default())))
            .clone()
    }

    /// Atomically consume a set of resource increments.
    ///
    /// Either every increment is applied or none are. Duplicate kinds in
    /// one request are summed before the check, so a workload asking for
    /// root disk plus volume disk is admitted (or refused) as one number.
    pub async fn consume(&self, tenant_id: &str, requests: &[ResourceRequest]) -> Result<()> {
        let account = self.account(tenant_id).await;
        let mut account = account.lock().await;

        let mut wanted: BTreeMap<ResourceKind, u64> = BTreeMap::new();
        for req in requests {
            *wanted.entry(req.kind).or_insert(0) += req.value;
        }

        for (kind, add) in &wanted {
            let limit = account.limits.get(kind).copied().unwrap_or(-1);
            if limit < 0 {
                continue;
            }
            let current = account.usage.get(kind).copied().unwrap_or(0);
            if current + add > limit as u64 {
                return Err(Error::QuotaExceeded {
                    tenant: tenant_id.to_string(),
                    reason: format!(
                        "{}: {} + {} exceeds limit {}",
                        kind, current, add, limit
                    ),
                });
            }
        }

        for (kind, add) in wanted {
            *account.usage.entry(kind).or_insert(0) += add;
        }
        Ok(())
    }

    /// Unconditionally return resources. Counters floor at zero.
    pub async fn release(&self, tenant_id: &str, resources: &[ResourceRequest]) {
        let account = self.account(tenant_id).await;
        let mut account = account.lock().await;

        for req in resources {
            let current = account.usage.entry(req.kind).or_insert(0);
            if *current < req.value {
                warn!(
                    tenant = %tenant_id,
                    kind = %req.kind,
                    usage = *current,
                    release = req.value,
                    "Quota release below zero, flooring"
                );
                *current = 0;
            } else {
                *current -= req.value;
            }
        }
    }

    /// Administrative limit update. A value of -1 removes the limit.
    pub async fn update(&self, tenant_id: &str, limits: &[LimitUpdate]) {
        let account = self.account(tenant_id).await;
        let mut account = account.lock().await;

        for update in limits {
            if update.limit < 0 {
                account.limits.remove(&update.kind);
            } else {
                account.limits.insert(update.kind, update.limit);
            }
        }
    }

    /// Snapshot of limits and usage for reporting.
    pub async fn dump(&self, tenant_id: &str) -> Vec<QuotaEntry> {
        let account = self.account(tenant_id).await;
        let account = account.lock().await;

        const ALL_KINDS: [ResourceKind; 8] = [
            ResourceKind::Instances,
            ResourceKind::Vcpus,
            ResourceKind::MemMb,
            ResourceKind::DiskGb,
            ResourceKind::SharedDiskGb,
            ResourceKind::Volumes,
            ResourceKind::Images,
            ResourceKind::ExternalIps,
        ];
        ALL_KINDS
            .iter()
            .map(|kind| QuotaEntry {
                kind: *kind,
                limit: account.limits.get(kind).copied().unwrap_or(-1),
                usage: account.usage.get(kind).copied().unwrap_or(0),
            })
            .collect()
    }

    /// Current usage of a single kind, for invariant checks and tests.
    pub async fn usage(&self, tenant_id: &str, kind: ResourceKind) -> u64 {
        let account = self.account(tenant_id).await;
        let account = account.lock().await;
        account.usage.get(&kind).copied().unwrap_or(0)
    }
}
