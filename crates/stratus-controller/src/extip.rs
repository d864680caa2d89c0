use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use stratus_core::error::{Error, Result};

/// A shared pool of routable addresses: whole CIDR blocks plus loose
/// individual addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalIpPool {
    pub id: Uuid,
    pub name: String,
    pub subnets: Vec<String>,
    pub addresses: Vec<Ipv4Addr>,
}

impl ExternalIpPool {
    /// Every address this pool can hand out, in order. Network and
    /// broadcast addresses of each block are excluded.
    fn candidates(&self) -> Vec<Ipv4Addr> {
        let mut out = Vec::new();
        for cidr in &self.subnets {
            let Some((base, bits)) = parse_cidr(cidr) else {
                continue;
            };
            let size = 1u32 << (32 - bits);
            let base = u32::from(base);
            for offset in 1..size - 1 {
                out.push(Ipv4Addr::from(base + offset));
            }
        }
        out.extend(self.addresses.iter().copied());
        out
    }

    pub fn total_count(&self) -> usize {
        self.candidates().len()
    }
}

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, bits) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let bits: u8 = bits.parse().ok()?;
    if bits > 30 {
        return None;
    }
    Some((addr, bits))
}

/// A reserved pool address bound to a tenant instance's private IP.
/// `active` flips once the CNCI confirms the assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedIp {
    pub public_ip: Ipv4Addr,
    pub pool_id: Uuid,
    pub tenant_id: String,
    pub instance_id: Uuid,
    pub private_ip: String,
    pub active: bool,
}

#[derive(Default)]
struct PoolState {
    pools: HashMap<Uuid, ExternalIpPool>,
    mapped: HashMap<Ipv4Addr, MappedIp>,
}

/// Owns the external IP pools and the public->private mappings.
#[derive(Default)]
pub struct PoolManager {
    inner: RwLock<PoolState>,
}

/// Free/total accounting for one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub id: Uuid,
    pub name: String,
    pub free: usize,
    pub total: usize,
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_pool(&self, name: &str) -> ExternalIpPool {
        let pool = ExternalIpPool {
            id: Uuid::new_v4(),
            name: name.to_string(),
            subnets: Vec::new(),
            addresses: Vec::new(),
        };
        self.inner
            .write()
            .await
            .pools
            .insert(pool.id, pool.clone());
        info!(pool = %name, id = %pool.id, "External IP pool created");
        pool
    }

    pub async fn add_subnet(&self, pool_id: Uuid, cidr: &str) -> Result<()> {
        if parse_cidr(cidr).is_none() {
            return Err(Error::InvalidInput(format!("bad pool subnet: {}", cidr)));
        }
        let mut state = self.inner.write().await;
        let pool = state.pools.get_mut(&pool_id).ok_or(Error::NotFound {
            kind: "external IP pool",
            id: pool_id.to_string(),
        })?;
        pool.subnets.push(cidr.to_string());
        Ok(())
    }

    pub async fn add_addresses(&self, pool_id: Uuid, addresses: &[Ipv4Addr]) -> Result<()> {
        let mut state = self.inner.write().await;
        let pool = state.pools.get_mut(&pool_id).ok_or(Error::NotFound {
            kind: "external IP pool",
            id: pool_id.to_string(),
        })?;
        pool.addresses.extend_from_slice(addresses);
        Ok(())
    }

    /// Delete a pool. Refused while any of its addresses is mapped.
    pub async fn delete_pool(&self, pool_id: Uuid) -> Result<()> {
        let mut state = self.inner.write().await;
        if state.mapped.values().any(|m| m.pool_id == pool_id) {
            return Err(Error::InvalidInput(
                "pool has mapped addresses".to_string(),
            ));
        }
        state.pools.remove(&pool_id).ok_or(Error::NotFound {
            kind: "external IP pool",
            id: pool_id.to_string(),
        })?;
        Ok(())
    }

    pub async fn summaries(&self) -> Vec<PoolSummary> {
        let state = self.inner.read().await;
        let mut out: Vec<PoolSummary> = state
            .pools
            .values()
            .map(|pool| {
                let total = pool.total_count();
                let used = state
                    .mapped
                    .values()
                    .filter(|m| m.pool_id == pool.id)
                    .count();
                PoolSummary {
                    id: pool.id,
                    name: pool.name.clone(),
                    free: total - used,
                    total,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Reserve the lowest free address across all pools (sorted by pool
    /// name) for an instance's private IP.
    pub async fn reserve(
        &self,
        tenant_id: &str,
        instance_id: Uuid,
        private_ip: &str,
    ) -> Result<MappedIp> {
        let mut state = self.inner.write().await;
        let mut pools: Vec<ExternalIpPool> = state.pools.values().cloned().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));

        for pool in pools {
            for candidate in pool.candidates() {
                if state.mapped.contains_key(&candidate) {
                    continue;
                }
                let mapping = MappedIp {
                    public_ip: candidate,
                    pool_id: pool.id,
                    tenant_id: tenant_id.to_string(),
                    instance_id,
                    private_ip: private_ip.to_string(),
                    active: false,
                };
                state.mapped.insert(candidate, mapping.clone());
                return Ok(mapping);
            }
        }
        Err(Error::PoolExhausted)
    }

    /// Drop a reservation, returning what was mapped.
    pub async fn release(&self, public_ip: Ipv4Addr) -> Result<MappedIp> {
        self.inner
            .write()
            .await
            .mapped
            .remove(&public_ip)
            .ok_or_else(|| Error::NotFound {
                kind: "mapped IP",
                id: public_ip.to_string(),
            })
    }

    /// Mark a reservation confirmed by the CNCI.
    pub async fn mark_active(&self, public_ip: Ipv4Addr) {
        if let Some(m) = self.inner.write().await.mapped.get_mut(&public_ip) {
            m.active = true;
        }
    }

    pub async fn mapped_for_instance(&self, instance_id: Uuid) -> Option<MappedIp> {
        self.inner
            .read()
            .await
            .mapped
            .values()
            .find(|m| m.instance_id == instance_id)
            .cloned()
    }

    pub async fn mappings(&self, tenant_id: &str) -> Vec<MappedIp> {
        self.inner
            .read()
            .await
            .mapped
            .values()
            .filter(|m| m.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}
