use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;

use tokio::sync::Mutex;
use tracing::debug;

use stratus_core::error::{Error, Result};

/// Base of the tenant overlay space: 172.0.0.0/8. Subnets are carved from
/// the 24 bits below it, so the encoded 172.{b0}.{b1}.{host} form is stable
/// across restarts and allocation is reproducible.
const NET_BASE: u32 = 0xAC00_0000;
const SPACE_BITS: u8 = 24;

/// An address handed to an instance, with the subnet it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedIp {
    pub ip: Ipv4Addr,
    pub subnet: String,
}

struct SubnetAlloc {
    /// Offset of the subnet's first address within the overlay space.
    base: u32,
    /// Host numbers in use.
    used: BTreeSet<u32>,
}

struct TenantNets {
    host_bits: u8,
    /// Keyed by base offset, so scans run in sorted order.
    subnets: BTreeMap<u32, SubnetAlloc>,
}

/// Owns every tenant's subnet set and the in-use host numbers within each.
///
/// New subnets come from a cluster-wide cursor: two tenants share the
/// numbering space but never a specific subnet. Within a tenant,
/// allocation prefers filling existing subnets in sorted order before
/// opening a new one. Host numbers 0 and 1 are reserved; a subnet is full
/// at 2^host_bits - 2 allocations.
pub struct NetworkAllocator {
    inner: Mutex<AllocState>,
}

struct AllocState {
    tenants: HashMap<String, TenantNets>,
    /// Next free offset in the overlay space.
    next_base: u32,
}

impl Default for NetworkAllocator {
    fn default() -> Self {
        Self {
            inner: Mutex::new(AllocState {
                tenants: HashMap::new(),
                next_base: 0,
            }),
        }
    }
}

fn subnet_cidr(base: u32, host_bits: u8) -> String {
    let addr = Ipv4Addr::from(NET_BASE | base);
    format!("{}/{}", addr, 32 - host_bits)
}

impl NetworkAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `count` addresses for a tenant whose subnets span
    /// `host_bits` host bits.
    ///
    /// Partially satisfied requests are fully rolled back.
    pub async fn allocate_pool(
        &self,
        tenant_id: &str,
        host_bits: u8,
        count: usize,
    ) -> Result<Vec<AllocatedIp>> {
        let mut state = self.inner.lock().await;
        let mut out = Vec::with_capacity(count);

        for _ in 0..count {
            match Self::allocate_one(&mut state, tenant_id, host_bits) {
                Ok(ip) => out.push(ip),
                Err(e) => {
                    for ip in &out {
                        Self::release_locked(&mut state, tenant_id, ip.ip);
                    }
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    fn allocate_one(state: &mut AllocState, tenant_id: &str, host_bits: u8) -> Result<AllocatedIp> {
        let capacity = (1u32 << host_bits) - 2;
        let nets = state
            .tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantNets {
                host_bits,
                subnets: BTreeMap::new(),
            });

        // First fit across the tenant's existing subnets, in sorted order.
        for (base, subnet) in nets.subnets.iter_mut() {
            if subnet.used.len() as u32 >= capacity {
                continue;
            }
            let host = (2..(1u32 << host_bits))
                .find(|h| !subnet.used.contains(h))
                .expect("subnet below capacity has a free host");
            subnet.used.insert(host);
            return Ok(AllocatedIp {
                ip: Ipv4Addr::from(NET_BASE | (base + host)),
                subnet: subnet_cidr(*base, host_bits),
            });
        }

        // No capacity left: open a fresh subnet at the cluster cursor.
        let size = 1u32 << host_bits;
        let base = state.next_base.div_ceil(size) * size;
        if base + size > 1 << SPACE_BITS {
            return Err(Error::OutOfSubnets);
        }
        state.next_base = base + size;

        let mut used = BTreeSet::new();
        used.insert(2);
        nets.subnets.insert(base, SubnetAlloc { base, used });
        debug!(
            tenant = %tenant_id,
            subnet = %subnet_cidr(base, host_bits),
            "Opened tenant subnet"
        );
        Ok(AllocatedIp {
            ip: Ipv4Addr::from(NET_BASE | (base + 2)),
            subnet: subnet_cidr(base, host_bits),
        })
    }

    /// Allocate `count` addresses out of one specific tenant subnet, for
    /// requests that pin placement. Fails without residue if the subnet
    /// cannot hold them all.
    pub async fn allocate_in_subnet(
        &self,
        tenant_id: &str,
        subnet: &str,
        count: usize,
    ) -> Result<Vec<AllocatedIp>> {
        let mut state = self.inner.lock().await;
        let nets = state.tenants.get_mut(tenant_id).ok_or(Error::NotFound {
            kind: "tenant subnet",
            id: format!("{}/{}", tenant_id, subnet),
        })?;
        let host_bits = nets.host_bits;
        let capacity = (1u32 << host_bits) - 2;
        let alloc = nets
            .subnets
            .values_mut()
            .find(|s| subnet_cidr(s.base, host_bits) == subnet)
            .ok_or(Error::NotFound {
                kind: "tenant subnet",
                id: format!("{}/{}", tenant_id, subnet),
            })?;
        if alloc.used.len() + count > capacity as usize {
            return Err(Error::OutOfIps(tenant_id.to_string()));
        }

        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let host = (2..(1u32 << host_bits))
                .find(|h| !alloc.used.contains(h))
                .expect("capacity checked above");
            alloc.used.insert(host);
            out.push(AllocatedIp {
                ip: Ipv4Addr::from(NET_BASE | (alloc.base + host)),
                subnet: subnet.to_string(),
            });
        }
        Ok(out)
    }

    /// Return an address to its tenant's pool.
    pub async fn release(&self, tenant_id: &str, ip: Ipv4Addr) -> Result<()> {
        let mut state = self.inner.lock().await;
        if Self::release_locked(&mut state, tenant_id, ip) {
            Ok(())
        } else {
            Err(Error::NotFound {
                kind: "tenant IP",
                id: format!("{}/{}", tenant_id, ip),
            })
        }
    }

    fn release_locked(state: &mut AllocState, tenant_id: &str, ip: Ipv4Addr) -> bool {
        let Some(nets) = state.tenants.get_mut(tenant_id) else {
            return false;
        };
        let offset = u32::from(ip) & ((1 << SPACE_BITS) - 1);
        let base = offset >> nets.host_bits << nets.host_bits;
        let host = offset - base;
        nets.subnets
            .get_mut(&base)
            .map(|s| s.used.remove(&host))
            .unwrap_or(false)
    }

    /// The tenant's subnets, in CIDR form, sorted.
    pub async fn subnets(&self, tenant_id: &str) -> Vec<String> {
        let state = self.inner.lock().await;
        state
            .tenants
            .get(tenant_id)
            .map(|nets| {
                nets.subnets
                    .values()
                    .map(|s| subnet_cidr(s.base, nets.host_bits))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of in-use addresses on one of the tenant's subnets.
    pub async fn used_in_subnet(&self, tenant_id: &str, subnet: &str) -> usize {
        let state = self.inner.lock().await;
        state
            .tenants
            .get(tenant_id)
            .and_then(|nets| {
                nets.subnets
                    .values()
                    .find(|s| subnet_cidr(s.base, nets.host_bits) == subnet)
                    .map(|s| s.used.len())
            })
            .unwrap_or(0)
    }
}

/// Host number of an address within a subnet of `host_bits` host bits.
pub fn host_number(ip: Ipv4Addr, host_bits: u8) -> u32 {
    u32::from(ip) & ((1 << host_bits) - 1)
}
