use serde::{Deserialize, Serialize};

/// Subnet prefix length used when a tenant config does not name one.
pub const DEFAULT_SUBNET_BITS: u8 = 24;

/// Tenant identity and network sizing. Created on first use or by an
/// explicit admin call; everything else the tenant owns (instances, IPs,
/// quotas, CNCIs) lives in the dedicated components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Prefix length of this tenant's subnets (20-30; default /24).
    #[serde(default = "default_subnet_bits")]
    pub subnet_bits: u8,
    pub created_at: String,
}

fn default_subnet_bits() -> u8 {
    DEFAULT_SUBNET_BITS
}

impl Tenant {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            subnet_bits: DEFAULT_SUBNET_BITS,
            created_at: crate::time::utc_now(),
        }
    }

    pub fn host_bits(&self) -> u8 {
        32 - self.subnet_bits
    }
}
