use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counted resource kinds tracked by the quota ledger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instances,
    Vcpus,
    MemMb,
    DiskGb,
    SharedDiskGb,
    Volumes,
    Images,
    ExternalIps,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Instances => "instances",
            Self::Vcpus => "vcpus",
            Self::MemMb => "mem_mb",
            Self::DiskGb => "disk_gb",
            Self::SharedDiskGb => "shared_disk_gb",
            Self::Volumes => "volumes",
            Self::Images => "images",
            Self::ExternalIps => "external_ips",
        };
        write!(f, "{}", s)
    }
}

/// A single (kind, amount) increment requested from or returned to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub kind: ResourceKind,
    pub value: u64,
}

impl ResourceRequest {
    pub fn new(kind: ResourceKind, value: u64) -> Self {
        Self { kind, value }
    }
}

/// Firmware flavor baked into a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Firmware {
    Efi,
    Legacy,
}

/// Hypervisor variant a workload runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmType {
    FullVm,
    Container,
}

/// Default per-instance resource requests carried by a workload.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkloadDefaults {
    pub vcpus: u32,
    pub mem_mb: u64,
    pub disk_gb: u64,
}

/// A storage resource the workload wants attached at boot, in order.
///
/// `existing` names a block device already owned by the tenant; when it is
/// None a fresh device of `size_gb` is created, ephemeral or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSpec {
    #[serde(default)]
    pub existing: Option<Uuid>,
    pub bootable: bool,
    pub ephemeral: bool,
    #[serde(default)]
    pub size_gb: u64,
}

/// An immutable recipe for launching instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: Uuid,
    /// Owning tenant; None means cluster-wide (the CNCI workload is one).
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub description: String,
    pub firmware: Firmware,
    pub vm_type: VmType,
    pub image_name: String,
    #[serde(default)]
    pub docker_image: Option<String>,
    /// Cloud-init user data handed to the guest verbatim.
    #[serde(default)]
    pub config: String,
    pub defaults: WorkloadDefaults,
    #[serde(default)]
    pub storage: Vec<StorageSpec>,
    /// The distinguished cluster-wide concentrator workload.
    #[serde(default)]
    pub is_cnci: bool,
}

impl Workload {
    /// The all-or-nothing admission request for one instance of this
    /// workload: the instance slot itself paired with its defaults, plus a
    /// volume slot and disk for every storage resource that will be created.
    pub fn resource_demands(&self) -> Vec<ResourceRequest> {
        let mut demands = vec![
            ResourceRequest::new(ResourceKind::Instances, 1),
            ResourceRequest::new(ResourceKind::Vcpus, self.defaults.vcpus as u64),
            ResourceRequest::new(ResourceKind::MemMb, self.defaults.mem_mb),
            ResourceRequest::new(ResourceKind::DiskGb, self.defaults.disk_gb),
        ];
        for spec in self.storage.iter().filter(|s| s.existing.is_none()) {
            demands.push(ResourceRequest::new(ResourceKind::Volumes, 1));
            demands.push(ResourceRequest::new(ResourceKind::DiskGb, spec.size_gb));
        }
        demands
    }
}
