use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::instance::InstanceState;
use crate::workload::{Firmware, VmType};

/// Maximum frame size on the bus (1 MiB).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ============================================================================
// Start payload
// ============================================================================

/// Per-instance vNIC configuration carried in a start payload.
///
/// Tenant instances get the full overlay wiring; a CNCI boots with just a
/// MAC and learns its addresses from the infrastructure network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Networking {
    Tenant {
        vnic_id: Uuid,
        vnic_mac: String,
        subnet: String,
        private_ip: String,
        concentrator_id: Uuid,
        concentrator_ip: String,
    },
    Concentrator {
        vnic_mac: String,
    },
}

/// A block device reference the worker should attach at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageReference {
    pub block_id: Uuid,
    pub bootable: bool,
    pub ephemeral: bool,
}

/// Trailing metadata block handed to the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub uuid: Uuid,
    pub hostname: String,
}

/// Everything a worker needs to boot one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPayload {
    pub tenant_id: String,
    pub instance_id: Uuid,
    pub firmware: Firmware,
    pub vm_type: VmType,
    /// Always "host": instances live on node-local storage.
    pub persistence: String,
    pub vcpus: u32,
    pub mem_mb: u64,
    pub disk_gb: u64,
    pub networking: Networking,
    #[serde(default)]
    pub storage: Vec<StorageReference>,
    #[serde(default)]
    pub docker_image: Option<String>,
    /// Set when re-launching an exited instance with its prior wiring.
    #[serde(default)]
    pub restart: bool,
    pub metadata: InstanceMetadata,
}

// ============================================================================
// Commands (controller -> workers / CNCIs)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Start {
        payload: StartPayload,
        /// Trace label + submission timestamp when the launch is traced.
        #[serde(default)]
        trace: Option<TraceContext>,
    },
    Delete {
        instance_id: Uuid,
        node_id: String,
        /// Stop keeps the instance record and its wiring for a later restart.
        stop: bool,
    },
    Evacuate {
        node_id: String,
    },
    Restore {
        node_id: String,
    },
    AttachVolume {
        volume_id: Uuid,
        instance_id: Uuid,
        node_id: String,
    },
    DetachVolume {
        volume_id: Uuid,
        instance_id: Uuid,
        node_id: String,
    },
    AssignPublicIp {
        cnci_id: Uuid,
        tenant_id: String,
        instance_id: Uuid,
        public_ip: String,
        private_ip: String,
    },
    ReleasePublicIp {
        cnci_id: Uuid,
        tenant_id: String,
        instance_id: Uuid,
        public_ip: String,
        private_ip: String,
    },
    RefreshCnci {
        cnci_id: Uuid,
        endpoints: Vec<CnciEndpoint>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceContext {
    pub label: String,
    pub started_at: String,
}

/// One tunnel endpoint in a CNCI refresh broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CnciEndpoint {
    pub subnet: String,
    pub tunnel_ip: String,
    pub tunnel_id: u32,
}

// ============================================================================
// Events (workers / CNCIs -> controller)
// ============================================================================

/// One per-instance sample inside a node stats frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSample {
    pub instance_id: Uuid,
    pub state: InstanceState,
    #[serde(default)]
    pub ssh_ip: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    pub vcpus: u32,
    pub mem_mb: u64,
    pub disk_mb: u64,
    /// Volumes the worker sees attached, for reconciling attach commands.
    #[serde(default)]
    pub attached_volumes: Vec<Uuid>,
}

/// Periodic per-node telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatsReport {
    pub node_id: String,
    pub mem_total_mb: u64,
    pub mem_available_mb: u64,
    pub load: f64,
    #[serde(default)]
    pub instances: Vec<InstanceSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Stats(NodeStatsReport),
    TraceReport {
        label: String,
        frames: Vec<serde_json::Value>,
    },
    InstanceDeleted {
        instance_id: Uuid,
        node_id: String,
    },
    InstanceStopped {
        instance_id: Uuid,
        node_id: String,
    },
    ConcentratorAdded {
        instance_id: Uuid,
        tenant_id: String,
        subnet: String,
        ip: String,
        mac: String,
    },
    NodeConnected {
        node_id: String,
        hostname: String,
    },
    NodeDisconnected {
        node_id: String,
    },
    PublicIpAssigned {
        instance_id: Uuid,
        public_ip: String,
        private_ip: String,
    },
    PublicIpUnassigned {
        instance_id: Uuid,
        public_ip: String,
        private_ip: String,
    },
}

// ============================================================================
// Worker-reported failures
// ============================================================================

/// Why a start did not happen. Fatal reasons mean the instance will never
/// boot and its resources must be torn down; the rest leave the instance in
/// place for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFailureReason {
    FullCloud,
    NoComputeNodes,
    InvalidPayload,
    ImageFailure,
    LaunchFailure,
    AlreadyRunning,
}

impl StartFailureReason {
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::FullCloud | Self::NoComputeNodes | Self::InvalidPayload | Self::ImageFailure
        )
    }
}

impl std::fmt::Display for StartFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FullCloud => "full_cloud",
            Self::NoComputeNodes => "no_compute_nodes",
            Self::InvalidPayload => "invalid_payload",
            Self::ImageFailure => "image_failure",
            Self::LaunchFailure => "launch_failure",
            Self::AlreadyRunning => "already_running",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Failure {
    StartFailure {
        instance_id: Uuid,
        reason: StartFailureReason,
        /// Set when the failed start was a restart of an exited instance.
        #[serde(default)]
        restart: bool,
    },
    AttachVolumeFailure {
        instance_id: Uuid,
        volume_id: Uuid,
        message: String,
    },
    DeleteFailure {
        instance_id: Uuid,
        message: String,
    },
    AssignPublicIpFailure {
        instance_id: Uuid,
        public_ip: String,
        message: String,
    },
    UnassignPublicIpFailure {
        instance_id: Uuid,
        public_ip: String,
        message: String,
    },
}

// ============================================================================
// Frame protocol (length-prefixed JSON)
// ============================================================================

/// The unit of exchange on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Command(Command),
    Event(Event),
    Failure(Failure),
}

/// Read a length-prefixed JSON frame from a tokio AsyncRead.
pub async fn read_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(crate::error::Error::Transport(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed JSON frame to a tokio AsyncWrite.
pub async fn write_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize and send a frame.
pub async fn send_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<()> {
    let data = serde_json::to_vec(frame)?;
    write_frame(writer, &data).await
}

/// Read and deserialize a frame.
pub async fn recv_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Frame> {
    let data = read_frame(reader).await?;
    Ok(serde_json::from_slice(&data)?)
}
