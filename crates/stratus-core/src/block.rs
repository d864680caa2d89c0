use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::instance::InstanceState;

/// Block device state. Attach is legal only from `Available`; detach only
/// from `InUse`, and only while the owning instance is `Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Available,
    Attaching,
    InUse,
    Detaching,
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Attaching => write!(f, "attaching"),
            Self::InUse => write!(f, "in-use"),
            Self::Detaching => write!(f, "detaching"),
        }
    }
}

/// A tenant-owned block device. At most one instance may hold it at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDevice {
    pub id: Uuid,
    pub tenant_id: String,
    pub size_gb: u64,
    pub state: BlockState,
    /// Internal devices (CNCI roots, ephemeral boot disks) bypass quota and
    /// are hidden from the user-facing volume listing.
    #[serde(default)]
    pub internal: bool,
    pub created_at: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl BlockDevice {
    /// Move to `Attaching`. Only an available device may be attached.
    pub fn begin_attach(&mut self) -> Result<()> {
        if self.state != BlockState::Available {
            return Err(Error::VolumeBusy {
                id: self.id.to_string(),
                state: self.state.to_string(),
                op: "attach",
            });
        }
        self.state = BlockState::Attaching;
        Ok(())
    }

    /// Move to `Detaching`. Requires the device be in use and the owning
    /// instance exited.
    pub fn begin_detach(&mut self, owner_state: InstanceState) -> Result<()> {
        if self.state != BlockState::InUse {
            return Err(Error::VolumeBusy {
                id: self.id.to_string(),
                state: self.state.to_string(),
                op: "detach",
            });
        }
        if owner_state != InstanceState::Exited {
            return Err(Error::InstanceNotExited);
        }
        self.state = BlockState::Detaching;
        Ok(())
    }
}

/// Binds a block device to the instance holding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageAttachment {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub block_id: Uuid,
    pub boot: bool,
    /// Ephemeral attachments are destroyed along with the instance.
    pub ephemeral: bool,
}

impl StorageAttachment {
    pub fn new(instance_id: Uuid, block_id: Uuid, boot: bool, ephemeral: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            block_id,
            boot,
            ephemeral,
        }
    }
}
