use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Instance lifecycle state.
///
/// `Stopping` is entered when a stop command is issued and lasts until the
/// worker confirms with an instance-stopped event. `Hung` is terminal and
/// only entered when a synchronous delete times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Exited,
    Stopping,
    Deleted,
    Hung,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Stopping => write!(f, "stopping"),
            Self::Deleted => write!(f, "deleted"),
            Self::Hung => write!(f, "hung"),
        }
    }
}

/// Validate that a state transition is allowed.
///
/// Returns Ok(()) if the transition is valid, Err with explanation otherwise.
/// Illegal transitions must not change state.
pub fn validate_transition(from: InstanceState, to: InstanceState) -> Result<()> {
    // An instance-deleted event may arrive in any state, and any state may
    // be declared hung by a sync-delete timeout.
    if to == InstanceState::Deleted || to == InstanceState::Hung {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        // Worker acknowledged the boot (instance-added or a running stats sample)
        (InstanceState::Pending, InstanceState::Running)
        // Stop command issued
        | (InstanceState::Running, InstanceState::Stopping)
        // Worker confirmed the stop
        | (InstanceState::Stopping, InstanceState::Exited)
        // Worker-initiated exit
        | (InstanceState::Running, InstanceState::Exited)
        // Restart command issued
        | (InstanceState::Exited, InstanceState::Pending)
    );

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

/// An instance record, the persisted view of a requested or running
/// VM/container. Runtime synchronization (state lock, change broadcast)
/// lives in the controller; this is the pure data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub tenant_id: String,
    pub workload_id: Uuid,
    pub state: InstanceState,
    /// Worker node the instance was scheduled onto. Empty until the first
    /// event or stats sample names one.
    #[serde(default)]
    pub node_id: Option<String>,
    pub mac: String,
    /// Tenant private IP. CNCI instances carry none until the concentrator
    /// reports in.
    #[serde(default)]
    pub private_ip: Option<String>,
    /// Tenant subnet in CIDR form, e.g. "172.16.0.0/24".
    #[serde(default)]
    pub subnet: Option<String>,
    pub vnic_id: Uuid,
    pub is_cnci: bool,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub ssh_ip: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
}

impl Instance {
    /// Apply a state transition, enforcing the allowed edges.
    pub fn transition(&mut self, to: InstanceState) -> Result<()> {
        validate_transition(self.state, to)?;
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::utc_now;

    fn test_instance(state: InstanceState) -> Instance {
        Instance {
            id: Uuid::new_v4(),
            tenant_id: "acme".to_string(),
            workload_id: Uuid::new_v4(),
            state,
            node_id: None,
            mac: "02:fc:10:00:00:02".to_string(),
            private_ip: Some("172.16.0.2".to_string()),
            subnet: Some("172.16.0.0/24".to_string()),
            vnic_id: Uuid::new_v4(),
            is_cnci: false,
            name: None,
            created_at: utc_now(),
            ssh_ip: None,
            ssh_port: None,
        }
    }

    #[test]
    fn test_valid_transitions() {
        assert!(validate_transition(InstanceState::Pending, InstanceState::Running).is_ok());
        assert!(validate_transition(InstanceState::Running, InstanceState::Stopping).is_ok());
        assert!(validate_transition(InstanceState::Stopping, InstanceState::Exited).is_ok());
        assert!(validate_transition(InstanceState::Running, InstanceState::Exited).is_ok());
        assert!(validate_transition(InstanceState::Exited, InstanceState::Pending).is_ok());
    }

    #[test]
    fn test_deleted_and_hung_from_any() {
        for state in [
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::Exited,
            InstanceState::Stopping,
            InstanceState::Deleted,
            InstanceState::Hung,
        ] {
            assert!(
                validate_transition(state, InstanceState::Deleted).is_ok(),
                "{} -> deleted should be valid",
                state,
            );
            assert!(
                validate_transition(state, InstanceState::Hung).is_ok(),
                "{} -> hung should be valid",
                state,
            );
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(validate_transition(InstanceState::Pending, InstanceState::Exited).is_err());
        assert!(validate_transition(InstanceState::Pending, InstanceState::Stopping).is_err());
        assert!(validate_transition(InstanceState::Exited, InstanceState::Running).is_err());
        assert!(validate_transition(InstanceState::Stopping, InstanceState::Running).is_err());
        assert!(validate_transition(InstanceState::Exited, InstanceState::Stopping).is_err());
    }

    #[test]
    fn test_transition_rejects_without_mutating() {
        let mut inst = test_instance(InstanceState::Pending);
        let err = inst.transition(InstanceState::Stopping).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(inst.state, InstanceState::Pending);

        inst.transition(InstanceState::Running).unwrap();
        assert_eq!(inst.state, InstanceState::Running);
    }

    #[test]
    fn test_instance_json_roundtrip() {
        let inst = test_instance(InstanceState::Running);
        let json = serde_json::to_string_pretty(&inst).unwrap();
        let parsed: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, inst.id);
        assert_eq!(parsed.state, InstanceState::Running);
        assert_eq!(parsed.private_ip.as_deref(), Some("172.16.0.2"));
        assert_eq!(parsed.subnet.as_deref(), Some("172.16.0.0/24"));
        assert!(!parsed.is_cnci);
    }

    #[test]
    fn test_instance_backward_compat() {
        // JSON without the optional fields should deserialize with defaults
        let json = format!(
            r#"{{
                "id": "{}",
                "tenant_id": "acme",
                "workload_id": "{}",
                "state": "pending",
                "mac": "02:fc:10:00:00:02",
                "vnic_id": "{}",
                "is_cnci": false,
                "created_at": "2026-01-01T00:00:00Z"
            }}"#,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        let parsed: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.node_id, None);
        assert_eq!(parsed.private_ip, None);
        assert_eq!(parsed.name, None);
        assert_eq!(parsed.ssh_port, None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(InstanceState::Pending.to_string(), "pending");
        assert_eq!(InstanceState::Stopping.to_string(), "stopping");
        assert_eq!(InstanceState::Hung.to_string(), "hung");
    }
}
