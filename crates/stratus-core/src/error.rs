use thiserror::Error;

use crate::instance::InstanceState;

/// Controller error taxonomy.
///
/// Validation and resource errors surface to the caller with any partial
/// reservations rolled back. Transport errors are retryable by the caller.
/// Worker-reported failures arrive as events and are handled (state
/// reverted, resources released) rather than propagated.
#[derive(Debug, Error)]
pub enum Error {
    // --- validation ---
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },

    #[error("instance name already in use: {0}")]
    NameInUse(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("instance {0} still has a mapped external IP")]
    ExternalIpMapped(String),

    #[error("only exited instances may detach volumes")]
    InstanceNotExited,

    #[error("volume {id} is {state}, cannot {op}")]
    VolumeBusy {
        id: String,
        state: String,
        op: &'static str,
    },

    // --- resource ---
    #[error("quota exceeded for tenant {tenant}: {reason}")]
    QuotaExceeded { tenant: String, reason: String },

    #[error("tenant {0} has no free tenant IPs")]
    OutOfIps(String),

    #[error("cluster subnet space exhausted")]
    OutOfSubnets,

    #[error("external IP pool exhausted")]
    PoolExhausted,

    #[error("CNCI unavailable for subnet {0}")]
    CnciUnavailable(String),

    // --- transport ---
    #[error("transport: {0}")]
    Transport(String),

    // --- timeouts ---
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    // --- worker-reported ---
    #[error("worker reported start failure: {0}")]
    StartFailed(String),

    // --- glue ---
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller may usefully retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        let e = Error::QuotaExceeded {
            tenant: "acme".to_string(),
            reason: "instances at limit".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "quota exceeded for tenant acme: instances at limit"
        );

        let e = Error::CnciUnavailable("172.16.0.0/24".to_string());
        assert!(e.to_string().contains("172.16.0.0/24"));
    }

    #[test]
    fn test_retryable_classes() {
        assert!(Error::Transport("bus closed".to_string()).is_retryable());
        assert!(Error::Timeout("CNCI added event").is_retryable());
        assert!(!Error::OutOfSubnets.is_retryable());
        assert!(
            !Error::NotFound {
                kind: "instance",
                id: "x".to_string()
            }
            .is_retryable()
        );
    }
}
