use std::fmt;

/// Persistence failure raised by a [`crate::db::DataStore`] implementation
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} {path} failed: {source}")]
    Persistence {
        op: &'static str,
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("malformed value at {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn persistence(
        op: &'static str,
        path: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Persistence {
            op,
            path: path.into(),
            source: source.into(),
        }
    }
}

/// VLAN allocation errors
#[derive(Debug, thiserror::Error)]
pub enum VlanError {
    #[error("All VLAN IDs are in use. VLAN pool {0} exhausted.")]
    PoolExhausted(String),
    #[error("invalid VLAN range {start}-{end}: {reason}")]
    InvalidRange { start: u16, end: u16, reason: String },
    #[error("no SPE sub-range generated for root VLAN {0}")]
    NoSubRange(u16),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error returned by an activation driver from one of its lifecycle calls
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver used before initialize")]
    NotInitialized,
    #[error("device {device} rejected configuration: {reason}")]
    Device { device: String, reason: String },
    #[error(transparent)]
    Vlan(#[from] VlanError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Driver lifecycle call that was in progress when a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Activate,
    Deactivate,
    Commit,
    Rollback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Activate => "activate",
            Phase::Deactivate => "deactivate",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the activation orchestrator and the activation service
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("invalid service request: {0}")]
    InvalidRequest(String),
    #[error("no activation driver found for service {0}")]
    DriverResolution(String),
    #[error("driver {driver} failed to {phase} {unit}: {source}")]
    DriverActivation {
        driver: String,
        phase: Phase,
        unit: String,
        #[source]
        source: DriverError,
    },
    #[error("driver {driver} failed to commit: {source}")]
    Commit {
        driver: String,
        #[source]
        source: DriverError,
    },
    #[error("service {0} is already activated")]
    AlreadyActive(String),
    #[error("service {0} is not activated")]
    NotActive(String),
    #[error("service {0} not found")]
    NotFound(String),
    #[error("service {0} already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhausted_message() {
        let err = VlanError::PoolExhausted("ovs-1".to_string());
        assert_eq!(err.to_string(), "All VLAN IDs are in use. VLAN pool ovs-1 exhausted.");
    }

    #[test]
    fn test_driver_activation_message() {
        let err = ActivationError::DriverActivation {
            driver: "vlan-tagged".to_string(),
            phase: Phase::Activate,
            unit: "a -> z".to_string(),
            source: DriverError::Vlan(VlanError::PoolExhausted("n1".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("driver vlan-tagged failed to activate a -> z"));
        assert!(msg.contains("exhausted"));
    }

    #[test]
    fn test_persistence_from_anyhow() {
        let err = StoreError::persistence("write", "operational/activation/s1", anyhow::anyhow!("disk full"));
        assert_eq!(err.to_string(), "write operational/activation/s1 failed: disk full");
    }
}
