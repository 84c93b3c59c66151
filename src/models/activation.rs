use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the last orchestration run for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationStatus {
    Active,
    Failed,
}

impl std::fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivationStatus::Active => f.write_str("ACTIVE"),
            ActivationStatus::Failed => f.write_str("FAILED"),
        }
    }
}

/// ActivationRecord is kept in the operational partition while a service is
/// (or failed to become) active
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub service_id: String,
    pub status: ActivationStatus,
    pub updated_at: DateTime<Utc>,
}

/// VlanAllocation binds a service name to a VLAN id within one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanAllocation {
    pub service_name: String,
    pub vlan_id: u16,
}
