use async_trait::async_trait;
use serde::Serialize;

use crate::error::DriverError;
use crate::topology::DriverFamily;

/// ConfigIntent describes one device-side change a driver wants applied.
/// The configurator decides how it is rendered on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIntent {
    pub service_id: String,
    pub device: String,
    pub port: String,
    pub family: DriverFamily,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    /// Far end as `device:port`, absent for single-endpoint intents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    pub exclusive: bool,
}

impl std::fmt::Display for ConfigIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}:{}", self.family, self.device, self.port)?;
        if let Some(vlan) = self.vlan_id {
            write!(f, " vlan {}", vlan)?;
        }
        if let Some(peer) = &self.peer {
            write!(f, " -> {}", peer)?;
        }
        Ok(())
    }
}

/// DeviceConfigurator pushes intents to network elements
#[async_trait]
pub trait DeviceConfigurator: Send + Sync {
    async fn apply(&self, intent: &ConfigIntent) -> Result<(), DriverError>;

    async fn remove(&self, intent: &ConfigIntent) -> Result<(), DriverError>;
}

/// Configurator that only logs. Used when no southbound is wired in.
#[derive(Debug, Default, Clone)]
pub struct LoggingConfigurator;

#[async_trait]
impl DeviceConfigurator for LoggingConfigurator {
    async fn apply(&self, intent: &ConfigIntent) -> Result<(), DriverError> {
        tracing::info!("[{}] apply {}", intent.service_id, intent);
        Ok(())
    }

    async fn remove(&self, intent: &ConfigIntent) -> Result<(), DriverError> {
        tracing::info!("[{}] remove {}", intent.service_id, intent);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_display() {
        let intent = ConfigIntent {
            service_id: "svc".to_string(),
            device: "r1".to_string(),
            port: "ge0".to_string(),
            family: DriverFamily::Tunnel,
            vlan_id: Some(100),
            peer: Some("r2:ge1".to_string()),
            exclusive: false,
        };
        assert_eq!(intent.to_string(), "tunnel r1:ge0 vlan 100 -> r2:ge1");
    }
}
