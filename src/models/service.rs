use serde::{Deserialize, Serialize};

/// Connectivity service types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    PointToPoint,
    Multipoint,
    RootedMultipoint,
}

impl ServiceType {
    /// Multipoint and rooted-multipoint services are realised as bridge domains
    pub fn is_bridge_domain(&self) -> bool {
        matches!(self, ServiceType::Multipoint | ServiceType::RootedMultipoint)
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceType::PointToPoint => "POINT_TO_POINT",
            ServiceType::Multipoint => "MULTIPOINT",
            ServiceType::RootedMultipoint => "ROOTED_MULTIPOINT",
        };
        f.write_str(s)
    }
}

/// E-Tree endpoint role. Roots are hub (SPE) ports, leaves are CPE ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Root,
    Leaf,
}

/// Endpoint is one attachment point (a port on a device) of a service.
///
/// Device and port names are not stored; they are parsed out of
/// `sip_id` by a [`crate::topology::SipParser`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub topology_id: String,
    /// Service interface point id, e.g. `sip:ovs-node-1:eth3`
    pub sip_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<EndpointRole>,
}

impl Endpoint {
    pub fn new(topology_id: impl Into<String>, sip_id: impl Into<String>) -> Self {
        Self {
            topology_id: topology_id.into(),
            sip_id: sip_id.into(),
            local_id: None,
            role: None,
        }
    }

    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    pub fn with_role(mut self, role: EndpointRole) -> Self {
        self.role = Some(role);
        self
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topology_id, self.sip_id)
    }
}

/// ConnectivityService is a provisioning request across two or more endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityService {
    pub service_id: String,
    pub service_type: ServiceType,
    #[serde(default)]
    pub is_exclusive: bool,
    pub endpoints: Vec<Endpoint>,
}

impl ConnectivityService {
    pub fn new(service_id: impl Into<String>, service_type: ServiceType, endpoints: Vec<Endpoint>) -> Self {
        Self {
            service_id: service_id.into(),
            service_type,
            is_exclusive: false,
            endpoints,
        }
    }

    pub fn exclusive(mut self, is_exclusive: bool) -> Self {
        self.is_exclusive = is_exclusive;
        self
    }

    /// Generate a service id of the form `{millis-hex}:{random-hex}`
    pub fn generate_id() -> String {
        format!(
            "{:x}:{:x}",
            chrono::Utc::now().timestamp_millis(),
            rand::random::<u32>()
        )
    }
}

/// ServiceRequest is a service-change event handed to the activation service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "service", rename_all = "snake_case")]
pub enum ServiceRequest {
    Create(ConnectivityService),
    Update(ConnectivityService),
    Delete(String),
}

impl ServiceRequest {
    pub fn service_id(&self) -> &str {
        match self {
            ServiceRequest::Create(s) | ServiceRequest::Update(s) => &s.service_id,
            ServiceRequest::Delete(id) => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_serde() {
        let json = serde_json::to_string(&ServiceType::RootedMultipoint).unwrap();
        assert_eq!(json, "\"ROOTED_MULTIPOINT\"");
        let parsed: ServiceType = serde_json::from_str("\"POINT_TO_POINT\"").unwrap();
        assert_eq!(parsed, ServiceType::PointToPoint);
    }

    #[test]
    fn test_bridge_domain_types() {
        assert!(!ServiceType::PointToPoint.is_bridge_domain());
        assert!(ServiceType::Multipoint.is_bridge_domain());
        assert!(ServiceType::RootedMultipoint.is_bridge_domain());
    }

    #[test]
    fn test_generated_id_shape() {
        let id = ConnectivityService::generate_id();
        let parts: Vec<&str> = id.split(':').collect();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| u64::from_str_radix(p, 16).is_ok()));
    }

    #[test]
    fn test_request_serde() {
        let req = ServiceRequest::Delete("svc-1".to_string());
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["op"], "delete");
        assert_eq!(req.service_id(), "svc-1");
    }
}
