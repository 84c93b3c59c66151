use std::collections::HashSet;

use crate::error::ActivationError;
use crate::models::ConnectivityService;
use crate::topology::SipParser;

/// Check a create or update request before it reaches the orchestrator
pub fn validate_service(service: &ConnectivityService, parser: &SipParser) -> Result<(), ActivationError> {
    let invalid = |msg: String| Err(ActivationError::InvalidRequest(msg));

    if service.service_id.trim().is_empty() {
        return invalid("service id is empty".to_string());
    }
    if service.endpoints.len() < 2 {
        return invalid(format!(
            "service {} needs at least 2 endpoints, got {}",
            service.service_id,
            service.endpoints.len()
        ));
    }

    let mut local_ids = HashSet::new();
    let mut sip_ids = HashSet::new();
    for endpoint in &service.endpoints {
        if let Some(local_id) = &endpoint.local_id {
            if !local_ids.insert(local_id.as_str()) {
                return invalid(format!("duplicate endpoint local id {}", local_id));
            }
        }
        if !sip_ids.insert(endpoint.sip_id.as_str()) {
            return invalid(format!("duplicate service interface point {}", endpoint.sip_id));
        }
        if parser.split(&endpoint.sip_id).is_none() {
            return invalid(format!("cannot derive device and port from {}", endpoint.sip_id));
        }
    }

    Ok(())
}

/// Update requests must name an existing service of the same type
pub fn validate_update(
    existing: Option<&ConnectivityService>,
    updated: &ConnectivityService,
    parser: &SipParser,
) -> Result<(), ActivationError> {
    let Some(existing) = existing else {
        return Err(ActivationError::NotFound(updated.service_id.clone()));
    };
    if existing.service_type != updated.service_type {
        return Err(ActivationError::InvalidRequest(format!(
            "service {} cannot change type from {} to {}",
            updated.service_id, existing.service_type, updated.service_type
        )));
    }
    validate_service(updated, parser)
}
