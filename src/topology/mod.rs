//! Endpoint pairing and locality classification.
//!
//! Turns the endpoint set of a service into the ordered [`WorkUnit`]s the
//! orchestrator resolves drivers for.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{Endpoint, ServiceType};

/// Extracts device and port names from a service interface point id.
///
/// The id is split on the delimiter; the second-to-last token is the device
/// and the last token is the port.
#[derive(Debug, Clone)]
pub struct SipParser {
    delimiter: String,
}

impl Default for SipParser {
    fn default() -> Self {
        Self::new(":")
    }
}

impl SipParser {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }

    /// `(device, port)` or None when the id has fewer than two non-empty tokens
    pub fn split<'a>(&self, sip_id: &'a str) -> Option<(&'a str, &'a str)> {
        let mut tokens = sip_id.rsplit(self.delimiter.as_str());
        let port = tokens.next()?;
        let device = tokens.next()?;
        if device.is_empty() || port.is_empty() {
            return None;
        }
        Some((device, port))
    }

    /// Device name, or the whole id when it cannot be split
    pub fn device_of<'a>(&self, sip_id: &'a str) -> &'a str {
        self.split(sip_id).map(|(device, _)| device).unwrap_or(sip_id)
    }

    pub fn port_of<'a>(&self, sip_id: &'a str) -> Option<&'a str> {
        self.split(sip_id).map(|(_, port)| port)
    }

    pub fn is_same_device(&self, a: &Endpoint, b: &Endpoint) -> bool {
        self.device_of(&a.sip_id) == self.device_of(&b.sip_id)
    }
}

/// Whether both ends of a work unit sit on the same device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Locality {
    Local,
    Remote,
}

/// Driver family a work unit is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverFamily {
    /// Same-device cross-connect
    CrossConnect,
    /// Inter-device tunnel
    Tunnel,
    /// Bridge domain confined to one device
    LocalBridgeDomain,
    /// Bridge domain spanning devices
    BridgeDomain,
}

impl fmt::Display for DriverFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverFamily::CrossConnect => "cross-connect",
            DriverFamily::Tunnel => "tunnel",
            DriverFamily::LocalBridgeDomain => "local-bridge-domain",
            DriverFamily::BridgeDomain => "bridge-domain",
        };
        f.write_str(s)
    }
}

/// WorkUnit is one ordered endpoint pair to activate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub local: Endpoint,
    /// Equal to `local` for single-endpoint units
    pub remote: Endpoint,
    pub local_device: String,
    pub remote_device: String,
    pub locality: Locality,
    pub family: DriverFamily,
}

impl WorkUnit {
    fn pair(parser: &SipParser, local: &Endpoint, remote: &Endpoint, family: DriverFamily) -> Self {
        let local_device = parser.device_of(&local.sip_id).to_string();
        let remote_device = parser.device_of(&remote.sip_id).to_string();
        let locality = if local_device == remote_device {
            Locality::Local
        } else {
            Locality::Remote
        };
        Self {
            local: local.clone(),
            remote: remote.clone(),
            local_device,
            remote_device,
            locality,
            family,
        }
    }

    /// Unit whose remote end is the endpoint itself
    pub fn single(parser: &SipParser, endpoint: &Endpoint, family: DriverFamily) -> Self {
        Self::pair(parser, endpoint, endpoint, family)
    }

    pub fn is_single(&self) -> bool {
        self.local == self.remote
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{} [{}]", self.local.sip_id, self.family)
        } else {
            write!(f, "{} -> {} [{}]", self.local.sip_id, self.remote.sip_id, self.family)
        }
    }
}

/// EndpointTopologyResolver partitions a service's endpoints into work units
#[derive(Debug, Clone, Default)]
pub struct EndpointTopologyResolver {
    parser: SipParser,
}

impl EndpointTopologyResolver {
    pub fn new(parser: SipParser) -> Self {
        Self { parser }
    }

    pub fn parser(&self) -> &SipParser {
        &self.parser
    }

    /// Ordered pairs `(E, N)` for every endpoint and every other endpoint.
    ///
    /// Both orderings of each pair are emitted. Bridge-domain services
    /// spanning several devices skip same-device pairs.
    pub fn pairs_for(&self, endpoints: &[Endpoint], service_type: ServiceType) -> Vec<WorkUnit> {
        if service_type.is_bridge_domain() {
            self.bridge_domain_pairs(endpoints)
        } else {
            self.ordered_pairs(endpoints, |unit_local| {
                if unit_local {
                    DriverFamily::CrossConnect
                } else {
                    DriverFamily::Tunnel
                }
            })
        }
    }

    fn bridge_domain_pairs(&self, endpoints: &[Endpoint]) -> Vec<WorkUnit> {
        let devices: BTreeSet<&str> = endpoints
            .iter()
            .map(|e| self.parser.device_of(&e.sip_id))
            .collect();

        if devices.len() <= 1 {
            return self.ordered_pairs(endpoints, |_| DriverFamily::LocalBridgeDomain);
        }

        self.ordered_pairs(endpoints, |_| DriverFamily::BridgeDomain)
            .into_iter()
            .filter(|unit| unit.locality == Locality::Remote)
            .collect()
    }

    fn ordered_pairs(&self, endpoints: &[Endpoint], family: impl Fn(bool) -> DriverFamily) -> Vec<WorkUnit> {
        let mut units = Vec::with_capacity(endpoints.len() * endpoints.len().saturating_sub(1));
        for (i, endpoint) in endpoints.iter().enumerate() {
            for (j, neighbor) in endpoints.iter().enumerate() {
                if i == j {
                    continue;
                }
                let same_device = self.parser.is_same_device(endpoint, neighbor);
                units.push(WorkUnit::pair(&self.parser, endpoint, neighbor, family(same_device)));
            }
        }
        units
    }
}
