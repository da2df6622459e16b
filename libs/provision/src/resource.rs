//! Resource model shared by providers, the poller and the relay API.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider-assigned resource identifier.
///
/// Providers disagree on the shape (DigitalOcean uses integers, others use
/// UUIDs), so the id is kept as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for ResourceId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle phase as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Accepted, not yet scheduled.
    New,
    Provisioning,
    /// Booted. Not necessarily addressable yet.
    Active,
    Off,
    Archive,
    #[serde(other)]
    Unknown,
}

impl Phase {
    /// Parses a provider status string. Unrecognised values map to `Unknown`
    /// rather than failing the poll.
    pub fn from_status(status: &str) -> Self {
        match status {
            "new" => Phase::New,
            "provisioning" => Phase::Provisioning,
            "active" | "ready" => Phase::Active,
            "off" => Phase::Off,
            "archive" => Phase::Archive,
            _ => Phase::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Active)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::New => write!(f, "new"),
            Phase::Provisioning => write!(f, "provisioning"),
            Phase::Active => write!(f, "active"),
            Phase::Off => write!(f, "off"),
            Phase::Archive => write!(f, "archive"),
            Phase::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub ip: IpAddr,
    pub kind: AddressKind,
}

impl NetworkAddress {
    pub fn public(ip: IpAddr) -> Self {
        Self {
            ip,
            kind: AddressKind::Public,
        }
    }
}

/// A provisioned (or provisioning) virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub phase: Phase,
    #[serde(default)]
    pub networks: Vec<NetworkAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Resource {
    /// The address a client should connect to.
    ///
    /// Public IPv4 first, then any public address, then whatever is assigned.
    pub fn primary_address(&self) -> Option<IpAddr> {
        let public = || {
            self.networks
                .iter()
                .filter(|n| n.kind == AddressKind::Public)
        };

        public()
            .find(|n| n.ip.is_ipv4())
            .or_else(|| public().next())
            .or_else(|| self.networks.first())
            .map(|n| n.ip)
    }

    /// Active with at least one address.
    pub fn is_ready(&self) -> bool {
        self.phase.is_active() && self.primary_address().is_some()
    }
}

/// What to create when no existing resource is reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub region: String,
    pub size: String,
    pub image: String,
    /// First-boot script (cloud-init user data). Passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Provider API credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken(String);

impl ApiToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiToken(<redacted>)")
    }
}

/// A request to obtain a ready machine.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Name given to a newly created machine.
    pub name: String,
    /// Name of an existing machine to reuse, if any.
    pub lookup_key: Option<String>,
    pub credential: ApiToken,
    pub machine: MachineSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(networks: Vec<NetworkAddress>) -> Resource {
        Resource {
            id: ResourceId::from(42),
            name: "web-1".to_string(),
            phase: Phase::Active,
            networks,
            region: None,
            size: None,
            created_at: None,
        }
    }

    #[test]
    fn test_primary_address_prefers_public_ipv4() {
        let r = resource(vec![
            NetworkAddress {
                ip: "10.0.0.5".parse().unwrap(),
                kind: AddressKind::Private,
            },
            NetworkAddress::public("2604:a880::1".parse().unwrap()),
            NetworkAddress::public("203.0.113.7".parse().unwrap()),
        ]);
        assert_eq!(r.primary_address(), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_primary_address_falls_back_to_private() {
        let r = resource(vec![NetworkAddress {
            ip: "10.0.0.5".parse().unwrap(),
            kind: AddressKind::Private,
        }]);
        assert_eq!(r.primary_address(), Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_active_without_address_is_not_ready() {
        let r = resource(vec![]);
        assert!(r.phase.is_active());
        assert!(!r.is_ready());
    }

    #[test]
    fn test_phase_from_status() {
        assert_eq!(Phase::from_status("new"), Phase::New);
        assert_eq!(Phase::from_status("active"), Phase::Active);
        assert_eq!(Phase::from_status("ready"), Phase::Active);
        assert_eq!(Phase::from_status("rebooting"), Phase::Unknown);
    }

    #[test]
    fn test_api_token_debug_is_redacted() {
        let token = ApiToken::new("dop_v1_secret");
        assert!(!format!("{token:?}").contains("secret"));
        assert_eq!(token.expose(), "dop_v1_secret");
    }
}
