//! DigitalOcean droplet API client.
//!
//! Implements [`ResourceProvider`] against the v2 REST API:
//! - `POST /v2/droplets`
//! - `GET /v2/droplets/{id}`
//! - `GET /v2/droplets?name={name}`
//! - `DELETE /v2/droplets/{id}`

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::ProviderError;
use crate::provider::{ProviderFactory, ResourceProvider};
use crate::resource::{
    AddressKind, ApiToken, MachineSpec, NetworkAddress, Phase, Resource, ResourceId,
};

/// Public API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.digitalocean.com";

/// Droplet API client bound to one API token.
pub struct DigitalOceanProvider {
    client: reqwest::Client,
    base_url: String,
    token: ApiToken,
}

impl DigitalOceanProvider {
    pub fn new(base_url: impl Into<String>, token: ApiToken) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, base_url, token))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, token: ApiToken) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turns a non-success response into a `ProviderError`, preferring the API's
/// own `message` field over the raw body.
async fn error_from_response(response: reqwest::Response, action: &str) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %body, "Failed to {action}");

    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| b.message)
        .unwrap_or_else(|_| {
            if body.is_empty() {
                status.to_string()
            } else {
                body
            }
        });

    ProviderError::with_status(status.as_u16(), format!("Failed to {action}: {message}"))
}

#[async_trait]
impl ResourceProvider for DigitalOceanProvider {
    async fn create(&self, name: &str, spec: &MachineSpec) -> Result<Resource, ProviderError> {
        let url = self.url("/v2/droplets");
        debug!(name = %name, region = %spec.region, size = %spec.size, "Creating droplet");

        let request = CreateDropletRequest {
            name,
            region: &spec.region,
            size: &spec.size,
            image: &spec.image,
            user_data: spec.user_data.as_deref(),
            ssh_keys: &spec.ssh_keys,
            tags: &spec.tags,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, "create droplet").await);
        }

        let body: DropletEnvelope = response.json().await?;
        Ok(body.droplet.into())
    }

    async fn fetch(&self, id: &ResourceId) -> Result<Resource, ProviderError> {
        let url = self.url(&format!("/v2/droplets/{id}"));

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token.expose())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, "fetch droplet").await);
        }

        let body: DropletEnvelope = response.json().await?;
        Ok(body.droplet.into())
    }

    async fn find(&self, name: &str) -> Result<Option<Resource>, ProviderError> {
        let url = self.url("/v2/droplets");

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token.expose())
            .query(&[("name", name)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, "list droplets").await);
        }

        let body: DropletList = response.json().await?;
        // The name filter is a prefix match on some API versions.
        Ok(body
            .droplets
            .into_iter()
            .find(|d| d.name == name)
            .map(Resource::from))
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ProviderError> {
        let url = self.url(&format!("/v2/droplets/{id}"));
        debug!(resource_id = %id, "Deleting droplet");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(self.token.expose())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, "delete droplet").await);
        }

        Ok(())
    }
}

/// Builds a [`DigitalOceanProvider`] per credential over one shared client.
pub struct DigitalOceanFactory {
    client: reqwest::Client,
    base_url: String,
}

impl DigitalOceanFactory {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl ProviderFactory for DigitalOceanFactory {
    fn provider(&self, credential: &ApiToken) -> Arc<dyn ResourceProvider> {
        Arc::new(DigitalOceanProvider::with_client(
            self.client.clone(),
            self.base_url.clone(),
            credential.clone(),
        ))
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct CreateDropletRequest<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
    #[serde(skip_serializing_if = "slice_is_empty")]
    ssh_keys: &'a [String],
    #[serde(skip_serializing_if = "slice_is_empty")]
    tags: &'a [String],
}

fn slice_is_empty(values: &&[String]) -> bool {
    values.is_empty()
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct DropletList {
    #[serde(default)]
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    networks: DropletNetworks,
    #[serde(default)]
    region: Option<DropletRegion>,
    #[serde(default)]
    size_slug: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct DropletNetworks {
    #[serde(default)]
    v4: Vec<DropletNetwork>,
    #[serde(default)]
    v6: Vec<DropletNetwork>,
}

#[derive(Debug, Deserialize)]
struct DropletNetwork {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct DropletRegion {
    slug: String,
}

impl From<Droplet> for Resource {
    fn from(d: Droplet) -> Self {
        let networks = d
            .networks
            .v4
            .iter()
            .chain(d.networks.v6.iter())
            .filter_map(|n| match n.ip_address.parse::<IpAddr>() {
                Ok(ip) => Some(NetworkAddress {
                    ip,
                    kind: if n.kind == "public" {
                        AddressKind::Public
                    } else {
                        AddressKind::Private
                    },
                }),
                Err(_) => {
                    warn!(droplet_id = d.id, ip = %n.ip_address, "Skipping unparseable droplet address");
                    None
                }
            })
            .collect();

        Resource {
            id: ResourceId::from(d.id),
            name: d.name,
            phase: Phase::from_status(&d.status),
            networks,
            region: d.region.map(|r| r.slug),
            size: d.size_slug,
            created_at: d.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_droplet_deserialization() {
        let json = r#"{
            "droplet": {
                "id": 3164444,
                "name": "example.com",
                "memory": 1024,
                "status": "active",
                "created_at": "2020-07-21T18:37:44Z",
                "networks": {
                    "v4": [
                        {"ip_address": "10.128.192.124", "netmask": "255.255.0.0", "gateway": "nil", "type": "private"},
                        {"ip_address": "192.241.165.154", "netmask": "255.255.240.0", "gateway": "192.241.160.1", "type": "public"}
                    ],
                    "v6": [
                        {"ip_address": "2604:a880:0:1010::18a:a001", "netmask": 64, "gateway": "2604:a880:0:1010::1", "type": "public"}
                    ]
                },
                "region": {"name": "New York 3", "slug": "nyc3"},
                "size_slug": "s-1vcpu-1gb"
            }
        }"#;

        let envelope: DropletEnvelope = serde_json::from_str(json).unwrap();
        let resource = Resource::from(envelope.droplet);
        assert_eq!(resource.id.as_str(), "3164444");
        assert_eq!(resource.phase, Phase::Active);
        assert_eq!(resource.networks.len(), 3);
        assert_eq!(resource.region.as_deref(), Some("nyc3"));
        assert_eq!(
            resource.primary_address(),
            Some("192.241.165.154".parse().unwrap())
        );
    }

    #[test]
    fn test_new_droplet_has_no_networks() {
        let json = r#"{"droplet": {"id": 1, "name": "a", "status": "new", "networks": {}}}"#;
        let envelope: DropletEnvelope = serde_json::from_str(json).unwrap();
        let resource = Resource::from(envelope.droplet);
        assert_eq!(resource.phase, Phase::New);
        assert!(!resource.is_ready());
    }

    #[test]
    fn test_create_request_omits_empty_fields() {
        let request = CreateDropletRequest {
            name: "box",
            region: "nyc3",
            size: "s-1vcpu-1gb",
            image: "ubuntu-24-04-x64",
            user_data: None,
            ssh_keys: &[],
            tags: &[],
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"image\":\"ubuntu-24-04-x64\""));
        assert!(!json.contains("user_data"));
        assert!(!json.contains("ssh_keys"));
    }
}
