//! Resource provider interface and mock implementation.
//!
//! The provider interface abstracts the IaaS API:
//! - Creating a machine from a spec
//! - Fetching its current phase and addresses
//! - Finding a machine by name
//! - Deleting it
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::error::ProviderError;
use crate::resource::{ApiToken, MachineSpec, NetworkAddress, Phase, Resource, ResourceId};

/// IaaS API operations the launcher and poller depend on.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Create a machine. Returns as soon as the provider accepts the request,
    /// typically in phase `new`.
    async fn create(&self, name: &str, spec: &MachineSpec) -> Result<Resource, ProviderError>;

    /// Fetch the current state of a machine.
    async fn fetch(&self, id: &ResourceId) -> Result<Resource, ProviderError>;

    /// Find a machine by exact name.
    async fn find(&self, name: &str) -> Result<Option<Resource>, ProviderError>;

    /// Delete a machine.
    async fn delete(&self, id: &ResourceId) -> Result<(), ProviderError>;
}

/// Builds a provider bound to one caller's credential.
pub trait ProviderFactory: Send + Sync {
    fn provider(&self, credential: &ApiToken) -> Arc<dyn ResourceProvider>;
}

/// Factory that hands out one shared provider regardless of credential.
pub struct StaticProviderFactory {
    provider: Arc<dyn ResourceProvider>,
}

impl StaticProviderFactory {
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self { provider }
    }
}

impl ProviderFactory for StaticProviderFactory {
    fn provider(&self, _credential: &ApiToken) -> Arc<dyn ResourceProvider> {
        Arc::clone(&self.provider)
    }
}

#[derive(Debug)]
struct MockEntry {
    resource: Resource,
    fetches: u32,
}

/// In-memory provider for tests and local development.
///
/// Created machines report `new` until they have been fetched
/// `ready_after` times, then `active` with a public address.
pub struct MockProvider {
    entries: Mutex<HashMap<ResourceId, MockEntry>>,
    next_id: AtomicU64,
    fetch_count: AtomicU32,
    /// `None` means created machines never become ready.
    ready_after: Option<u32>,
    fail_fetches: bool,
}

impl MockProvider {
    /// A provider whose machines become ready on the third fetch.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1000),
            fetch_count: AtomicU32::new(0),
            ready_after: Some(3),
            fail_fetches: false,
        }
    }

    pub fn ready_after(mut self, fetches: u32) -> Self {
        self.ready_after = Some(fetches);
        self
    }

    /// Machines stay in `new` forever.
    pub fn never_ready(mut self) -> Self {
        self.ready_after = None;
        self
    }

    /// Every fetch fails with a 500.
    pub fn failing_fetches(mut self) -> Self {
        self.fail_fetches = true;
        self
    }

    /// Seed an existing machine, as if created earlier.
    pub fn insert(&self, resource: Resource) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            resource.id.clone(),
            MockEntry {
                resource,
                fetches: 0,
            },
        );
    }

    /// Total number of fetch calls served.
    pub fn fetch_count(&self) -> u32 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(id)
    }

    fn address_for(id: u64) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, (id % 250) as u8 + 1))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProvider for MockProvider {
    async fn create(&self, name: &str, spec: &MachineSpec) -> Result<Resource, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(
            name = %name,
            region = %spec.region,
            size = %spec.size,
            "[MOCK] Creating machine"
        );

        let resource = Resource {
            id: ResourceId::from(id),
            name: name.to_string(),
            phase: Phase::New,
            networks: Vec::new(),
            region: Some(spec.region.clone()),
            size: Some(spec.size.clone()),
            created_at: Some(Utc::now()),
        };
        self.insert(resource.clone());
        Ok(resource)
    }

    async fn fetch(&self, id: &ResourceId) -> Result<Resource, ProviderError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches {
            return Err(ProviderError::with_status(500, "mock provider unavailable"));
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(id).ok_or_else(|| {
            ProviderError::with_status(404, "The resource you were accessing could not be found.")
        })?;

        entry.fetches += 1;
        if entry.resource.phase == Phase::New
            && self.ready_after.is_some_and(|n| entry.fetches >= n)
        {
            let numeric = id.as_str().parse::<u64>().unwrap_or(0);
            entry.resource.phase = Phase::Active;
            entry.resource.networks = vec![NetworkAddress::public(Self::address_for(numeric))];
        }

        debug!(
            resource_id = %id,
            phase = %entry.resource.phase,
            fetches = entry.fetches,
            "[MOCK] Fetched machine"
        );
        Ok(entry.resource.clone())
    }

    async fn find(&self, name: &str) -> Result<Option<Resource>, ProviderError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .values()
            .find(|e| e.resource.name == name)
            .map(|e| e.resource.clone()))
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ProviderError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.remove(id) {
            Some(_) => {
                info!(resource_id = %id, "[MOCK] Deleted machine");
                Ok(())
            }
            None => Err(ProviderError::with_status(
                404,
                "The resource you were accessing could not be found.",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> MachineSpec {
        MachineSpec {
            region: "nyc3".to_string(),
            size: "s-1vcpu-1gb".to_string(),
            image: "ubuntu-24-04-x64".to_string(),
            user_data: None,
            ssh_keys: Vec::new(),
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_becomes_active_after_configured_fetches() {
        let provider = MockProvider::new().ready_after(2);
        let created = provider.create("box", &spec()).await.unwrap();
        assert_eq!(created.phase, Phase::New);

        let first = provider.fetch(&created.id).await.unwrap();
        assert_eq!(first.phase, Phase::New);
        assert!(first.networks.is_empty());

        let second = provider.fetch(&created.id).await.unwrap();
        assert!(second.is_ready());
        assert_eq!(provider.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_find_and_delete() {
        let provider = MockProvider::new();
        let created = provider.create("box", &spec()).await.unwrap();

        let found = provider.find("box").await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(created.id.clone()));
        assert!(provider.find("other").await.unwrap().is_none());

        provider.delete(&created.id).await.unwrap();
        assert!(!provider.contains(&created.id));
        let err = provider.delete(&created.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_static_factory_ignores_credential() {
        let mock = Arc::new(MockProvider::new());
        let factory = StaticProviderFactory::new(mock.clone());
        let provider = factory.provider(&ApiToken::new("anything"));
        provider.create("box", &spec()).await.unwrap();
        assert!(mock.find("box").await.unwrap().is_some());
    }
}
