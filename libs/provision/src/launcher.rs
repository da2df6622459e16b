//! Launcher: find-or-create a machine, then wait for it.

use std::sync::Arc;

use tracing::info;

use crate::error::ProvisionError;
use crate::poller::{PollPolicy, ProgressListener, ReadinessPoller, ReadyResource};
use crate::provider::ProviderFactory;
use crate::resource::{ApiToken, ProvisionRequest, Resource, ResourceId};

/// Entry point for provisioning on behalf of a credential holder.
#[derive(Clone)]
pub struct Launcher {
    providers: Arc<dyn ProviderFactory>,
    poller: ReadinessPoller,
}

impl Launcher {
    pub fn new(providers: Arc<dyn ProviderFactory>, policy: PollPolicy) -> Self {
        Self {
            providers,
            poller: ReadinessPoller::new(policy),
        }
    }

    /// Reuse the machine named by `lookup_key` if one exists, otherwise
    /// create one. Does not wait.
    pub async fn start(&self, request: &ProvisionRequest) -> Result<Resource, ProvisionError> {
        let provider = self.providers.provider(&request.credential);

        if let Some(key) = request.lookup_key.as_deref() {
            if let Some(existing) = provider.find(key).await? {
                info!(
                    resource_id = %existing.id,
                    name = %existing.name,
                    phase = %existing.phase,
                    "Reusing existing machine"
                );
                return Ok(existing);
            }
        }

        let created = provider.create(&request.name, &request.machine).await?;
        info!(
            resource_id = %created.id,
            name = %created.name,
            region = %request.machine.region,
            "Machine created"
        );
        Ok(created)
    }

    /// [`start`](Self::start), then wait for readiness unless the machine is
    /// already ready.
    pub async fn launch(
        &self,
        request: &ProvisionRequest,
        listener: &dyn ProgressListener,
    ) -> Result<ReadyResource, ProvisionError> {
        let resource = self.start(request).await?;
        match ReadyResource::from_ready(resource.clone()) {
            Some(ready) => Ok(ready),
            None => self.poll(&request.credential, &resource.id, listener).await,
        }
    }

    /// Wait for an existing machine. A machine that is already ready is
    /// returned after a single fetch, without waiting an interval.
    pub async fn wait(
        &self,
        credential: &ApiToken,
        id: &ResourceId,
        listener: &dyn ProgressListener,
    ) -> Result<ReadyResource, ProvisionError> {
        let current = self.describe(credential, id).await?;
        if let Some(ready) = ReadyResource::from_ready(current) {
            info!(resource_id = %id, "Machine already ready");
            return Ok(ready);
        }
        self.poll(credential, id, listener).await
    }

    async fn poll(
        &self,
        credential: &ApiToken,
        id: &ResourceId,
        listener: &dyn ProgressListener,
    ) -> Result<ReadyResource, ProvisionError> {
        let provider = self.providers.provider(credential);
        self.poller
            .wait_until_ready(provider.as_ref(), id, listener)
            .await
    }

    pub async fn describe(
        &self,
        credential: &ApiToken,
        id: &ResourceId,
    ) -> Result<Resource, ProvisionError> {
        let provider = self.providers.provider(credential);
        Ok(provider.fetch(id).await?)
    }

    pub async fn teardown(&self, credential: &ApiToken, id: &ResourceId) -> Result<(), ProvisionError> {
        let provider = self.providers.provider(credential);
        provider.delete(id).await?;
        info!(resource_id = %id, "Machine deleted");
        Ok(())
    }
}
