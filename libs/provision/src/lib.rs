//! Cloud machine provisioning.
//!
//! This library turns "I want a machine" into "here is a machine with an
//! address you can SSH to". Key pieces:
//!
//! - **Provider**: the IaaS API behind the [`ResourceProvider`] trait, with a
//!   DigitalOcean implementation and an in-memory mock.
//! - **Poller**: [`ReadinessPoller`] polls a machine at a fixed interval until
//!   it is active and addressed, or gives up after a fixed number of attempts.
//! - **Launcher**: [`Launcher`] finds or creates the machine for a request and
//!   drives the poller.
//!
//! # Invariants
//!
//! - A machine is only reported ready when it is `active` AND has an address
//! - Provider failures are never retried inside a wait
//! - A wait performs at most `max_attempts` fetches

pub mod digitalocean;
pub mod error;
pub mod launcher;
pub mod poller;
pub mod provider;
pub mod resource;

pub use digitalocean::{DigitalOceanFactory, DigitalOceanProvider};
pub use error::{ProviderError, ProvisionError};
pub use launcher::Launcher;
pub use poller::{
    PollPolicy, PollProgress, ProgressListener, ProvisionPhase, ProvisionState, ReadinessPoller,
    ReadyResource,
};
pub use provider::{MockProvider, ProviderFactory, ResourceProvider, StaticProviderFactory};
pub use resource::{
    AddressKind, ApiToken, MachineSpec, NetworkAddress, Phase, ProvisionRequest, Resource,
    ResourceId,
};
