//! Readiness poller.
//!
//! Drives one machine from `new` to usable by polling the provider at a fixed
//! interval:
//!
//! ```text
//! requested --(first fetch)--> provisioning --(active + address)--> ready
//!                                  |--(fetch error)--> failed
//!                                  '--(attempt cap)--> timed_out
//! ```
//!
//! There is no grace delay after readiness: the poller returns on the first
//! poll that sees `active` with an address. Whether sshd inside the machine
//! is up yet is the session bridge's concern.
//!
//! Cancellation is by dropping the future. The only timer is the
//! `tokio::time::sleep` between polls, which is dropped with it.

use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::provider::ResourceProvider;
use crate::resource::{Phase, Resource, ResourceId};

/// Default delay before each poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default attempt cap (about 200 seconds at the default interval).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay before each fetch, including the first.
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Poller-side lifecycle of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionPhase {
    Requested,
    Provisioning,
    Ready,
    Failed,
    TimedOut,
}

impl ProvisionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisionPhase::Ready | ProvisionPhase::Failed | ProvisionPhase::TimedOut
        )
    }
}

/// Tracks one in-flight wait. Frozen once the phase is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionState {
    pub resource_id: ResourceId,
    pub phase: ProvisionPhase,
    pub attempts: u32,
    pub last_status: String,
}

impl ProvisionState {
    fn new(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            phase: ProvisionPhase::Requested,
            attempts: 0,
            last_status: "requested".to_string(),
        }
    }

    fn observe(&mut self, attempt: u32, max_attempts: u32, resource: &Resource) {
        if self.phase.is_terminal() {
            return;
        }
        self.phase = ProvisionPhase::Provisioning;
        self.attempts = attempt;
        self.last_status = format!(
            "Machine {} is {} (attempt {attempt}/{max_attempts})",
            resource.name, resource.phase
        );
    }

    fn finish(&mut self, phase: ProvisionPhase) {
        if !self.phase.is_terminal() {
            self.phase = phase;
        }
    }
}

/// One progress report, sent after every poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollProgress {
    pub attempt: u32,
    pub max_attempts: u32,
    pub resource_phase: Phase,
    pub state: ProvisionState,
}

impl PollProgress {
    /// Human-readable status line.
    pub fn message(&self) -> &str {
        &self.state.last_status
    }
}

/// Receives progress reports from a wait.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, progress: &PollProgress);
}

/// Ignores progress.
impl ProgressListener for () {
    fn on_progress(&self, _progress: &PollProgress) {}
}

/// Forwards progress to a channel. A closed receiver is ignored.
impl ProgressListener for mpsc::UnboundedSender<PollProgress> {
    fn on_progress(&self, progress: &PollProgress) {
        let _ = self.send(progress.clone());
    }
}

/// A machine that passed the readiness check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadyResource {
    pub resource: Resource,
    /// Address a client should connect to.
    pub address: IpAddr,
    /// Polls it took; zero when the machine was already ready.
    pub attempts: u32,
}

impl ReadyResource {
    /// Wraps a resource that is already ready, without polling.
    pub fn from_ready(resource: Resource) -> Option<Self> {
        if !resource.is_ready() {
            return None;
        }
        let address = resource.primary_address()?;
        Some(Self {
            resource,
            address,
            attempts: 0,
        })
    }
}

/// Fixed-interval readiness poller.
#[derive(Debug, Clone, Default)]
pub struct ReadinessPoller {
    policy: PollPolicy,
}

impl ReadinessPoller {
    pub fn new(policy: PollPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Poll until the machine is active with an address, the attempt cap is
    /// hit, or the provider fails.
    pub async fn wait_until_ready(
        &self,
        provider: &dyn ResourceProvider,
        id: &ResourceId,
        listener: &dyn ProgressListener,
    ) -> Result<ReadyResource, ProvisionError> {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts;
        let mut state = ProvisionState::new(id.clone());

        info!(
            resource_id = %id,
            interval_ms = self.policy.interval.as_millis() as u64,
            max_attempts,
            "Waiting for machine to become ready"
        );

        for attempt in 1..=max_attempts {
            tokio::time::sleep(self.policy.interval).await;

            let resource = match provider.fetch(id).await {
                Ok(resource) => resource,
                Err(e) => {
                    state.finish(ProvisionPhase::Failed);
                    warn!(resource_id = %id, attempt, error = %e, "Readiness poll failed");
                    return Err(ProvisionError::Provider(e));
                }
            };

            state.observe(attempt, max_attempts, &resource);
            let address = resource.primary_address().filter(|_| resource.phase.is_active());
            if address.is_some() {
                state.finish(ProvisionPhase::Ready);
            }

            debug!(
                resource_id = %id,
                attempt,
                phase = %resource.phase,
                addresses = resource.networks.len(),
                "Polled machine"
            );

            listener.on_progress(&PollProgress {
                attempt,
                max_attempts,
                resource_phase: resource.phase,
                state: state.clone(),
            });

            if let Some(address) = address {
                info!(
                    resource_id = %id,
                    address = %address,
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Machine is ready"
                );
                return Ok(ReadyResource {
                    resource,
                    address,
                    attempts: attempt,
                });
            }
        }

        state.finish(ProvisionPhase::TimedOut);
        let elapsed = started.elapsed();
        warn!(resource_id = %id, attempts = max_attempts, ?elapsed, "Machine did not become ready");

        Err(ProvisionError::Timeout {
            resource: id.to_string(),
            attempts: max_attempts,
            elapsed,
            last_status: state.last_status,
        })
    }
}
