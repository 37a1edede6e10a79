//! Agent-wide configuration (ambient stack addition, SPEC_FULL.md §2):
//! a `derive_builder`-generated builder for assembling a validated,
//! immutable config value once at startup.

use std::time::Duration;

use derive_builder::Builder;

use crate::codec::control::HEALTHCHECK_PERIOD;

/// Static configuration the agent is constructed with. Everything here
/// is read-only after construction; runtime-mutable state (deployment
/// records, pending work) lives in the components themselves.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct AgentConfig {
    /// Base URL of the deployment service (spec.md §6).
    pub server_url: String,

    /// Tenant token presented on first authentication (spec.md §4.5.3),
    /// absent for servers that don't require one.
    #[builder(default)]
    pub tenant_token: Option<String>,

    /// Poll interval for the deployment engine's tick (spec.md §4.5.2).
    #[builder(default = "Duration::from_secs(600)")]
    pub poll_interval: Duration,

    /// Retry backoff floor after a failed deployment (spec.md §4.5.2).
    #[builder(default = "Duration::from_secs(300)")]
    pub retry_interval: Duration,

    /// Cadence of the interactive channel's healthcheck work item
    /// (spec.md §4.6.5).
    #[builder(default = "HEALTHCHECK_PERIOD")]
    pub healthcheck_period: Duration,

    /// How long a deployment may sit in `AFTER_REBOOT` awaiting
    /// `confirm_image` before the core treats it as a failed upgrade
    /// (spec.md §4.5.2's rollback-on-no-confirm policy).
    #[builder(default = "Duration::from_secs(600)")]
    pub commit_timeout: Duration,

    /// How long `WorkMutex::acquire` should wait for the inventory/
    /// configuration keystores before giving up (spec.md §4.4).
    #[builder(default = "Some(Duration::from_secs(30))")]
    pub keystore_lock_timeout: Option<Duration>,
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }
}
