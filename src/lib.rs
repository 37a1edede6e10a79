//! Core, platform-independent logic for an embedded OTA update agent
//! (spec.md §1). Everything that touches real hardware or a real
//! network socket is a trait the platform implements; this crate only
//! knows how to drive those traits correctly.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod deployment;
pub mod error;
pub mod flash;
pub mod http;
pub mod identity;
pub mod kv_store;
pub mod logging;
pub mod scheduler;
pub mod tar;

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::codec::control::{ChannelSender, NoopChannelSender};
use crate::codec::shell::{NoopShellIo, ShellIo, ShellSession};
use crate::config::AgentConfig;
use crate::crypto::DemoSigner;
use crate::deployment::{DeploymentEngine, NoopRebootTrigger};
use crate::error::AgentResult;
use crate::flash::FlashSlot;
use crate::http::HttpClient;
use crate::identity::{CryptoSigner, Identity};
use crate::kv_store::KvStore;
use crate::scheduler::{WorkParams, WorkScheduler};

/// Top-level agent: owns the scheduler and registers the deployment
/// engine's tick, the interactive channel's healthcheck, and the
/// inventory-publish/configuration-sync pair as the periodic work items
/// a platform integration needs (spec.md §4.4, §4.5.2, §4.6.5; inventory
/// and configuration sync per SPEC_FULL.md §3).
pub struct Agent<K, F, H, S>
where
    K: KvStore + 'static,
    F: FlashSlot + 'static,
    H: HttpClient + 'static,
    S: CryptoSigner + 'static,
{
    pub scheduler: WorkScheduler,
    pub deployment: Arc<DeploymentEngine<K, F, H, S, NoopRebootTrigger>>,
    pub http: Arc<H>,
    /// The shell session the interactive channel's dispatcher and the
    /// healthcheck work item both observe (spec.md §4.6.3, §4.6.5). A
    /// platform's channel-dispatch loop feeds inbound frames to
    /// `ShellSession::on_message` using this same handle.
    pub shell_session: Arc<AsyncMutex<ShellSession>>,
    channel: Arc<dyn ChannelSender>,
    shell_io: Arc<dyn ShellIo>,
    config: AgentConfig,
}

impl<K, F, H, S> Agent<K, F, H, S>
where
    K: KvStore + 'static,
    F: FlashSlot + 'static,
    H: HttpClient + 'static,
    S: CryptoSigner + 'static,
{
    pub fn new(
        config: AgentConfig,
        kv: Arc<K>,
        flash: Arc<F>,
        http: Arc<H>,
        signer: Arc<S>,
        identity: Identity,
        device_type: impl Into<String>,
        registry: deployment::artifact::HandlerRegistry,
        channel: Arc<dyn ChannelSender>,
        shell_io: Arc<dyn ShellIo>,
    ) -> Self {
        let deployment = Arc::new(DeploymentEngine::new(
            kv,
            flash,
            http.clone(),
            signer,
            Arc::new(NoopRebootTrigger),
            identity,
            config.tenant_token.clone(),
            device_type.into(),
            registry,
        ));
        Self {
            scheduler: WorkScheduler::new(),
            deployment,
            http,
            shell_session: Arc::new(AsyncMutex::new(ShellSession::new())),
            channel,
            shell_io,
            config,
        }
    }

    /// Registers and activates the deployment-poll, healthcheck,
    /// inventory-publish, and configuration-sync work items. Call once
    /// at startup, after constructing the agent.
    pub async fn start(&self) {
        let deployment = self.deployment.clone();
        let poll_item = self.scheduler.create(WorkParams {
            name: "deployment-poll".into(),
            period: self.config.poll_interval,
            function: Arc::new(move || {
                let deployment = deployment.clone();
                Box::pin(async move { deployment.tick().await })
            }),
        });
        self.scheduler.activate(&poll_item).await;

        let healthcheck_item = self.scheduler.create(WorkParams {
            name: "healthcheck".into(),
            period: self.config.healthcheck_period,
            function: codec::control::healthcheck_work_fn(
                self.http.clone(),
                self.channel.clone(),
                self.shell_session.clone(),
                self.shell_io.clone(),
                self.config.healthcheck_period.as_secs() as u32,
            ),
        });
        self.scheduler.activate(&healthcheck_item).await;

        let inventory_deployment = self.deployment.clone();
        let inventory_item = self.scheduler.create(WorkParams {
            name: "inventory-publish".into(),
            period: self.config.poll_interval,
            function: Arc::new(move || {
                let deployment = inventory_deployment.clone();
                Box::pin(async move { deployment.inventory_publish_once(b"{}").await })
            }),
        });
        self.scheduler.activate(&inventory_item).await;

        let configuration_deployment = self.deployment.clone();
        let configuration_item = self.scheduler.create(WorkParams {
            name: "configuration-sync".into(),
            period: self.config.poll_interval,
            function: Arc::new(move || {
                let deployment = configuration_deployment.clone();
                Box::pin(async move { deployment.configuration_sync_once().await })
            }),
        });
        self.scheduler.activate(&configuration_item).await;
    }
}

/// Convenience constructor for an all-in-memory agent, used by the demo
/// binary and integration tests that don't need a real platform.
pub fn demo_agent<H: HttpClient + 'static>(
    server_url: impl Into<String>,
    http: Arc<H>,
) -> Agent<kv_store::InMemoryKvStore, flash::InMemoryFlashSlot, H, DemoSigner> {
    let config = AgentConfig::builder()
        .server_url(server_url)
        .build()
        .expect("server_url is always set here");
    Agent::new(
        config,
        Arc::new(kv_store::InMemoryKvStore::new()),
        Arc::new(flash::InMemoryFlashSlot::new()),
        http,
        Arc::new(DemoSigner::new()),
        Identity::new(vec![("mac".into(), "00:00:00:00:00:00".into())]),
        "demo-board",
        deployment::artifact::HandlerRegistry::new(),
        Arc::new(NoopChannelSender),
        Arc::new(NoopShellIo),
    )
}

/// Result alias re-exported for downstream crates that only need the
/// error type, not the full module path.
pub type Result<T> = AgentResult<T>;
pub use error::{AgentError, WorkOutcome as Outcome};
