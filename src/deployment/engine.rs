//! C5 — the deployment engine (spec.md §4.5): drives one deployment
//! from discovery through install, reboot, commit, and status
//! reporting, resuming from the durable record on every tick.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::deployment::artifact::{ArtifactStreamConfig, HandlerRegistry};
use crate::deployment::auth::authenticate;
use crate::deployment::reporting::report_status;
use crate::deployment::state::{DeploymentRecord, DeploymentState, DeploymentStatus, PayloadRecord};
use crate::error::{AgentError, AgentResult, WorkOutcome};
use crate::flash::FlashSlot;
use crate::http::{perform_buffered, HttpClient, HttpRequest};
use crate::identity::{CryptoSigner, Identity};
use crate::kv_store::{KvStore, StoreKey};

/// Hands control to the platform's reboot path (spec.md §1's
/// platform-provided boundary). A real implementation does not return;
/// [`NoopRebootTrigger`] is a stand-in for tests and the demo binary,
/// where "rebooting" just means the next tick resumes from
/// `AfterReboot` in the same process.
#[async_trait]
pub trait RebootTrigger: Send + Sync {
    async fn reboot(&self) -> AgentResult<()>;
}

pub struct NoopRebootTrigger;

#[async_trait]
impl RebootTrigger for NoopRebootTrigger {
    async fn reboot(&self) -> AgentResult<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct NextDeploymentResponse {
    id: String,
    artifact: NextDeploymentArtifact,
}

#[derive(Debug, Deserialize)]
struct NextDeploymentArtifact {
    artifact_name: String,
    source: NextDeploymentSource,
}

#[derive(Debug, Deserialize)]
struct NextDeploymentSource {
    uri: String,
}

#[derive(Debug, Serialize)]
struct DeviceTypeQuery<'a> {
    device_type: &'a str,
}

/// Wires together the components a deployment needs: persistent
/// storage for the in-flight record, the flash slot, the HTTP
/// transport, identity/signing, the artifact handler registry, and the
/// platform's reboot trigger.
pub struct DeploymentEngine<K, F, H, S, R>
where
    K: KvStore,
    F: FlashSlot,
    H: HttpClient,
    S: CryptoSigner,
    R: RebootTrigger,
{
    kv: Arc<K>,
    flash: Arc<F>,
    http: Arc<H>,
    signer: Arc<S>,
    reboot: Arc<R>,
    identity: Identity,
    tenant_token: Option<String>,
    device_type: String,
    registry: HandlerRegistry,
    stream_config: ArtifactStreamConfig,
}

impl<K, F, H, S, R> DeploymentEngine<K, F, H, S, R>
where
    K: KvStore,
    F: FlashSlot,
    H: HttpClient,
    S: CryptoSigner,
    R: RebootTrigger,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<K>,
        flash: Arc<F>,
        http: Arc<H>,
        signer: Arc<S>,
        reboot: Arc<R>,
        identity: Identity,
        tenant_token: Option<String>,
        device_type: String,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            kv,
            flash,
            http,
            signer,
            reboot,
            identity,
            tenant_token,
            device_type,
            registry,
            stream_config: ArtifactStreamConfig::default(),
        }
    }

    /// Installs a hook for decompressing artifact bytes before they
    /// reach the tar parser (SPEC_FULL.md §5 Open Question 1). Leaving
    /// this unset assumes the `HttpClient` transport already hands back
    /// a plain tar stream.
    pub fn with_stream_config(mut self, stream_config: ArtifactStreamConfig) -> Self {
        self.stream_config = stream_config;
        self
    }

    async fn load_record(&self) -> AgentResult<Option<DeploymentRecord>> {
        match self.kv.get(StoreKey::DeploymentData).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(AgentError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save_record(&self, record: &DeploymentRecord) -> AgentResult<()> {
        let bytes = serde_json::to_vec(record)?;
        self.kv.set(StoreKey::DeploymentData, Bytes::from(bytes)).await
    }

    async fn clear_record(&self) -> AgentResult<()> {
        self.kv.delete(StoreKey::DeploymentData).await
    }

    async fn token(&self) -> AgentResult<String> {
        authenticate(
            self.http.as_ref(),
            self.signer.as_ref(),
            &self.identity,
            self.tenant_token.as_deref(),
        )
        .await
    }

    async fn check_for_update(&self, token: &str) -> AgentResult<Option<NextDeploymentResponse>> {
        let query = DeviceTypeQuery {
            device_type: &self.device_type,
        };
        let path = format!(
            "/api/devices/v1/deployments/device/deployments/next?device_type={}",
            query.device_type
        );
        let (status, body) = perform_buffered(
            self.http.as_ref(),
            HttpRequest {
                token: Some(token),
                path: &path,
                method: Method::GET,
                body: None,
                signature: None,
            },
        )
        .await?;
        match status {
            204 => Ok(None),
            200 => Ok(Some(serde_json::from_slice(&body)?)),
            other => Err(AgentError::NetworkError(format!(
                "next-deployment check failed with {other}"
            ))),
        }
    }

    async fn download_artifact(&self, token: &str, uri: &str) -> AgentResult<Vec<u8>> {
        let (status, body) = perform_buffered(
            self.http.as_ref(),
            HttpRequest {
                token: Some(token),
                path: uri,
                method: Method::GET,
                body: None,
                signature: None,
            },
        )
        .await?;
        if status != 200 {
            return Err(AgentError::NetworkError(format!(
                "artifact download failed with {status}"
            )));
        }
        Ok(body)
    }

    /// Runs `inventory_publish` once, as a scheduled work item would
    /// (SPEC_FULL.md §3). `attributes_json` is the device's current
    /// inventory, already JSON-encoded by the caller.
    pub async fn inventory_publish_once(&self, attributes_json: &[u8]) -> AgentResult<WorkOutcome> {
        let token = self.token().await?;
        crate::deployment::inventory::inventory_publish(self.http.as_ref(), &token, attributes_json).await
    }

    /// Runs `configuration_sync` once (SPEC_FULL.md §3).
    pub async fn configuration_sync_once(&self) -> AgentResult<WorkOutcome> {
        let token = self.token().await?;
        crate::deployment::inventory::configuration_sync(self.http.as_ref(), self.kv.as_ref(), &token).await
    }

    /// One pass of the engine's scheduled work (spec.md §4.4, §4.5.2).
    /// Resumes an in-flight deployment from its durable record, or
    /// looks for a new one if none is pending.
    pub async fn tick(&self) -> AgentResult<WorkOutcome> {
        let mut record = match self.load_record().await? {
            Some(record) => record,
            None => match self.start_new_deployment().await? {
                Some(record) => record,
                None => return Ok(WorkOutcome::KeepScheduled),
            },
        };

        let token = self.token().await?;

        loop {
            match record.state {
                DeploymentState::Download | DeploymentState::Install => {
                    if let Err(e) = self.run_install(&token, &mut record).await {
                        warn!(deployment_id = %record.deployment_id, error = %e, "install failed, rolling back");
                        record.state = DeploymentState::Failure;
                        self.save_record(&record).await?;
                        continue;
                    }
                    // A payload whose handler reported `needs_reboot =
                    // false` (e.g. a configuration update) skips the
                    // reboot branch entirely (spec.md §4.5.2 step 6).
                    record.state = if record.needs_reboot() {
                        DeploymentState::Reboot
                    } else {
                        DeploymentState::Commit
                    };
                    self.save_record(&record).await?;
                }
                DeploymentState::Reboot => {
                    report_status(
                        self.http.as_ref(),
                        &token,
                        &record.deployment_id,
                        DeploymentStatus::Rebooting,
                    )
                    .await?;
                    self.reboot.reboot().await?;
                    record.state = DeploymentState::AfterReboot;
                    self.save_record(&record).await?;
                }
                DeploymentState::AfterReboot => {
                    if self.flash.is_image_confirmed().await? {
                        record.state = DeploymentState::Commit;
                    } else {
                        self.flash.confirm_image().await?;
                        record.state = DeploymentState::Commit;
                    }
                    self.save_record(&record).await?;
                }
                DeploymentState::Commit => {
                    report_status(
                        self.http.as_ref(),
                        &token,
                        &record.deployment_id,
                        DeploymentStatus::Success,
                    )
                    .await?;
                    record.state = DeploymentState::Cleanup;
                    self.save_record(&record).await?;
                }
                DeploymentState::Cleanup => {
                    info!(deployment_id = %record.deployment_id, "deployment committed, clearing record");
                    self.clear_record().await?;
                    return Ok(WorkOutcome::KeepScheduled);
                }
                DeploymentState::Failure => {
                    report_status(
                        self.http.as_ref(),
                        &token,
                        &record.deployment_id,
                        DeploymentStatus::Failure,
                    )
                    .await?;
                    // A payload whose handler reported
                    // `rollback_supported = false` can't be backed out
                    // automatically (spec.md §4.5.1 item 7); the
                    // deployment is reported aborted and left failed
                    // rather than entering the rollback/reboot chain.
                    if record.rollback_supported() {
                        record.state = DeploymentState::Rollback;
                    } else {
                        report_status(
                            self.http.as_ref(),
                            &token,
                            &record.deployment_id,
                            DeploymentStatus::Aborted,
                        )
                        .await?;
                        record.state = DeploymentState::FailureReported;
                    }
                    self.save_record(&record).await?;
                }
                DeploymentState::Rollback => {
                    if let Some(slot) = &record.pending_slot_name {
                        warn!(slot = %slot, "discarding pending image after failed install");
                    }
                    record.state = DeploymentState::RollbackReboot;
                    self.save_record(&record).await?;
                }
                DeploymentState::RollbackReboot => {
                    self.reboot.reboot().await?;
                    record.state = DeploymentState::AfterRollbackReboot;
                    self.save_record(&record).await?;
                }
                DeploymentState::AfterRollbackReboot => {
                    record.state = DeploymentState::FailureReported;
                    self.save_record(&record).await?;
                }
                DeploymentState::FailureReported => {
                    self.clear_record().await?;
                    return Ok(WorkOutcome::KeepScheduled);
                }
            }
        }
    }

    /// Drives a deployment from `Download` through a finished install
    /// (spec.md §4.5.2, §4.5.5): reports `downloading`, fetches and
    /// unpacks the artifact, reports `installing` while that runs, then
    /// records what each payload requires and reports `installed`.
    async fn run_install(&self, token: &str, record: &mut DeploymentRecord) -> AgentResult<()> {
        record.state = DeploymentState::Download;
        self.save_record(record).await?;
        report_status(
            self.http.as_ref(),
            token,
            &record.deployment_id,
            DeploymentStatus::Downloading,
        )
        .await?;

        let artifact_bytes = self.download_artifact(token, &record.source_uri).await?;
        let artifact_bytes = match self.stream_config.decompress {
            Some(decompress) => decompress(&artifact_bytes)?,
            None => artifact_bytes,
        };

        record.state = DeploymentState::Install;
        self.save_record(record).await?;
        report_status(
            self.http.as_ref(),
            token,
            &record.deployment_id,
            DeploymentStatus::Installing,
        )
        .await?;

        let installed = crate::deployment::artifact::install_artifact(
            &self.registry,
            self.signer.as_ref(),
            std::iter::once(artifact_bytes.as_slice()),
        )
        .await?;

        record.pending_slot_name = installed.iter().find_map(|p| p.pending_slot.clone());
        record.payloads = installed
            .into_iter()
            .map(|p| PayloadRecord {
                payload_type: p.payload_type,
                payload_index: p.payload_index,
                needs_reboot: p.needs_reboot,
                rollback_supported: p.rollback_supported,
                state_data_store: p.state_data_store,
            })
            .collect();

        report_status(
            self.http.as_ref(),
            token,
            &record.deployment_id,
            DeploymentStatus::Installed,
        )
        .await?;
        Ok(())
    }

    async fn start_new_deployment(&self) -> AgentResult<Option<DeploymentRecord>> {
        let token = self.token().await?;
        let next = match self.check_for_update(&token).await? {
            Some(next) => next,
            None => return Ok(None),
        };
        let record =
            DeploymentRecord::new(next.id, next.artifact.artifact_name, next.artifact.source.uri);
        self.save_record(&record).await?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DemoSigner;
    use crate::deployment::artifact::{ConfigureHandler, RootfsImageHandler};
    use crate::flash::InMemoryFlashSlot;
    use crate::http::HttpEvent;
    use crate::kv_store::InMemoryKvStore;
    use crate::tar::test_support::build_tar;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A fake server that serves one deployment then reports 204 for
    /// every subsequent `next` check, matching the real service's
    /// "nothing pending" response. Records every status PUT body so
    /// tests can assert on the reported sequence.
    struct FakeServer {
        artifact: Vec<u8>,
        served: AtomicUsize,
        statuses: std::sync::Mutex<Vec<String>>,
    }

    impl FakeServer {
        fn new(artifact: Vec<u8>) -> Self {
            Self {
                artifact,
                served: AtomicUsize::new(0),
                statuses: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpClient for FakeServer {
        async fn perform(
            &self,
            request: HttpRequest<'_>,
            on_event: &mut (dyn FnMut(HttpEvent<'_>) -> AgentResult<()> + Send),
        ) -> AgentResult<u16> {
            if request.path.contains("/authentication/") {
                on_event(HttpEvent::DataReceived(b"test-token"))?;
                return Ok(200);
            }
            if request.path.contains("/deployments/next") {
                if self.served.fetch_add(1, Ordering::SeqCst) == 0 {
                    let body = serde_json::to_vec(&serde_json::json!({
                        "id": "dep-1",
                        "artifact": {
                            "artifact_name": "release-5",
                            "source": { "uri": "/download/release-5" }
                        }
                    }))
                    .unwrap();
                    on_event(HttpEvent::DataReceived(&body))?;
                    return Ok(200);
                }
                return Ok(204);
            }
            if request.path == "/download/release-5" {
                on_event(HttpEvent::DataReceived(&self.artifact))?;
                return Ok(200);
            }
            if request.path.contains("/status") {
                if let Some(body) = request.body {
                    let status: serde_json::Value = serde_json::from_slice(body).unwrap();
                    self.statuses.lock().unwrap().push(status["status"].as_str().unwrap().to_string());
                }
                return Ok(204);
            }
            Ok(404)
        }
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Builds a real mender-layout artifact tar carrying a single
    /// payload of the given type (spec.md §6).
    async fn build_artifact(signer: &DemoSigner, payload_type: &str, payload: &[u8]) -> Vec<u8> {
        let version = serde_json::to_vec(&serde_json::json!({"format": "mender", "version": 3})).unwrap();
        let type_info = serde_json::to_vec(&serde_json::json!({"type": payload_type})).unwrap();
        let header_info = serde_json::to_vec(&serde_json::json!({"payloads": [{"type": payload_type}]})).unwrap();
        let header = build_tar(&[
            ("header-info", &header_info),
            ("headers/0000/type-info", &type_info),
        ]);
        let data = build_tar(&[("rootfs.img", payload)]);

        let manifest_text = format!(
            "{}  version\n{}  header.tar\n{}  data/0000.tar\n",
            sha256_hex(&version),
            sha256_hex(&header),
            sha256_hex(&data),
        );
        let manifest_bytes = manifest_text.into_bytes();
        let sig = signer.sign(&manifest_bytes).await.unwrap();

        build_tar(&[
            ("version", &version),
            ("manifest", &manifest_bytes),
            ("manifest.sig", &sig),
            ("header.tar", &header),
            ("data/0000.tar", &data),
        ])
    }

    #[tokio::test]
    async fn full_deployment_commits_and_clears_its_record() {
        let signer = Arc::new(DemoSigner::new());
        let artifact = build_artifact(&signer, "rootfs-image", b"firmware-bytes").await;
        let server = Arc::new(FakeServer::new(artifact));
        let flash = Arc::new(InMemoryFlashSlot::new());
        let kv = Arc::new(InMemoryKvStore::new());

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(RootfsImageHandler::new(flash.clone(), "release-5")));

        let engine = DeploymentEngine::new(
            kv.clone(),
            flash.clone(),
            server.clone(),
            signer,
            Arc::new(NoopRebootTrigger),
            Identity::new(vec![]),
            None,
            "demo-board".into(),
            registry,
        );

        // First tick: discovers the deployment, installs it, "reboots",
        // and runs to completion in this process's single tick loop.
        let outcome = engine.tick().await.unwrap();
        assert_eq!(outcome, WorkOutcome::KeepScheduled);
        assert_eq!(flash.written_bytes().await, b"firmware-bytes");
        assert!(flash.is_image_confirmed().await.unwrap());
        assert!(matches!(kv.get(StoreKey::DeploymentData).await, Err(AgentError::NotFound)));
        assert_eq!(
            *server.statuses.lock().unwrap(),
            vec!["downloading", "installing", "installed", "rebooting", "success"]
        );

        // Second tick: no deployment pending, nothing to do.
        let outcome = engine.tick().await.unwrap();
        assert_eq!(outcome, WorkOutcome::KeepScheduled);
    }

    #[tokio::test]
    async fn resumes_from_a_persisted_record_after_a_restart() {
        let signer = Arc::new(DemoSigner::new());
        let artifact = build_artifact(&signer, "rootfs-image", b"firmware-bytes").await;
        let server = Arc::new(FakeServer::new(artifact));
        let flash = Arc::new(InMemoryFlashSlot::new());
        let kv = Arc::new(InMemoryKvStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(RootfsImageHandler::new(flash.clone(), "release-5")));

        // Simulate a crash right after the record reaches `Reboot`:
        // persist that record by hand before the engine ever ticks.
        let mut record = DeploymentRecord::new("dep-1", "release-5", "/download/release-5");
        record.state = DeploymentState::Reboot;
        kv.set(
            StoreKey::DeploymentData,
            Bytes::from(serde_json::to_vec(&record).unwrap()),
        )
        .await
        .unwrap();

        let engine = DeploymentEngine::new(
            kv.clone(),
            flash.clone(),
            server,
            signer,
            Arc::new(NoopRebootTrigger),
            Identity::new(vec![]),
            None,
            "demo-board".into(),
            registry,
        );

        engine.tick().await.unwrap();
        assert!(matches!(kv.get(StoreKey::DeploymentData).await, Err(AgentError::NotFound)));
        assert!(flash.is_image_confirmed().await.unwrap());
    }

    #[tokio::test]
    async fn a_payload_with_no_reboot_requirement_skips_straight_to_commit() {
        let signer = Arc::new(DemoSigner::new());
        let artifact = build_artifact(&signer, "mender-configure", br#"{"k":"v"}"#).await;
        let server = Arc::new(FakeServer::new(artifact));
        let flash = Arc::new(InMemoryFlashSlot::new());
        let kv = Arc::new(InMemoryKvStore::new());

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(ConfigureHandler::new(kv.clone())));

        let engine = DeploymentEngine::new(
            kv.clone(),
            flash.clone(),
            server.clone(),
            signer,
            Arc::new(NoopRebootTrigger),
            Identity::new(vec![]),
            None,
            "demo-board".into(),
            registry,
        );

        let outcome = engine.tick().await.unwrap();
        assert_eq!(outcome, WorkOutcome::KeepScheduled);
        // No `rebooting` status and no pending flash slot: the engine
        // went straight from installing to success.
        assert_eq!(
            *server.statuses.lock().unwrap(),
            vec!["downloading", "installing", "installed", "success"]
        );
        assert!(flash.pending_name().await.is_none());
        assert!(matches!(kv.get(StoreKey::DeploymentData).await, Err(AgentError::NotFound)));
    }

    #[tokio::test]
    async fn a_payload_with_no_rollback_support_reports_aborted_instead_of_rolling_back() {
        let signer = Arc::new(DemoSigner::new());
        let artifact = build_artifact(&signer, "unknown-type", b"irrelevant").await;
        let server = Arc::new(FakeServer::new(artifact));
        let flash = Arc::new(InMemoryFlashSlot::new());
        let kv = Arc::new(InMemoryKvStore::new());

        // No handler is registered for "unknown-type": the install fails
        // before any payload record exists, so there is nothing for the
        // engine to roll back.
        let registry = HandlerRegistry::new();

        let engine = DeploymentEngine::new(
            kv.clone(),
            flash.clone(),
            server.clone(),
            signer,
            Arc::new(NoopRebootTrigger),
            Identity::new(vec![]),
            None,
            "demo-board".into(),
            registry,
        );

        let outcome = engine.tick().await.unwrap();
        assert_eq!(outcome, WorkOutcome::KeepScheduled);
        assert_eq!(
            *server.statuses.lock().unwrap(),
            vec!["downloading", "installing", "failure", "aborted"]
        );
        assert!(matches!(kv.get(StoreKey::DeploymentData).await, Err(AgentError::NotFound)));
    }
}
