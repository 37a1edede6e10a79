//! Artifact consumption (spec.md §4.5.4, §6 "Artifact format"): streams
//! the downloaded Mender-style artifact tar through
//! [`crate::tar::TarParser`] member by member.
//!
//! The outer tar holds, in order: `version` (JSON), `manifest` (text),
//! an optional `manifest.sig`, `header.tar` (a nested tar of per-payload
//! metadata), and one `data/NNNN.tar` per payload (a nested tar whose
//! single member is that payload's actual bytes). The manifest lists a
//! `<hex-sha256>  <filename>` record for each of `version`, `header.tar`
//! and every `data/NNNN.tar` — verified against a running hash of each
//! member's raw bytes as it streams past, before any byte reaches a
//! handler. `header.tar` is small enough to buffer whole and re-parsed
//! with a second `TarParser` instance to discover each payload's type
//! (`headers/NNNN/type-info`); `data/NNNN.tar` is driven incrementally
//! through a nested parser so a firmware-sized payload is never
//! buffered in memory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{AgentError, AgentResult};
use crate::flash::{FlashHandle, FlashSlot};
use crate::identity::CryptoSigner;
use crate::kv_store::{KvStore, StoreKey};
use crate::tar::{TarEvent, TarParser};

/// Artifacts may be gzip-compressed on the wire; this crate does not
/// bundle a decompressor (SPEC_FULL.md §5 Open Questions), so the
/// engine is configured with an optional hook the platform provides.
/// `None` means the artifact stream is assumed to already be a plain
/// tar.
pub type DecompressHook = fn(&[u8]) -> AgentResult<Vec<u8>>;

#[derive(Default)]
pub struct ArtifactStreamConfig {
    pub decompress: Option<DecompressHook>,
}

/// The artifact format marker, the tar's first member (spec.md §6).
#[derive(Debug, Deserialize)]
struct ArtifactVersion {
    format: String,
    version: u32,
}

const SUPPORTED_FORMAT: &str = "mender";
const SUPPORTED_VERSION: u32 = 3;

fn validate_version(bytes: &[u8]) -> AgentResult<()> {
    let version: ArtifactVersion = serde_json::from_slice(bytes)
        .map_err(|e| AgentError::UnsupportedArtifact(format!("malformed version entry: {e}")))?;
    if version.format != SUPPORTED_FORMAT || version.version != SUPPORTED_VERSION {
        return Err(AgentError::UnsupportedArtifact(format!(
            "{}/{}",
            version.format, version.version
        )));
    }
    Ok(())
}

/// `header.tar`'s `header-info` entry (spec.md §6): names the payload
/// count this artifact carries. Per-payload type comes from the
/// sibling `headers/NNNN/type-info` entries, not from this file.
#[derive(Debug, Deserialize)]
struct TypeInfo {
    #[serde(rename = "type")]
    payload_type: String,
}

/// Parses `header.tar`'s fully-buffered bytes, returning the declared
/// type for every `headers/NNNN/type-info` member, keyed by the
/// zero-padded index string `NNNN` (spec.md §6, §4.5.4).
fn parse_header_tar(bytes: &[u8]) -> AgentResult<HashMap<String, String>> {
    let mut types = HashMap::new();
    let mut parser = TarParser::new();
    let mut current: Option<String> = None;
    let mut buffer = Vec::new();
    let mut input = bytes;

    while !input.is_empty() {
        let step = parser.feed(input);
        match step.event {
            TarEvent::NeedMoreInput => {}
            TarEvent::Header { name, .. } => {
                if let Some(index) = payload_index_from_type_info_path(current.as_deref()) {
                    let info: TypeInfo = serde_json::from_slice(&buffer).map_err(|e| {
                        AgentError::Malformed(format!("malformed type-info for payload {index}: {e}"))
                    })?;
                    types.insert(index, info.payload_type);
                }
                current = Some(name);
                buffer.clear();
            }
            TarEvent::Data { data } => buffer.extend_from_slice(data),
            TarEvent::EndOfArchive => {
                if let Some(index) = payload_index_from_type_info_path(current.as_deref()) {
                    let info: TypeInfo = serde_json::from_slice(&buffer).map_err(|e| {
                        AgentError::Malformed(format!("malformed type-info for payload {index}: {e}"))
                    })?;
                    types.insert(index, info.payload_type);
                }
                break;
            }
            TarEvent::Error(e) => return Err(e),
        }
        input = &input[step.consumed..];
    }
    Ok(types)
}

/// `headers/<NNNN>/type-info` -> `Some(NNNN)`; anything else -> `None`.
fn payload_index_from_type_info_path(name: Option<&str>) -> Option<String> {
    let name = name?;
    let rest = name.strip_prefix("headers/")?;
    let (index, tail) = rest.split_once('/')?;
    (tail == "type-info").then(|| index.to_string())
}

/// `data/<NNNN>.tar` -> `Some(NNNN)`; anything else -> `None`.
fn payload_index_from_data_path(name: &str) -> Option<String> {
    let rest = name.strip_prefix("data/")?;
    rest.strip_suffix(".tar").map(str::to_string)
}

/// Parses a `manifest` entry's text body into a `filename -> hex sha256`
/// table (spec.md §6: `<hex-sha256>  <filename>` records, one per
/// line).
fn parse_manifest(bytes: &[u8]) -> AgentResult<HashMap<String, String>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| AgentError::Malformed(format!("manifest is not valid utf-8: {e}")))?;
    let mut records = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let hash = parts
            .next()
            .ok_or_else(|| AgentError::Malformed("manifest record missing hash".into()))?;
        let name = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| AgentError::Malformed("manifest record missing filename".into()))?;
        records.insert(name.to_string(), hash.to_ascii_lowercase());
    }
    Ok(records)
}

fn verify_member_hash(
    manifest: &HashMap<String, String>,
    member: &str,
    digest: &[u8],
) -> AgentResult<()> {
    let expected = manifest
        .get(member)
        .ok_or_else(|| AgentError::Malformed(format!("manifest has no entry for {member}")))?;
    let actual = hex::encode(digest);
    if &actual != expected {
        return Err(AgentError::VerificationFailed(format!(
            "sha256 mismatch for {member}"
        )));
    }
    Ok(())
}

/// One artifact-type handler (spec.md §4.5.4 "type-handler registry").
/// `begin`/`write`/`finish` mirror [`FlashSlot`]'s streaming contract so
/// a handler can forward payload bytes without buffering the whole
/// artifact.
#[async_trait]
pub trait ArtifactHandler: Send + Sync {
    fn artifact_type(&self) -> &'static str;

    /// Whether this payload type requires a reboot to take effect
    /// (spec.md §3, §4.5.2 step 6). Defaults to `true`, the common
    /// case for image-replacing handlers.
    fn needs_reboot(&self) -> bool {
        true
    }

    /// Whether a failed install of this payload type can be rolled back
    /// automatically (spec.md §3, §4.5.1 item 7). Defaults to `true`.
    fn rollback_supported(&self) -> bool {
        true
    }

    /// Keys this handler stores transient state under, recorded on the
    /// deployment record so a rollback or commit can find them (spec.md
    /// §3 `state_data_store`). Defaults to none.
    fn state_data_store(&self) -> Vec<String> {
        Vec::new()
    }

    async fn begin(&self, declared_size: u64) -> AgentResult<()>;

    async fn write(&self, data: &[u8]) -> AgentResult<()>;

    /// Completes the install. Returns the flash slot name that was made
    /// pending, if this handler requires a reboot to take effect.
    async fn finish(&self) -> AgentResult<Option<String>>;
}

/// Dispatch table from manifest `artifact_type` to handler
/// implementation.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ArtifactHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ArtifactHandler>) {
        self.handlers.insert(handler.artifact_type().to_string(), handler);
    }

    pub fn get(&self, artifact_type: &str) -> AgentResult<Arc<dyn ArtifactHandler>> {
        self.handlers
            .get(artifact_type)
            .cloned()
            .ok_or_else(|| AgentError::UnsupportedArtifact(artifact_type.to_string()))
    }
}

/// Handler for the `rootfs-image` artifact type: streams the payload
/// straight into the inactive flash slot and marks it pending on
/// completion (spec.md §4.2, §4.5.4).
pub struct RootfsImageHandler<F: FlashSlot> {
    flash: Arc<F>,
    handle: Mutex<Option<FlashHandle>>,
    name: String,
    offset: Mutex<u64>,
}

impl<F: FlashSlot> RootfsImageHandler<F> {
    pub fn new(flash: Arc<F>, artifact_name: impl Into<String>) -> Self {
        Self {
            flash,
            handle: Mutex::new(None),
            name: artifact_name.into(),
            offset: Mutex::new(0),
        }
    }
}

#[async_trait]
impl<F: FlashSlot> ArtifactHandler for RootfsImageHandler<F> {
    fn artifact_type(&self) -> &'static str {
        "rootfs-image"
    }

    fn state_data_store(&self) -> Vec<String> {
        vec![format!("flash-slot:{}", self.name)]
    }

    async fn begin(&self, declared_size: u64) -> AgentResult<()> {
        let opened = self.flash.open(&self.name, declared_size).await?;
        *self.handle.lock().await = Some(opened);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> AgentResult<()> {
        let mut guard = self.handle.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| AgentError::Fatal("write before begin on rootfs-image handler".into()))?;
        let mut offset = self.offset.lock().await;
        self.flash.write(handle, data, *offset).await?;
        *offset += data.len() as u64;
        Ok(())
    }

    async fn finish(&self) -> AgentResult<Option<String>> {
        let mut guard = self.handle.lock().await;
        let mut handle = guard
            .take()
            .ok_or_else(|| AgentError::Fatal("finish before begin on rootfs-image handler".into()))?;
        self.flash.close(&mut handle).await?;
        self.flash.set_pending(handle).await?;
        Ok(Some(self.name.clone()))
    }
}

/// Handler for the `mender-configure` artifact type (SPEC_FULL.md §3):
/// a small key/value configuration blob applied in place, without a
/// reboot, and with no automatic rollback path.
pub struct ConfigureHandler<K: KvStore> {
    kv: Arc<K>,
    buffer: Mutex<Vec<u8>>,
}

impl<K: KvStore> ConfigureHandler<K> {
    pub fn new(kv: Arc<K>) -> Self {
        Self {
            kv,
            buffer: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl<K: KvStore> ArtifactHandler for ConfigureHandler<K> {
    fn artifact_type(&self) -> &'static str {
        "mender-configure"
    }

    fn needs_reboot(&self) -> bool {
        false
    }

    fn rollback_supported(&self) -> bool {
        false
    }

    fn state_data_store(&self) -> Vec<String> {
        vec!["device-config".into()]
    }

    async fn begin(&self, declared_size: u64) -> AgentResult<()> {
        let mut buffer = self.buffer.lock().await;
        buffer.clear();
        buffer.reserve(declared_size as usize);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> AgentResult<()> {
        self.buffer.lock().await.extend_from_slice(data);
        Ok(())
    }

    async fn finish(&self) -> AgentResult<Option<String>> {
        let buffer = std::mem::take(&mut *self.buffer.lock().await);
        self.kv.set(StoreKey::DeviceConfig, buffer.into()).await?;
        Ok(None)
    }
}

/// One payload this install pass unpacked and handed to its handler.
#[derive(Debug, Clone)]
pub struct InstalledPayload {
    pub payload_type: String,
    pub payload_index: u32,
    pub needs_reboot: bool,
    pub rollback_supported: bool,
    pub state_data_store: Vec<String>,
    pub pending_slot: Option<String>,
}

struct PendingPayload {
    index: String,
    handler: Arc<dyn ArtifactHandler>,
    nested: TarParser,
    begun: bool,
}

/// Consumes an entire artifact tar stream to completion (spec.md §6,
/// §4.5.4): validates the `version` marker, checks the manifest
/// signature, then verifies and unpacks `header.tar` and every
/// `data/NNNN.tar` member, streaming each payload to the handler its
/// declared type resolves to in `registry`.
///
/// `chunks` yields successive byte slices of the (already
/// decompressed, if applicable) tar stream as they arrive from the
/// HTTP transport.
pub async fn install_artifact<'a, I>(
    registry: &HandlerRegistry,
    signer: &dyn CryptoSigner,
    mut chunks: I,
) -> AgentResult<Vec<InstalledPayload>>
where
    I: Iterator<Item = &'a [u8]>,
{
    let mut parser = TarParser::new();
    let mut current_entry: Option<String> = None;
    let mut buffer: Vec<u8> = Vec::new();
    let mut hasher = Sha256::new();

    let mut manifest: Option<HashMap<String, String>> = None;
    let mut manifest_bytes: Option<Vec<u8>> = None;
    let mut header_types: Option<HashMap<String, String>> = None;
    let mut pending_payload: Option<PendingPayload> = None;
    let mut results = Vec::new();

    while let Some(mut chunk) = chunks.next() {
        while !chunk.is_empty() {
            let step = parser.feed(chunk);
            match step.event {
                TarEvent::NeedMoreInput => {}
                TarEvent::Header { name, .. } => {
                    finish_entry(
                        &current_entry,
                        &buffer,
                        &hasher,
                        signer,
                        &mut manifest,
                        &mut manifest_bytes,
                        &mut header_types,
                        &mut pending_payload,
                        &mut results,
                    )
                    .await?;

                    current_entry = Some(name.clone());
                    buffer.clear();
                    hasher = Sha256::new();

                    if let Some(index) = payload_index_from_data_path(&name) {
                        let types = header_types.as_ref().ok_or_else(|| {
                            AgentError::Malformed(
                                "data/NNNN.tar encountered before header.tar".into(),
                            )
                        })?;
                        let payload_type = types.get(&index).ok_or_else(|| {
                            AgentError::Malformed(format!("no type-info for payload {index}"))
                        })?;
                        let handler = registry.get(payload_type)?;
                        pending_payload = Some(PendingPayload {
                            index,
                            handler,
                            nested: TarParser::new(),
                            begun: false,
                        });
                    }
                }
                TarEvent::Data { data } => {
                    hasher.update(data);
                    if let Some(pending) = &mut pending_payload {
                        feed_nested_payload(pending, data).await?;
                    } else {
                        buffer.extend_from_slice(data);
                    }
                }
                TarEvent::EndOfArchive => {
                    finish_entry(
                        &current_entry,
                        &buffer,
                        &hasher,
                        signer,
                        &mut manifest,
                        &mut manifest_bytes,
                        &mut header_types,
                        &mut pending_payload,
                        &mut results,
                    )
                    .await?;
                    return Ok(results);
                }
                TarEvent::Error(e) => return Err(e),
            }
            chunk = &chunk[step.consumed..];
        }
    }
    Err(AgentError::Malformed(
        "artifact stream ended before an end-of-archive marker".into(),
    ))
}

async fn feed_nested_payload(pending: &mut PendingPayload, mut data: &[u8]) -> AgentResult<()> {
    while !data.is_empty() {
        let step = pending.nested.feed(data);
        match step.event {
            TarEvent::NeedMoreInput => {}
            TarEvent::Header { size, .. } => {
                pending.handler.begin(size).await?;
                pending.begun = true;
            }
            TarEvent::Data { data: inner } => {
                if !pending.begun {
                    return Err(AgentError::Malformed(format!(
                        "payload {} has bytes before a nested header",
                        pending.index
                    )));
                }
                pending.handler.write(inner).await?;
            }
            TarEvent::EndOfArchive => {}
            TarEvent::Error(e) => return Err(e),
        }
        data = &data[step.consumed..];
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn finish_entry(
    current_entry: &Option<String>,
    buffer: &[u8],
    hasher: &Sha256,
    signer: &dyn CryptoSigner,
    manifest: &mut Option<HashMap<String, String>>,
    manifest_bytes: &mut Option<Vec<u8>>,
    header_types: &mut Option<HashMap<String, String>>,
    pending_payload: &mut Option<PendingPayload>,
    results: &mut Vec<InstalledPayload>,
) -> AgentResult<()> {
    let Some(name) = current_entry.as_deref() else {
        return Ok(());
    };

    match name {
        "version" => validate_version(buffer)?,
        "manifest" => {
            *manifest_bytes = Some(buffer.to_vec());
            *manifest = Some(parse_manifest(buffer)?);
        }
        "manifest.sig" => {
            let payload = manifest_bytes.as_ref().ok_or_else(|| {
                AgentError::Malformed("manifest.sig seen before manifest".into())
            })?;
            if !signer.verify(payload, buffer).await? {
                return Err(AgentError::VerificationFailed(
                    "manifest signature does not match manifest".into(),
                ));
            }
        }
        "header.tar" => {
            let manifest = manifest
                .as_ref()
                .ok_or_else(|| AgentError::Malformed("header.tar seen before manifest".into()))?;
            verify_member_hash(manifest, "header.tar", &hasher.clone().finalize())?;
            *header_types = Some(parse_header_tar(buffer)?);
        }
        _ => {
            if let Some(pending) = pending_payload.take() {
                let manifest = manifest.as_ref().ok_or_else(|| {
                    AgentError::Malformed("data/NNNN.tar seen before manifest".into())
                })?;
                verify_member_hash(
                    manifest,
                    &format!("data/{}.tar", pending.index),
                    &hasher.clone().finalize(),
                )?;
                let pending_slot = pending.handler.finish().await?;
                let index: u32 = pending.index.parse().map_err(|_| {
                    AgentError::Malformed(format!("non-numeric payload index {}", pending.index))
                })?;
                results.push(InstalledPayload {
                    payload_type: pending.handler.artifact_type().to_string(),
                    payload_index: index,
                    needs_reboot: pending.handler.needs_reboot(),
                    rollback_supported: pending.handler.rollback_supported(),
                    state_data_store: pending.handler.state_data_store(),
                    pending_slot,
                });
            }
        }
    }
    Ok(())
}
