//! Device identity and the signing oracle boundary (spec.md §3, §4.5.3).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentResult;

/// An ordered set of string key/value attributes identifying this
/// device to the service (spec.md §3 "Identity").
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub attributes: Vec<(String, String)>,
}

impl Identity {
    pub fn new(attributes: Vec<(String, String)>) -> Self {
        Self { attributes }
    }
}

/// RSA key generation and signing are external oracles (spec.md §1);
/// this is the trait boundary the engine consumes. `verify` is bundled
/// here because artifact `manifest.sig` verification (spec.md §4.5.4,
/// §6) checks a signature against the same identity key-pair.
#[async_trait]
pub trait CryptoSigner: Send + Sync {
    /// Returns the DER-encoded public key, generating (and persisting,
    /// via the caller) a fresh key pair on first use if one does not
    /// exist yet (spec.md §3 "Identity keys... created on first use if
    /// absent").
    async fn public_key_der(&self) -> AgentResult<Vec<u8>>;

    /// Signs `payload` with the device's private key.
    async fn sign(&self, payload: &[u8]) -> AgentResult<Vec<u8>>;

    /// Verifies `signature` over `payload` against the device's own
    /// public key (used for artifact manifest signatures issued by the
    /// same tenant's key-pair infrastructure).
    async fn verify(&self, payload: &[u8], signature: &[u8]) -> AgentResult<bool>;
}

/// Body of the authentication request (spec.md §4.5.3).
#[derive(Debug, Serialize)]
pub struct AuthRequest<'a> {
    pub id_data: &'a Identity,
    pub pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_token: Option<&'a str>,
}
