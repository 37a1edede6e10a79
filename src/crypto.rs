//! A deterministic, non-cryptographic [`CryptoSigner`] for the demo
//! binary and tests. Real platforms back the trait with an RSA oracle
//! (hardware keystore, mbedTLS, etc.) per spec.md §1 — this crate never
//! generates or verifies real signatures.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::error::AgentResult;
use crate::identity::CryptoSigner;

/// Holds a private "key" (really just a random seed) that is zeroized
/// on drop, and derives a "signature" as a keyed hash. This is
/// intentionally not real cryptography; it exists so the deployment
/// engine's authentication and manifest-verification code paths are
/// exercised end-to-end in tests without a real crypto dependency.
pub struct DemoSigner {
    private_key: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl Default for DemoSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoSigner {
    pub fn new() -> Self {
        Self {
            private_key: Mutex::new(None),
        }
    }

    pub fn with_key(seed: Vec<u8>) -> Self {
        Self {
            private_key: Mutex::new(Some(Zeroizing::new(seed))),
        }
    }

    async fn key(&self) -> Vec<u8> {
        let mut guard = self.private_key.lock().await;
        if guard.is_none() {
            // "Created on first use if absent" (spec.md §3).
            let seed: Vec<u8> = (0u8..32).collect();
            *guard = Some(Zeroizing::new(seed));
        }
        guard.as_ref().unwrap().to_vec()
    }
}

#[async_trait]
impl CryptoSigner for DemoSigner {
    async fn public_key_der(&self) -> AgentResult<Vec<u8>> {
        let key = self.key().await;
        Ok(Sha256::digest(&key).to_vec())
    }

    async fn sign(&self, payload: &[u8]) -> AgentResult<Vec<u8>> {
        let key = self.key().await;
        let mut hasher = Sha256::new();
        hasher.update(&key);
        hasher.update(payload);
        Ok(hasher.finalize().to_vec())
    }

    async fn verify(&self, payload: &[u8], signature: &[u8]) -> AgentResult<bool> {
        let expected = self.sign(payload).await?;
        Ok(expected == signature)
    }
}
