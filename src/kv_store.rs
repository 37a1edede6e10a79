//! C1 — durable storage of identity keys, deployment data, and optional
//! device config (spec.md §4.1).

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use zeroize::Zeroize;

use crate::error::{AgentError, AgentResult};

/// The fixed set of stable keys the core persists across resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    PrivateKey,
    PublicKey,
    DeploymentData,
    DeviceConfig,
}

impl StoreKey {
    fn as_str(self) -> &'static str {
        match self {
            StoreKey::PrivateKey => "private_key",
            StoreKey::PublicKey => "public_key",
            StoreKey::DeploymentData => "deployment_data",
            StoreKey::DeviceConfig => "device_config",
        }
    }
}

/// Durable key/value contract (spec.md §4.1). Implementations back this
/// with a flash partition, a file, or whatever the platform provides;
/// the core only requires the commit-fence semantics documented on each
/// method.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Writes are durable on successful return.
    async fn set(&self, key: StoreKey, value: Bytes) -> AgentResult<()>;

    /// Fails with `AgentError::NotFound` for a never-written or deleted
    /// key — distinct from an `Ok` of an empty value.
    async fn get(&self, key: StoreKey) -> AgentResult<Bytes>;

    /// No-op (`Ok`) if the key was already absent.
    async fn delete(&self, key: StoreKey) -> AgentResult<()>;
}

/// Reference implementation used by the demo binary and tests. Real
/// platforms back this with a flash-partition or file driver instead.
#[derive(Default)]
pub struct InMemoryKvStore {
    inner: Mutex<HashMap<&'static str, Vec<u8>>>,
    capacity_bytes: Option<usize>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity_bytes: None,
        }
    }

    /// Matches spec.md §4.1's "size bounds are platform-provided" — a
    /// write exceeding this bound fails with `AgentError::StorageFull`.
    pub fn with_capacity_bytes(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity_bytes: Some(capacity_bytes),
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set(&self, key: StoreKey, value: Bytes) -> AgentResult<()> {
        if let Some(cap) = self.capacity_bytes {
            if value.len() > cap {
                return Err(AgentError::StorageFull);
            }
        }
        let mut guard = self.inner.lock().await;
        let mut bytes = value.to_vec();
        let key_str = key.as_str();
        if key == StoreKey::PrivateKey {
            // Best-effort: scrub the staging copy once it's been moved into
            // the map; the map's own copy is freed on delete/overwrite.
            let stored = bytes.clone();
            guard.insert(key_str, stored);
            bytes.zeroize();
        } else {
            guard.insert(key_str, bytes);
        }
        Ok(())
    }

    async fn get(&self, key: StoreKey) -> AgentResult<Bytes> {
        let guard = self.inner.lock().await;
        guard
            .get(key.as_str())
            .map(|v| Bytes::from(v.clone()))
            .ok_or(AgentError::NotFound)
    }

    async fn delete(&self, key: StoreKey) -> AgentResult<()> {
        let mut guard = self.inner.lock().await;
        if let Some(mut v) = guard.remove(key.as_str()) {
            v.zeroize();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_set_is_not_found() {
        let store = InMemoryKvStore::new();
        assert!(matches!(
            store.get(StoreKey::DeviceConfig).await,
            Err(AgentError::NotFound)
        ));
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryKvStore::new();
        store
            .set(StoreKey::DeploymentData, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let got = store.get(StoreKey::DeploymentData).await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn present_empty_differs_from_absent() {
        let store = InMemoryKvStore::new();
        store
            .set(StoreKey::DeviceConfig, Bytes::new())
            .await
            .unwrap();
        let got = store.get(StoreKey::DeviceConfig).await.unwrap();
        assert_eq!(got, Bytes::new());
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let store = InMemoryKvStore::new();
        store
            .set(StoreKey::PublicKey, Bytes::from_static(b"key"))
            .await
            .unwrap();
        store.delete(StoreKey::PublicKey).await.unwrap();
        assert!(matches!(
            store.get(StoreKey::PublicKey).await,
            Err(AgentError::NotFound)
        ));
    }

    #[tokio::test]
    async fn capacity_bound_rejects_oversized_writes() {
        let store = InMemoryKvStore::with_capacity_bytes(4);
        let result = store
            .set(StoreKey::DeviceConfig, Bytes::from_static(b"too long"))
            .await;
        assert!(matches!(result, Err(AgentError::StorageFull)));
    }

    proptest::proptest! {
        #[test]
        fn set_get_delete_sequence_obeys_contract(
            ops in proptest::collection::vec(
                proptest::prop_oneof![
                    proptest::collection::vec(proptest::prelude::any::<u8>(), 0..16)
                        .prop_map(|v| Op::Set(v)),
                    proptest::prelude::Just(Op::Delete),
                    proptest::prelude::Just(Op::Get),
                ],
                0..50,
            )
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let store = InMemoryKvStore::new();
                let mut expected: Option<Vec<u8>> = None;
                for op in ops {
                    match op {
                        Op::Set(v) => {
                            store.set(StoreKey::DeviceConfig, Bytes::from(v.clone())).await.unwrap();
                            expected = Some(v);
                        }
                        Op::Delete => {
                            store.delete(StoreKey::DeviceConfig).await.unwrap();
                            expected = None;
                        }
                        Op::Get => {
                            let got = store.get(StoreKey::DeviceConfig).await;
                            match &expected {
                                Some(v) => assert_eq!(got.unwrap(), Bytes::from(v.clone())),
                                None => assert!(matches!(got, Err(AgentError::NotFound))),
                            }
                        }
                    }
                }
            });
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(Vec<u8>),
        Delete,
        Get,
    }
}
