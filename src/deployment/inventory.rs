//! `inventory_publish` and `configuration_sync` (spec.md §5, SPEC_FULL.md
//! §3): the two scheduled work items that keep the service's view of
//! this device's attributes and configuration up to date. Both follow
//! the "network-guarded" lifecycle spec.md §9 names authoritative:
//! `connect` once, perform the one request, `release`.

use http::Method;
use std::sync::Arc;

use crate::error::{AgentResult, WorkOutcome};
use crate::http::{perform_buffered, HttpClient, HttpRequest};
use crate::kv_store::{KvStore, StoreKey};
use crate::scheduler::WorkFn;

const INVENTORY_PATH: &str = "/api/devices/v1/inventory/device/attributes";
const CONFIGURATION_PATH: &str = "/api/devices/v1/deviceconfig/configuration";

/// Pushes the device's current inventory attributes (already encoded
/// as JSON bytes by the caller) to the service.
pub async fn inventory_publish(
    http: &dyn HttpClient,
    token: &str,
    attributes_json: &[u8],
) -> AgentResult<WorkOutcome> {
    http.connect().await?;
    let (status, _) = perform_buffered(
        http,
        HttpRequest {
            token: Some(token),
            path: INVENTORY_PATH,
            method: Method::PUT,
            body: Some(attributes_json),
            signature: None,
        },
    )
    .await?;
    http.release().await?;
    if (200..300).contains(&status) {
        Ok(WorkOutcome::KeepScheduled)
    } else {
        Err(crate::error::AgentError::NetworkError(format!(
            "inventory push rejected with {status}"
        )))
    }
}

/// Fetches the service's desired device configuration and persists it
/// to `StoreKey::DeviceConfig`, if it differs from what's already
/// stored.
pub async fn configuration_sync(
    http: &dyn HttpClient,
    kv: &dyn KvStore,
    token: &str,
) -> AgentResult<WorkOutcome> {
    http.connect().await?;
    let (status, body) = perform_buffered(
        http,
        HttpRequest {
            token: Some(token),
            path: CONFIGURATION_PATH,
            method: Method::GET,
            body: None,
            signature: None,
        },
    )
    .await?;
    http.release().await?;

    match status {
        200 => {
            kv.set(StoreKey::DeviceConfig, body.into()).await?;
            Ok(WorkOutcome::KeepScheduled)
        }
        204 => Ok(WorkOutcome::KeepScheduled),
        other => Err(crate::error::AgentError::NetworkError(format!(
            "configuration fetch rejected with {other}"
        ))),
    }
}

/// Wraps [`inventory_publish`] as a `WorkFn`. The attributes JSON is
/// supplied by a closure so the caller can refresh it between ticks
/// without re-registering the work item.
pub fn inventory_publish_work_fn(
    http: Arc<dyn HttpClient>,
    token: Arc<dyn Fn() -> Option<String> + Send + Sync>,
    attributes_json: Arc<dyn Fn() -> Vec<u8> + Send + Sync>,
) -> WorkFn {
    Arc::new(move || {
        let http = http.clone();
        let token = token.clone();
        let attributes_json = attributes_json.clone();
        Box::pin(async move {
            let token = token().ok_or(crate::error::AgentError::AuthRequired)?;
            let body = attributes_json();
            inventory_publish(http.as_ref(), &token, &body).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::InMemoryKvStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        connects: AtomicUsize,
        releases: AtomicUsize,
        status: u16,
        body: Vec<u8>,
    }

    #[async_trait]
    impl HttpClient for CountingClient {
        async fn perform(
            &self,
            _request: HttpRequest<'_>,
            on_event: &mut (dyn FnMut(crate::http::HttpEvent<'_>) -> AgentResult<()> + Send),
        ) -> AgentResult<u16> {
            on_event(crate::http::HttpEvent::DataReceived(&self.body))?;
            Ok(self.status)
        }

        async fn connect(&self) -> AgentResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&self) -> AgentResult<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn inventory_publish_connects_and_releases_around_the_call() {
        let client = CountingClient {
            connects: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            status: 200,
            body: Vec::new(),
        };
        inventory_publish(&client, "tok", b"{}").await.unwrap();
        assert_eq!(client.connects.load(Ordering::SeqCst), 1);
        assert_eq!(client.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn configuration_sync_persists_a_200_body() {
        let client = CountingClient {
            connects: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            status: 200,
            body: b"{\"led\":\"on\"}".to_vec(),
        };
        let kv = InMemoryKvStore::new();
        configuration_sync(&client, &kv, "tok").await.unwrap();
        let stored = kv.get(StoreKey::DeviceConfig).await.unwrap();
        assert_eq!(stored, bytes::Bytes::from_static(b"{\"led\":\"on\"}"));
    }

    #[tokio::test]
    async fn configuration_sync_ignores_a_204() {
        let client = CountingClient {
            connects: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            status: 204,
            body: Vec::new(),
        };
        let kv = InMemoryKvStore::new();
        let outcome = configuration_sync(&client, &kv, "tok").await.unwrap();
        assert_eq!(outcome, WorkOutcome::KeepScheduled);
        assert!(matches!(
            kv.get(StoreKey::DeviceConfig).await,
            Err(crate::error::AgentError::NotFound)
        ));
    }
}
