//! Minimal wiring demo: brings up an [`ota_agent_core::Agent`] backed
//! entirely by in-memory/no-op component implementations so the core
//! can be exercised without a real platform. Prints the deployment
//! engine's poll cadence and exits; real platforms replace `main` with
//! their own integration that never returns.

use std::sync::Arc;

use async_trait::async_trait;
use ota_agent_core::error::AgentResult;
use ota_agent_core::http::{HttpClient, HttpEvent, HttpRequest};
use ota_agent_core::demo_agent;
use tracing_subscriber::EnvFilter;

/// Reports every `next`-deployment check as "nothing pending" and
/// every other call as not found, so the demo agent's scheduled work
/// runs forever without ever finding (or needing) a real server.
struct NullHttpClient;

#[async_trait]
impl HttpClient for NullHttpClient {
    async fn perform(
        &self,
        request: HttpRequest<'_>,
        on_event: &mut (dyn FnMut(HttpEvent<'_>) -> AgentResult<()> + Send),
    ) -> AgentResult<u16> {
        if request.path.contains("/authentication/") {
            on_event(HttpEvent::DataReceived(b"demo-token"))?;
            return Ok(200);
        }
        if request.path.contains("/deployments/next") {
            return Ok(204);
        }
        Ok(404)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let agent = demo_agent("https://example.test", Arc::new(NullHttpClient));
    agent.start().await;

    tracing::info!("demo agent started; polling for deployments on a 10-minute cadence");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    tracing::info!("demo run complete");
}
