//! Deployment status reporting (spec.md §4.5.5): pushes the current
//! [`DeploymentStatus`] to the service as the deployment progresses.

use http::Method;
use serde::Serialize;

use crate::deployment::state::DeploymentStatus;
use crate::error::{AgentError, AgentResult};
use crate::http::{perform_buffered, HttpClient, HttpRequest};

#[derive(Serialize)]
struct StatusBody {
    status: DeploymentStatus,
}

/// `PUT /api/devices/v1/deployments/device/deployments/{id}/status`
/// (spec.md §4.5.5). A non-2xx response is surfaced as a
/// `NetworkError`; the caller decides whether to retry.
pub async fn report_status(
    client: &dyn HttpClient,
    token: &str,
    deployment_id: &str,
    status: DeploymentStatus,
) -> AgentResult<()> {
    let path = format!(
        "/api/devices/v1/deployments/device/deployments/{deployment_id}/status"
    );
    let body = serde_json::to_vec(&StatusBody { status })?;
    let (code, _) = perform_buffered(
        client,
        HttpRequest {
            token: Some(token),
            path: &path,
            method: Method::PUT,
            body: Some(&body),
            signature: None,
        },
    )
    .await?;
    if (200..300).contains(&code) {
        Ok(())
    } else {
        Err(AgentError::NetworkError(format!(
            "status report rejected with {code}"
        )))
    }
}
