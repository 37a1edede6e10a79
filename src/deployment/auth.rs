//! Device authentication (spec.md §4.5.3): sign the identity payload
//! and exchange it for a bearer token before any other server call.

use http::Method;

use crate::error::{AgentError, AgentResult};
use crate::http::{perform_buffered, HttpClient, HttpRequest};
use crate::identity::{AuthRequest, CryptoSigner, Identity};

const AUTH_PATH: &str = "/api/devices/v1/authentication/auth_requests";

/// Performs one authentication round trip, returning the bearer token
/// the deployment engine attaches to every subsequent request.
pub async fn authenticate(
    client: &dyn HttpClient,
    signer: &dyn CryptoSigner,
    identity: &Identity,
    tenant_token: Option<&str>,
) -> AgentResult<String> {
    let pubkey_der = signer.public_key_der().await?;
    let request_body = AuthRequest {
        id_data: identity,
        pubkey: hex::encode(&pubkey_der),
        tenant_token,
    };
    let payload = serde_json::to_vec(&request_body)?;
    let signature = signer.sign(&payload).await?;

    let (status, body) = perform_buffered(
        client,
        HttpRequest {
            token: None,
            path: AUTH_PATH,
            method: Method::POST,
            body: Some(&payload),
            signature: Some(&signature),
        },
    )
    .await?;

    match status {
        200 => {
            let token = String::from_utf8(body)
                .map_err(|e| AgentError::Malformed(format!("non-utf8 auth token: {e}")))?;
            Ok(token)
        }
        401 | 403 => Err(AgentError::AuthRequired),
        other => Err(AgentError::NetworkError(format!(
            "authentication failed with status {other}"
        ))),
    }
}
