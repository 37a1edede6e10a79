//! The HTTP client transport is consumed, not defined, by this crate
//! (spec.md §1, §6). This module only fixes the event callback contract
//! so the deployment engine and the channel codec's healthcheck work
//! item can be written against a trait instead of a concrete client.

use async_trait::async_trait;
use http::Method;

use crate::error::AgentResult;

/// Mirrors spec.md §6's `perform(...)` event stream. `DataReceived` may
/// fire multiple times for a single response body; returning an error
/// from the callback aborts the stream.
#[derive(Debug)]
pub enum HttpEvent<'a> {
    Connected,
    DataReceived(&'a [u8]),
    Disconnected,
    Error(String),
}

/// One HTTP call as spec.md §6 describes it: a path (absolute or
/// relative to the configured host), a method, an optional body, an
/// optional bearer token, and an optional `X-MEN-Signature` header
/// value.
pub struct HttpRequest<'a> {
    pub token: Option<&'a str>,
    pub path: &'a str,
    pub method: Method,
    pub body: Option<&'a [u8]>,
    pub signature: Option<&'a [u8]>,
}

/// The injected HTTP transport trait (spec.md §9 "Re-model as a
/// trait/interface... injected at construction").
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Performs one request, invoking `on_event` for each event in
    /// order. Returns the final status code once the exchange
    /// completes.
    async fn perform(
        &self,
        request: HttpRequest<'_>,
        on_event: &mut (dyn FnMut(HttpEvent<'_>) -> AgentResult<()> + Send),
    ) -> AgentResult<u16>;

    /// Requests that the underlying connection be established ahead of
    /// use (spec.md §4.6.5 healthcheck, §9 "network-guarded" inventory
    /// and configuration variants). A no-op for transports that connect
    /// lazily per-request.
    async fn connect(&self) -> AgentResult<()> {
        Ok(())
    }

    /// Releases a connection opened by [`HttpClient::connect`].
    async fn release(&self) -> AgentResult<()> {
        Ok(())
    }
}

/// Convenience for callers that just want the fully buffered response
/// body rather than driving the event callback themselves.
pub async fn perform_buffered(
    client: &dyn HttpClient,
    request: HttpRequest<'_>,
) -> AgentResult<(u16, Vec<u8>)> {
    let mut body = Vec::new();
    let status = client
        .perform(request, &mut |event| {
            if let HttpEvent::DataReceived(chunk) = event {
                body.extend_from_slice(chunk);
            }
            Ok(())
        })
        .await?;
    Ok((status, body))
}
