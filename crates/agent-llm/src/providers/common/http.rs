//! Request plumbing shared by the HTTP adapters.

use futures_util::StreamExt;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::provider::{LLMError, LLMStream, Result};

/// Send `request`, racing it against `cancel`, and reject non-2xx responses.
pub async fn send_checked(request: RequestBuilder, cancel: &CancellationToken) -> Result<Response> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(LLMError::Cancelled),
        response = request.send() => response?,
    };

    ensure_success(response).await
}

/// Turn a non-2xx response into `LLMError::Api` carrying status and body.
pub async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    log::debug!("HTTP {} from provider: {}", status, body);
    Err(LLMError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Read and decode a complete JSON body. Decode failures are fatal.
pub async fn read_json<T: DeserializeOwned>(
    response: Response,
    cancel: &CancellationToken,
) -> Result<T> {
    let bytes = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(LLMError::Cancelled),
        bytes = response.bytes() => bytes?,
    };

    serde_json::from_slice(&bytes).map_err(|error| {
        LLMError::InvalidResponse(format!("failed to decode response body: {error}"))
    })
}

/// End `stream` as soon as `cancel` fires.
pub fn cancellable(stream: LLMStream, cancel: &CancellationToken) -> LLMStream {
    Box::pin(stream.take_until(cancel.clone().cancelled_owned()))
}
