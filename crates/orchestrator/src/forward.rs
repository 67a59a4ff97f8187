//! HTTP client for server-mode workers.
//!
//! A running server-mode worker listens on `127.0.0.1:<port>` and accepts a
//! JSON [`GenerationRequest`] on its generation endpoint. A successful
//! response body is the artifact itself.

use std::time::Duration;

use kiln_core::request::GenerationRequest;

/// Errors from forwarding a request to a server-mode worker.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The HTTP request itself failed (connect, timeout, etc.).
    #[error("Worker request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The worker returned a non-2xx status code.
    #[error("Worker returned {status}: {body}")]
    Status {
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// Client shared by every server-mode dispatch.
#[derive(Debug, Clone)]
pub struct ServerWorkerClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl ServerWorkerClient {
    /// `timeout` bounds each forwarded request end to end.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Reuse an existing [`reqwest::Client`] (for connection pooling).
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// `POST` `request` to `http://127.0.0.1:<port><endpoint>` and return the
    /// response body.
    pub async fn generate(
        &self,
        port: u16,
        endpoint: &str,
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, ForwardError> {
        let url = worker_url(port, endpoint);
        tracing::debug!(url = %url, "Forwarding request to server worker");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Return the response unchanged on success, or a
    /// [`ForwardError::Status`] carrying the status and body text.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ForwardError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ForwardError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

fn worker_url(port: u16, endpoint: &str) -> String {
    if endpoint.starts_with('/') {
        format!("http://127.0.0.1:{port}{endpoint}")
    } else {
        format!("http://127.0.0.1:{port}/{endpoint}")
    }
}
