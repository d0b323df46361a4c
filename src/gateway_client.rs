use crate::errors::FunnelError;
use crate::models::LeadPayload;
use async_trait::async_trait;
use std::time::Duration;

pub const DEFAULT_CAPTURE_PATH: &str = "/api/leads/capture/";

/// Raw answer from the lead API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// Server-provided error message: `detail`, then `error`, else
    /// `Error <status>`.
    pub fn error_message(&self) -> String {
        serde_json::from_str::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| {
                v.get("detail")
                    .or_else(|| v.get("error"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("Error {}", self.status))
    }
}

/// Delivers lead payloads to the remote API.
///
/// `Err` means the request never produced an HTTP response (connection
/// refused, timeout, body read failure).
#[async_trait]
pub trait LeadTransport: Send + Sync {
    async fn post_lead(&self, payload: &LeadPayload) -> Result<TransportResponse, FunnelError>;
}

/// Client for the lead capture endpoint.
#[derive(Clone)]
pub struct HttpLeadTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLeadTransport {
    /// Creates a new `HttpLeadTransport`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Origin of the lead API, e.g. `https://digisoftnexus.in`.
    /// * `capture_path` - Path of the capture endpoint.
    /// * `timeout` - Per-request timeout.
    pub fn new(base_url: &str, capture_path: &str, timeout: Duration) -> Result<Self, FunnelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                FunnelError::TransportError(format!("Failed to create lead API client: {}", e))
            })?;

        let endpoint = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            capture_path.trim_start_matches('/')
        );

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LeadTransport for HttpLeadTransport {
    async fn post_lead(&self, payload: &LeadPayload) -> Result<TransportResponse, FunnelError> {
        tracing::debug!("POST {}", self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| FunnelError::TransportError(format!("Lead API request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            FunnelError::TransportError(format!("Failed to read lead API response: {}", e))
        })?;

        tracing::debug!("Lead API answered {}", status);
        Ok(TransportResponse { status, body })
    }
}
