//! HTTP client for the remote inference endpoint.

use serde_json::Value;
use tracing::info;

use super::ForecastRequest;
use crate::config::PredictionSettings;
use crate::upstream::{read_json, UpstreamError};

const SERVICE: &str = "inference endpoint";

/// Thin client for the remote scoring endpoint.
pub struct InferenceClient {
    http: reqwest::Client,
    settings: PredictionSettings,
}

impl InferenceClient {
    // ---
    pub fn new(http: reqwest::Client, settings: PredictionSettings) -> Self {
        Self { http, settings }
    }

    /// POST the request payload with the bearer token and return the raw JSON.
    pub async fn predict(&self, request: &ForecastRequest) -> Result<Value, UpstreamError> {
        // ---
        info!(
            endpoint = %self.settings.endpoint_url,
            series = request.series_count(),
            synthetic = request.synthetic,
            "Calling inference endpoint"
        );

        let response = self
            .http
            .post(&self.settings.endpoint_url)
            .bearer_auth(&self.settings.api_key)
            .timeout(self.settings.timeout)
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(SERVICE, e))?;

        read_json(SERVICE, response).await
    }
}
