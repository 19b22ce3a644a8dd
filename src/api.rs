use crate::error::PipelineError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Outcome of one batch submission.
///
/// `status_code` is the HTTP status, or `None` when the transport failed
/// before producing a response (classified as `-1` by the uploader).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResponse {
    pub status_code: Option<i32>,
}

impl BatchResponse {
    pub fn status(code: i32) -> Self {
        Self { status_code: Some(code) }
    }

    pub fn transport_failure() -> Self {
        Self { status_code: None }
    }
}

/// Remote sink for event batches.
#[async_trait]
pub trait BatchEndpoint: Send + Sync {
    async fn send_batch(&self, events: &[Value]) -> BatchResponse;
}

/// Identity forwarded to remote flag evaluation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecideRequest {
    pub distinct_id: String,

    #[serde(rename = "$anon_distinct_id", skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,

    #[serde(rename = "$groups", skip_serializing_if = "HashMap::is_empty")]
    pub groups: HashMap<String, String>,
}

/// Remote feature-flag evaluation endpoint.
///
/// Returns the raw response body; the flag cache owns shape validation.
#[async_trait]
pub trait DecideEndpoint: Send + Sync {
    async fn decide(&self, request: &DecideRequest) -> Result<Value, PipelineError>;
}

/// Default HTTP implementation of both endpoints.
#[derive(Debug, Clone)]
pub struct HttpApi {
    host: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpApi {
    pub fn new(host: impl Into<String>, api_key: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            host: host.trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BatchEndpoint for HttpApi {
    async fn send_batch(&self, events: &[Value]) -> BatchResponse {
        let body = serde_json::json!({
            "api_key": self.api_key,
            "batch": events,
        });

        match self
            .http
            .post(format!("{}/batch", self.host))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => BatchResponse::status(resp.status().as_u16() as i32),
            Err(err) => {
                tracing::warn!(error = %err, "batch POST failed");
                BatchResponse::transport_failure()
            }
        }
    }
}

#[async_trait]
impl DecideEndpoint for HttpApi {
    async fn decide(&self, request: &DecideRequest) -> Result<Value, PipelineError> {
        let mut body = serde_json::to_value(request)?;
        body["api_key"] = Value::String(self.api_key.clone());

        let resp = self
            .http
            .post(format!("{}/decide?v=3", self.host))
            .json(&body)
            .send()
            .await
            .map_err(|err| PipelineError::Endpoint(err.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::Endpoint(format!("decide returned HTTP {status}")));
        }

        resp.json()
            .await
            .map_err(|err| PipelineError::Endpoint(err.to_string()))
    }
}
