//! Inference service contract and its HTTP client.
//!
//! Speaks the service's JSON API:
//! - `GET /health` liveness/readiness
//! - `POST /analyze` one image per call, base64 data URI payload
//! - `GET /models/info` per-modality model availability

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::request::{Diagnosis, ErrorKind, Modality};

pub const NEUROLET_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, thiserror::Error)]
pub enum InferenceError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("service error (status {status}): {message}")]
    Service { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl InferenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Network(_) => ErrorKind::Network,
            Self::Service { .. } => ErrorKind::Inference,
            Self::Malformed(_) => ErrorKind::MalformedResponse,
            Self::Unavailable(_) => ErrorKind::ServiceUnavailable,
        }
    }

    fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            Self::Timeout(timeout)
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Result of one liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    pub models_loaded: bool,
    pub detail: Option<String>,
}

/// Payload of one analyze call.
#[derive(Debug, Clone)]
pub struct AnalyzeCall {
    pub image_name: String,
    pub image: std::sync::Arc<[u8]>,
    pub modality: Modality,
}

/// Availability of one model as reported by `/models/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub available: bool,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// The external inference service as seen by the orchestrator.
///
/// Separates the dispatcher and prober from HTTP so both can be tested
/// against an in-process double.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn health(&self) -> Result<HealthReport, InferenceError>;

    async fn analyze(&self, call: AnalyzeCall) -> Result<Diagnosis, InferenceError>;

    async fn models_info(&self) -> Result<BTreeMap<String, ModelInfo>, InferenceError>;

    /// Ask the running service to load its models again. Returns the
    /// service's confirmation message.
    async fn reload_models(&self) -> Result<String, InferenceError>;
}

#[derive(Deserialize)]
struct HealthBody {
    status: String,
    #[serde(default)]
    models: BTreeMap<String, bool>,
    #[serde(default, alias = "modelsLoaded")]
    models_loaded: Option<bool>,
}

#[derive(Serialize)]
struct AnalyzeBody<'a> {
    image_data: String,
    image_name: &'a str,
    analysis_type: Modality,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(default = "default_true")]
    success: bool,
    prediction: Option<String>,
    model_type: Option<String>,
    confidence: Option<f64>,
    #[serde(default, alias = "confidenceDistribution", alias = "confidence_distribution")]
    all_predictions: Option<BTreeMap<String, f64>>,
    medical_info: Option<serde_json::Value>,
    analysis_id: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ReloadResponse {
    #[serde(default)]
    success: bool,
    message: Option<String>,
    #[serde(alias = "error")]
    detail: Option<String>,
}

fn default_true() -> bool {
    true
}

/// HTTP client for the local inference service.
pub struct HttpInferenceClient {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpInferenceClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let user_agent = format!("neurolet/{}", NEUROLET_VERSION);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|e| InferenceError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            request_timeout,
            probe_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Encode image bytes as a data URI, mime guessed from the file name.
pub fn to_data_uri(image_name: &str, bytes: &[u8]) -> String {
    let mime = mime_guess::from_path(image_name)
        .first_or_octet_stream()
        .to_string();
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{mime};base64,{encoded}")
}

#[async_trait]
impl InferenceService for HttpInferenceClient {
    async fn health(&self) -> Result<HealthReport, InferenceError> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| InferenceError::from_reqwest(e, self.probe_timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Ok(HealthReport {
                healthy: false,
                models_loaded: false,
                detail: Some(format!("health endpoint returned {}", status.as_u16())),
            });
        }

        let body: HealthBody = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;

        let healthy = body.status.eq_ignore_ascii_case("healthy");
        let models_loaded = body
            .models_loaded
            .unwrap_or_else(|| body.models.values().any(|loaded| *loaded));
        Ok(HealthReport {
            healthy,
            models_loaded,
            detail: (!healthy).then(|| format!("service reports status '{}'", body.status)),
        })
    }

    async fn analyze(&self, call: AnalyzeCall) -> Result<Diagnosis, InferenceError> {
        let body = AnalyzeBody {
            image_data: to_data_uri(&call.image_name, &call.image),
            image_name: &call.image_name,
            analysis_type: call.modality,
        };

        let response = self
            .client
            .post(self.url("/analyze"))
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::from_reqwest(e, self.request_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_default();
            return Err(InferenceError::Service {
                status: status.as_u16(),
                message: if message.is_empty() {
                    status.to_string()
                } else {
                    message
                },
            });
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;

        if !parsed.success {
            return Err(InferenceError::Service {
                status: status.as_u16(),
                message: parsed
                    .error
                    .unwrap_or_else(|| "analysis failed".to_string()),
            });
        }

        let prediction = parsed
            .prediction
            .ok_or_else(|| InferenceError::Malformed("missing prediction".to_string()))?;

        Ok(Diagnosis {
            prediction,
            model_type: parsed.model_type,
            confidence: parsed.confidence,
            confidence_distribution: parsed.all_predictions.unwrap_or_default(),
            medical_info: parsed.medical_info,
            analysis_id: parsed.analysis_id,
        })
    }

    async fn models_info(&self) -> Result<BTreeMap<String, ModelInfo>, InferenceError> {
        let response = self
            .client
            .get(self.url("/models/info"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| InferenceError::from_reqwest(e, self.probe_timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Service {
                status: status.as_u16(),
                message: "models info unavailable".to_string(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))
    }

    async fn reload_models(&self) -> Result<String, InferenceError> {
        let response = self
            .client
            .post(self.url("/models/reload"))
            .send()
            .await
            .map_err(|e| InferenceError::from_reqwest(e, self.request_timeout))?;

        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        let parsed: Option<ReloadResponse> = serde_json::from_str(&raw).ok();

        match parsed {
            Some(body) if status.is_success() && body.success => Ok(body
                .message
                .unwrap_or_else(|| "models reloaded".to_string())),
            Some(body) => Err(InferenceError::Service {
                status: status.as_u16(),
                message: body
                    .detail
                    .or(body.message)
                    .unwrap_or_else(|| "model reload failed".to_string()),
            }),
            None if status.is_success() => Err(InferenceError::Malformed(format!(
                "unexpected reload response: {raw}"
            ))),
            None => Err(InferenceError::Service {
                status: status.as_u16(),
                message: if raw.is_empty() { status.to_string() } else { raw },
            }),
        }
    }
}
