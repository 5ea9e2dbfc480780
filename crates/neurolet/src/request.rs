//! Analysis requests and their per-item outcomes.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Anatomical category selecting the inference path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Brain,
    Chest,
    #[default]
    Auto,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brain => "brain",
            Self::Chest => "chest",
            Self::Auto => "auto",
        }
    }
}

impl std::str::FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "brain" => Ok(Self::Brain),
            "chest" => Ok(Self::Chest),
            "auto" => Ok(Self::Auto),
            other => Err(format!(
                "invalid modality '{other}', expected 'auto', 'brain' or 'chest'"
            )),
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to image bytes. The bytes are read only when the item is dispatched.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes { name: String, data: Arc<[u8]> },
}

impl ImageSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self::Bytes {
            name: name.into(),
            data: data.into(),
        }
    }

    /// File name reported to the service and the user.
    pub fn name(&self) -> String {
        match self {
            Self::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Bytes { name, .. } => name.clone(),
        }
    }

    pub async fn load(&self) -> std::io::Result<Arc<[u8]>> {
        match self {
            Self::Path(path) => Ok(tokio::fs::read(path).await?.into()),
            Self::Bytes { data, .. } => Ok(Arc::clone(data)),
        }
    }
}

/// One image submitted as part of a batch. Immutable once created.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub id: String,
    pub image: ImageSource,
    pub modality: Modality,
}

impl AnalysisRequest {
    pub fn new(image: ImageSource, modality: Modality) -> Self {
        Self::with_id(format!("req_{}", Uuid::new_v4().simple()), image, modality)
    }

    pub fn with_id(id: impl Into<String>, image: ImageSource, modality: Modality) -> Self {
        Self {
            id: id.into(),
            image,
            modality,
        }
    }
}

/// Why an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ServiceUnavailable,
    Inference,
    Network,
    MalformedResponse,
    ImageUnreadable,
}

impl ErrorKind {
    /// Whether a fresh attempt can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Inference => "inference",
            Self::Network => "network",
            Self::MalformedResponse => "malformed_response",
            Self::ImageUnreadable => "image_unreadable",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful diagnosis returned by the inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub prediction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub confidence_distribution: std::collections::BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medical_info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<String>,
}

/// Settled result of one request. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub request_id: String,
    pub image_name: String,
    pub success: bool,
    #[serde(flatten)]
    pub diagnosis: Option<Diagnosis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl AnalysisOutcome {
    pub fn succeeded(request: &AnalysisRequest, diagnosis: Diagnosis, attempts: u32) -> Self {
        Self {
            request_id: request.id.clone(),
            image_name: request.image.name(),
            success: true,
            diagnosis: Some(diagnosis),
            error_kind: None,
            error: None,
            attempts,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        request: &AnalysisRequest,
        kind: ErrorKind,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            request_id: request.id.clone(),
            image_name: request.image.name(),
            success: false,
            diagnosis: None,
            error_kind: Some(kind),
            error: Some(error.into()),
            attempts,
            completed_at: Utc::now(),
        }
    }

    pub fn prediction(&self) -> Option<&str> {
        self.diagnosis.as_ref().map(|d| d.prediction.as_str())
    }
}
