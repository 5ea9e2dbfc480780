//! neurolet: supervisor and batch orchestrator for a local medical-image inference service.

mod batch;
mod prober;
mod status;

pub mod config;
pub mod dispatcher;
pub mod history;
pub mod inference;
pub mod process;
pub mod request;
pub mod service;

pub use batch::{AggregateError, BatchRun, BatchStatus, RequestSummary, ResultAggregator};
pub use config::{
    ConfigError, DispatchConfig, LaunchConfig, ProbeConfig, RestartPolicy, ServiceConfig,
};
pub use dispatcher::{DispatchEvent, DispatchSummary, Dispatcher, Progress, SubmitError};
pub use history::{HistoryError, HistoryPage, HistorySink, JsonFileHistory};
pub use inference::{
    HttpInferenceClient, InferenceError, InferenceService, ModelInfo, NEUROLET_VERSION,
};
pub use prober::HealthProber;
pub use process::{ProcessSupervisor, SpawnError, SupervisorError};
pub use request::{AnalysisOutcome, AnalysisRequest, Diagnosis, ErrorKind, ImageSource, Modality};
pub use service::{AnalysisService, BatchEvent, BatchHandle, InitSummary};
pub use status::{ServiceState, ServiceStatus, StatusBoard};
