//! Bounded-concurrency dispatch of a batch to the inference service.
//!
//! One control loop owns the work queue. At most `limit` analyze calls are
//! polled at once; queued requests are admitted as slots free up, and the
//! cancellation token is checked before every admission.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::batch::AggregateError;
use crate::config::DispatchConfig;
use crate::inference::{AnalyzeCall, InferenceError, InferenceService};
use crate::request::{AnalysisOutcome, AnalysisRequest, Diagnosis, ErrorKind};
use crate::status::{ServiceState, ServiceStatus};

/// Batch-level misuse, rejected before anything is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("batch contains no images")]
    EmptyBatch,
    #[error("batch {0} is still running")]
    BatchInProgress(String),
    #[error("inference service is {0}, not accepting work")]
    ServiceUnavailable(ServiceState),
    #[error("concurrency limit must be at least 1")]
    InvalidConcurrency,
    #[error("invalid batch: {0}")]
    InvalidBatch(#[from] AggregateError),
}

/// One settled request.
#[derive(Debug, Clone)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub outcome: AnalysisOutcome,
}

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Progress(Progress),
    /// Cancellation observed; no further events follow.
    Cancelled {
        completed: usize,
        /// Requests that were still queued and never sent
        not_dispatched: usize,
        /// Calls in flight when cancellation hit; their results are discarded
        abandoned: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub total: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub cancelled: bool,
}

#[derive(Debug, thiserror::Error)]
enum ItemError {
    #[error("failed to read image: {0}")]
    Image(#[from] std::io::Error),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl ItemError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Image(_) => ErrorKind::ImageUnreadable,
            Self::Inference(e) => e.kind(),
        }
    }
}

pub struct Dispatcher {
    service: Arc<dyn InferenceService>,
    status: watch::Receiver<ServiceStatus>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        service: Arc<dyn InferenceService>,
        status: watch::Receiver<ServiceStatus>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            service,
            status,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Fail fast unless the service is `Ready` or `Degraded`.
    pub fn ensure_ready(&self) -> Result<(), SubmitError> {
        let state = self.status.borrow().state;
        match state {
            ServiceState::Ready => Ok(()),
            ServiceState::Degraded => {
                tracing::warn!("Dispatching while inference service is degraded");
                Ok(())
            }
            other => Err(SubmitError::ServiceUnavailable(other)),
        }
    }

    /// Check readiness, then run the batch to completion or cancellation.
    pub async fn submit<F>(
        &self,
        requests: Vec<AnalysisRequest>,
        limit: usize,
        cancel: &CancellationToken,
        on_event: F,
    ) -> Result<DispatchSummary, SubmitError>
    where
        F: FnMut(DispatchEvent),
    {
        if requests.is_empty() {
            return Err(SubmitError::EmptyBatch);
        }
        if limit == 0 {
            return Err(SubmitError::InvalidConcurrency);
        }
        self.ensure_ready()?;
        Ok(self.run(requests, limit, cancel, on_event).await)
    }

    /// Dispatch without the up-front readiness check.
    ///
    /// Items still check the status individually, so a service that goes
    /// down mid-batch fails the remaining items with `ServiceUnavailable`
    /// instead of waiting on timeouts.
    pub async fn run<F>(
        &self,
        requests: Vec<AnalysisRequest>,
        limit: usize,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> DispatchSummary
    where
        F: FnMut(DispatchEvent),
    {
        let total = requests.len();
        let limit = limit.max(1);
        let mut queue = requests.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut dispatched = 0;
        let mut completed = 0;

        loop {
            while in_flight.len() < limit && !cancel.is_cancelled() {
                let Some(request) = queue.next() else {
                    break;
                };
                dispatched += 1;
                tracing::debug!(
                    request_id = %request.id,
                    in_flight = in_flight.len() + 1,
                    "Dispatching request"
                );
                in_flight.push(self.analyze(request));
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(outcome) = in_flight.next() => {
                    completed += 1;
                    on_event(DispatchEvent::Progress(Progress {
                        completed,
                        total,
                        outcome,
                    }));
                }
            }
        }

        let cancelled = cancel.is_cancelled() && completed < total;
        if cancelled {
            let not_dispatched = queue.len();
            let abandoned = in_flight.len();
            // Dropping the futures drops the underlying HTTP requests.
            drop(in_flight);
            tracing::info!(completed, not_dispatched, abandoned, "Dispatch cancelled");
            on_event(DispatchEvent::Cancelled {
                completed,
                not_dispatched,
                abandoned,
            });
        }

        DispatchSummary {
            total,
            dispatched,
            completed,
            cancelled,
        }
    }

    async fn analyze(&self, request: AnalysisRequest) -> AnalysisOutcome {
        let image = match request.image.load().await {
            Ok(image) => image,
            Err(e) => {
                let e = ItemError::from(e);
                tracing::warn!(request_id = %request.id, error = %e, "Image unreadable");
                return AnalysisOutcome::failed(&request, e.kind(), e.to_string(), 1);
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = AnalyzeCall {
                image_name: request.image.name(),
                image: Arc::clone(&image),
                modality: request.modality,
            };
            match self.attempt(call).await {
                Ok(diagnosis) => {
                    tracing::info!(
                        request_id = %request.id,
                        prediction = %diagnosis.prediction,
                        attempt,
                        "Analysis succeeded"
                    );
                    return AnalysisOutcome::succeeded(&request, diagnosis, attempt);
                }
                Err(e) if e.kind().is_transient() && attempt <= self.config.item_retries => {
                    tracing::debug!(
                        request_id = %request.id,
                        error = %e,
                        attempt,
                        "Retrying request"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %request.id,
                        error_kind = %e.kind(),
                        error = %e,
                        attempt,
                        "Analysis failed"
                    );
                    return AnalysisOutcome::failed(&request, e.kind(), e.to_string(), attempt);
                }
            }
        }
    }

    async fn attempt(&self, call: AnalyzeCall) -> Result<Diagnosis, ItemError> {
        let state = self.status.borrow().state;
        if !state.accepts_work() {
            return Err(InferenceError::Unavailable(format!("service is {state}")).into());
        }

        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, self.service.analyze(call)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(InferenceError::Timeout(timeout).into()),
        }
    }
}

/// Scripted inference double shared by dispatcher and facade tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::inference::{AnalyzeCall, HealthReport, InferenceError, InferenceService, ModelInfo};
    use crate::request::Diagnosis;

    /// Answers every analyze call after `delay`, tracking how many calls
    /// overlap.
    pub struct MockInference {
        delay: Duration,
        failing: HashSet<String>,
        flaky: Mutex<HashMap<String, u32>>,
        pub healthy: AtomicBool,
        calls: AtomicUsize,
        reloads: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl MockInference {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                failing: HashSet::new(),
                flaky: Mutex::new(HashMap::new()),
                healthy: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
                reloads: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        /// Images whose analysis the service rejects.
        pub fn failing<I: IntoIterator<Item = &'static str>>(mut self, names: I) -> Self {
            self.failing = names.into_iter().map(String::from).collect();
            self
        }

        /// `name` fails with a network error `times` times, then succeeds.
        pub fn flaky(self, name: &str, times: u32) -> Self {
            self.flaky.lock().unwrap().insert(name.to_string(), times);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        pub fn reloads(&self) -> usize {
            self.reloads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InferenceService for MockInference {
        async fn health(&self) -> Result<HealthReport, InferenceError> {
            let healthy = self.healthy.load(Ordering::SeqCst);
            Ok(HealthReport {
                healthy,
                models_loaded: healthy,
                detail: None,
            })
        }

        async fn analyze(&self, call: AnalyzeCall) -> Result<Diagnosis, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            tokio::time::sleep(self.delay).await;

            if self.failing.contains(&call.image_name) {
                return Err(InferenceError::Service {
                    status: 500,
                    message: "Model prediction failed".to_string(),
                });
            }
            {
                let mut flaky = self.flaky.lock().unwrap();
                if let Some(left) = flaky.get_mut(&call.image_name)
                    && *left > 0
                {
                    *left -= 1;
                    return Err(InferenceError::Network("connection reset".to_string()));
                }
            }

            Ok(Diagnosis {
                prediction: "No Tumor".to_string(),
                model_type: Some(call.modality.to_string()),
                confidence: Some(97.5),
                confidence_distribution: [
                    ("Glioma".to_string(), 1.0),
                    ("No Tumor".to_string(), 97.5),
                ]
                .into_iter()
                .collect(),
                medical_info: None,
                analysis_id: None,
            })
        }

        async fn models_info(&self) -> Result<BTreeMap<String, ModelInfo>, InferenceError> {
            Ok([(
                "brain".to_string(),
                ModelInfo {
                    available: true,
                    classes: vec!["Glioma".to_string(), "No Tumor".to_string()],
                    path: None,
                },
            )]
            .into_iter()
            .collect())
        }

        async fn reload_models(&self) -> Result<String, InferenceError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok("Models reloaded".to_string())
        }
    }
}
