//! The orchestrator facade: the only type a front end talks to.
//!
//! [`AnalysisService`] wires the supervisor, prober, dispatcher and result
//! aggregator together and hands out [`BatchHandle`]s. Status and batch
//! state are exposed read-only (snapshots and `watch` subscriptions).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{BatchRun, ResultAggregator};
use crate::config::ServiceConfig;
use crate::dispatcher::{DispatchEvent, Dispatcher, Progress, SubmitError};
use crate::history::{HistorySink, JsonFileHistory};
use crate::inference::{HttpInferenceClient, InferenceError, InferenceService, ModelInfo};
use crate::process::{CommandSpawner, ProcessSupervisor, ServiceSpawner, SpawnError};
use crate::prober::HealthProber;
use crate::request::{AnalysisRequest, ImageSource, Modality};
use crate::status::{ServiceState, ServiceStatus, StatusBoard};

/// Outcome of [`AnalysisService::initialize`].
#[derive(Debug, Clone, Serialize)]
pub struct InitSummary {
    pub ready: bool,
    pub status: ServiceStatus,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum BatchEvent {
    Progress(Progress),
    /// Terminal snapshot, sent once after the last progress event.
    Finished(BatchRun),
}

/// Handle to a submitted batch: progress stream, live snapshot, cancellation.
pub struct BatchHandle {
    batch_id: String,
    events: mpsc::UnboundedReceiver<BatchEvent>,
    snapshot: watch::Receiver<BatchRun>,
    cancel: CancellationToken,
}

impl BatchHandle {
    pub fn id(&self) -> &str {
        &self.batch_id
    }

    pub fn snapshot(&self) -> BatchRun {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchRun> {
        self.snapshot.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event in completion order; `None` after `Finished`.
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    /// Drain events and return the terminal snapshot.
    pub async fn wait(mut self) -> BatchRun {
        while let Some(event) = self.events.recv().await {
            if let BatchEvent::Finished(run) = event {
                return run;
            }
        }
        self.snapshot.borrow().clone()
    }
}

struct BatchEntry {
    cancel: CancellationToken,
    snapshot: watch::Receiver<BatchRun>,
}

/// At most one batch runs at a time.
struct ActiveBatch {
    batch_id: String,
    snapshot: watch::Receiver<BatchRun>,
}

pub struct AnalysisService {
    config: ServiceConfig,
    board: StatusBoard,
    supervisor: ProcessSupervisor,
    inference: Arc<dyn InferenceService>,
    dispatcher: Dispatcher,
    history: Option<Arc<dyn HistorySink>>,
    batches: DashMap<String, BatchEntry>,
    active: Mutex<Option<ActiveBatch>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    prober: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl AnalysisService {
    /// Service launching the configured executable and talking HTTP to it.
    pub fn new(config: ServiceConfig) -> Result<Arc<Self>, InferenceError> {
        let client = HttpInferenceClient::new(
            config.launch.base_url(),
            config.dispatch.request_timeout,
            config.probe.timeout,
        )?;
        let history = config
            .history_file
            .as_ref()
            .map(|path| Arc::new(JsonFileHistory::new(path)) as Arc<dyn HistorySink>);
        Ok(Self::from_parts(
            config,
            Arc::new(CommandSpawner),
            Arc::new(client),
            history,
        ))
    }

    pub fn from_parts(
        config: ServiceConfig,
        spawner: Arc<dyn ServiceSpawner>,
        inference: Arc<dyn InferenceService>,
        history: Option<Arc<dyn HistorySink>>,
    ) -> Arc<Self> {
        let board = StatusBoard::new();
        let supervisor = ProcessSupervisor::new(
            config.launch.clone(),
            config.restart.clone(),
            config.grace_period,
            spawner,
            board.clone(),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&inference),
            board.subscribe(),
            config.dispatch.clone(),
        );
        Arc::new(Self {
            config,
            board,
            supervisor,
            inference,
            dispatcher,
            history,
            batches: DashMap::new(),
            active: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            prober: tokio::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the service and wait for readiness.
    ///
    /// Never fails: spawn errors and timeouts end up in the summary, and the
    /// supervisor keeps retrying in the background.
    pub async fn initialize(&self) -> InitSummary {
        if let Err(e) = self.supervisor.start().await {
            tracing::warn!(error = %e, "Initial spawn failed, retrying with backoff");
        }
        self.start_prober().await;

        match self.supervisor.await_ready(self.config.ready_timeout).await {
            Ok(status) => {
                tracing::info!(state = %status.state, "Inference service ready");
                InitSummary {
                    ready: true,
                    status,
                    message: "inference service ready".to_string(),
                }
            }
            Err(e) => {
                let status = self.status();
                let message = match &status.detail {
                    Some(detail) => format!("{e} (last status: {}, {detail})", status.state),
                    None => format!("{e} (last status: {})", status.state),
                };
                InitSummary {
                    ready: false,
                    status,
                    message,
                }
            }
        }
    }

    async fn start_prober(&self) {
        let mut prober = self.prober.lock().await;
        if prober.is_some() {
            return;
        }
        let handle = HealthProber::new(
            Arc::clone(&self.inference),
            self.board.clone(),
            self.config.probe.clone(),
        )
        .spawn(self.shutdown.child_token());
        *prober = Some(handle);
    }

    /// Submit a batch. `concurrency` falls back to the configured default.
    pub fn submit_batch(
        self: &Arc<Self>,
        images: Vec<ImageSource>,
        modality: Modality,
        concurrency: Option<usize>,
    ) -> Result<BatchHandle, SubmitError> {
        if images.is_empty() {
            return Err(SubmitError::EmptyBatch);
        }
        let limit = concurrency.unwrap_or(self.dispatcher.config().concurrency);
        if limit == 0 {
            return Err(SubmitError::InvalidConcurrency);
        }

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = active.as_ref()
            && !running.snapshot.borrow().is_terminal()
        {
            return Err(SubmitError::BatchInProgress(running.batch_id.clone()));
        }
        self.dispatcher.ensure_ready()?;

        let batch_id = format!("batch_{}", Uuid::new_v4().simple());
        let requests: Vec<AnalysisRequest> = images
            .into_iter()
            .map(|image| AnalysisRequest::new(image, modality))
            .collect();
        let aggregator = ResultAggregator::new(batch_id.clone(), &requests)?;

        let (snapshot_tx, snapshot_rx) = watch::channel(aggregator.snapshot());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();

        self.batches.insert(
            batch_id.clone(),
            BatchEntry {
                cancel: cancel.clone(),
                snapshot: snapshot_rx.clone(),
            },
        );
        *active = Some(ActiveBatch {
            batch_id: batch_id.clone(),
            snapshot: snapshot_rx.clone(),
        });

        tracing::info!(
            batch_id = %batch_id,
            total = requests.len(),
            concurrency = limit,
            %modality,
            "Batch submitted"
        );

        let service = Arc::clone(self);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            service
                .run_batch(requests, limit, task_cancel, aggregator, snapshot_tx, events_tx)
                .await;
        });
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);

        Ok(BatchHandle {
            batch_id,
            events: events_rx,
            snapshot: snapshot_rx,
            cancel,
        })
    }

    async fn run_batch(
        &self,
        requests: Vec<AnalysisRequest>,
        limit: usize,
        cancel: CancellationToken,
        mut aggregator: ResultAggregator,
        snapshot: watch::Sender<BatchRun>,
        events: mpsc::UnboundedSender<BatchEvent>,
    ) {
        self.dispatcher
            .run(requests, limit, &cancel, |event| match event {
                DispatchEvent::Progress(progress) => {
                    if let Err(e) = aggregator.record(progress.outcome.clone()) {
                        tracing::error!(error = %e, "Dropping outcome");
                        return;
                    }
                    snapshot.send_replace(aggregator.snapshot());
                    // The handle may have been dropped; the batch still runs to the end.
                    let _ = events.send(BatchEvent::Progress(progress));
                }
                DispatchEvent::Cancelled { .. } => {
                    aggregator.abort();
                }
            })
            .await;

        // No-op unless the dispatcher stopped short without a cancellation.
        aggregator.abort();
        let run = aggregator.into_run();
        snapshot.send_replace(run.clone());
        self.batches.remove(&run.batch_id);
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.as_ref().is_some_and(|a| a.batch_id == run.batch_id) {
                *active = None;
            }
        }
        let _ = events.send(BatchEvent::Finished(run.clone()));

        if let Some(history) = &self.history
            && let Err(e) = history.record(&run).await
        {
            tracing::warn!(batch_id = %run.batch_id, error = %e, "Failed to record batch history");
        }
    }

    /// Cancel a running batch. Returns false if it is unknown or already terminal.
    pub fn cancel(&self, batch_id: &str) -> bool {
        match self.batches.get(batch_id) {
            Some(entry) if !entry.snapshot.borrow().is_terminal() => {
                tracing::info!(batch_id, "Cancelling batch");
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Live snapshot of a batch that has not finished yet.
    pub fn batch(&self, batch_id: &str) -> Option<BatchRun> {
        self.batches
            .get(batch_id)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    pub fn status(&self) -> ServiceStatus {
        self.board.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServiceStatus> {
        self.board.subscribe()
    }

    pub async fn models_info(&self) -> Result<BTreeMap<String, ModelInfo>, InferenceError> {
        self.inference.models_info().await
    }

    /// Ask the running service to load its models again.
    ///
    /// Leaves the process alone; use [`Self::restart_service`] when the
    /// process itself is gone.
    pub async fn reload_models(&self) -> Result<String, InferenceError> {
        let state = self.board.current().state;
        if matches!(state, ServiceState::Crashed | ServiceState::Stopped) {
            return Err(InferenceError::Unavailable(format!("service is {state}")));
        }
        tracing::info!("Model reload requested");
        let message = self.inference.reload_models().await?;
        tracing::info!(%message, "Models reloaded");
        Ok(message)
    }

    /// Reset the restart budget and respawn a service the supervisor gave up on.
    pub async fn restart_service(&self) -> Result<(), SpawnError> {
        tracing::info!("Restart requested");
        self.supervisor.restart().await
    }

    /// Cancel running batches, stop probing, stop the process. Idempotent.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Batch task failed");
            }
        }
        if let Some(prober) = self.prober.lock().await.take()
            && let Err(e) = prober.await
        {
            tracing::error!(error = %e, "Prober task failed");
        }
        self.supervisor.stop().await;
    }
}
