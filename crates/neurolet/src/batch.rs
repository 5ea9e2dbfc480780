//! Batch run state and the result aggregator that owns it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::request::{AnalysisOutcome, AnalysisRequest, Modality};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    /// Every request succeeded
    Completed,
    /// At least one success and at least one failure
    PartiallyFailed,
    /// Every request settled, none succeeded
    Failed,
    /// Cancelled before all outcomes arrived
    Aborted,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Terminal status for a batch whose requests have all settled.
    pub fn classify(successes: usize, failures: usize) -> Self {
        match (successes, failures) {
            (_, 0) => Self::Completed,
            (0, _) => Self::Failed,
            _ => Self::PartiallyFailed,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable view of a submitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub id: String,
    pub image_name: String,
    pub modality: Modality,
}

impl From<&AnalysisRequest> for RequestSummary {
    fn from(request: &AnalysisRequest) -> Self {
        Self {
            id: request.id.clone(),
            image_name: request.image.name(),
            modality: request.modality,
        }
    }
}

/// One submitted batch and the outcomes recorded for it so far.
///
/// `outcomes` is keyed by request id and kept in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub batch_id: String,
    pub requests: Vec<RequestSummary>,
    pub outcomes: IndexMap<String, AnalysisOutcome>,
    pub status: BatchStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchRun {
    pub fn total(&self) -> usize {
        self.requests.len()
    }

    pub fn completed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn successes(&self) -> usize {
        self.outcomes.values().filter(|o| o.success).count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.values().filter(|o| !o.success).count()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Outcomes in submission order; requests without an outcome are skipped.
    pub fn ordered_outcomes(&self) -> Vec<&AnalysisOutcome> {
        self.requests
            .iter()
            .filter_map(|r| self.outcomes.get(&r.id))
            .collect()
    }

    /// Requests that never produced an outcome.
    pub fn missing(&self) -> Vec<&RequestSummary> {
        self.requests
            .iter()
            .filter(|r| !self.outcomes.contains_key(&r.id))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    #[error("duplicate request id {0}")]
    DuplicateRequest(String),
    #[error("outcome for unknown request {0}")]
    UnknownRequest(String),
    #[error("outcome for request {0} already recorded")]
    DuplicateOutcome(String),
    #[error("batch is already {0}")]
    NotRunning(BatchStatus),
}

/// Owns the authoritative [`BatchRun`] state machine.
///
/// `Running` moves to exactly one terminal state and never comes back.
pub struct ResultAggregator {
    run: BatchRun,
    known: HashSet<String>,
}

impl ResultAggregator {
    pub fn new(
        batch_id: impl Into<String>,
        requests: &[AnalysisRequest],
    ) -> Result<Self, AggregateError> {
        let mut known = HashSet::with_capacity(requests.len());
        for request in requests {
            if !known.insert(request.id.clone()) {
                return Err(AggregateError::DuplicateRequest(request.id.clone()));
            }
        }

        Ok(Self {
            run: BatchRun {
                batch_id: batch_id.into(),
                requests: requests.iter().map(RequestSummary::from).collect(),
                outcomes: IndexMap::with_capacity(requests.len()),
                status: BatchStatus::Running,
                submitted_at: Utc::now(),
                finished_at: None,
            },
            known,
        })
    }

    pub fn status(&self) -> BatchStatus {
        self.run.status
    }

    /// Record one settled request. Returns the terminal status once the last one lands.
    pub fn record(
        &mut self,
        outcome: AnalysisOutcome,
    ) -> Result<Option<BatchStatus>, AggregateError> {
        if self.run.status.is_terminal() {
            return Err(AggregateError::NotRunning(self.run.status));
        }
        if !self.known.contains(&outcome.request_id) {
            return Err(AggregateError::UnknownRequest(outcome.request_id));
        }
        if self.run.outcomes.contains_key(&outcome.request_id) {
            return Err(AggregateError::DuplicateOutcome(outcome.request_id));
        }

        self.run.outcomes.insert(outcome.request_id.clone(), outcome);

        if self.run.outcomes.len() == self.run.requests.len() {
            let status = BatchStatus::classify(self.run.successes(), self.run.failures());
            self.finish(status);
            return Ok(Some(status));
        }
        Ok(None)
    }

    /// Cancellation acknowledged: keep what was recorded and stop accepting more.
    ///
    /// Returns false if the batch had already reached a terminal state.
    pub fn abort(&mut self) -> bool {
        if self.run.status.is_terminal() {
            return false;
        }
        self.finish(BatchStatus::Aborted);
        true
    }

    fn finish(&mut self, status: BatchStatus) {
        self.run.status = status;
        self.run.finished_at = Some(Utc::now());
        tracing::info!(
            batch_id = %self.run.batch_id,
            status = %status,
            completed = self.run.completed(),
            total = self.run.total(),
            "Batch finished"
        );
    }

    pub fn snapshot(&self) -> BatchRun {
        self.run.clone()
    }

    pub fn into_run(self) -> BatchRun {
        self.run
    }
}
