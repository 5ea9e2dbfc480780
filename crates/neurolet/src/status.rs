//! Inference service status and its transition rules.
//!
//! The status value is written only by the process supervisor and the health
//! prober (through [`StatusBoard`]); every other component holds a read-only
//! [`watch::Receiver`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle state of the external inference service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Process spawned, models still loading
    Starting,
    /// Passing health checks
    Ready,
    /// Reachable before, now failing health checks
    Degraded,
    /// Process exited without being asked to, or could not be spawned
    Crashed,
    /// Not running (never started, or stopped on request)
    #[default]
    Stopped,
}

impl ServiceState {
    /// Whether new analysis work may be admitted.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the service status as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// When the last health probe was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Human-readable detail for the current state (probe error, exit code, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Number of restarts since the service was last ready.
    pub restarts: u32,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            state: ServiceState::Stopped,
            last_checked_at: None,
            consecutive_failures: 0,
            detail: None,
            restarts: 0,
        }
    }
}

impl ServiceStatus {
    pub fn is_ready(&self) -> bool {
        self.state == ServiceState::Ready
    }

    pub fn accepts_work(&self) -> bool {
        self.state.accepts_work()
    }

    /// Apply a successful probe. Returns true if the state changed.
    fn apply_probe_success(&mut self, at: DateTime<Utc>) -> bool {
        match self.state {
            ServiceState::Starting | ServiceState::Ready | ServiceState::Degraded => {
                let changed = self.state != ServiceState::Ready;
                self.state = ServiceState::Ready;
                self.last_checked_at = Some(at);
                self.consecutive_failures = 0;
                self.detail = None;
                self.restarts = 0;
                changed
            }
            // Process exit supersedes whatever the endpoint says.
            ServiceState::Crashed | ServiceState::Stopped => false,
        }
    }

    /// Apply a failed probe. Returns true if the state changed.
    fn apply_probe_failure(&mut self, at: DateTime<Utc>, threshold: u32, detail: String) -> bool {
        match self.state {
            ServiceState::Starting | ServiceState::Degraded => {
                self.last_checked_at = Some(at);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.detail = Some(detail);
                false
            }
            ServiceState::Ready => {
                self.last_checked_at = Some(at);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.detail = Some(detail);
                if self.consecutive_failures >= threshold {
                    self.state = ServiceState::Degraded;
                    true
                } else {
                    false
                }
            }
            ServiceState::Crashed | ServiceState::Stopped => false,
        }
    }
}

/// Single-writer handle on the shared service status.
///
/// Cloned only into the supervisor and the prober. Every spawn starts a new
/// generation; probe results carry the generation they were started in and
/// are dropped if the process has been replaced since.
#[derive(Clone)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<ServiceStatus>>,
    // Only written inside `send_modify`, so reads under the same lock agree
    // with the published state.
    generation: Arc<AtomicU64>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ServiceStatus::default());
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn generation a probe should be tagged with.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ServiceStatus {
        self.tx.borrow().clone()
    }

    pub fn mark_starting(&self, restarts: u32) {
        self.tx.send_modify(|s| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            s.state = ServiceState::Starting;
            s.consecutive_failures = 0;
            s.detail = None;
            s.restarts = restarts;
        });
        tracing::info!(state = %ServiceState::Starting, restarts, "Service status changed");
    }

    pub fn mark_crashed(&self, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!(state = %ServiceState::Crashed, %detail, "Service status changed");
        self.tx.send_modify(|s| {
            s.state = ServiceState::Crashed;
            s.detail = Some(detail);
        });
    }

    pub fn mark_stopped(&self) {
        self.tx.send_modify(|s| {
            s.state = ServiceState::Stopped;
            s.consecutive_failures = 0;
            s.detail = None;
        });
        tracing::info!(state = %ServiceState::Stopped, "Service status changed");
    }

    pub fn record_probe_success(&self, generation: u64) {
        let mut changed = false;
        self.tx.send_if_modified(|s| {
            if self.is_stale(generation) {
                return false;
            }
            let before = s.clone();
            changed = s.apply_probe_success(Utc::now());
            *s != before
        });
        if changed {
            tracing::info!(state = %ServiceState::Ready, "Service status changed");
        }
    }

    pub fn record_probe_failure(
        &self,
        generation: u64,
        threshold: u32,
        detail: impl Into<String>,
    ) {
        let detail = detail.into();
        let mut changed = false;
        self.tx.send_if_modified(|s| {
            if self.is_stale(generation) {
                return false;
            }
            let before = s.clone();
            changed = s.apply_probe_failure(Utc::now(), threshold, detail.clone());
            *s != before
        });
        if changed {
            tracing::warn!(state = %ServiceState::Degraded, %detail, "Service status changed");
        }
    }
}

impl StatusBoard {
    fn is_stale(&self, generation: u64) -> bool {
        let current = self.generation();
        if current != generation {
            tracing::debug!(generation, current, "Discarding probe from a replaced process");
            return true;
        }
        false
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: ServiceState) -> ServiceStatus {
        ServiceStatus {
            state,
            ..ServiceStatus::default()
        }
    }

    #[test]
    fn default_is_stopped() {
        assert_eq!(ServiceState::default(), ServiceState::Stopped);
        assert_eq!(ServiceStatus::default().state, ServiceState::Stopped);
    }

    #[test]
    fn only_ready_and_degraded_accept_work() {
        assert!(!ServiceState::Starting.accepts_work());
        assert!(ServiceState::Ready.accepts_work());
        assert!(ServiceState::Degraded.accepts_work());
        assert!(!ServiceState::Crashed.accepts_work());
        assert!(!ServiceState::Stopped.accepts_work());
    }

    #[test]
    fn state_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [
                ServiceState::Starting,
                ServiceState::Ready,
                ServiceState::Degraded,
                ServiceState::Crashed,
                ServiceState::Stopped,
            ],
            @r#"
        [
          "STARTING",
          "READY",
          "DEGRADED",
          "CRASHED",
          "STOPPED"
        ]
        "#
        );
    }

    #[test]
    fn probe_success_promotes_starting_to_ready() {
        let mut s = status(ServiceState::Starting);
        s.consecutive_failures = 2;
        assert!(s.apply_probe_success(Utc::now()));
        assert_eq!(s.state, ServiceState::Ready);
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.last_checked_at.is_some());
    }

    #[test]
    fn three_failures_while_ready_degrade() {
        let mut s = status(ServiceState::Ready);
        assert!(!s.apply_probe_failure(Utc::now(), 3, "refused".into()));
        assert!(!s.apply_probe_failure(Utc::now(), 3, "refused".into()));
        assert_eq!(s.state, ServiceState::Ready);
        assert!(s.apply_probe_failure(Utc::now(), 3, "refused".into()));
        assert_eq!(s.state, ServiceState::Degraded);
        assert_eq!(s.consecutive_failures, 3);
    }

    #[test]
    fn success_resets_failure_count() {
        let mut s = status(ServiceState::Ready);
        s.apply_probe_failure(Utc::now(), 3, "x".into());
        s.apply_probe_failure(Utc::now(), 3, "x".into());
        s.apply_probe_success(Utc::now());
        s.apply_probe_failure(Utc::now(), 3, "x".into());
        assert_eq!(s.state, ServiceState::Ready);
        assert_eq!(s.consecutive_failures, 1);
    }

    #[test]
    fn degraded_recovers_on_success() {
        let mut s = status(ServiceState::Degraded);
        assert!(s.apply_probe_success(Utc::now()));
        assert_eq!(s.state, ServiceState::Ready);
    }

    #[test]
    fn probes_ignored_after_crash() {
        let mut s = status(ServiceState::Crashed);
        assert!(!s.apply_probe_success(Utc::now()));
        assert!(!s.apply_probe_failure(Utc::now(), 1, "x".into()));
        assert_eq!(s.state, ServiceState::Crashed);
        assert!(s.last_checked_at.is_none());
    }

    #[test]
    fn failures_while_starting_keep_starting() {
        let mut s = status(ServiceState::Starting);
        for _ in 0..5 {
            s.apply_probe_failure(Utc::now(), 3, "loading".into());
        }
        assert_eq!(s.state, ServiceState::Starting);
    }

    #[test]
    fn board_publishes_to_subscribers() {
        let board = StatusBoard::new();
        let rx = board.subscribe();
        board.mark_starting(0);
        board.record_probe_success(board.generation());
        assert_eq!(rx.borrow().state, ServiceState::Ready);
        board.mark_crashed("exit code 1");
        assert_eq!(rx.borrow().state, ServiceState::Crashed);
        assert_eq!(rx.borrow().detail.as_deref(), Some("exit code 1"));
        board.record_probe_success(board.generation());
        assert_eq!(board.current().state, ServiceState::Crashed);
    }

    #[test]
    fn probe_from_replaced_process_is_discarded() {
        let board = StatusBoard::new();
        board.mark_starting(0);
        let stale = board.generation();

        board.mark_crashed("exit code 1");
        board.mark_starting(1);
        assert_ne!(board.generation(), stale);

        board.record_probe_success(stale);
        assert_eq!(board.current().state, ServiceState::Starting);
        assert!(board.current().last_checked_at.is_none());

        board.record_probe_success(board.generation());
        for _ in 0..3 {
            board.record_probe_failure(stale, 3, "connection refused");
        }
        assert_eq!(board.current().state, ServiceState::Ready);
        assert_eq!(board.current().consecutive_failures, 0);
    }
}
