//! Periodic health probing of the inference service.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::inference::InferenceService;
use crate::status::{ServiceState, StatusBoard};

/// Polls the liveness endpoint on a fixed interval and feeds the result
/// into the shared status.
pub struct HealthProber {
    service: Arc<dyn InferenceService>,
    board: StatusBoard,
    config: ProbeConfig,
}

impl HealthProber {
    pub fn new(
        service: Arc<dyn InferenceService>,
        board: StatusBoard,
        config: ProbeConfig,
    ) -> Self {
        Self {
            service,
            board,
            config,
        }
    }

    /// Run one probe and apply its result.
    pub async fn probe_once(&self) {
        // Taken before the state check so a respawn during the call is noticed.
        let generation = self.board.generation();
        // Nothing to observe while no process is (supposed to be) running.
        let state = self.board.current().state;
        if matches!(state, ServiceState::Crashed | ServiceState::Stopped) {
            tracing::trace!(%state, "Skipping probe");
            return;
        }

        let result = tokio::time::timeout(self.config.timeout, self.service.health()).await;
        match result {
            Ok(Ok(report)) if report.healthy => {
                if !report.models_loaded {
                    tracing::debug!("Service healthy but reports no models loaded");
                }
                self.board.record_probe_success(generation);
            }
            Ok(Ok(report)) => {
                let detail = report
                    .detail
                    .unwrap_or_else(|| "service reported unhealthy".to_string());
                tracing::debug!(%detail, "Health probe failed");
                self.board
                    .record_probe_failure(generation, self.config.failure_threshold, detail);
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Health probe failed");
                self.board.record_probe_failure(
                    generation,
                    self.config.failure_threshold,
                    e.to_string(),
                );
            }
            Err(_) => {
                tracing::debug!(timeout = ?self.config.timeout, "Health probe timed out");
                self.board.record_probe_failure(
                    generation,
                    self.config.failure_threshold,
                    format!("health probe timed out after {:?}", self.config.timeout),
                );
            }
        }
    }

    /// Probe until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::debug!(interval = ?self.config.interval, "Health prober started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.probe_once().await,
                }
            }
            tracing::debug!("Health prober stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::inference::{AnalyzeCall, HealthReport, InferenceError, ModelInfo};
    use crate::request::Diagnosis;

    /// Replays scripted probe results, then repeats the last one.
    struct ScriptedHealth {
        script: Mutex<Vec<Result<bool, ()>>>,
        calls: AtomicUsize,
    }

    impl ScriptedHealth {
        fn new(script: Vec<Result<bool, ()>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InferenceService for ScriptedHealth {
        async fn health(&self) -> Result<HealthReport, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0]
            };
            match next {
                Ok(healthy) => Ok(HealthReport {
                    healthy,
                    models_loaded: healthy,
                    detail: None,
                }),
                Err(()) => Err(InferenceError::Network("connection refused".to_string())),
            }
        }

        async fn analyze(&self, _call: AnalyzeCall) -> Result<Diagnosis, InferenceError> {
            unreachable!("prober never analyzes")
        }

        async fn models_info(&self) -> Result<BTreeMap<String, ModelInfo>, InferenceError> {
            Ok(BTreeMap::new())
        }

        async fn reload_models(&self) -> Result<String, InferenceError> {
            unreachable!("prober never reloads")
        }
    }

    /// Reports healthy, but only after the supervisor has replaced the
    /// process it was asked about.
    struct RespawnDuringProbe {
        board: StatusBoard,
    }

    #[async_trait]
    impl InferenceService for RespawnDuringProbe {
        async fn health(&self) -> Result<HealthReport, InferenceError> {
            self.board.mark_crashed("exit status 1");
            self.board.mark_starting(1);
            Ok(HealthReport {
                healthy: true,
                models_loaded: true,
                detail: None,
            })
        }

        async fn analyze(&self, _call: AnalyzeCall) -> Result<Diagnosis, InferenceError> {
            unreachable!("prober never analyzes")
        }

        async fn models_info(&self) -> Result<BTreeMap<String, ModelInfo>, InferenceError> {
            Ok(BTreeMap::new())
        }

        async fn reload_models(&self) -> Result<String, InferenceError> {
            unreachable!("prober never reloads")
        }
    }

    fn prober(service: Arc<ScriptedHealth>, board: &StatusBoard) -> HealthProber {
        HealthProber::new(service, board.clone(), ProbeConfig::default())
    }

    #[tokio::test]
    async fn first_success_while_starting_makes_ready() {
        let board = StatusBoard::new();
        board.mark_starting(0);
        let service = ScriptedHealth::new(vec![Err(()), Ok(true)]);
        let prober = prober(Arc::clone(&service), &board);

        prober.probe_once().await;
        assert_eq!(board.current().state, ServiceState::Starting);
        prober.probe_once().await;
        assert_eq!(board.current().state, ServiceState::Ready);
    }

    #[tokio::test]
    async fn three_consecutive_failures_degrade() {
        let board = StatusBoard::new();
        board.mark_starting(0);
        let service = ScriptedHealth::new(vec![Ok(true), Err(()), Ok(false), Err(())]);
        let prober = prober(Arc::clone(&service), &board);

        prober.probe_once().await;
        prober.probe_once().await;
        prober.probe_once().await;
        assert_eq!(board.current().state, ServiceState::Ready);
        prober.probe_once().await;
        let status = board.current();
        assert_eq!(status.state, ServiceState::Degraded);
        assert_eq!(status.consecutive_failures, 3);
        assert!(status.detail.is_some());
    }

    #[tokio::test]
    async fn crashed_service_is_not_probed() {
        let board = StatusBoard::new();
        board.mark_crashed("exit status 1");
        let service = ScriptedHealth::new(vec![Ok(true)]);
        let prober = prober(Arc::clone(&service), &board);

        prober.probe_once().await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
        assert_eq!(board.current().state, ServiceState::Crashed);
    }

    #[tokio::test]
    async fn result_for_replaced_process_is_ignored() {
        let board = StatusBoard::new();
        board.mark_starting(0);
        let service = Arc::new(RespawnDuringProbe {
            board: board.clone(),
        });
        let prober = HealthProber::new(service, board.clone(), ProbeConfig::default());

        prober.probe_once().await;
        let status = board.current();
        assert_eq!(status.state, ServiceState::Starting);
        assert_eq!(status.restarts, 1);
        assert!(status.last_checked_at.is_none());

        // The new process still has to answer a probe of its own.
        prober.probe_once().await;
        assert_eq!(board.current().state, ServiceState::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_prober_runs_until_shutdown() {
        let board = StatusBoard::new();
        board.mark_starting(0);
        let service = ScriptedHealth::new(vec![Ok(true)]);
        let config = ProbeConfig {
            interval: Duration::from_secs(2),
            ..ProbeConfig::default()
        };
        let shutdown = CancellationToken::new();
        let handle = HealthProber::new(
            Arc::clone(&service) as Arc<dyn InferenceService>,
            board.clone(),
            config,
        )
        .spawn(shutdown.clone());

        let mut rx = board.subscribe();
        rx.wait_for(|s| s.state == ServiceState::Ready).await.unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;
        let calls = service.calls.load(Ordering::SeqCst);
        assert!(calls >= 4, "expected periodic probes, got {calls}");

        shutdown.cancel();
        handle.await.unwrap();
        let after = service.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), after);
    }
}
