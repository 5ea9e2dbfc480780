//! Runtime configuration.
//!
//! Every knob has a default and a `with_*` builder; [`ServiceConfig::from_env`]
//! layers `NEUROLET_*` environment variables on top.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_CONCURRENCY: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// How to launch the inference service process.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub brain_model: PathBuf,
    pub chest_model: PathBuf,
    pub env: HashMap<String, String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("python"),
            args: vec!["app.py".to_string()],
            working_dir: None,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            brain_model: PathBuf::from("models/brain_model.h5"),
            chest_model: PathBuf::from("models/chest_model.h5"),
            env: HashMap::new(),
        }
    }
}

impl LaunchConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_models(mut self, brain: impl Into<PathBuf>, chest: impl Into<PathBuf>) -> Self {
        self.brain_model = brain.into();
        self.chest_model = chest.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Base URL the service will listen on.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Environment passed to the launched process.
    pub fn process_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = vec![
            ("PORT".to_string(), self.port.to_string()),
            ("FLASK_PORT".to_string(), self.port.to_string()),
            (
                "MODEL_BRAIN_PATH".to_string(),
                self.brain_model.display().to_string(),
            ),
            (
                "MODEL_CHEST_PATH".to_string(),
                self.chest_model.display().to_string(),
            ),
        ];
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Health probe cadence.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures while ready before the service is degraded.
    pub failure_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

/// Exponential restart backoff for a crashed service.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Restarts allowed before giving up and waiting for an explicit restart.
    pub max_restarts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_restarts: 5,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based): base, 2*base, 4*base, ... capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Batch dispatch tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub concurrency: usize,
    pub request_timeout: Duration,
    /// Extra attempts for items failing with a timeout or network error.
    pub item_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            request_timeout: Duration::from_secs(30),
            item_retries: 0,
        }
    }
}

/// Top-level configuration for [`crate::AnalysisService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub launch: LaunchConfig,
    pub probe: ProbeConfig,
    pub restart: RestartPolicy,
    pub dispatch: DispatchConfig,
    pub ready_timeout: Duration,
    pub grace_period: Duration,
    pub history_file: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            launch: LaunchConfig::default(),
            probe: ProbeConfig::default(),
            restart: RestartPolicy::default(),
            dispatch: DispatchConfig::default(),
            ready_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(5),
            history_file: None,
        }
    }
}

impl ServiceConfig {
    pub fn new(launch: LaunchConfig) -> Self {
        Self {
            launch,
            ..Self::default()
        }
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_history_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_file = Some(path.into());
        self
    }

    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(exe) = lookup("NEUROLET_EXECUTABLE") {
            config.launch.executable = PathBuf::from(exe);
            config.launch.args = Vec::new();
        }
        if let Some(args) = lookup("NEUROLET_ARGS") {
            config.launch.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(dir) = lookup("NEUROLET_WORKDIR") {
            config.launch.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(port) = parse_var(&lookup, "NEUROLET_PORT")? {
            config.launch.port = port;
        } else if let Some(port) = parse_var(&lookup, "FLASK_PORT")? {
            config.launch.port = port;
        }
        if let Some(path) = lookup("NEUROLET_BRAIN_MODEL") {
            config.launch.brain_model = PathBuf::from(path);
        }
        if let Some(path) = lookup("NEUROLET_CHEST_MODEL") {
            config.launch.chest_model = PathBuf::from(path);
        }
        if let Some(secs) = parse_var::<f64, _>(&lookup, "NEUROLET_PROBE_INTERVAL_SECS")? {
            config.probe.interval = secs_to_duration("NEUROLET_PROBE_INTERVAL_SECS", secs)?;
        }
        if let Some(secs) = parse_var::<f64, _>(&lookup, "NEUROLET_READY_TIMEOUT_SECS")? {
            config.ready_timeout = secs_to_duration("NEUROLET_READY_TIMEOUT_SECS", secs)?;
        }
        if let Some(secs) = parse_var::<f64, _>(&lookup, "NEUROLET_REQUEST_TIMEOUT_SECS")? {
            config.dispatch.request_timeout =
                secs_to_duration("NEUROLET_REQUEST_TIMEOUT_SECS", secs)?;
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "NEUROLET_CONCURRENCY")? {
            if n == 0 {
                return Err(ConfigError::Invalid {
                    var: "NEUROLET_CONCURRENCY",
                    value: n.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.dispatch.concurrency = n;
        }
        if let Some(n) = parse_var(&lookup, "NEUROLET_MAX_RESTARTS")? {
            config.restart.max_restarts = n;
        }
        if let Some(n) = parse_var(&lookup, "NEUROLET_ITEM_RETRIES")? {
            config.dispatch.item_retries = n;
        }
        if let Some(path) = lookup("NEUROLET_HISTORY_FILE") {
            config.history_file = Some(PathBuf::from(path));
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn secs_to_duration(var: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
        var,
        value: secs.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.launch.port, 5000);
        assert_eq!(config.dispatch.concurrency, 2);
        assert_eq!(config.dispatch.request_timeout, Duration::from_secs(30));
        assert_eq!(config.dispatch.item_retries, 0);
        assert_eq!(config.probe.failure_threshold, 3);
        assert_eq!(config.restart.max_restarts, 5);
        assert_eq!(config.launch.base_url(), "http://127.0.0.1:5000");
    }

    #[test]
    fn restart_delay_doubles_and_caps() {
        let policy = RestartPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn env_overrides() {
        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("NEUROLET_EXECUTABLE", "/opt/neuro/server"),
            ("NEUROLET_ARGS", "--workers 1"),
            ("NEUROLET_PORT", "5055"),
            ("NEUROLET_CONCURRENCY", "4"),
            ("NEUROLET_REQUEST_TIMEOUT_SECS", "12.5"),
            ("NEUROLET_ITEM_RETRIES", "2"),
            ("NEUROLET_HISTORY_FILE", "data/history.json"),
        ]))
        .unwrap();

        assert_eq!(config.launch.executable, PathBuf::from("/opt/neuro/server"));
        assert_eq!(config.launch.args, vec!["--workers", "1"]);
        assert_eq!(config.launch.port, 5055);
        assert_eq!(config.dispatch.concurrency, 4);
        assert_eq!(config.dispatch.request_timeout, Duration::from_millis(12_500));
        assert_eq!(config.dispatch.item_retries, 2);
        assert_eq!(
            config.history_file,
            Some(PathBuf::from("data/history.json"))
        );
    }

    #[test]
    fn flask_port_is_fallback() {
        let config = ServiceConfig::from_lookup(lookup_from(&[("FLASK_PORT", "6000")])).unwrap();
        assert_eq!(config.launch.port, 6000);

        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("FLASK_PORT", "6000"),
            ("NEUROLET_PORT", "7000"),
        ]))
        .unwrap();
        assert_eq!(config.launch.port, 7000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = ServiceConfig::from_lookup(lookup_from(&[("NEUROLET_PORT", "http")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "NEUROLET_PORT",
                ..
            }
        ));

        let err = ServiceConfig::from_lookup(lookup_from(&[("NEUROLET_CONCURRENCY", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("at least 1"));

        assert!(
            ServiceConfig::from_lookup(lookup_from(&[("NEUROLET_READY_TIMEOUT_SECS", "-1")]))
                .is_err()
        );
    }

    #[test]
    fn process_env_carries_port_and_models() {
        let launch = LaunchConfig::new("server")
            .with_port(5100)
            .with_models("b.h5", "c.h5")
            .with_env("TF_CPP_MIN_LOG_LEVEL", "2");
        let env: HashMap<String, String> = launch.process_env().into_iter().collect();
        assert_eq!(env["PORT"], "5100");
        assert_eq!(env["FLASK_PORT"], "5100");
        assert_eq!(env["MODEL_BRAIN_PATH"], "b.h5");
        assert_eq!(env["MODEL_CHEST_PATH"], "c.h5");
        assert_eq!(env["TF_CPP_MIN_LOG_LEVEL"], "2");
    }
}
