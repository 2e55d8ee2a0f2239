use std::time::Duration;

use crate::CoreError;

pub const DEFAULT_FINALIZER: &str = "reko.dev/cleanup";

/// Engine policy knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Finalizer token the engine adds to primaries it manages.
    pub finalizer_token: String,
    /// Requeue while managed resources are still converging.
    pub requeue_interval: Duration,
    /// Drift-check requeue once managed resources have completed or failed.
    pub terminal_requeue_interval: Duration,
    /// Requeue while `managementState=Removed` teardown is in progress.
    pub removal_requeue_interval: Duration,
    /// First backoff step after an error.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    pub worker_count: usize,
    /// Deadline for one reconciliation pass.
    pub pass_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            finalizer_token: DEFAULT_FINALIZER.to_string(),
            requeue_interval: Duration::from_secs(60),
            terminal_requeue_interval: Duration::from_secs(300),
            removal_requeue_interval: Duration::from_secs(5),
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(300),
            worker_count: 1,
            pass_timeout: Duration::from_secs(30),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis)
}

impl EngineConfig {
    /// Defaults overridden by `REKO_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            finalizer_token: std::env::var("REKO_FINALIZER").unwrap_or(d.finalizer_token),
            requeue_interval: env_secs("REKO_REQUEUE_SECS").unwrap_or(d.requeue_interval),
            terminal_requeue_interval: env_secs("REKO_TERMINAL_REQUEUE_SECS").unwrap_or(d.terminal_requeue_interval),
            removal_requeue_interval: env_secs("REKO_REMOVAL_REQUEUE_SECS").unwrap_or(d.removal_requeue_interval),
            base_backoff: env_millis("REKO_BASE_BACKOFF_MS").unwrap_or(d.base_backoff),
            max_backoff: env_secs("REKO_MAX_BACKOFF_SECS").unwrap_or(d.max_backoff),
            worker_count: std::env::var("REKO_WORKERS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.worker_count),
            pass_timeout: env_secs("REKO_PASS_TIMEOUT_SECS").unwrap_or(d.pass_timeout),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.finalizer_token.trim().is_empty() {
            return Err(CoreError::InvalidConfig("finalizer token must not be empty".into()));
        }
        if self.worker_count == 0 {
            return Err(CoreError::InvalidConfig("worker count must be at least 1".into()));
        }
        if self.base_backoff.is_zero() || self.base_backoff > self.max_backoff {
            return Err(CoreError::InvalidConfig(format!(
                "backoff base {:?} must be non-zero and not above max {:?}",
                self.base_backoff, self.max_backoff
            )));
        }
        if self.pass_timeout.is_zero() {
            return Err(CoreError::InvalidConfig("pass timeout must be non-zero".into()));
        }
        Ok(())
    }
}
