use std::env;
use std::time::Duration;

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_TIMEOUT_MS: u64 = 240_000;
pub const DEFAULT_SIDE_EFFECT_BUFFER: usize = 1024;

/// Runtime configuration for the import coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportConfig {
    /// Units of one stage-group in flight at once.
    pub max_concurrency: usize,
    /// Per-unit timeout used when a request does not set one.
    pub timeout: Duration,
    /// Capacity of the post-commit side effect queue.
    pub side_effect_buffer: usize,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            max_concurrency: env_usize("IMPORT_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY).max(1),
            timeout: env_duration_millis("IMPORT_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
            side_effect_buffer: env_usize("IMPORT_SIDE_EFFECT_BUFFER", DEFAULT_SIDE_EFFECT_BUFFER)
                .max(1),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            side_effect_buffer: DEFAULT_SIDE_EFFECT_BUFFER,
        }
    }
}
