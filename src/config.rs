//! Process-level configuration surface consumed by the Queue Manager and Scheduler.
//!
//! A `Default` impl carries the documented defaults, with `#[must_use]`
//! chained `with_*` methods and an environment overlay via `dotenvy`.

/// Queue-level settings, immutable once handed to a [`crate::manager::QueueManager`].
#[derive(Clone, Debug, PartialEq)]
pub struct QueueConfig {
    pub max_concurrent_global: usize,
    pub max_concurrent_per_agent: usize,
    pub max_queue_size: usize,
    pub enable_persistence: bool,
    pub db_path: String,
    pub retention_days: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_global: 4,
            max_concurrent_per_agent: 2,
            max_queue_size: 100,
            enable_persistence: true,
            db_path: ".praison/queue.db".to_string(),
            retention_days: 30,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn with_max_concurrent_global(mut self, n: usize) -> Self {
        self.max_concurrent_global = n.max(1);
        self
    }

    #[must_use]
    pub fn with_max_concurrent_per_agent(mut self, n: usize) -> Self {
        self.max_concurrent_per_agent = n.max(1);
        self
    }

    #[must_use]
    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n.max(1);
        self
    }

    #[must_use]
    pub fn with_persistence(mut self, enable: bool) -> Self {
        self.enable_persistence = enable;
        self
    }

    #[must_use]
    pub fn with_db_path(mut self, path: impl Into<String>) -> Self {
        self.db_path = path.into();
        self
    }

    #[must_use]
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Build from `Default`, then overlay any `QUEUE_*` environment variables
    /// present after loading a local `.env` via `dotenvy`. Unset/unparsable
    /// variables fall back to the existing value rather than erroring.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Some(v) = env_usize("QUEUE_MAX_CONCURRENT_GLOBAL") {
            cfg.max_concurrent_global = v.max(1);
        }
        if let Some(v) = env_usize("QUEUE_MAX_CONCURRENT_PER_AGENT") {
            cfg.max_concurrent_per_agent = v.max(1);
        }
        if let Some(v) = env_usize("QUEUE_MAX_QUEUE_SIZE") {
            cfg.max_queue_size = v.max(1);
        }
        if let Ok(v) = std::env::var("QUEUE_ENABLE_PERSISTENCE") {
            cfg.enable_persistence = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("QUEUE_DB_PATH") {
            cfg.db_path = v;
        }
        if let Some(v) = env_usize("QUEUE_RETENTION_DAYS") {
            cfg.retention_days = v as u32;
        }
        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
