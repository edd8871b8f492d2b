//! Task queue, context and system configuration structures.

use std::collections::HashSet;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

/// Default number of entries a context can hand out at once.
pub const DEFAULT_MAX_ENTRIES: usize = 4096;

/// Environment variable overriding [`ContextConfig::max_entries`].
pub const ENV_MAX_ENTRIES: &str = "TASKQ_MAX_ENTRIES";

/// Environment variable overriding [`ContextConfig::parallelism`].
pub const ENV_PARALLELISM: &str = "TASKQ_PARALLELISM";

/// Worker thread count of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadCount {
    /// Exactly this many threads.
    Fixed(usize),
    /// Percentage of the context's parallelism, floored, at least one thread.
    CpuPercent(u32),
}

impl ThreadCount {
    /// Number of threads for a machine with `parallelism` hardware threads.
    #[must_use]
    pub fn resolve(self, parallelism: usize) -> usize {
        match self {
            Self::Fixed(n) => n.max(1),
            Self::CpuPercent(pct) => (parallelism * pct as usize / 100).max(1),
        }
    }

    fn validate(self) -> Result<(), String> {
        match self {
            Self::Fixed(0) => Err("thread count must be greater than 0".into()),
            Self::CpuPercent(0) => Err("cpu percent must be greater than 0".into()),
            Self::CpuPercent(pct) if pct > 100 => {
                Err(format!("cpu percent must be at most 100, got {pct}"))
            }
            _ => Ok(()),
        }
    }
}

impl Default for ThreadCount {
    fn default() -> Self {
        Self::Fixed(1)
    }
}

/// Configuration of one task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskqConfig {
    /// Queue name; workers are named after it.
    pub name: String,
    /// Worker thread count.
    #[serde(default)]
    pub threads: ThreadCount,
    /// Requested worker priority.
    #[serde(default)]
    pub priority: i32,
    /// Worker stack size in bytes; platform default when unset.
    #[serde(default)]
    pub stack_size: Option<usize>,
}

impl TaskqConfig {
    /// Single-threaded queue named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threads: ThreadCount::default(),
            priority: 0,
            stack_size: None,
        }
    }

    /// Use exactly `threads` workers.
    #[must_use]
    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.threads = ThreadCount::Fixed(threads);
        self
    }

    /// Use `percent` of the context's parallelism.
    #[must_use]
    pub const fn with_cpu_percent(mut self, percent: u32) -> Self {
        self.threads = ThreadCount::CpuPercent(percent);
        self
    }

    /// Set the thread count.
    #[must_use]
    pub const fn with_thread_count(mut self, threads: ThreadCount) -> Self {
        self.threads = threads;
        self
    }

    /// Set the requested worker priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the worker stack size.
    #[must_use]
    pub const fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Validate queue configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("queue name must not be empty".into());
        }
        self.threads.validate()?;
        if self.stack_size == Some(0) {
            return Err("stack_size must be greater than 0".into());
        }
        Ok(())
    }
}

/// Configuration of a [`TaskqContext`](crate::core::TaskqContext).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Entries available to all queues of the context.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Hardware parallelism; detected when unset.
    #[serde(default)]
    pub parallelism: Option<usize>,
}

const fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            parallelism: None,
        }
    }
}

impl ContextConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry capacity.
    #[must_use]
    pub const fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Override detected parallelism.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Validate context configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("max_entries must be greater than 0".into());
        }
        if u32::try_from(self.max_entries).is_err() {
            return Err(format!("max_entries must fit in 32 bits, got {}", self.max_entries));
        }
        if self.parallelism == Some(0) {
            return Err("parallelism must be greater than 0".into());
        }
        Ok(())
    }

    /// Load configuration from the environment, reading a `.env` file first
    /// when one exists.
    ///
    /// # Errors
    ///
    /// Fails if a variable is set but not a number, or the result is invalid.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();

        if let Ok(raw) = std::env::var(ENV_MAX_ENTRIES) {
            cfg.max_entries = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_ENTRIES}={raw} is not a number"))?;
        }
        if let Ok(raw) = std::env::var(ENV_PARALLELISM) {
            let parallelism = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PARALLELISM}={raw} is not a number"))?;
            cfg.parallelism = Some(parallelism);
        }

        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }
}

/// Thread counts of the two general-purpose system queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Threads of `system_taskq`.
    #[serde(default = "all_cpus")]
    pub system_threads: ThreadCount,
    /// Threads of `system_delay_taskq`.
    #[serde(default = "all_cpus")]
    pub delay_threads: ThreadCount,
}

const fn all_cpus() -> ThreadCount {
    ThreadCount::CpuPercent(100)
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            system_threads: all_cpus(),
            delay_threads: all_cpus(),
        }
    }
}

impl SystemConfig {
    /// Validate both thread counts.
    pub fn validate(&self) -> Result<(), String> {
        self.system_threads
            .validate()
            .map_err(|e| format!("system_threads invalid: {e}"))?;
        self.delay_threads
            .validate()
            .map_err(|e| format!("delay_threads invalid: {e}"))
    }

    /// Parse system configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// A set of named queues built together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskqSetConfig {
    /// Queue definitions.
    pub queues: Vec<TaskqConfig>,
}

impl TaskqSetConfig {
    /// Validate every queue and ensure names are unique.
    pub fn validate(&self) -> Result<(), String> {
        if self.queues.is_empty() {
            return Err("at least one queue must be defined".into());
        }
        let mut seen = HashSet::new();
        for queue in &self.queues {
            queue
                .validate()
                .map_err(|e| format!("queue `{}` invalid: {e}", queue.name))?;
            if !seen.insert(queue.name.as_str()) {
                return Err(format!("queue `{}` defined twice", queue.name));
            }
        }
        Ok(())
    }

    /// Parse queue set configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
