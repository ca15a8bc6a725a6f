//! Pipeline configuration, assembled from environment variables.
//!
//! A `.env` file in the working directory is loaded first (if present).
//! Every value has a default; a value that is present but malformed is an error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use vidflow_core::{Category, Priority};
use vidflow_jobs::{ActionKind, Platform, PollPolicy, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Render submission and polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Wall-clock bound on a render, measured from submission.
    pub timeout: Duration,
    /// First poll delay; later polls back off exponentially.
    pub poll_interval: Duration,
    pub poll_max_interval: Duration,
    /// Transient status-check failures tolerated before a job fails.
    pub max_transient_retries: u32,
    /// Jobs fetched per poller tick.
    pub poll_batch_size: usize,
    pub poll_concurrency: usize,
    pub submit_concurrency: usize,
    /// Attempts per submission before the job is failed.
    pub submit_max_attempts: u32,
    pub submit_retry_base: Duration,
    /// Per-call timeout on the render service.
    pub call_timeout: Duration,
    /// Cadence of the submission worker.
    pub submit_interval: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(5),
            poll_max_interval: Duration::from_secs(60),
            max_transient_retries: 5,
            poll_batch_size: 50,
            poll_concurrency: 8,
            submit_concurrency: 2,
            submit_max_attempts: 3,
            submit_retry_base: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
            submit_interval: Duration::from_secs(5),
        }
    }
}

/// Back-pressure on the pending queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLimits {
    pub max_pending: usize,
    pub warning_threshold: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_pending: 100,
            warning_threshold: 50,
        }
    }
}

impl QueueLimits {
    pub fn unbounded() -> Self {
        Self {
            max_pending: usize::MAX,
            warning_threshold: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupPolicy {
    pub retention: Duration,
    pub max_per_category: usize,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
            max_per_category: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Attempts per action before it is recorded as failed.
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// An in-progress claim older than this is presumed abandoned.
    pub claim_lease: Duration,
    /// Per-call timeout on platform and webhook calls.
    pub call_timeout: Duration,
    /// Actions executing at once across all jobs.
    pub concurrency: usize,
    pub reconcile_interval: Duration,
    pub reconcile_batch_size: usize,
    /// How far back the sweep looks for completed jobs.
    pub reconcile_lookback: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
            claim_lease: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
            concurrency: 4,
            reconcile_interval: Duration::from_secs(60),
            reconcile_batch_size: 100,
            reconcile_lookback: Duration::from_secs(24 * 3600),
        }
    }
}

impl DispatcherConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.retry_base, self.retry_max)
    }

    /// Shortest claim lease that outlives one action's full run.
    pub fn min_claim_lease(&self) -> Duration {
        claim_lease_floor(&self.retry_policy(), self.call_timeout)
    }
}

/// Every attempt timing out, every backoff served, and one more call timeout
/// for the ledger writes around them.
pub(crate) fn claim_lease_floor(retry: &RetryPolicy, call_timeout: Duration) -> Duration {
    retry.worst_case(call_timeout).saturating_add(call_timeout)
}

/// One category the intake scheduler pulls content for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPlan {
    pub category: Category,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    pub url: Option<String>,
    pub categories: Vec<CategoryPlan>,
    pub interval: Duration,
    /// Recently admitted identifiers sent to the intake source as a cursor.
    pub cursor_len: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            url: None,
            categories: Vec::new(),
            interval: Duration::from_secs(300),
            cursor_len: 10,
        }
    }
}

/// Endpoints of the external collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointsConfig {
    pub render_create_url: String,
    /// Status URL template; `{id}` is replaced with the render handle.
    pub render_status_url: String,
    #[serde(skip_serializing)]
    pub render_api_key: Option<String>,
    pub webhook_url: Option<String>,
    pub tiktok_publish_url: Option<String>,
    pub twitter_publish_url: Option<String>,
    #[serde(skip_serializing)]
    pub publish_api_key: Option<String>,
}

impl EndpointsConfig {
    pub fn publish_url(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::TikTok => self.tiktok_publish_url.as_deref(),
            Platform::Twitter => self.twitter_publish_url.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    pub interval: Duration,
    /// Terminal jobs older than this are deleted.
    pub job_max_age: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            job_max_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub render: RenderConfig,
    pub queue: QueueLimits,
    pub dedup: DedupPolicy,
    pub dispatcher: DispatcherConfig,
    pub intake: IntakeConfig,
    pub endpoints: EndpointsConfig,
    pub housekeeping: HousekeepingConfig,
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    #[serde(skip_serializing)]
    pub redis_url: Option<String>,
}

impl PipelineConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env is normal outside development.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let render_defaults = RenderConfig::default();
        let dispatcher_defaults = DispatcherConfig::default();
        let intake_defaults = IntakeConfig::default();
        let housekeeping_defaults = HousekeepingConfig::default();

        let render = RenderConfig {
            timeout: env.secs("RENDER_TIMEOUT_SECS", render_defaults.timeout)?,
            poll_interval: env.secs("RENDER_POLL_INTERVAL_SECS", render_defaults.poll_interval)?,
            poll_max_interval: env.secs("RENDER_POLL_MAX_INTERVAL_SECS", render_defaults.poll_max_interval)?,
            max_transient_retries: env.parse("RENDER_MAX_TRANSIENT_RETRIES", render_defaults.max_transient_retries)?,
            poll_batch_size: env.parse("RENDER_POLL_BATCH_SIZE", render_defaults.poll_batch_size)?,
            poll_concurrency: env.positive("RENDER_POLL_CONCURRENCY", render_defaults.poll_concurrency)?,
            submit_concurrency: env.positive("MAX_CONCURRENT_TASKS", render_defaults.submit_concurrency)?,
            submit_max_attempts: env.parse("RENDER_SUBMIT_MAX_ATTEMPTS", render_defaults.submit_max_attempts)?,
            submit_retry_base: env.millis("RENDER_SUBMIT_RETRY_BASE_MS", render_defaults.submit_retry_base)?,
            call_timeout: env.secs("RENDER_CALL_TIMEOUT_SECS", render_defaults.call_timeout)?,
            submit_interval: env.secs("TASK_CHECK_INTERVAL", render_defaults.submit_interval)?,
        };

        let queue = QueueLimits {
            max_pending: env.positive("MAX_QUEUE_LENGTH", QueueLimits::default().max_pending)?,
            warning_threshold: env.parse("QUEUE_WARNING_THRESHOLD", QueueLimits::default().warning_threshold)?,
        };

        let dedup = DedupPolicy {
            retention: env.secs("DEDUP_RETENTION_SECS", DedupPolicy::default().retention)?,
            max_per_category: env.positive("DEDUP_MAX_PER_CATEGORY", DedupPolicy::default().max_per_category)?,
        };

        let dispatcher = DispatcherConfig {
            max_attempts: env.positive("ACTION_MAX_ATTEMPTS", dispatcher_defaults.max_attempts)?,
            retry_base: env.millis("ACTION_RETRY_BASE_MS", dispatcher_defaults.retry_base)?,
            retry_max: env.secs("ACTION_RETRY_MAX_SECS", dispatcher_defaults.retry_max)?,
            claim_lease: env.secs("ACTION_CLAIM_LEASE_SECS", dispatcher_defaults.claim_lease)?,
            call_timeout: env.secs("ACTION_CALL_TIMEOUT_SECS", dispatcher_defaults.call_timeout)?,
            concurrency: env.positive("ACTION_CONCURRENCY", dispatcher_defaults.concurrency)?,
            reconcile_interval: env.secs("ACTION_RECONCILE_INTERVAL_SECS", dispatcher_defaults.reconcile_interval)?,
            reconcile_batch_size: env.positive("ACTION_RECONCILE_BATCH_SIZE", dispatcher_defaults.reconcile_batch_size)?,
            reconcile_lookback: env.secs("ACTION_RECONCILE_LOOKBACK_SECS", dispatcher_defaults.reconcile_lookback)?,
        };
        // A lapsed claim lets a second dispatcher repeat a side effect still in flight.
        let min_lease = dispatcher.min_claim_lease();
        if dispatcher.claim_lease < min_lease {
            return Err(ConfigError::Invalid {
                key: "ACTION_CLAIM_LEASE_SECS",
                value: dispatcher.claim_lease.as_secs().to_string(),
                reason: format!(
                    "must cover every attempt and backoff of one action (at least {}s)",
                    min_lease.as_secs_f64().ceil()
                ),
            });
        }

        let intake = IntakeConfig {
            url: env.string("INTAKE_URL"),
            categories: match env.string("INTAKE_CATEGORIES") {
                Some(raw) => parse_category_plans(&raw)?,
                None => intake_defaults.categories,
            },
            interval: env.secs("INTAKE_INTERVAL_SECS", intake_defaults.interval)?,
            cursor_len: env.parse("INTAKE_CURSOR_LEN", intake_defaults.cursor_len)?,
        };

        let render_create_url = env
            .string("TEXT2VIDEO_API_CREATE_URL")
            .unwrap_or_else(|| "https://api.d-id.com/talks".to_string());
        let render_status_url = env
            .string("TEXT2VIDEO_API_STATUS_URL")
            .unwrap_or_else(|| format!("{}/{{id}}", render_create_url.trim_end_matches('/')));

        let endpoints = EndpointsConfig {
            render_create_url,
            render_status_url,
            render_api_key: env.string("TEXT2VIDEO_API_KEY"),
            webhook_url: env.string("WEBHOOK_URL"),
            tiktok_publish_url: env.string("TIKTOK_PUBLISH_URL"),
            twitter_publish_url: env.string("TWITTER_PUBLISH_URL"),
            publish_api_key: env.string("PUBLISH_API_KEY"),
        };

        let housekeeping = HousekeepingConfig {
            interval: env.secs("HOUSEKEEPING_INTERVAL_SECS", housekeeping_defaults.interval)?,
            job_max_age: env.days("JOB_MAX_AGE_DAYS", housekeeping_defaults.job_max_age)?,
        };

        Ok(Self {
            render,
            queue,
            dedup,
            dispatcher,
            intake,
            endpoints,
            housekeeping,
            database_url: env.string("DATABASE_URL"),
            database_max_connections: env.positive("DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: env.string("REDIS_URL"),
        })
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            backoff: RetryPolicy::exponential(0, self.render.poll_interval, self.render.poll_max_interval)
                .with_jitter(0.0),
            max_transient_retries: self.render.max_transient_retries,
            render_timeout: self.render.timeout,
        }
    }

    pub fn submit_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.render.submit_max_attempts,
            self.render.submit_retry_base,
            self.render.poll_max_interval,
        )
    }

    /// Platforms with a configured publish endpoint.
    pub fn enabled_platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.endpoints.publish_url(*p).is_some())
            .collect()
    }

    /// Action set given to jobs that do not bring their own.
    pub fn default_actions(&self) -> Vec<ActionKind> {
        ActionKind::default_set(&self.enabled_platforms(), self.endpoints.webhook_url.is_some())
    }
}

/// `news:high,science,sports:0` -> one plan per entry; priority defaults to normal.
fn parse_category_plans(raw: &str) -> Result<Vec<CategoryPlan>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: "INTAKE_CATEGORIES",
        value: raw.to_string(),
        reason,
    };

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, priority) = match entry.split_once(':') {
                Some((name, priority)) => (name, priority.parse().map_err(|e| invalid(format!("{e}")))?),
                None => (entry, Priority::NORMAL),
            };
            let category = Category::new(name).map_err(|e| invalid(e.to_string()))?;
            Ok(CategoryPlan { category, priority })
        })
        .collect()
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn positive<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr + PartialOrd + Default + Copy,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                key,
                value: self.string(key).unwrap_or_default(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64).map(Duration::from_millis)
    }

    fn days(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs() / 86_400)
            .map(|days| Duration::from_secs(days.saturating_mul(86_400)))
    }
}
