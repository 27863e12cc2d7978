use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::job::SchedulingPolicy;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "concordance".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Bounds of the job cache.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Soft limit on the number of cached jobs.
    pub max_entries: Option<usize>,

    /// Soft limit on the aggregate estimated size of all cached results, in bytes.
    pub max_size_bytes: Option<usize>,

    /// Maximum duration a job may sit in the cache without being accessed.
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,

    /// Hard limit on the execution time of a single job.
    ///
    /// Jobs exceeding it are cancelled and fail, independent of cache pressure.
    #[serde(with = "humantime_serde")]
    pub max_job_time: Duration,

    /// Drop the result of a job as soon as nothing references it anymore.
    pub release_results_early: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: Some(20),
            max_size_bytes: None,
            max_age: Some(Duration::from_secs(3600)),
            max_job_time: Duration::from_secs(300),
            release_results_early: false,
        }
    }
}

/// Fine-tuning of the job scheduler.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Jobs that have executed for less than this are considered young, and are preferred.
    #[serde(with = "humantime_serde")]
    pub youth_threshold: Duration,

    /// Jobs that were resumed or paused within this window are not switched again.
    #[serde(with = "humantime_serde")]
    pub anti_thrash_window: Duration,

    /// Interval of the background sweep enforcing cache bounds and priority levels.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long a non-blocking request waits for its job before returning.
    #[serde(with = "humantime_serde")]
    pub quick_answer_wait: Duration,

    /// Maximum number of unfinished jobs. New jobs are rejected beyond this.
    pub max_concurrent_jobs: Option<usize>,

    /// Maximum number of jobs running at full priority.
    ///
    /// When unset, all jobs run at full priority.
    pub max_running_jobs: Option<usize>,

    /// Maximum number of jobs running at low priority, in addition to the running ones.
    pub max_low_priority_jobs: usize,

    /// Maximum number of paused jobs. Less worthy jobs beyond this are aborted.
    pub max_paused_jobs: usize,

    /// Lower bound for the advice on when to check a running job again.
    #[serde(with = "humantime_serde")]
    pub check_again_min: Duration,

    /// The advice on when to check again is the execution time divided by this.
    pub check_again_divider: u32,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            youth_threshold: Duration::from_secs(20),
            anti_thrash_window: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            quick_answer_wait: Duration::from_millis(100),
            max_concurrent_jobs: None,
            max_running_jobs: None,
            max_low_priority_jobs: 10,
            max_paused_jobs: 10,
            check_again_min: Duration::from_millis(200),
            check_again_divider: 5,
        }
    }
}

impl SchedulingConfig {
    pub fn policy(&self) -> SchedulingPolicy {
        SchedulingPolicy {
            youth_threshold: self.youth_threshold,
            anti_thrash_window: self.anti_thrash_window,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Bounds of the job cache.
    pub cache: CacheConfig,

    /// Scheduler settings.
    pub scheduling: SchedulingConfig,
}

impl Config {
    /// Loads the configuration from the given YAML file, or the default configuration.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
