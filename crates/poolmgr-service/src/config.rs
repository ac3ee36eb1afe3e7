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
use url::Url;

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
    /// The log level for the pool manager.
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "poolmgr".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the function metadata cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MetadataCacheConfig {
    /// How long fetched function and environment definitions are reused.
    ///
    /// Errors are never cached, the next lookup after a failed fetch retries right away.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// The timeout for a single round trip to the metadata store.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Configures the per-environment pools of warm instances.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// The number of unspecialized instances each pool keeps ready.
    pub warm_instances: usize,

    /// How long a specialization waits for a warm instance to become available.
    #[serde(with = "humantime_serde")]
    pub creation_timeout: Duration,

    /// The timeout for injecting a function into a claimed instance.
    #[serde(with = "humantime_serde")]
    pub specialize_timeout: Duration,

    /// How long a freshly specialized instance has to become reachable.
    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,

    /// The delay between two readiness probes.
    #[serde(with = "humantime_serde")]
    pub readiness_interval: Duration,

    /// The delay before retrying after the orchestrator failed to create an instance.
    #[serde(with = "humantime_serde")]
    pub replenish_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            warm_instances: 3,
            creation_timeout: Duration::from_secs(60),
            specialize_timeout: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(30),
            readiness_interval: Duration::from_millis(200),
            replenish_backoff: Duration::from_secs(1),
        }
    }
}

/// Controls reclamation of specialized instances which are no longer used.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct IdleConfig {
    /// Maximum duration since the last access of a specialized instance.
    ///
    /// A value of `None` keeps specialized instances around forever.
    #[serde(with = "humantime_serde")]
    pub max_idle: Option<Duration>,

    /// How often to look for idle instances.
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            max_idle: Some(Duration::from_secs(10 * 60)),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Configures how instances are created and specialized.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// The base URL of the orchestration agent that creates and destroys instances.
    pub url: Option<Url>,

    /// The port of the package fetcher running next to every instance.
    pub fetcher_port: u16,

    /// The path on the instance that triggers loading the fetched package.
    pub specialize_path: String,

    /// The timeout of a single request to the agent or an instance.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            url: None,
            fetcher_port: 8000,
            specialize_path: "/specialize".into(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The base URL of the metadata store holding function and environment definitions.
    pub controller_url: Option<Url>,

    /// Fine-tune the function metadata cache.
    pub metadata: MetadataCacheConfig,

    /// Configure the pools of warm instances.
    pub pools: PoolConfig,

    /// Configure reclamation of idle instances.
    pub idle: IdleConfig,

    /// Configure the orchestration agent.
    pub orchestrator: OrchestratorConfig,

    /// The maximum number of resolution requests that are processed concurrently.
    ///
    /// A value of `None` indicates no limit.
    pub max_concurrent_requests: Option<usize>,
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:8889".to_owned()
    } else {
        "127.0.0.1:8889".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            controller_url: None,
            metadata: MetadataCacheConfig::default(),
            pools: PoolConfig::default(),
            idle: IdleConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            max_concurrent_requests: Some(1000),
        }
    }
}

impl Config {
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
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        // check for empty files explicitly
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
