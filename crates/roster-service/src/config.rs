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
    /// The log level for roster.
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
            prefix: "roster".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Connection settings of the PostgreSQL store.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Database {
    /// A `postgres://` connection string.
    ///
    /// Defaults to the `DATABASE_URL` environment variable. Without a URL, users are kept in
    /// process memory and are lost on restart.
    pub url: Option<String>,

    /// The maximum size of the connection pool.
    pub max_connections: usize,

    /// How long to wait for a pooled connection before giving up.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for Database {
    fn default() -> Self {
        Database {
            url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            max_connections: 16,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// How lookups by id arbitrate between the cache and the store.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPolicy {
    /// Concurrent lookups of the same id share a single store read.
    #[default]
    Dedupe,
    /// Every lookup races a cache attempt against a store read.
    Race,
}

/// Fine-tuning of the read path.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Reads {
    /// Which read coordination to use.
    pub policy: ReadPolicy,

    /// The time budget of every read, starting when the request arrives.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// How long a user fetched from the store stays in the cache.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Artificial latency of the cache attempt when racing.
    #[serde(with = "humantime_serde")]
    pub race_cache_latency: Duration,
}

impl Default for Reads {
    fn default() -> Self {
        Reads {
            policy: ReadPolicy::default(),
            timeout: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(30),
            race_cache_latency: Duration::ZERO,
        }
    }
}

/// Fine-tuning of creates, updates and deletes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Writes {
    /// The time budget of every write, starting when the request arrives.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for Writes {
    fn default() -> Self {
        Writes {
            timeout: Duration::from_millis(500),
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

    /// The durable user store.
    pub database: Database,

    /// Tuning of lookups by id.
    pub reads: Reads,

    /// Tuning of everything but lookups by id.
    pub writes: Writes,
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
        "0.0.0.0:8080".to_owned()
    } else {
        "127.0.0.1:8080".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            database: Database::default(),
            reads: Reads::default(),
            writes: Writes::default(),
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
