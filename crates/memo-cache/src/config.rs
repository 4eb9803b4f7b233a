use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{CachePolicy, DEFAULT_CAPACITY, DEFAULT_FAILURE_TTL};

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
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
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
            prefix: "memo".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Settings of a [`MemoCache`](crate::MemoCache).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoConfig {
    /// The name reported with metrics and logs.
    pub name: String,

    /// The maximum number of cached results.
    pub capacity: u64,

    /// How long a failed computation is replayed before it is retried.
    #[serde(with = "humantime_serde")]
    pub failure_ttl: Duration,

    /// Whether failures of cancelled callers are cached as well.
    pub cache_cancelled_failures: bool,

    /// The policy used by callers that do not bring their own.
    pub default_policy: CachePolicy,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            name: "memo".into(),
            capacity: DEFAULT_CAPACITY,
            failure_ttl: DEFAULT_FAILURE_TTL,
            cache_cancelled_failures: false,
            default_policy: CachePolicy::absolute(Duration::from_secs(3600)),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings
    pub logging: Logging,

    /// Metrics settings
    pub metrics: Metrics,

    /// Settings of the memo cache
    pub memo: MemoConfig,
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

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        if config.memo.failure_ttl.is_zero() {
            anyhow::bail!("memo.failure_ttl must be greater than zero");
        }
        config
            .memo
            .default_policy
            .validate()
            .map_err(|message| anyhow::anyhow!("invalid memo.default_policy: {message}"))?;
        Ok(config)
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

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_memo_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.memo, MemoConfig::default());
        assert_eq!(cfg.memo.failure_ttl, Duration::from_secs(5));

        // It should be possible to set individual values without affecting the other defaults.
        let yaml = r#"
            memo:
              failure_ttl: 250ms
              default_policy:
                sliding_ttl: 10m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.memo.failure_ttl, Duration::from_millis(250));
        assert_eq!(
            cfg.memo.default_policy,
            CachePolicy::sliding(Duration::from_secs(600))
        );
        assert_eq!(cfg.memo.capacity, DEFAULT_CAPACITY);
        assert!(!cfg.memo.cache_cancelled_failures);
    }

    #[test]
    fn test_logging_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_zero_durations() {
        let yaml = r#"
            memo:
              failure_ttl: 0s
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());

        let yaml = r#"
            memo:
              default_policy:
                absolute_ttl: 0s
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            memo:
              not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = memo_test::tempdir();
        let path = dir.path().join("config.yml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "memo:\n  name: users\n  capacity: 10").unwrap();

        let cfg = Config::get(Some(&path)).unwrap();
        assert_eq!(cfg.memo.name, "users");
        assert_eq!(cfg.memo.capacity, 10);

        assert!(Config::get(Some(&dir.path().join("missing.yml"))).is_err());
    }
}
