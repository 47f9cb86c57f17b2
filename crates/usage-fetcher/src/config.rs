//! Daemon configuration
//!
//! Loaded from a YAML, TOML or JSON file (by extension) with environment
//! overrides prefixed `USAGE_FETCHER__`, e.g.
//! `USAGE_FETCHER__ACCOUNTANT__MAX_EMIT_RATE=20`.

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use usage_accountant::{AccountantConfig, OverflowPolicy, RetryPolicy};
use usage_common::{
    AccountantError, Granularity, PayloadEncoding, ResourceId, Result, UsageUnit,
};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "USAGE_FETCHER";

/// Full daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub accountant: AccountantSettings,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub fetchers: Vec<FetcherConfig>,
}

/// Message bus settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub url: String,
    pub topic: String,
    pub encoding: PayloadEncoding,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            topic: usage_common::DEFAULT_TOPIC.to_string(),
            encoding: PayloadEncoding::default(),
        }
    }
}

/// Aggregation and emission settings
///
/// Unknown keys are rejected so a misspelled or retired setting fails at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccountantSettings {
    pub granularity_secs: u64,
    pub flush_period_secs: Option<u64>,
    pub max_emit_rate: f64,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub retry: RetrySettings,
    /// Every resource when absent
    pub allowed_resources: Option<Vec<ResourceId>>,
    /// Every unit when absent
    pub allowed_units: Option<Vec<UsageUnit>>,
}

impl Default for AccountantSettings {
    fn default() -> Self {
        let defaults = AccountantConfig::default();
        Self {
            granularity_secs: usage_common::DEFAULT_GRANULARITY_SECS,
            flush_period_secs: None,
            max_emit_rate: defaults.max_emit_rate,
            queue_capacity: defaults.queue_capacity,
            overflow_policy: defaults.overflow_policy,
            retry: RetrySettings::default(),
            allowed_resources: None,
            allowed_units: None,
        }
    }
}

/// Publish retry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

/// One configured fetcher instance
#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// Registered implementation name
    #[serde(rename = "type")]
    pub kind: String,
    /// Instance name; `<type>-<index>` when absent
    #[serde(default)]
    pub name: Option<String>,
    pub period_secs: f64,
    #[serde(default)]
    pub args: serde_json::Value,
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl FetcherConfig {
    pub fn instance_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.kind.to_ascii_lowercase(), index))
    }

    pub fn period(&self) -> Result<Duration> {
        if !self.period_secs.is_finite() || self.period_secs <= 0.0 {
            return Err(AccountantError::Config(format!(
                "fetcher '{}': period must be positive, got {}",
                self.kind, self.period_secs
            )));
        }
        Ok(Duration::from_secs_f64(self.period_secs))
    }
}

impl DaemonConfig {
    /// Load from a file plus environment overrides, then validate
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(AccountantError::Config(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }
        Self::build(Config::builder().add_source(File::from(path)))
    }

    /// Parse from a string in the given format, with environment overrides
    pub fn parse(raw: &str, format: FileFormat) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(raw, format)))
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AccountantError::Config(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| AccountantError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bus.url.is_empty() {
            return Err(AccountantError::Config("bus.url must not be empty".into()));
        }
        if self.fetchers.is_empty() {
            return Err(AccountantError::Config("at least one fetcher is required".into()));
        }
        for fetcher in &self.fetchers {
            fetcher.period()?;
        }
        self.accountant_config()?.validate()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Accountant settings as the accountant's own configuration type
    pub fn accountant_config(&self) -> Result<AccountantConfig> {
        let a = &self.accountant;
        let retry = RetryPolicy::new(a.retry.max_attempts)
            .with_base_delay(Duration::from_millis(a.retry.base_delay_ms))
            .with_max_delay(Duration::from_millis(a.retry.max_delay_ms));

        let mut config = AccountantConfig::default()
            .with_topic(self.bus.topic.clone())
            .with_granularity(Granularity::from_secs(a.granularity_secs)?)
            .with_max_emit_rate(a.max_emit_rate)
            .with_queue_capacity(a.queue_capacity)
            .with_overflow_policy(a.overflow_policy)
            .with_encoding(self.bus.encoding)
            .with_retry(retry);

        if let Some(secs) = a.flush_period_secs {
            config = config.with_flush_period(Duration::from_secs(secs));
        }
        if let Some(resources) = &a.allowed_resources {
            config.allowed_resources = resources.iter().copied().collect::<BTreeSet<_>>();
        }
        if let Some(units) = &a.allowed_units {
            config.allowed_units = units.iter().copied().collect::<BTreeSet<_>>();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
bus:
  url: nats://bus.internal:4222
  encoding: bincode
accountant:
  granularity_secs: 300
  max_emit_rate: 20
  overflow_policy: drop-oldest
  retry:
    max_attempts: 5
  allowed_resources: [compute, queue-bytes]
  allowed_units: [milliseconds, bytes]
shutdown_grace_secs: 3
fetchers:
  - type: dummy
    period_secs: 30
    args:
      feature: smoke
  - type: datadog
    name: redis-memory
    period_secs: 0.5
    args:
      queries:
        - query: "avg:redis.mem.peak{app_feature:shared} by {shared_resource_id}"
          unit: bytes
"#;

    #[test]
    fn test_parse_yaml() {
        let config = DaemonConfig::parse(YAML, FileFormat::Yaml).unwrap();

        assert_eq!(config.bus.url, "nats://bus.internal:4222");
        assert_eq!(config.bus.topic, usage_common::DEFAULT_TOPIC);
        assert_eq!(config.bus.encoding, PayloadEncoding::Bincode);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(3));
        assert_eq!(config.fetchers.len(), 2);
        assert_eq!(config.fetchers[0].instance_name(0), "dummy-0");
        assert_eq!(config.fetchers[1].instance_name(1), "redis-memory");
        assert_eq!(config.fetchers[1].period().unwrap(), Duration::from_millis(500));
        assert_eq!(config.fetchers[0].args["feature"], "smoke");
    }

    #[test]
    fn test_accountant_config_mapping() {
        let config = DaemonConfig::parse(YAML, FileFormat::Yaml).unwrap();
        let accountant = config.accountant_config().unwrap();

        assert_eq!(accountant.granularity.as_duration(), Duration::from_secs(300));
        assert_eq!(accountant.flush_period(), Duration::from_secs(300));
        assert_eq!(accountant.max_emit_rate, 20.0);
        assert_eq!(accountant.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(accountant.retry.max_attempts, 5);
        assert_eq!(accountant.retry.base_delay, Duration::from_millis(100));
        assert_eq!(accountant.allowed_resources.len(), 2);
        assert!(accountant.allowed_units.contains(&UsageUnit::Bytes));
        assert_eq!(accountant.queue_capacity, 10_000);
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = DaemonConfig::parse(
            "fetchers:\n  - type: dummy\n    period_secs: 1\n",
            FileFormat::Yaml,
        )
        .unwrap();
        let accountant = config.accountant_config().unwrap();
        assert_eq!(accountant.overflow_policy, OverflowPolicy::Coalesce);
        assert_eq!(accountant.allowed_resources.len(), ResourceId::ALL.len());
        assert_eq!(config.shutdown_grace_secs, 10);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let no_fetchers = DaemonConfig::parse("bus:\n  url: nats://x\n", FileFormat::Yaml);
        assert!(matches!(no_fetchers, Err(AccountantError::Config(_))));

        let zero_granularity = DaemonConfig::parse(
            "accountant:\n  granularity_secs: 0\nfetchers:\n  - type: dummy\n    period_secs: 1\n",
            FileFormat::Yaml,
        );
        assert!(zero_granularity.is_err());

        let negative_period = DaemonConfig::parse(
            "fetchers:\n  - type: dummy\n    period_secs: -1\n",
            FileFormat::Yaml,
        );
        assert!(negative_period.is_err());

        let empty_units = DaemonConfig::parse(
            "accountant:\n  allowed_units: []\nfetchers:\n  - type: dummy\n    period_secs: 1\n",
            FileFormat::Yaml,
        );
        assert!(empty_units.is_err());
    }

    #[test]
    fn test_unknown_accountant_key_rejected() {
        // The token bucket holds a single token; a burst allowance would break the rate cap
        let burst = DaemonConfig::parse(
            "accountant:\n  max_emit_rate: 5\n  burst: 5\nfetchers:\n  - type: dummy\n    period_secs: 1\n",
            FileFormat::Yaml,
        );
        assert!(matches!(burst, Err(AccountantError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(DaemonConfig::load(Path::new("/nonexistent/usage-fetcher.yaml")).is_err());
    }
}
