use std::collections::BTreeMap;
use std::time::Duration;

use daas_core::Config;
use once_cell::sync::Lazy;

const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 5_000;
const DEFAULT_RETRY_BACKOFF_MIN_MS: u64 = 1_000;
const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_MAX_RETRIES_BEFORE_FATAL: u32 = 5;
const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAILBOX_CAPACITY: usize = 64;

pub const DEFAULT_NAMESPACE: &str = "daas";
pub const DEFAULT_SQL_SERVER_IMAGE: &str = "microsoft/mssql-server-linux:2017-GA";
pub const DEFAULT_RAVENDB_IMAGE: &str = "ravendb/ravendb:4.0-ubuntu-latest";
const DEFAULT_DATA_VOLUME_MB: u32 = 10_240;
const DEFAULT_INGRESS_PORT_BASE: u16 = 11_433;
const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_SERVER_MEMORY_MB: u32 = 2_048;
const DEFAULT_STATS_POLL_SECS: u64 = 10;

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

static ENV_RECONCILE_INTERVAL_MS: Lazy<Option<u64>> =
    Lazy::new(|| env_u64("DAAS_RECONCILE_INTERVAL_MS").filter(|value| *value >= 100));

static ENV_RETRY_BACKOFF_MIN_MS: Lazy<Option<u64>> =
    Lazy::new(|| env_u64("DAAS_RETRY_BACKOFF_MIN_MS").filter(|value| *value >= 10));

static ENV_RETRY_BACKOFF_MAX_MS: Lazy<Option<u64>> =
    Lazy::new(|| env_u64("DAAS_RETRY_BACKOFF_MAX_MS").filter(|value| *value >= 10));

static ENV_MAX_RETRIES_BEFORE_FATAL: Lazy<Option<u32>> = Lazy::new(|| {
    env_u64("DAAS_MAX_RETRIES_BEFORE_FATAL")
        .and_then(|value| u32::try_from(value).ok())
        .filter(|value| *value >= 1)
});

static ENV_PHASE_TIMEOUT_SECS: Lazy<Option<u64>> =
    Lazy::new(|| env_u64("DAAS_PHASE_TIMEOUT_SECS").filter(|value| *value >= 1));

/// Timing and retry policy for every server actor.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileOptions {
    pub interval: Duration,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
    pub max_retries_before_fatal: u32,
    pub phase_timeout: Duration,
    pub mailbox_capacity: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self::resolve(&daas_core::ReconcileConfig::default())
    }
}

impl ReconcileOptions {
    /// Environment beats the config file, which beats built-in defaults.
    fn resolve(file: &daas_core::ReconcileConfig) -> Self {
        let min_ms = ENV_RETRY_BACKOFF_MIN_MS
            .or(file.retry_backoff_min_ms)
            .unwrap_or(DEFAULT_RETRY_BACKOFF_MIN_MS);
        let max_ms = ENV_RETRY_BACKOFF_MAX_MS
            .or(file.retry_backoff_max_ms)
            .unwrap_or(DEFAULT_RETRY_BACKOFF_MAX_MS)
            .max(min_ms);
        Self {
            interval: Duration::from_millis(
                ENV_RECONCILE_INTERVAL_MS
                    .or(file.interval_ms)
                    .unwrap_or(DEFAULT_RECONCILE_INTERVAL_MS),
            ),
            retry_backoff_min: Duration::from_millis(min_ms),
            retry_backoff_max: Duration::from_millis(max_ms),
            max_retries_before_fatal: ENV_MAX_RETRIES_BEFORE_FATAL
                .or(file.max_retries_before_fatal)
                .unwrap_or(DEFAULT_MAX_RETRIES_BEFORE_FATAL)
                .max(1),
            phase_timeout: Duration::from_secs(
                ENV_PHASE_TIMEOUT_SECS
                    .or(file.phase_timeout_secs)
                    .unwrap_or(DEFAULT_PHASE_TIMEOUT_SECS),
            ),
            mailbox_capacity: file
                .mailbox_capacity
                .unwrap_or(DEFAULT_MAILBOX_CAPACITY)
                .max(1),
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles from the
    /// minimum and is capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .retry_backoff_min
            .saturating_mul(1u32 << exponent);
        delay.min(self.retry_backoff_max)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KubeOptions {
    pub namespace: String,
    pub sql_server_image: String,
    pub ravendb_image: String,
    pub storage_class: Option<String>,
    pub data_volume_mb: u32,
    pub ingress_port_base: u16,
}

impl Default for KubeOptions {
    fn default() -> Self {
        Self::resolve(&daas_core::KubeConfig::default())
    }
}

impl KubeOptions {
    fn resolve(file: &daas_core::KubeConfig) -> Self {
        Self {
            namespace: file
                .namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            sql_server_image: file
                .sql_server_image
                .clone()
                .unwrap_or_else(|| DEFAULT_SQL_SERVER_IMAGE.to_string()),
            ravendb_image: file
                .ravendb_image
                .clone()
                .unwrap_or_else(|| DEFAULT_RAVENDB_IMAGE.to_string()),
            storage_class: file.storage_class.clone(),
            data_volume_mb: file.data_volume_mb.unwrap_or(DEFAULT_DATA_VOLUME_MB),
            ingress_port_base: file.ingress_port_base.unwrap_or(DEFAULT_INGRESS_PORT_BASE),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProxyOptions {
    pub endpoint: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout: Duration::from_secs(DEFAULT_PROXY_TIMEOUT_SECS),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SqlOptions {
    pub max_server_memory_mb: u32,
}

impl Default for SqlOptions {
    fn default() -> Self {
        Self {
            max_server_memory_mb: DEFAULT_MAX_SERVER_MEMORY_MB,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatsOptions {
    pub endpoint: Option<String>,
    pub poll_interval: Duration,
    /// Name to PromQL template; `{server_id}` and `{base_name}` are substituted.
    pub queries: BTreeMap<String, String>,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            poll_interval: Duration::from_secs(DEFAULT_STATS_POLL_SECS),
            queries: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineOptions {
    pub reconcile: ReconcileOptions,
    pub kube: KubeOptions,
    pub proxy: ProxyOptions,
    pub sql: SqlOptions,
    pub stats: StatsOptions,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconcile: ReconcileOptions::resolve(&config.reconcile),
            kube: KubeOptions::resolve(&config.kube),
            proxy: ProxyOptions {
                endpoint: config.proxy.endpoint.clone(),
                request_timeout: Duration::from_secs(
                    config
                        .proxy
                        .request_timeout_secs
                        .unwrap_or(DEFAULT_PROXY_TIMEOUT_SECS),
                ),
            },
            sql: SqlOptions {
                max_server_memory_mb: config
                    .sql
                    .max_server_memory_mb
                    .unwrap_or(DEFAULT_MAX_SERVER_MEMORY_MB),
            },
            stats: StatsOptions {
                endpoint: config.prometheus.endpoint.clone(),
                poll_interval: Duration::from_secs(
                    config
                        .prometheus
                        .poll_interval_secs
                        .unwrap_or(DEFAULT_STATS_POLL_SECS),
                ),
                queries: config.prometheus.queries.clone().unwrap_or_default(),
            },
        }
    }
}
