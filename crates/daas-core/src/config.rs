use anyhow::Result;
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub kube: KubeConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub sql: SqlConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Periodic reconciliation tick per server, in milliseconds.
    #[serde(default)]
    #[schemars(range(min = 100))]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    #[schemars(range(min = 10))]
    pub retry_backoff_min_ms: Option<u64>,
    #[serde(default)]
    #[schemars(range(min = 10))]
    pub retry_backoff_max_ms: Option<u64>,
    /// Retries allowed for a retryable failure before it is escalated to fatal.
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub max_retries_before_fatal: Option<u32>,
    /// How long one phase may stay unsettled before it is treated as fatal.
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub phase_timeout_secs: Option<u64>,
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub mailbox_capacity: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct KubeConfig {
    /// Namespace that holds every tenant server object.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub sql_server_image: Option<String>,
    #[serde(default)]
    pub ravendb_image: Option<String>,
    /// Storage class for data volume claims (cluster default when unset).
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Default size of a server's data volume when the server does not say.
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub data_volume_mb: Option<u32>,
    /// First external TCP port handed out by the ingress controller.
    #[serde(default)]
    #[schemars(range(min = 1024))]
    pub ingress_port_base: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Base URL of the SQL/RavenDB execution proxy, e.g. <http://sql-proxy:5000/>
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SqlConfig {
    /// `max server memory (MB)` applied when a SQL Server is initialized.
    #[serde(default)]
    #[schemars(range(min = 512))]
    pub max_server_memory_mb: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PrometheusConfig {
    /// Base URL of the Prometheus HTTP API; stats collection is off when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub poll_interval_secs: Option<u64>,
    /// Named PromQL queries; `{server_id}` is substituted per server.
    #[serde(default)]
    pub queries: Option<std::collections::BTreeMap<String, String>>,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn write_schema_file(path: &str) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Validates TOML text against the schema, then deserializes it.
pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}
