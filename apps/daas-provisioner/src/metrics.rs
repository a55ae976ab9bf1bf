//! Prometheus-backed statistics for ready servers.
//!
//! Collection is best effort: failures are logged and the registry keeps the
//! last good samples. Nothing here feeds back into reconciliation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use daas_events::Bus;
use daas_protocol::{InstantSample, QueryData, QueryError, QueryResponse};
use daas_runtime::{DatabaseServer, ServerId};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::kube_resources::base_name;
use crate::store::ServerStore;

pub const QUERY_PATH: &str = "api/v1/query";

/// Used when no `[prometheus.queries]` are configured.
pub const DEFAULT_QUERIES: [(&str, &str); 2] = [
    (
        "memory_bytes",
        r#"sum(container_memory_usage_bytes{pod_name=~"{base_name}-.*"})"#,
    ),
    (
        "cpu_seconds",
        r#"sum(rate(container_cpu_usage_seconds_total{pod_name=~"{base_name}-.*"}[1m]))"#,
    ),
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricsError {
    #[error("invalid metrics endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("metrics request failed: {0}")]
    Transport(String),
    #[error("metrics endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("metrics response could not be decoded: {0}")]
    Decode(String),
    #[error(transparent)]
    Query(#[from] QueryError),
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query(&self, query: &str) -> Result<QueryData, MetricsError>;
}

pub struct HttpMetricsSource {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpMetricsSource {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, MetricsError> {
        let client = crate::http_client::client_with_timeout(timeout)
            .map_err(|err| MetricsError::Transport(err.to_string()))?;
        Self::with_client(client, endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: &str) -> Result<Self, MetricsError> {
        let base = crate::http_client::base_url(endpoint).map_err(MetricsError::InvalidEndpoint)?;
        Ok(Self { client, base })
    }

    fn url(&self, query: &str) -> Result<reqwest::Url, MetricsError> {
        let mut url = self
            .base
            .join(QUERY_PATH)
            .map_err(|err| MetricsError::InvalidEndpoint(err.to_string()))?;
        url.query_pairs_mut().append_pair("query", query);
        Ok(url)
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn query(&self, query: &str) -> Result<QueryData, MetricsError> {
        let url = self.url(query)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| MetricsError::Transport(err.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|err| MetricsError::Transport(err.to_string()))?;
        // Prometheus reports query errors as 400/422 with a JSON error body.
        match serde_json::from_str::<QueryResponse>(&body) {
            Ok(decoded) => Ok(decoded.into_data()?),
            Err(_) if !status.is_success() => Err(MetricsError::Status {
                status: status.as_u16(),
                body,
            }),
            Err(err) => Err(MetricsError::Decode(err.to_string())),
        }
    }
}

pub fn render_query(template: &str, server_id: &str) -> String {
    template
        .replace("{server_id}", server_id)
        .replace("{base_name}", &base_name(server_id))
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ServerStats {
    pub server_id: ServerId,
    pub collected_at: DateTime<Utc>,
    pub samples: BTreeMap<String, Vec<InstantSample>>,
}

/// Latest statistics per server.
#[derive(Default)]
pub struct StatsRegistry {
    entries: RwLock<HashMap<ServerId, ServerStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, stats: ServerStats) {
        self.entries
            .write()
            .await
            .insert(stats.server_id.clone(), stats);
    }

    pub async fn get(&self, server_id: &str) -> Option<ServerStats> {
        self.entries.read().await.get(server_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drops entries for servers not in `keep`.
    pub async fn retain(&self, keep: &[&str]) {
        self.entries
            .write()
            .await
            .retain(|id, _| keep.contains(&id.as_str()));
    }
}

pub struct StatsCollector {
    store: Arc<dyn ServerStore>,
    source: Arc<dyn MetricsSource>,
    registry: Arc<StatsRegistry>,
    bus: Bus,
    queries: BTreeMap<String, String>,
}

impl StatsCollector {
    pub fn new(
        store: Arc<dyn ServerStore>,
        source: Arc<dyn MetricsSource>,
        registry: Arc<StatsRegistry>,
        bus: Bus,
        queries: BTreeMap<String, String>,
    ) -> Self {
        let queries = if queries.is_empty() {
            DEFAULT_QUERIES
                .iter()
                .map(|(name, query)| (name.to_string(), query.to_string()))
                .collect()
        } else {
            queries
        };
        Self {
            store,
            source,
            registry,
            bus,
            queries,
        }
    }

    async fn collect_server(&self, server: &DatabaseServer) -> Option<ServerStats> {
        let mut samples = BTreeMap::new();
        for (name, template) in &self.queries {
            let query = render_query(template, &server.id);
            match self.source.query(&query).await {
                Ok(data) => {
                    samples.insert(name.clone(), data.latest_samples());
                }
                Err(err) => {
                    warn!(
                        target: "daas::stats",
                        server = %server.id,
                        query = %name,
                        error = %err,
                        "stats query failed"
                    );
                }
            }
        }
        if samples.is_empty() {
            return None;
        }
        Some(ServerStats {
            server_id: server.id.clone(),
            collected_at: Utc::now(),
            samples,
        })
    }

    /// One pass over every ready server; returns how many produced stats.
    pub async fn collect_once(&self) -> usize {
        let servers = match self.store.servers().await {
            Ok(servers) => servers,
            Err(err) => {
                warn!(target: "daas::stats", error = %err, "could not list servers");
                return 0;
            }
        };
        let ready: Vec<&DatabaseServer> = servers.iter().filter(|s| s.is_ready()).collect();
        let ids: Vec<&str> = ready.iter().map(|s| s.id.as_str()).collect();
        self.registry.retain(&ids).await;
        let mut collected = 0;
        for server in ready {
            if let Some(stats) = self.collect_server(server).await {
                self.bus
                    .publish(daas_topics::TOPIC_SERVER_STATS_COLLECTED, &stats);
                self.registry.record(stats).await;
                collected += 1;
            }
        }
        debug!(target: "daas::stats", collected, "stats pass finished");
        collected
    }

    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.collect_once().await;
                }
            }
        }
    }
}
