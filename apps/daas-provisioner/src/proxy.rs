//! Gateway to the SQL/RavenDB execution proxy.

use std::time::Duration;

use async_trait::async_trait;
use daas_protocol::{CommandResult, QueryResult, SqlRequest};
use daas_runtime::ProvisioningError;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::http_client;

pub const COMMAND_PATH: &str = "api/v1/sql/command";
pub const QUERY_PATH: &str = "api/v1/sql/query";

pub fn initialize_path(server_id: &str) -> String {
    format!("api/v1/raven/{server_id}/initialize")
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy endpoint is not configured")]
    NotConfigured,
    #[error("invalid proxy endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("proxy request failed: {0}")]
    Transport(String),
    #[error("proxy returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("proxy response could not be decoded: {0}")]
    Decode(String),
}

impl ProxyError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProxyError::Transport(_) => true,
            ProxyError::Status { status, .. } => *status >= 500,
            ProxyError::NotConfigured | ProxyError::InvalidEndpoint(_) | ProxyError::Decode(_) => {
                false
            }
        }
    }
}

impl From<ProxyError> for ProvisioningError {
    fn from(err: ProxyError) -> Self {
        if err.is_transient() {
            ProvisioningError::retryable(err.to_string())
        } else {
            ProvisioningError::fatal(err.to_string())
        }
    }
}

/// Executes batches against a tenant server through the proxy.
///
/// A returned result may still carry `Errors`; turning those into a
/// [`daas_runtime::SqlExecutionError`] is the caller's job.
#[async_trait]
pub trait DatabaseProxy: Send + Sync {
    async fn execute_command(&self, request: SqlRequest) -> Result<CommandResult, ProxyError>;

    async fn execute_query(&self, request: SqlRequest) -> Result<QueryResult, ProxyError>;

    /// Success is the HTTP status alone; the proxy returns no body.
    async fn initialize_server_configuration(&self, server_id: &str) -> Result<(), ProxyError>;
}

pub struct HttpDatabaseProxy {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpDatabaseProxy {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ProxyError> {
        let base = http_client::base_url(endpoint).map_err(ProxyError::InvalidEndpoint)?;
        let client = http_client::client_with_timeout(timeout)
            .map_err(|err| ProxyError::Transport(err.to_string()))?;
        Ok(Self { client, base })
    }

    pub fn with_client(client: reqwest::Client, endpoint: &str) -> Result<Self, ProxyError> {
        let base = http_client::base_url(endpoint).map_err(ProxyError::InvalidEndpoint)?;
        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, ProxyError> {
        self.base
            .join(path)
            .map_err(|err| ProxyError::InvalidEndpoint(err.to_string()))
    }

    async fn post(
        &self,
        path: &str,
        body: Option<&SqlRequest>,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = self.url(path)?;
        let mut request = self.client.post(url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ProxyError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &SqlRequest,
    ) -> Result<T, ProxyError> {
        debug!(
            target: "daas::proxy",
            path,
            server = %body.server_id,
            database = %body.database_id,
            statements = body.sql.len(),
            "executing batch"
        );
        let response = self.post(path, Some(body)).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| ProxyError::Decode(err.to_string()))
    }
}

#[async_trait]
impl DatabaseProxy for HttpDatabaseProxy {
    async fn execute_command(&self, request: SqlRequest) -> Result<CommandResult, ProxyError> {
        self.post_json(COMMAND_PATH, &request).await
    }

    async fn execute_query(&self, request: SqlRequest) -> Result<QueryResult, ProxyError> {
        self.post_json(QUERY_PATH, &request).await
    }

    async fn initialize_server_configuration(&self, server_id: &str) -> Result<(), ProxyError> {
        debug!(target: "daas::proxy", server = %server_id, "initializing server configuration");
        self.post(&initialize_path(server_id), None).await?;
        Ok(())
    }
}

/// Stand-in used when no proxy endpoint is configured; every call is fatal.
pub struct UnconfiguredProxy;

#[async_trait]
impl DatabaseProxy for UnconfiguredProxy {
    async fn execute_command(&self, _request: SqlRequest) -> Result<CommandResult, ProxyError> {
        Err(ProxyError::NotConfigured)
    }

    async fn execute_query(&self, _request: SqlRequest) -> Result<QueryResult, ProxyError> {
        Err(ProxyError::NotConfigured)
    }

    async fn initialize_server_configuration(&self, _server_id: &str) -> Result<(), ProxyError> {
        Err(ProxyError::NotConfigured)
    }
}
