//! Persistence seam for server and database records.

use std::collections::BTreeMap;

use async_trait::async_trait;
use daas_runtime::{DatabaseInstance, DatabaseServer, ProvisioningError};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("server `{0}` not found")]
    ServerNotFound(String),
    #[error("database `{0}` not found")]
    DatabaseNotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ProvisioningError {
    fn from(err: StoreError) -> Self {
        ProvisioningError::retryable(err.to_string())
    }
}

/// Records are written only by the actor that owns the server id; external
/// callers change `action` and then notify the supervisor.
#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn server(&self, id: &str) -> Result<Option<DatabaseServer>, StoreError>;

    async fn servers(&self) -> Result<Vec<DatabaseServer>, StoreError>;

    async fn save_server(&self, server: &DatabaseServer) -> Result<(), StoreError>;

    async fn databases(&self, server_id: &str) -> Result<Vec<DatabaseInstance>, StoreError>;

    async fn database(&self, id: &str) -> Result<Option<DatabaseInstance>, StoreError>;

    async fn save_database(&self, database: &DatabaseInstance) -> Result<(), StoreError>;
}

/// In-process store; ordered by id so listings are stable.
#[derive(Default)]
pub struct MemoryStore {
    servers: RwLock<BTreeMap<String, DatabaseServer>>,
    databases: RwLock<BTreeMap<String, DatabaseInstance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_server(&self, server: DatabaseServer) {
        self.servers.write().await.insert(server.id.clone(), server);
    }

    pub async fn insert_database(&self, database: DatabaseInstance) {
        self.databases
            .write()
            .await
            .insert(database.id.clone(), database);
    }

    pub async fn remove_server(&self, id: &str) -> Option<DatabaseServer> {
        self.servers.write().await.remove(id)
    }

    /// Applies an external change (typically a new `action`) to a server.
    pub async fn update_server<F>(&self, id: &str, update: F) -> Result<DatabaseServer, StoreError>
    where
        F: FnOnce(&mut DatabaseServer),
    {
        let mut servers = self.servers.write().await;
        let server = servers
            .get_mut(id)
            .ok_or_else(|| StoreError::ServerNotFound(id.to_string()))?;
        update(server);
        Ok(server.clone())
    }

    pub async fn update_database<F>(
        &self,
        id: &str,
        update: F,
    ) -> Result<DatabaseInstance, StoreError>
    where
        F: FnOnce(&mut DatabaseInstance),
    {
        let mut databases = self.databases.write().await;
        let database = databases
            .get_mut(id)
            .ok_or_else(|| StoreError::DatabaseNotFound(id.to_string()))?;
        update(database);
        Ok(database.clone())
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn server(&self, id: &str) -> Result<Option<DatabaseServer>, StoreError> {
        Ok(self.servers.read().await.get(id).cloned())
    }

    async fn servers(&self) -> Result<Vec<DatabaseServer>, StoreError> {
        Ok(self.servers.read().await.values().cloned().collect())
    }

    async fn save_server(&self, server: &DatabaseServer) -> Result<(), StoreError> {
        let mut servers = self.servers.write().await;
        if !servers.contains_key(&server.id) {
            return Err(StoreError::ServerNotFound(server.id.clone()));
        }
        servers.insert(server.id.clone(), server.clone());
        Ok(())
    }

    async fn databases(&self, server_id: &str) -> Result<Vec<DatabaseInstance>, StoreError> {
        Ok(self
            .databases
            .read()
            .await
            .values()
            .filter(|database| database.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn database(&self, id: &str) -> Result<Option<DatabaseInstance>, StoreError> {
        Ok(self.databases.read().await.get(id).cloned())
    }

    async fn save_database(&self, database: &DatabaseInstance) -> Result<(), StoreError> {
        let mut databases = self.databases.write().await;
        if !databases.contains_key(&database.id) {
            return Err(StoreError::DatabaseNotFound(database.id.clone()));
        }
        databases.insert(database.id.clone(), database.clone());
        Ok(())
    }
}
