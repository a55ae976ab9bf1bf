//! Provisioning and reconciliation engine for tenant database servers.

pub mod engine;
pub mod http_client;
pub mod kube_resources;
pub mod management_sql;
pub mod metrics;
pub mod options;
pub mod provisioner;
pub mod proxy;
pub mod reconcile;
pub mod scope;
pub mod server_manager;
pub mod store;
pub mod supervisor;
pub mod tasks;

#[cfg(test)]
mod test_support;

pub use engine::{EngineDeps, ProvisioningEngine};
pub use options::EngineOptions;
pub use store::{MemoryStore, ServerStore, StoreError};
pub use supervisor::{ServerSupervisor, SupervisorError};
