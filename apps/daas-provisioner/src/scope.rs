//! Per-actor collaborators, released when the actor exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use daas_kube::KubeApi;
use daas_runtime::ProvisioningError;

use crate::proxy::DatabaseProxy;

/// The Kubernetes and proxy clients one server actor works through.
///
/// Dropping the scope releases it; the actor owns it for its whole run so
/// every exit path (completion, cancellation, panic) lets go of it.
pub struct ServerScope {
    server_id: String,
    kube: Arc<dyn KubeApi>,
    proxy: Arc<dyn DatabaseProxy>,
    open: Arc<AtomicUsize>,
}

impl ServerScope {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn kube(&self) -> &dyn KubeApi {
        self.kube.as_ref()
    }

    pub fn proxy(&self) -> &dyn DatabaseProxy {
        self.proxy.as_ref()
    }
}

impl Drop for ServerScope {
    fn drop(&mut self) {
        let remaining = self.open.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        tracing::debug!(
            target: "daas::server",
            server = %self.server_id,
            remaining,
            "released server scope"
        );
    }
}

pub trait ScopeFactory: Send + Sync {
    fn open(&self, server_id: &str) -> Result<ServerScope, ProvisioningError>;

    /// Scopes handed out and not yet dropped.
    fn open_scopes(&self) -> usize;
}

/// Hands every actor the same shared clients.
pub struct SharedScopeFactory {
    kube: Arc<dyn KubeApi>,
    proxy: Arc<dyn DatabaseProxy>,
    open: Arc<AtomicUsize>,
}

impl SharedScopeFactory {
    pub fn new(kube: Arc<dyn KubeApi>, proxy: Arc<dyn DatabaseProxy>) -> Self {
        Self {
            kube,
            proxy,
            open: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ScopeFactory for SharedScopeFactory {
    fn open(&self, server_id: &str) -> Result<ServerScope, ProvisioningError> {
        if server_id.trim().is_empty() {
            return Err(ProvisioningError::fatal("server id must not be empty"));
        }
        self.open.fetch_add(1, Ordering::AcqRel);
        Ok(ServerScope {
            server_id: server_id.to_string(),
            kube: Arc::clone(&self.kube),
            proxy: Arc::clone(&self.proxy),
            open: Arc::clone(&self.open),
        })
    }

    fn open_scopes(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}
