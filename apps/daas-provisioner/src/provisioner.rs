//! Object-level work for one phase, and database create/drop.
//!
//! Each call issues at most one create or delete. Callers decide what to do
//! with the outcome; nothing here touches the persisted records.

use daas_kube::{KubeApi, KubeApiExt, KubeResource, ResourceKind};
use daas_protocol::{SqlRequest, MASTER_DATABASE_ID};
use daas_runtime::{
    DatabaseInstance, DatabaseServer, DatabaseServerKind, ProvisioningAction, ProvisioningError,
    ProvisioningStatus, SqlExecutionError,
};
use tracing::{debug, info};

use crate::kube_resources::{kube_failure, server_labels, ResourceFactory};
use crate::management_sql;
use crate::options::EngineOptions;
use crate::proxy::DatabaseProxy;

/// Externally reachable coordinates published by a ready ingress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressEndpoint {
    pub ip: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkOutcome {
    Created(ResourceKind),
    Deleted(ResourceKind),
    /// The object exists but has not settled (or is still terminating).
    Waiting(ResourceKind),
    /// Nothing left to do for this phase.
    Settled(Option<IngressEndpoint>),
}

impl WorkOutcome {
    pub fn describe(&self) -> String {
        match self {
            WorkOutcome::Created(kind) => format!("created {kind}"),
            WorkOutcome::Deleted(kind) => format!("deleted {kind}"),
            WorkOutcome::Waiting(kind) => format!("waiting for {kind}"),
            WorkOutcome::Settled(_) => "settled".to_string(),
        }
    }
}

pub struct ServerProvisioner<'a> {
    kube: &'a dyn KubeApi,
    proxy: &'a dyn DatabaseProxy,
    options: &'a EngineOptions,
}

impl<'a> ServerProvisioner<'a> {
    pub fn new(
        kube: &'a dyn KubeApi,
        proxy: &'a dyn DatabaseProxy,
        options: &'a EngineOptions,
    ) -> Self {
        Self {
            kube,
            proxy,
            options,
        }
    }

    fn factory(&self) -> ResourceFactory<'_> {
        ResourceFactory::new(&self.options.kube)
    }

    async fn find(
        &self,
        server: &DatabaseServer,
        kind: ResourceKind,
    ) -> Result<Option<KubeResource>, ProvisioningError> {
        self.kube
            .find(kind, &server_labels(&server.id))
            .await
            .map_err(kube_failure)
    }

    /// Creates the object when absent, otherwise reports whether it settled.
    async fn ensure<F>(
        &self,
        server: &DatabaseServer,
        kind: ResourceKind,
        build: F,
    ) -> Result<WorkOutcome, ProvisioningError>
    where
        F: FnOnce(&ResourceFactory<'_>, &DatabaseServer) -> Result<KubeResource, ProvisioningError>,
    {
        match self.find(server, kind).await? {
            None => {
                let resource = build(&self.factory(), server)?;
                let created = self
                    .kube
                    .create_if_absent(&resource)
                    .await
                    .map_err(kube_failure)?;
                if created {
                    info!(
                        target: "daas::server",
                        server = %server.id,
                        kind = %kind,
                        name = %resource.name(),
                        "created object"
                    );
                }
                Ok(WorkOutcome::Created(kind))
            }
            Some(existing) if existing.is_ready() => Ok(WorkOutcome::Settled(None)),
            Some(existing) => {
                debug!(
                    target: "daas::server",
                    server = %server.id,
                    kind = %kind,
                    name = %existing.name(),
                    terminating = existing.is_terminating(),
                    "object not ready yet"
                );
                Ok(WorkOutcome::Waiting(kind))
            }
        }
    }

    /// Deletes the object when present. A terminating object is never
    /// deleted twice; the phase waits for it to disappear.
    async fn remove(
        &self,
        server: &DatabaseServer,
        kind: ResourceKind,
    ) -> Result<WorkOutcome, ProvisioningError> {
        match self.find(server, kind).await? {
            None => Ok(WorkOutcome::Settled(None)),
            Some(existing) if existing.is_terminating() => Ok(WorkOutcome::Waiting(kind)),
            Some(existing) => {
                let deleted = self
                    .kube
                    .delete_if_present(kind, existing.name())
                    .await
                    .map_err(kube_failure)?;
                if deleted {
                    info!(
                        target: "daas::server",
                        server = %server.id,
                        kind = %kind,
                        name = %existing.name(),
                        "deleted object"
                    );
                }
                Ok(WorkOutcome::Deleted(kind))
            }
        }
    }

    /// Data volume claim first, then the controller that mounts it.
    pub async fn ensure_controller(
        &self,
        server: &DatabaseServer,
    ) -> Result<WorkOutcome, ProvisioningError> {
        if let Some(claim) = self.find(server, ResourceKind::PersistentVolumeClaim).await? {
            if claim.is_terminating() {
                return Ok(WorkOutcome::Waiting(ResourceKind::PersistentVolumeClaim));
            }
            if !claim.is_ready() {
                return Err(ProvisioningError::fatal(format!(
                    "data volume claim `{}` was lost",
                    claim.name()
                )));
            }
        } else {
            return self
                .ensure(server, ResourceKind::PersistentVolumeClaim, |factory, server| {
                    factory.data_volume_claim(server)
                })
                .await;
        }
        self.ensure(server, ResourceKind::ReplicationController, |factory, server| {
            factory.replication_controller(server)
        })
        .await
    }

    /// Controller first, then the claim it was mounting.
    pub async fn remove_controller(
        &self,
        server: &DatabaseServer,
    ) -> Result<WorkOutcome, ProvisioningError> {
        match self.remove(server, ResourceKind::ReplicationController).await? {
            WorkOutcome::Settled(_) => {
                self.remove(server, ResourceKind::PersistentVolumeClaim)
                    .await
            }
            other => Ok(other),
        }
    }

    pub async fn ensure_service(
        &self,
        server: &DatabaseServer,
    ) -> Result<WorkOutcome, ProvisioningError> {
        self.ensure(server, ResourceKind::Service, |factory, server| {
            factory.internal_service(server)
        })
        .await
    }

    pub async fn remove_service(
        &self,
        server: &DatabaseServer,
    ) -> Result<WorkOutcome, ProvisioningError> {
        self.remove(server, ResourceKind::Service).await
    }

    /// Settles with the published endpoint once the load balancer reports one.
    pub async fn ensure_ingress(
        &self,
        server: &DatabaseServer,
    ) -> Result<WorkOutcome, ProvisioningError> {
        let outcome = self
            .ensure(server, ResourceKind::Ingress, |factory, server| {
                factory.ingress(server)
            })
            .await?;
        if outcome != WorkOutcome::Settled(None) {
            return Ok(outcome);
        }
        let found = self.find(server, ResourceKind::Ingress).await?;
        let endpoint = found.as_ref().and_then(KubeResource::as_ingress).and_then(|ingress| {
            Some(IngressEndpoint {
                ip: ingress.external_address()?.to_string(),
                port: ingress.host_port()?,
            })
        });
        match endpoint {
            Some(endpoint) => Ok(WorkOutcome::Settled(Some(endpoint))),
            None => Ok(WorkOutcome::Waiting(ResourceKind::Ingress)),
        }
    }

    pub async fn remove_ingress(
        &self,
        server: &DatabaseServer,
    ) -> Result<WorkOutcome, ProvisioningError> {
        self.remove(server, ResourceKind::Ingress).await
    }

    /// SQL Server gets its memory cap applied through the master database;
    /// RavenDB is initialized by the proxy itself.
    pub async fn initialize_configuration(
        &self,
        server: &DatabaseServer,
    ) -> Result<WorkOutcome, ProvisioningError> {
        match server.kind {
            DatabaseServerKind::SqlServer => {
                let request = SqlRequest::new(
                    server.id.clone(),
                    MASTER_DATABASE_ID,
                    management_sql::configure_server_memory(self.options.sql.max_server_memory_mb),
                )
                .as_admin();
                let result = self.proxy.execute_command(request).await?;
                if !result.success() {
                    return Err(SqlExecutionError::from_result(
                        format!("failed to configure server `{}`", server.id),
                        server.id.clone(),
                        MASTER_DATABASE_ID,
                        &result,
                    )
                    .into());
                }
            }
            DatabaseServerKind::RavenDb => {
                self.proxy.initialize_server_configuration(&server.id).await?;
            }
        }
        info!(
            target: "daas::server",
            server = %server.id,
            kind = server.kind.as_str(),
            "server configuration initialized"
        );
        Ok(WorkOutcome::Settled(None))
    }
}

/// What a database step did to the record it was given.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatabaseOutcome {
    Idle,
    Provisioned,
    Deprovisioned,
    Reconfigured,
}

pub struct DatabaseProvisioner<'a> {
    proxy: &'a dyn DatabaseProxy,
}

impl<'a> DatabaseProvisioner<'a> {
    pub fn new(proxy: &'a dyn DatabaseProxy) -> Self {
        Self { proxy }
    }

    async fn exists(
        &self,
        server: &DatabaseServer,
        database: &DatabaseInstance,
    ) -> Result<bool, ProvisioningError> {
        let (sql, parameters) = management_sql::check_database_exists(&database.name);
        let request = SqlRequest::new(server.id.clone(), MASTER_DATABASE_ID, sql)
            .with_parameters(parameters)
            .as_admin();
        let result = self.proxy.execute_query(request).await?;
        if !result.success() {
            return Err(SqlExecutionError::from_result(
                format!("failed to look up database `{}`", database.name),
                server.id.clone(),
                database.id.clone(),
                &result.into_command_result(),
            )
            .into());
        }
        Ok(!result.first_rows().is_empty())
    }

    async fn run(
        &self,
        server: &DatabaseServer,
        database: &DatabaseInstance,
        sql: Vec<String>,
        failure: &str,
    ) -> Result<(), ProvisioningError> {
        let request = SqlRequest::new(server.id.clone(), MASTER_DATABASE_ID, sql).as_admin();
        let result = self.proxy.execute_command(request).await?;
        if result.success() {
            return Ok(());
        }
        Err(SqlExecutionError::from_result(
            format!("{failure} `{}`", database.name),
            server.id.clone(),
            database.id.clone(),
            &result,
        )
        .into())
    }

    /// Applies the database's pending action and returns the updated record.
    /// The caller persists it.
    pub async fn reconcile(
        &self,
        server: &DatabaseServer,
        database: &DatabaseInstance,
    ) -> Result<(DatabaseInstance, DatabaseOutcome), ProvisioningError> {
        let mut next = database.clone();
        if !database.action.is_pending() {
            return Ok((next, DatabaseOutcome::Idle));
        }
        if server.kind == DatabaseServerKind::RavenDb {
            return Err(ProvisioningError::fatal(format!(
                "{} of RavenDB database `{}` is not supported",
                database.action.display_label(),
                database.name
            )));
        }
        let outcome = match database.action {
            ProvisioningAction::None => DatabaseOutcome::Idle,
            ProvisioningAction::Provision => {
                if !self.exists(server, database).await? {
                    self.run(
                        server,
                        database,
                        management_sql::create_database(
                            &database.name,
                            &database.database_user,
                            &database.database_password,
                        ),
                        "failed to create database",
                    )
                    .await?;
                }
                next.status = ProvisioningStatus::Ready;
                DatabaseOutcome::Provisioned
            }
            ProvisioningAction::Deprovision => {
                if self.exists(server, database).await? {
                    self.run(
                        server,
                        database,
                        management_sql::drop_database(&database.name),
                        "failed to drop database",
                    )
                    .await?;
                }
                next.status = ProvisioningStatus::Deprovisioned;
                DatabaseOutcome::Deprovisioned
            }
            // Nothing about a database is reconfigurable yet.
            ProvisioningAction::Reconfigure => {
                next.status = ProvisioningStatus::Ready;
                DatabaseOutcome::Reconfigured
            }
        };
        next.action = ProvisioningAction::None;
        next.last_error = None;
        Ok((next.touch(), outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_resources::{controller_name, data_volume_claim_name, ingress_name, service_name};
    use crate::test_support::{FakeKube, FakeProxy, FAKE_INGRESS_IP};
    use daas_protocol::SqlError;

    fn server() -> DatabaseServer {
        DatabaseServer::new("4", "tenant", "orders", DatabaseServerKind::SqlServer)
            .with_admin_password("secret")
    }

    #[tokio::test]
    async fn controller_creates_claim_then_controller() {
        let kube = FakeKube::new();
        let proxy = FakeProxy::new();
        let options = EngineOptions::default();
        let provisioner = ServerProvisioner::new(&kube, &proxy, &options);
        let server = server();

        let first = provisioner.ensure_controller(&server).await.expect("step");
        assert_eq!(first, WorkOutcome::Created(ResourceKind::PersistentVolumeClaim));
        let second = provisioner.ensure_controller(&server).await.expect("step");
        assert_eq!(second, WorkOutcome::Created(ResourceKind::ReplicationController));
        assert_eq!(kube.creates(), 2);

        let waiting = provisioner.ensure_controller(&server).await.expect("step");
        assert_eq!(waiting, WorkOutcome::Waiting(ResourceKind::ReplicationController));
        kube.settle(ResourceKind::ReplicationController, &controller_name("4"));
        let settled = provisioner.ensure_controller(&server).await.expect("step");
        assert_eq!(settled, WorkOutcome::Settled(None));
        assert_eq!(kube.creates(), 2);
        assert!(kube
            .get(ResourceKind::PersistentVolumeClaim, &data_volume_claim_name("4"))
            .is_some());
    }

    #[tokio::test]
    async fn teardown_never_deletes_a_terminating_object_twice() {
        let kube = FakeKube::settling();
        let proxy = FakeProxy::new();
        let options = EngineOptions::default();
        let provisioner = ServerProvisioner::new(&kube, &proxy, &options);
        let server = server();
        provisioner.ensure_service(&server).await.expect("create");
        kube.hold_deletes(true);

        assert_eq!(
            provisioner.remove_service(&server).await.expect("delete"),
            WorkOutcome::Deleted(ResourceKind::Service)
        );
        for _ in 0..3 {
            assert_eq!(
                provisioner.remove_service(&server).await.expect("wait"),
                WorkOutcome::Waiting(ResourceKind::Service)
            );
        }
        assert_eq!(kube.deletes(), 1);
        kube.finish_deletes();
        assert_eq!(
            provisioner.remove_service(&server).await.expect("gone"),
            WorkOutcome::Settled(None)
        );
        assert!(kube.get(ResourceKind::Service, &service_name("4")).is_none());
    }

    #[tokio::test]
    async fn ingress_settles_with_its_endpoint() {
        let kube = FakeKube::new();
        let proxy = FakeProxy::new();
        let options = EngineOptions::default();
        let provisioner = ServerProvisioner::new(&kube, &proxy, &options);
        let server = server();

        assert_eq!(
            provisioner.ensure_ingress(&server).await.expect("create"),
            WorkOutcome::Created(ResourceKind::Ingress)
        );
        assert_eq!(
            provisioner.ensure_ingress(&server).await.expect("wait"),
            WorkOutcome::Waiting(ResourceKind::Ingress)
        );
        kube.settle(ResourceKind::Ingress, &ingress_name("4"));
        assert_eq!(
            provisioner.ensure_ingress(&server).await.expect("ready"),
            WorkOutcome::Settled(Some(IngressEndpoint {
                ip: FAKE_INGRESS_IP.to_string(),
                port: 11437,
            }))
        );
    }

    #[tokio::test]
    async fn sql_server_configuration_runs_against_master_as_admin() {
        let kube = FakeKube::new();
        let proxy = FakeProxy::new();
        let options = EngineOptions::default();
        let provisioner = ServerProvisioner::new(&kube, &proxy, &options);

        provisioner
            .initialize_configuration(&server())
            .await
            .expect("configured");
        let commands = proxy.commands.lock().expect("commands").clone();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].targets_master());
        assert!(commands[0].execute_as_admin_user);

        proxy.fail_commands_with(vec![SqlError::tsql(15123, 1, "bad option")]);
        let err = provisioner
            .initialize_configuration(&server())
            .await
            .expect_err("sql errors surface");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("bad option"));
    }

    #[tokio::test]
    async fn ravendb_configuration_uses_the_initialize_call() {
        let kube = FakeKube::new();
        let proxy = FakeProxy::new();
        let options = EngineOptions::default();
        let provisioner = ServerProvisioner::new(&kube, &proxy, &options);
        let server = DatabaseServer::new("9", "tenant", "docs", DatabaseServerKind::RavenDb);
        provisioner
            .initialize_configuration(&server)
            .await
            .expect("initialized");
        assert_eq!(proxy.initialize_count(), 1);
        assert_eq!(proxy.command_count(), 0);
    }

    #[tokio::test]
    async fn database_provisioning_skips_existing_databases() {
        let proxy = FakeProxy::new().with_existing("orders");
        let provisioner = DatabaseProvisioner::new(&proxy);
        let server = server();
        let database = DatabaseInstance::new("d1", "4", "tenant", "orders")
            .with_credentials("orders_user", "pw");

        let (updated, outcome) = provisioner
            .reconcile(&server, &database)
            .await
            .expect("reconciled");
        assert_eq!(outcome, DatabaseOutcome::Provisioned);
        assert_eq!(updated.status, ProvisioningStatus::Ready);
        assert_eq!(updated.action, ProvisioningAction::None);
        assert_eq!(proxy.command_count(), 0);

        let fresh = DatabaseInstance::new("d2", "4", "tenant", "billing");
        provisioner.reconcile(&server, &fresh).await.expect("created");
        assert_eq!(proxy.command_count(), 1);
    }

    #[tokio::test]
    async fn database_deprovisioning_drops_when_present() {
        let proxy = FakeProxy::new().with_existing("orders");
        let provisioner = DatabaseProvisioner::new(&proxy);
        let database = DatabaseInstance::new("d1", "4", "tenant", "orders")
            .with_action(ProvisioningAction::Deprovision);
        let (updated, outcome) = provisioner
            .reconcile(&server(), &database)
            .await
            .expect("dropped");
        assert_eq!(outcome, DatabaseOutcome::Deprovisioned);
        assert_eq!(updated.status, ProvisioningStatus::Deprovisioned);
        let commands = proxy.commands.lock().expect("commands").clone();
        assert!(commands[0].sql.iter().any(|line| line.starts_with("Drop Database")));
    }

    #[tokio::test]
    async fn ravendb_databases_are_rejected() {
        let proxy = FakeProxy::new();
        let provisioner = DatabaseProvisioner::new(&proxy);
        let server = DatabaseServer::new("9", "tenant", "docs", DatabaseServerKind::RavenDb);
        let database = DatabaseInstance::new("d1", "9", "tenant", "docs");
        let err = provisioner
            .reconcile(&server, &database)
            .await
            .expect_err("unsupported");
        assert!(err.is_fatal());
        assert_eq!(proxy.command_count(), 0);
    }
}
