//! The per-server reconciliation actor.
//!
//! One task per server id. Every mailbox message (tick, routed watch event,
//! action or database notification) triggers at most one step. A step works
//! on a copy of the record; the copy is adopted only after the store took it,
//! so a cancelled or unpersisted step leaves no trace.

use std::collections::BTreeSet;
use std::sync::Arc;

use daas_events::Bus;
use daas_kube::{ObjectMeta, ResourceEventBus, ResourceEventFilter, WatchEvent};
use daas_runtime::{
    DatabaseId, DatabaseInstance, DatabaseServer, ProvisioningAction, ProvisioningError,
    ProvisioningStatus, ServerId,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::kube_resources::server_labels;
use crate::options::EngineOptions;
use crate::provisioner::{DatabaseOutcome, DatabaseProvisioner};
use crate::reconcile::{self, StepContext, StepOutcome};
use crate::scope::{ScopeFactory, ServerScope};
use crate::store::ServerStore;

#[derive(Clone, Debug)]
pub enum ServerMessage {
    Tick,
    /// The record's desired action was changed externally.
    ActionChanged,
    DatabaseChanged(DatabaseId),
    Watch(Arc<WatchEvent>),
    Stop,
}

impl From<Arc<WatchEvent>> for ServerMessage {
    fn from(event: Arc<WatchEvent>) -> Self {
        ServerMessage::Watch(event)
    }
}

/// Shared collaborators every actor is started with.
#[derive(Clone)]
pub struct ServerManagerDeps {
    pub store: Arc<dyn ServerStore>,
    pub scopes: Arc<dyn ScopeFactory>,
    pub watch: Arc<ResourceEventBus<ServerMessage>>,
    pub bus: Bus,
    pub options: Arc<EngineOptions>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActorExit {
    Stopped,
    Cancelled,
    /// Teardown finished; nothing left to reconcile.
    Deprovisioned,
    /// The record disappeared from the store.
    Missing,
    Failed(String),
}

impl ActorExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorExit::Stopped => "stopped",
            ActorExit::Cancelled => "cancelled",
            ActorExit::Deprovisioned => "deprovisioned",
            ActorExit::Missing => "missing",
            ActorExit::Failed(_) => "failed",
        }
    }
}

fn started_topic(action: ProvisioningAction) -> Option<&'static str> {
    match action {
        ProvisioningAction::None => None,
        ProvisioningAction::Provision => Some(daas_topics::TOPIC_SERVER_PROVISIONING),
        ProvisioningAction::Reconfigure => Some(daas_topics::TOPIC_SERVER_RECONFIGURING),
        ProvisioningAction::Deprovision => Some(daas_topics::TOPIC_SERVER_DEPROVISIONING),
    }
}

fn completed_topic(action: ProvisioningAction) -> Option<&'static str> {
    match action {
        ProvisioningAction::None => None,
        ProvisioningAction::Provision => Some(daas_topics::TOPIC_SERVER_PROVISIONED),
        ProvisioningAction::Reconfigure => Some(daas_topics::TOPIC_SERVER_RECONFIGURED),
        ProvisioningAction::Deprovision => Some(daas_topics::TOPIC_SERVER_DEPROVISIONED),
    }
}

fn failed_topic(action: ProvisioningAction) -> Option<&'static str> {
    match action {
        ProvisioningAction::None => None,
        ProvisioningAction::Provision => Some(daas_topics::TOPIC_SERVER_PROVISIONING_FAILED),
        ProvisioningAction::Reconfigure => Some(daas_topics::TOPIC_SERVER_RECONFIGURATION_FAILED),
        ProvisioningAction::Deprovision => Some(daas_topics::TOPIC_SERVER_DEPROVISIONING_FAILED),
    }
}

/// Subscriber key on the watch bus; unique per actor generation so a
/// replaced actor never unsubscribes its successor.
pub fn subscriber_key(server_id: &str, generation: Uuid) -> String {
    format!("server/{server_id}/{generation}")
}

/// Runs the actor for `server_id` until it is stopped, cancelled, or has
/// nothing left to do. The watch subscription and the server scope are
/// released on every exit path.
pub async fn run_server_manager(
    server_id: ServerId,
    generation: Uuid,
    deps: ServerManagerDeps,
    sender: mpsc::Sender<ServerMessage>,
    mailbox: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
) -> ActorExit {
    let scope = match deps.scopes.open(&server_id) {
        Ok(scope) => scope,
        Err(err) => {
            error!(target: "daas::server", server = %server_id, error = %err, "could not open server scope");
            return ActorExit::Failed(err.to_string());
        }
    };
    let server = match deps.store.server(&server_id).await {
        Ok(Some(server)) => server,
        Ok(None) => return ActorExit::Missing,
        Err(err) => {
            warn!(target: "daas::server", server = %server_id, error = %err, "could not load server");
            return ActorExit::Failed(err.to_string());
        }
    };

    let subscriber = subscriber_key(&server_id, generation);
    // Label-only: routes every object of this server regardless of name.
    let filter = ResourceEventFilter::from_metadata(
        &ObjectMeta::default().with_labels(server_labels(&server_id)),
    );
    deps.watch.subscribe(subscriber.clone(), filter, sender).await;
    info!(
        target: "daas::server",
        server = %server_id,
        action = %server.action,
        phase = %server.phase,
        status = %server.status,
        "server manager started"
    );

    let watch = Arc::clone(&deps.watch);
    let mut manager = ServerManager::new(deps, scope, server);
    let exit = manager.run(mailbox, &cancel).await;

    let removed = watch.unsubscribe_all(&subscriber).await;
    info!(
        target: "daas::server",
        server = %server_id,
        exit = exit.as_str(),
        routes = removed,
        "server manager stopped"
    );
    exit
}

struct ServerManager {
    deps: ServerManagerDeps,
    scope: ServerScope,
    server: DatabaseServer,
    failures: u32,
    retry_at: Option<Instant>,
    phase_since: Instant,
    announced: Option<ProvisioningAction>,
    /// Errored databases named by `DatabaseChanged` that have not been
    /// retried yet.
    changed_databases: BTreeSet<DatabaseId>,
}

impl ServerManager {
    fn new(deps: ServerManagerDeps, scope: ServerScope, server: DatabaseServer) -> Self {
        Self {
            deps,
            scope,
            server,
            failures: 0,
            retry_at: None,
            phase_since: Instant::now(),
            announced: None,
            changed_databases: BTreeSet::new(),
        }
    }

    fn id(&self) -> &str {
        &self.server.id
    }

    async fn run(
        &mut self,
        mut mailbox: mpsc::Receiver<ServerMessage>,
        cancel: &CancellationToken,
    ) -> ActorExit {
        let mut ticker = tokio::time::interval(self.deps.options.reconcile.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let retry_deadline = self.retry_at.unwrap_or_else(Instant::now);
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ActorExit::Cancelled,
                received = mailbox.recv() => match received {
                    Some(message) => message,
                    None => return ActorExit::Stopped,
                },
                _ = tokio::time::sleep_until(retry_deadline), if self.retry_at.is_some() => {
                    ServerMessage::Tick
                }
                _ = ticker.tick() => ServerMessage::Tick,
            };

            match message {
                ServerMessage::Stop => return ActorExit::Stopped,
                ServerMessage::ActionChanged => {
                    if let Some(exit) = self.reload().await {
                        return exit;
                    }
                }
                ServerMessage::DatabaseChanged(id) => {
                    self.changed_databases.insert(id);
                }
                ServerMessage::Watch(event) => {
                    debug!(
                        target: "daas::watch",
                        server = %self.id(),
                        kind = %event.object.kind(),
                        object = %event.object.name(),
                        event = event.event_type.as_str(),
                        "watch event received"
                    );
                }
                ServerMessage::Tick => {}
            }

            if self.server.is_halted() {
                continue;
            }
            if let Some(at) = self.retry_at {
                if Instant::now() < at {
                    continue;
                }
                self.retry_at = None;
            }

            if self.server.action.is_pending() {
                match self.step_server(cancel).await {
                    StepResult::Exit(exit) => return exit,
                    StepResult::Continue => {}
                }
            } else if self.server.is_ready() {
                if let Some(exit) = self.step_databases(cancel).await {
                    return exit;
                }
            }
        }
    }

    /// Adopts the stored record after an external change. A halted server
    /// with a pending action resumes.
    async fn reload(&mut self) -> Option<ActorExit> {
        let stored = match self.deps.store.server(&self.server.id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Some(ActorExit::Missing),
            Err(err) => {
                warn!(target: "daas::server", server = %self.id(), error = %err, "reload failed");
                return None;
            }
        };
        if stored.phase != self.server.phase {
            self.phase_since = Instant::now();
        }
        self.server = stored;
        if self.server.is_halted() && self.server.action.is_pending() {
            let mut resumed = self.server.clone();
            resumed.status = ProvisioningStatus::Processing;
            resumed.last_error = None;
            match self.commit(resumed).await {
                Ok(()) => {
                    self.failures = 0;
                    self.retry_at = None;
                    self.phase_since = Instant::now();
                    self.announced = None;
                    info!(
                        target: "daas::server",
                        server = %self.id(),
                        action = %self.server.action,
                        phase = %self.server.phase,
                        "resuming halted server"
                    );
                }
                Err(err) => self.fail(err).await,
            }
        }
        None
    }

    fn announce(&mut self) {
        let action = self.server.action;
        if self.announced == Some(action) {
            return;
        }
        self.announced = Some(action);
        self.phase_since = Instant::now();
        if let Some(topic) = started_topic(action) {
            self.deps.bus.publish(
                topic,
                &json!({
                    "server_id": self.server.id,
                    "tenant_id": self.server.tenant_id,
                    "phase": self.server.phase,
                }),
            );
        }
        info!(
            target: "daas::server",
            server = %self.id(),
            action = %action,
            phase = %self.server.phase,
            "{} started",
            action.display_label()
        );
    }

    async fn step_server(&mut self, cancel: &CancellationToken) -> StepResult {
        self.announce();
        let action = self.server.action;
        let result = {
            let ctx = StepContext {
                kube: self.scope.kube(),
                proxy: self.scope.proxy(),
                options: &self.deps.options,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StepResult::Exit(ActorExit::Cancelled),
                result = reconcile::step(&self.server, &ctx) => result,
            }
        };

        let (next, outcome) = match result {
            Ok(stepped) => stepped,
            Err(err) => {
                self.fail(err).await;
                return StepResult::Continue;
            }
        };
        if outcome == StepOutcome::Idle {
            return StepResult::Continue;
        }
        if let Err(err) = self.commit(next).await {
            self.fail(err).await;
            return StepResult::Continue;
        }
        self.failures = 0;

        match outcome {
            StepOutcome::Completed { action: done } => {
                self.announced = None;
                if let Some(topic) = completed_topic(done) {
                    self.deps.bus.publish(
                        topic,
                        &json!({
                            "server_id": self.server.id,
                            "tenant_id": self.server.tenant_id,
                            "endpoint": self.server.public_endpoint(),
                        }),
                    );
                }
                info!(
                    target: "daas::server",
                    server = %self.id(),
                    action = %done,
                    status = %self.server.status,
                    "{} complete",
                    done.display_label()
                );
                if done == ProvisioningAction::Deprovision {
                    self.retire_databases().await;
                    return StepResult::Exit(ActorExit::Deprovisioned);
                }
            }
            StepOutcome::Waiting { phase, kind } => {
                debug!(target: "daas::server", server = %self.id(), phase = %phase, kind = %kind, "waiting");
                self.check_phase_timeout(action).await;
            }
            StepOutcome::Acted { phase, detail } => {
                debug!(target: "daas::server", server = %self.id(), phase = %phase, detail = %detail, "acted");
                self.check_phase_timeout(action).await;
            }
            StepOutcome::Advanced { .. } | StepOutcome::Idle => {}
        }
        StepResult::Continue
    }

    async fn check_phase_timeout(&mut self, action: ProvisioningAction) {
        let timeout = self.deps.options.reconcile.phase_timeout;
        let elapsed = self.phase_since.elapsed();
        if elapsed <= timeout || self.server.action != action {
            return;
        }
        let err = ProvisioningError::fatal(format!(
            "phase {} did not settle within {}s",
            self.server.phase,
            timeout.as_secs()
        ));
        self.fail(err).await;
    }

    /// Persists `candidate` and adopts it; on failure the current record stays.
    async fn commit(&mut self, candidate: DatabaseServer) -> Result<(), ProvisioningError> {
        self.deps.store.save_server(&candidate).await?;
        let previous = std::mem::replace(&mut self.server, candidate);
        if previous.phase != self.server.phase {
            self.phase_since = Instant::now();
            self.deps.bus.publish(
                daas_topics::TOPIC_SERVER_PHASE_CHANGED,
                &json!({
                    "server_id": self.server.id,
                    "from": previous.phase,
                    "to": self.server.phase,
                    "action": previous.action,
                }),
            );
            info!(
                target: "daas::server",
                server = %self.id(),
                from = %previous.phase,
                to = %self.server.phase,
                "phase changed"
            );
        }
        if previous.public_endpoint() != self.server.public_endpoint() {
            self.deps.bus.publish(
                daas_topics::TOPIC_SERVER_INGRESS_CHANGED,
                &json!({
                    "server_id": self.server.id,
                    "ingress_ip": self.server.ingress_ip,
                    "ingress_port": self.server.ingress_port,
                }),
            );
        }
        Ok(())
    }

    /// Records a failed step. Retryable failures back off and eventually
    /// escalate; fatal ones halt the server until its action is reset.
    async fn fail(&mut self, err: ProvisioningError) {
        self.failures = self.failures.saturating_add(1);
        let reconcile = &self.deps.options.reconcile;
        let err = if !err.is_fatal() && self.failures > reconcile.max_retries_before_fatal {
            err.escalate(self.failures)
        } else {
            err
        };
        let fatal = err.is_fatal();
        let mut failed = self.server.clone();
        failed.status = if fatal {
            ProvisioningStatus::Error
        } else {
            ProvisioningStatus::Processing
        };
        failed.last_error = Some(err.to_string());
        let failed = failed.touch();

        let backoff = reconcile.backoff(self.failures);
        if let Err(store_err) = self.deps.store.save_server(&failed).await {
            warn!(
                target: "daas::server",
                server = %self.id(),
                error = %store_err,
                "could not record failure; will retry"
            );
            self.retry_at = Some(Instant::now() + backoff);
            return;
        }
        let action = failed.action;
        self.server = failed;

        if fatal {
            self.retry_at = None;
            self.announced = None;
            if let Some(topic) = failed_topic(action) {
                self.deps.bus.publish(
                    topic,
                    &json!({
                        "server_id": self.server.id,
                        "tenant_id": self.server.tenant_id,
                        "phase": self.server.phase,
                        "error": err.to_string(),
                        "kind": err.kind_label(),
                    }),
                );
            }
            error!(
                target: "daas::server",
                server = %self.id(),
                action = %action,
                phase = %self.server.phase,
                kind = err.kind_label(),
                error = %err,
                "{} failed; server halted",
                action.display_label()
            );
        } else {
            self.retry_at = Some(Instant::now() + backoff);
            warn!(
                target: "daas::server",
                server = %self.id(),
                phase = %self.server.phase,
                attempt = self.failures,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "step failed; retrying"
            );
        }
    }

    /// One database step for a ready server. Databases halted in `Error`
    /// are only picked up again once they were changed externally.
    async fn step_databases(&mut self, cancel: &CancellationToken) -> Option<ActorExit> {
        let databases = match self.deps.store.databases(&self.server.id).await {
            Ok(databases) => databases,
            Err(err) => {
                warn!(target: "daas::database", server = %self.id(), error = %err, "could not list databases");
                return None;
            }
        };
        self.changed_databases.retain(|id| {
            databases
                .iter()
                .any(|database| &database.id == id && database.action.is_pending())
        });
        let changed = &self.changed_databases;
        let database = databases.into_iter().find(|database| {
            database.action.is_pending()
                && (database.status != ProvisioningStatus::Error || changed.contains(&database.id))
        })?;
        self.changed_databases.remove(&database.id);

        let provisioner = DatabaseProvisioner::new(self.scope.proxy());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(ActorExit::Cancelled),
            result = provisioner.reconcile(&self.server, &database) => result,
        };
        match result {
            Ok((updated, outcome)) => {
                if let Err(err) = self.deps.store.save_database(&updated).await {
                    warn!(target: "daas::database", database = %database.id, error = %err, "could not save database");
                    return None;
                }
                let topic = match outcome {
                    DatabaseOutcome::Provisioned => Some(daas_topics::TOPIC_DATABASE_PROVISIONED),
                    DatabaseOutcome::Deprovisioned => Some(daas_topics::TOPIC_DATABASE_DEPROVISIONED),
                    DatabaseOutcome::Reconfigured | DatabaseOutcome::Idle => None,
                };
                if let Some(topic) = topic {
                    self.publish_database(topic, &updated, None);
                }
                info!(
                    target: "daas::database",
                    server = %self.id(),
                    database = %updated.id,
                    name = %updated.name,
                    status = %updated.status,
                    "database reconciled"
                );
            }
            Err(err) => {
                let fatal = err.is_fatal();
                let mut failed = database.clone();
                failed.status = if fatal {
                    ProvisioningStatus::Error
                } else {
                    ProvisioningStatus::Processing
                };
                failed.last_error = Some(err.to_string());
                let failed = failed.touch();
                if let Err(store_err) = self.deps.store.save_database(&failed).await {
                    warn!(target: "daas::database", database = %database.id, error = %store_err, "could not record database failure");
                }
                if fatal {
                    self.publish_database(daas_topics::TOPIC_DATABASE_FAILED, &failed, Some(&err));
                    error!(target: "daas::database", server = %self.id(), database = %database.id, error = %err, "database action failed");
                } else {
                    warn!(target: "daas::database", server = %self.id(), database = %database.id, error = %err, "database step failed; retrying on next tick");
                }
            }
        }
        None
    }

    /// A torn-down server takes its databases with it.
    async fn retire_databases(&mut self) {
        let databases = match self.deps.store.databases(&self.server.id).await {
            Ok(databases) => databases,
            Err(err) => {
                warn!(target: "daas::database", server = %self.id(), error = %err, "could not list databases to retire");
                return;
            }
        };
        for database in databases {
            if database.status == ProvisioningStatus::Deprovisioned {
                continue;
            }
            let mut retired = database;
            retired.status = ProvisioningStatus::Deprovisioned;
            retired.action = ProvisioningAction::None;
            let retired = retired.touch();
            match self.deps.store.save_database(&retired).await {
                Ok(()) => {
                    self.publish_database(daas_topics::TOPIC_DATABASE_DEPROVISIONED, &retired, None)
                }
                Err(err) => {
                    warn!(target: "daas::database", database = %retired.id, error = %err, "could not retire database")
                }
            }
        }
    }

    fn publish_database(
        &self,
        topic: &str,
        database: &DatabaseInstance,
        err: Option<&ProvisioningError>,
    ) {
        let mut payload = json!({
            "server_id": database.server_id,
            "database_id": database.id,
            "name": database.name,
            "status": database.status,
        });
        if let (Some(err), serde_json::Value::Object(map)) = (err, &mut payload) {
            map.insert("error".into(), json!(err.to_string()));
        }
        self.deps.bus.publish(topic, &payload);
    }
}

enum StepResult {
    Continue,
    Exit(ActorExit),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ReconcileOptions;
    use crate::scope::SharedScopeFactory;
    use crate::store::MemoryStore;
    use crate::test_support::{FakeKube, FakeProxy};
    use daas_kube::{KubeError, ResourceKind};
    use daas_runtime::{DatabaseServerKind, ServerPhase};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        kube: Arc<FakeKube>,
        proxy: Arc<FakeProxy>,
        scopes: Arc<SharedScopeFactory>,
        deps: ServerManagerDeps,
    }

    fn fast_options() -> EngineOptions {
        EngineOptions {
            reconcile: ReconcileOptions {
                interval: Duration::from_millis(10),
                retry_backoff_min: Duration::from_millis(1),
                retry_backoff_max: Duration::from_millis(5),
                max_retries_before_fatal: 3,
                phase_timeout: Duration::from_secs(60),
                mailbox_capacity: 16,
            },
            ..EngineOptions::default()
        }
    }

    fn harness(kube: FakeKube, proxy: FakeProxy) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let kube = Arc::new(kube);
        let proxy = Arc::new(proxy);
        let scopes = Arc::new(SharedScopeFactory::new(kube.clone(), proxy.clone()));
        let deps = ServerManagerDeps {
            store: store.clone(),
            scopes: scopes.clone(),
            watch: Arc::new(ResourceEventBus::new()),
            bus: Bus::new(64),
            options: Arc::new(fast_options()),
        };
        Harness {
            store,
            kube,
            proxy,
            scopes,
            deps,
        }
    }

    fn spawn(
        harness: &Harness,
        id: &str,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<ServerMessage>, tokio::task::JoinHandle<ActorExit>) {
        let (tx, rx) = mpsc::channel(16);
        let deps = harness.deps.clone();
        let sender = tx.clone();
        let id = id.to_string();
        let handle = tokio::spawn(async move {
            run_server_manager(id, Uuid::new_v4(), deps, sender, rx, cancel).await
        });
        (tx, handle)
    }

    async fn wait_for_server<F>(store: &MemoryStore, id: &str, predicate: F) -> DatabaseServer
    where
        F: Fn(&DatabaseServer) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(server) = store.server(id).await.expect("store") {
                    if predicate(&server) {
                        return server;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached in time")
    }

    fn sql_server(id: &str) -> DatabaseServer {
        DatabaseServer::new(id, "tenant", "orders", DatabaseServerKind::SqlServer)
            .with_admin_password("secret")
    }

    #[tokio::test]
    async fn provisions_to_ready_and_releases_on_stop() {
        let h = harness(FakeKube::settling(), FakeProxy::new());
        h.store.insert_server(sql_server("4")).await;
        let mut events = h.deps.bus.subscribe();
        let (tx, handle) = spawn(&h, "4", CancellationToken::new());

        let ready = wait_for_server(&h.store, "4", DatabaseServer::is_ready).await;
        assert_eq!(ready.phase, ServerPhase::Done);
        assert_eq!(ready.action, ProvisioningAction::None);
        assert!(ready.public_endpoint().is_some());
        assert_eq!(h.kube.creates(), 4);

        tx.send(ServerMessage::Stop).await.expect("mailbox open");
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("actor stops")
            .expect("actor joined");
        assert_eq!(exit, ActorExit::Stopped);
        assert_eq!(h.scopes.open_scopes(), 0);
        assert_eq!(h.deps.watch.stats().await.routes, 0);

        let mut kinds = Vec::new();
        while let Ok(env) = events.try_recv() {
            kinds.push(env.kind);
        }
        assert_eq!(kinds.first().map(String::as_str), Some(daas_topics::TOPIC_SERVER_PROVISIONING));
        assert!(kinds.iter().any(|k| k == daas_topics::TOPIC_SERVER_PROVISIONED));
        assert!(kinds.iter().any(|k| k == daas_topics::TOPIC_SERVER_INGRESS_CHANGED));
    }

    #[tokio::test]
    async fn deprovision_retires_databases_and_exits() {
        let h = harness(FakeKube::settling(), FakeProxy::new());
        h.store.insert_server(sql_server("4")).await;
        h.store
            .insert_database(
                DatabaseInstance::new("d1", "4", "tenant", "orders")
                    .with_action(ProvisioningAction::None)
                    .with_status(ProvisioningStatus::Ready),
            )
            .await;
        let (tx, handle) = spawn(&h, "4", CancellationToken::new());
        wait_for_server(&h.store, "4", DatabaseServer::is_ready).await;

        h.store
            .update_server("4", |s| s.action = ProvisioningAction::Deprovision)
            .await
            .expect("action set");
        tx.send(ServerMessage::ActionChanged).await.expect("mailbox open");

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("actor exits")
            .expect("actor joined");
        assert_eq!(exit, ActorExit::Deprovisioned);
        let server = h.store.server("4").await.expect("store").expect("record kept");
        assert_eq!(server.status, ProvisioningStatus::Deprovisioned);
        assert_eq!(server.phase, ServerPhase::None);
        assert!(h.kube.is_empty());
        assert_eq!(h.kube.deletes(), 4);
        let database = h.store.database("d1").await.expect("store").expect("db");
        assert_eq!(database.status, ProvisioningStatus::Deprovisioned);
    }

    #[tokio::test]
    async fn fatal_failure_halts_until_action_changes() {
        let h = harness(FakeKube::settling(), FakeProxy::new());
        h.store.insert_server(sql_server("4")).await;
        h.kube.fail_next(KubeError::Api {
            status: 403,
            reason: "Forbidden".into(),
            message: "quota".into(),
        });
        let (tx, handle) = spawn(&h, "4", CancellationToken::new());

        let halted = wait_for_server(&h.store, "4", DatabaseServer::is_halted).await;
        assert!(halted.last_error.as_deref().unwrap_or_default().contains("quota"));
        assert_eq!(halted.phase, ServerPhase::None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.kube.creates(), 0);

        tx.send(ServerMessage::ActionChanged).await.expect("mailbox open");
        let ready = wait_for_server(&h.store, "4", DatabaseServer::is_ready).await;
        assert_eq!(ready.last_error, None);

        tx.send(ServerMessage::Stop).await.expect("mailbox open");
        handle.await.expect("actor joined");
    }

    #[tokio::test]
    async fn retryable_failures_escalate() {
        let h = harness(FakeKube::new(), FakeProxy::new());
        h.store.insert_server(sql_server("4")).await;
        h.kube
            .fail_always(Some(KubeError::Transport("connection refused".into())));
        let (tx, handle) = spawn(&h, "4", CancellationToken::new());

        let halted = wait_for_server(&h.store, "4", DatabaseServer::is_halted).await;
        let message = halted.last_error.expect("error recorded");
        assert!(message.contains("giving up after 4 attempts"), "{message}");
        assert_eq!(h.kube.creates(), 0);
        assert!(message.contains("connection refused"), "{message}");

        tx.send(ServerMessage::Stop).await.expect("mailbox open");
        handle.await.expect("actor joined");
    }

    #[tokio::test]
    async fn single_retry_budget_survives_one_transient_failure() {
        let mut h = harness(FakeKube::settling(), FakeProxy::new());
        let defaults = fast_options();
        h.deps.options = Arc::new(EngineOptions {
            reconcile: ReconcileOptions {
                max_retries_before_fatal: 1,
                ..defaults.reconcile.clone()
            },
            ..defaults
        });
        h.store.insert_server(sql_server("4")).await;
        h.kube.fail_next(KubeError::Transport("blip".into()));
        let (tx, handle) = spawn(&h, "4", CancellationToken::new());

        let ready = wait_for_server(&h.store, "4", DatabaseServer::is_ready).await;
        assert_eq!(ready.phase, ServerPhase::Done);
        assert_eq!(h.kube.creates(), 4);

        tx.send(ServerMessage::Stop).await.expect("mailbox open");
        handle.await.expect("actor joined");
    }

    #[tokio::test]
    async fn database_change_during_backoff_is_not_lost() {
        let mut h = harness(FakeKube::settling(), FakeProxy::new());
        let defaults = fast_options();
        h.deps.options = Arc::new(EngineOptions {
            reconcile: ReconcileOptions {
                retry_backoff_min: Duration::from_millis(200),
                retry_backoff_max: Duration::from_millis(200),
                ..defaults.reconcile.clone()
            },
            ..defaults
        });
        h.store.insert_server(sql_server("4")).await;
        let mut errored = DatabaseInstance::new("d1", "4", "tenant", "orders")
            .with_credentials("orders_user", "pw");
        errored.status = ProvisioningStatus::Error;
        errored.last_error = Some("login failed".into());
        h.store.insert_database(errored).await;
        h.kube.fail_next(KubeError::Transport("blip".into()));
        let (tx, handle) = spawn(&h, "4", CancellationToken::new());

        wait_for_server(&h.store, "4", |server| server.last_error.is_some()).await;
        tx.send(ServerMessage::DatabaseChanged("d1".into()))
            .await
            .expect("mailbox open");

        let database = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let database = h.store.database("d1").await.expect("store").expect("db");
                if database.status == ProvisioningStatus::Ready {
                    return database;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("errored database retried once the server is ready");
        assert_eq!(database.action, ProvisioningAction::None);

        tx.send(ServerMessage::Stop).await.expect("mailbox open");
        handle.await.expect("actor joined");
    }

    #[tokio::test]
    async fn cancellation_commits_nothing() {
        let h = harness(FakeKube::settling(), FakeProxy::new());
        h.store.insert_server(sql_server("4")).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_tx, handle) = spawn(&h, "4", cancel);
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("actor exits")
            .expect("actor joined");
        assert_eq!(exit, ActorExit::Cancelled);
        let server = h.store.server("4").await.expect("store").expect("record");
        assert_eq!(server.status, ProvisioningStatus::Pending);
        assert_eq!(h.kube.creates(), 0);
        assert_eq!(h.scopes.open_scopes(), 0);
    }

    #[tokio::test]
    async fn ready_server_provisions_pending_databases() {
        let h = harness(FakeKube::settling(), FakeProxy::new());
        h.store.insert_server(sql_server("4")).await;
        h.store
            .insert_database(
                DatabaseInstance::new("d1", "4", "tenant", "orders")
                    .with_credentials("orders_user", "pw"),
            )
            .await;
        let mut events = h.deps.bus.subscribe();
        let (tx, handle) = spawn(&h, "4", CancellationToken::new());

        let database = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let database = h.store.database("d1").await.expect("store").expect("db");
                if database.status == ProvisioningStatus::Ready {
                    return database;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("database ready in time");
        assert_eq!(database.action, ProvisioningAction::None);
        // Memory configuration plus the create batch.
        assert_eq!(h.proxy.command_count(), 2);

        tx.send(ServerMessage::Stop).await.expect("mailbox open");
        handle.await.expect("actor joined");
        let mut saw_database_event = false;
        while let Ok(env) = events.try_recv() {
            saw_database_event |= env.kind == daas_topics::TOPIC_DATABASE_PROVISIONED;
        }
        assert!(saw_database_event);
    }

    #[tokio::test]
    async fn missing_record_exits_immediately() {
        let h = harness(FakeKube::new(), FakeProxy::new());
        let (_tx, handle) = spawn(&h, "404", CancellationToken::new());
        let exit = handle.await.expect("actor joined");
        assert_eq!(exit, ActorExit::Missing);
        assert_eq!(h.scopes.open_scopes(), 0);
        assert_eq!(h.kube.count(ResourceKind::Service), 0);
    }
}
