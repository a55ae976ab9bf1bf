//! Keeps exactly one reconciliation actor per server id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use daas_runtime::{DatabaseServer, ProvisioningAction, ServerId};
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server_manager::{run_server_manager, ActorExit, ServerManagerDeps, ServerMessage};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error("server `{0}` is not known to the store")]
    UnknownServer(String),
    #[error("mailbox of server `{0}` is closed")]
    MailboxClosed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct ActiveServer {
    generation: Uuid,
    sender: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    last_action: ProvisioningAction,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub started: usize,
    pub notified: usize,
    pub stopped: usize,
}

pub struct ServerSupervisor {
    deps: ServerManagerDeps,
    active: RwLock<HashMap<ServerId, ActiveServer>>,
    shutting_down: AtomicBool,
}

/// A server gets an actor while it has work pending or serves databases.
/// Halted servers wait for an explicit notification.
fn needs_actor(server: &DatabaseServer) -> bool {
    if server.is_halted() {
        return false;
    }
    server.action.is_pending() || server.is_ready()
}

impl ServerSupervisor {
    pub fn new(deps: ServerManagerDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            active: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn deps(&self) -> &ServerManagerDeps {
        &self.deps
    }

    /// Starts an actor for `server_id` unless a live one exists. Returns
    /// whether a new actor was spawned.
    pub async fn ensure_server(self: &Arc<Self>, server_id: &str) -> Result<bool, SupervisorError> {
        self.ensure_with_action(server_id, None).await
    }

    async fn ensure_with_action(
        self: &Arc<Self>,
        server_id: &str,
        observed: Option<ProvisioningAction>,
    ) -> Result<bool, SupervisorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }
        let mut active = self.active.write().await;
        if let Some(existing) = active.get(server_id) {
            if !existing.task.is_finished() {
                return Ok(false);
            }
        }
        if let Some(stale) = active.remove(server_id) {
            stale.cancel.cancel();
            stale.task.abort();
        }
        let entry = self.spawn_actor(server_id, observed.unwrap_or_default());
        info!(
            target: "daas::supervisor",
            server = %server_id,
            generation = %entry.generation,
            "server actor started"
        );
        active.insert(server_id.to_string(), entry);
        Ok(true)
    }

    fn spawn_actor(self: &Arc<Self>, server_id: &str, last_action: ProvisioningAction) -> ActiveServer {
        let generation = Uuid::new_v4();
        let capacity = self.deps.options.reconcile.mailbox_capacity.max(1);
        let (sender, mailbox) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let supervisor: Weak<Self> = Arc::downgrade(self);
        let task = {
            let deps = self.deps.clone();
            let sender = sender.clone();
            let cancel = cancel.clone();
            let server_id = server_id.to_string();
            tokio::spawn(async move {
                let exit =
                    run_server_manager(server_id.clone(), generation, deps, sender, mailbox, cancel)
                        .await;
                if let Some(supervisor) = supervisor.upgrade() {
                    supervisor.retire(&server_id, generation, &exit).await;
                }
            })
        };
        ActiveServer {
            generation,
            sender,
            cancel,
            task,
            last_action,
        }
    }

    /// Drops the map entry of a finished actor, but only if it still belongs
    /// to that actor's generation.
    async fn retire(&self, server_id: &str, generation: Uuid, exit: &ActorExit) {
        let removed = {
            let mut active = self.active.write().await;
            match active.get(server_id) {
                Some(entry) if entry.generation == generation => active.remove(server_id).is_some(),
                _ => false,
            }
        };
        if let ActorExit::Failed(reason) = exit {
            warn!(
                target: "daas::supervisor",
                server = %server_id,
                generation = %generation,
                reason = %reason,
                "server actor failed"
            );
        }
        debug!(
            target: "daas::supervisor",
            server = %server_id,
            generation = %generation,
            exit = exit.as_str(),
            removed,
            "server actor retired"
        );
    }

    async fn sender_for(&self, server_id: &str) -> Option<mpsc::Sender<ServerMessage>> {
        self.active
            .read()
            .await
            .get(server_id)
            .map(|entry| entry.sender.clone())
    }

    async fn deliver(
        self: &Arc<Self>,
        server_id: &str,
        message: ServerMessage,
    ) -> Result<(), SupervisorError> {
        if self.deps.store.server(server_id).await?.is_none() {
            return Err(SupervisorError::UnknownServer(server_id.to_string()));
        }
        self.ensure_server(server_id).await?;
        let sender = self
            .sender_for(server_id)
            .await
            .ok_or_else(|| SupervisorError::MailboxClosed(server_id.to_string()))?;
        sender
            .send(message)
            .await
            .map_err(|_| SupervisorError::MailboxClosed(server_id.to_string()))
    }

    /// Tells the server's actor (starting one if needed) that the desired
    /// action changed. This is also how a halted server is resumed.
    pub async fn notify_action_changed(self: &Arc<Self>, server_id: &str) -> Result<(), SupervisorError> {
        self.deliver(server_id, ServerMessage::ActionChanged).await?;
        if let Some(server) = self.deps.store.server(server_id).await? {
            if let Some(entry) = self.active.write().await.get_mut(server_id) {
                entry.last_action = server.action;
            }
        }
        Ok(())
    }

    pub async fn notify_database_changed(
        self: &Arc<Self>,
        server_id: &str,
        database_id: &str,
    ) -> Result<(), SupervisorError> {
        self.deliver(server_id, ServerMessage::DatabaseChanged(database_id.to_string()))
            .await
    }

    /// Stops the actor for `server_id`; returns whether one was running.
    pub async fn stop_server(&self, server_id: &str) -> bool {
        let entry = self.active.write().await.remove(server_id);
        let Some(entry) = entry else {
            return false;
        };
        entry.cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(5), entry.task).await.is_err() {
            warn!(target: "daas::supervisor", server = %server_id, "server actor did not stop in time");
        }
        info!(target: "daas::supervisor", server = %server_id, "server actor stopped");
        true
    }

    pub async fn active_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reconciles the actor set with the store: starts actors for servers
    /// that need one, notifies actors whose action changed since last seen
    /// and stops actors whose record disappeared.
    pub async fn sync_from_store(self: &Arc<Self>) -> Result<SyncReport, SupervisorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }
        let servers = self.deps.store.servers().await?;
        let mut report = SyncReport::default();
        let known: HashSet<&str> = servers.iter().map(|server| server.id.as_str()).collect();

        let vanished: Vec<ServerId> = self
            .active
            .read()
            .await
            .keys()
            .filter(|id| !known.contains(id.as_str()))
            .cloned()
            .collect();
        for id in vanished {
            if self.stop_server(&id).await {
                report.stopped += 1;
            }
        }

        for server in &servers {
            let seen = {
                let active = self.active.read().await;
                active
                    .get(&server.id)
                    .filter(|entry| !entry.task.is_finished())
                    .map(|entry| (entry.last_action, entry.sender.clone()))
            };
            match seen {
                Some((last_action, sender)) if last_action != server.action => {
                    if sender.send(ServerMessage::ActionChanged).await.is_ok() {
                        report.notified += 1;
                    }
                    if let Some(entry) = self.active.write().await.get_mut(&server.id) {
                        entry.last_action = server.action;
                    }
                }
                Some(_) => {}
                None if needs_actor(server) => {
                    if self.ensure_with_action(&server.id, Some(server.action)).await? {
                        report.started += 1;
                    }
                }
                None => {}
            }
        }

        if report != SyncReport::default() {
            self.deps.bus.publish(
                daas_topics::TOPIC_SUPERVISOR_SYNCED,
                &json!({
                    "started": report.started,
                    "notified": report.notified,
                    "stopped": report.stopped,
                    "active": self.active.read().await.len(),
                }),
            );
        }
        Ok(report)
    }

    /// Cancels every actor and waits up to `grace` for each to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let entries: Vec<(ServerId, ActiveServer)> = self.active.write().await.drain().collect();
        for (_, entry) in &entries {
            entry.cancel.cancel();
        }
        let count = entries.len();
        for (id, entry) in entries {
            let mut task = entry.task;
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
                warn!(target: "daas::supervisor", server = %id, "server actor aborted after grace period");
            }
        }
        info!(target: "daas::supervisor", actors = count, "supervisor stopped");
    }
}
