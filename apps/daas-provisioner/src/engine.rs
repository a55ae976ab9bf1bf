//! Wires the supervisor to its background loops.

use std::sync::Arc;
use std::time::Duration;

use daas_events::Bus;
use daas_kube::{forward_watch, KubeApi, ResourceEventBus, ResourceKind, WatchEvent};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kube_resources::LABEL_SERVER_ID;
use crate::metrics::{MetricsSource, StatsCollector, StatsRegistry};
use crate::options::EngineOptions;
use crate::proxy::DatabaseProxy;
use crate::scope::SharedScopeFactory;
use crate::server_manager::{ServerManagerDeps, ServerMessage};
use crate::store::ServerStore;
use crate::supervisor::ServerSupervisor;
use crate::tasks::{spawn_supervised, TaskManager, TaskShutdownReport};

const WATCH_BACKOFF_MIN: Duration = Duration::from_millis(200);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(10);
const WATCH_FEED_CAPACITY: usize = 256;

/// Every kind the engine creates; the watch covers all of them.
pub const WATCHED_KINDS: [ResourceKind; 4] = [
    ResourceKind::PersistentVolumeClaim,
    ResourceKind::ReplicationController,
    ResourceKind::Service,
    ResourceKind::Ingress,
];

pub struct EngineDeps {
    pub store: Arc<dyn ServerStore>,
    pub kube: Arc<dyn KubeApi>,
    pub proxy: Arc<dyn DatabaseProxy>,
    /// Stats collection is skipped without one.
    pub metrics: Option<Arc<dyn MetricsSource>>,
    pub bus: Bus,
}

pub struct ProvisioningEngine {
    supervisor: Arc<ServerSupervisor>,
    watch: Arc<ResourceEventBus<ServerMessage>>,
    stats: Arc<StatsRegistry>,
    cancel: CancellationToken,
}

impl ProvisioningEngine {
    pub fn start(deps: EngineDeps, options: EngineOptions) -> (Arc<Self>, TaskManager) {
        let options = Arc::new(options);
        let cancel = CancellationToken::new();
        let watch = Arc::new(ResourceEventBus::new());
        let scopes = Arc::new(SharedScopeFactory::new(deps.kube.clone(), deps.proxy.clone()));
        let supervisor = ServerSupervisor::new(ServerManagerDeps {
            store: deps.store.clone(),
            scopes,
            watch: watch.clone(),
            bus: deps.bus.clone(),
            options: options.clone(),
        });
        let stats = Arc::new(StatsRegistry::new());
        let (feed, _) = broadcast::channel::<Arc<WatchEvent>>(WATCH_FEED_CAPACITY);

        let mut tasks = TaskManager::new();
        tasks.push(spawn_supervised("watch-dispatcher", {
            let watch = watch.clone();
            let feed = feed.clone();
            let cancel = cancel.clone();
            move || {
                let watch = watch.clone();
                let receiver = feed.subscribe();
                let cancel = cancel.clone();
                async move { watch.run(receiver, cancel).await }
            }
        }));
        tasks.push(spawn_supervised("watch-pump", {
            let kube = deps.kube.clone();
            let bus = deps.bus.clone();
            let feed = feed.clone();
            let cancel = cancel.clone();
            move || {
                let kube = kube.clone();
                let bus = bus.clone();
                let feed = feed.clone();
                let cancel = cancel.clone();
                async move { run_watch_pump(kube, feed, bus, cancel).await }
            }
        }));
        tasks.push(spawn_supervised("action-poller", {
            let supervisor = supervisor.clone();
            let interval = options.reconcile.interval;
            let cancel = cancel.clone();
            move || {
                let supervisor = supervisor.clone();
                let cancel = cancel.clone();
                async move { run_action_poller(supervisor, interval, cancel).await }
            }
        }));
        if let Some(source) = deps.metrics {
            let collector = Arc::new(StatsCollector::new(
                deps.store.clone(),
                source,
                stats.clone(),
                deps.bus.clone(),
                options.stats.queries.clone(),
            ));
            let interval = options.stats.poll_interval;
            tasks.push(spawn_supervised("stats-collector", {
                let cancel = cancel.clone();
                move || {
                    let collector = collector.clone();
                    let cancel = cancel.clone();
                    async move { collector.run(interval, cancel).await }
                }
            }));
        }
        info!(
            target: "daas::supervisor",
            tasks = ?tasks.names(),
            namespace = %options.kube.namespace,
            "provisioning engine started"
        );

        let engine = Arc::new(Self {
            supervisor,
            watch,
            stats,
            cancel,
        });
        (engine, tasks)
    }

    pub fn supervisor(&self) -> &Arc<ServerSupervisor> {
        &self.supervisor
    }

    pub fn watch(&self) -> &Arc<ResourceEventBus<ServerMessage>> {
        &self.watch
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    /// Stops the background loops and every actor, allowing each up to
    /// `grace` to finish on its own.
    pub async fn shutdown(&self, tasks: TaskManager, grace: Duration) -> TaskShutdownReport {
        self.cancel.cancel();
        self.supervisor.shutdown(grace).await;
        let report = tasks.shutdown_with_grace(grace).await;
        info!(
            target: "daas::supervisor",
            completed = report.completed,
            aborted = report.aborted,
            "provisioning engine stopped"
        );
        report
    }
}

/// Keeps one cluster watch open and forwards it into `feed`. A closed or
/// failed watch is reopened after a backoff that resets once events flow.
async fn run_watch_pump(
    kube: Arc<dyn KubeApi>,
    feed: broadcast::Sender<Arc<WatchEvent>>,
    bus: Bus,
    cancel: CancellationToken,
) {
    let mut backoff = WATCH_BACKOFF_MIN;
    let mut restarts: u64 = 0;
    while !cancel.is_cancelled() {
        let result = match kube.watch(&WATCHED_KINDS, LABEL_SERVER_ID).await {
            Ok(stream) => forward_watch(stream, &feed, &cancel).await,
            Err(err) => Err(err),
        };
        if cancel.is_cancelled() {
            break;
        }
        match result {
            Ok(forwarded) => {
                if forwarded > 0 {
                    backoff = WATCH_BACKOFF_MIN;
                }
                debug!(target: "daas::watch", forwarded, "watch stream closed");
            }
            Err(err) => {
                warn!(
                    target: "daas::watch",
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "watch failed; reopening"
                );
            }
        }
        restarts += 1;
        bus.publish(
            daas_topics::TOPIC_WATCH_RESTARTED,
            &json!({ "restarts": restarts, "backoff_ms": backoff.as_millis() as u64 }),
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = backoff.saturating_mul(2).min(WATCH_BACKOFF_MAX);
    }
}

async fn run_action_poller(
    supervisor: Arc<ServerSupervisor>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match supervisor.sync_from_store().await {
                    Ok(report) => {
                        if report.started + report.notified + report.stopped > 0 {
                            debug!(
                                target: "daas::supervisor",
                                started = report.started,
                                notified = report.notified,
                                stopped = report.stopped,
                                "store sync"
                            );
                        }
                    }
                    Err(err) => {
                        warn!(target: "daas::supervisor", error = %err, "store sync failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ReconcileOptions;
    use crate::store::MemoryStore;
    use crate::test_support::{FakeKube, FakeMetrics, FakeProxy};
    use chrono::Utc;
    use daas_protocol::{InstantSample, PrometheusValue, QueryData};
    use daas_runtime::{DatabaseServer, DatabaseServerKind, ProvisioningStatus};
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    fn fast_options() -> EngineOptions {
        let mut options = EngineOptions {
            reconcile: ReconcileOptions {
                interval: Duration::from_millis(10),
                retry_backoff_min: Duration::from_millis(1),
                retry_backoff_max: Duration::from_millis(5),
                max_retries_before_fatal: 3,
                phase_timeout: Duration::from_secs(60),
                mailbox_capacity: 16,
            },
            ..EngineOptions::default()
        };
        options.stats.poll_interval = Duration::from_millis(10);
        options
    }

    async fn wait_for_status(store: &MemoryStore, id: &str, status: ProvisioningStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = store.server(id).await.expect("store").map(|s| s.status);
                if current == Some(status) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status reached in time");
    }

    #[tokio::test]
    async fn engine_provisions_servers_found_in_the_store() {
        let store = Arc::new(MemoryStore::new());
        let kube = Arc::new(FakeKube::settling());
        let metrics = Arc::new(FakeMetrics::new(QueryData::Vector(vec![InstantSample {
            metric: BTreeMap::new(),
            value: PrometheusValue::new(Utc::now(), Some("1".to_string())),
        }])));
        store
            .insert_server(
                DatabaseServer::new("7", "tenant", "orders", DatabaseServerKind::SqlServer)
                    .with_admin_password("secret"),
            )
            .await;
        let (engine, tasks) = ProvisioningEngine::start(
            EngineDeps {
                store: store.clone(),
                kube: kube.clone(),
                proxy: Arc::new(FakeProxy::new()),
                metrics: Some(metrics.clone()),
                bus: Bus::new(64),
            },
            fast_options(),
        );
        assert_eq!(
            tasks.names(),
            vec!["watch-dispatcher", "watch-pump", "action-poller", "stats-collector"]
        );

        wait_for_status(&store, "7", ProvisioningStatus::Ready).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.stats().get("7").await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stats collected in time");
        assert!(kube.watches() >= 1);
        assert!(metrics.calls.load(Ordering::SeqCst) > 0);
        assert_eq!(engine.supervisor().active_ids().await, vec!["7".to_string()]);

        let report = engine.shutdown(tasks, Duration::from_secs(1)).await;
        assert_eq!(report.aborted, 0);
        assert!(engine.supervisor().active_ids().await.is_empty());
        assert_eq!(engine.watch().stats().await.routes, 0);
    }

    #[tokio::test]
    async fn watch_events_reach_the_owning_actor() {
        let store = Arc::new(MemoryStore::new());
        // Unsettled objects leave the claim pending; settling it produces a
        // MODIFIED event for the actor.
        let kube = Arc::new(FakeKube::new());
        let (engine, tasks) = ProvisioningEngine::start(
            EngineDeps {
                store: store.clone(),
                kube: kube.clone(),
                proxy: Arc::new(FakeProxy::new()),
                metrics: None,
                bus: Bus::new(64),
            },
            fast_options(),
        );
        assert_eq!(tasks.len(), 3);
        tokio::time::timeout(Duration::from_secs(5), async {
            while kube.watches() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watch opened in time");

        store
            .insert_server(
                DatabaseServer::new("8", "tenant", "orders", DatabaseServerKind::SqlServer)
                    .with_admin_password("secret"),
            )
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while kube.count(ResourceKind::PersistentVolumeClaim) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("claim created in time");
        kube.settle(
            ResourceKind::PersistentVolumeClaim,
            &crate::kube_resources::data_volume_claim_name("8"),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.watch().stats().await.delivered == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events routed in time");
        assert_eq!(engine.watch().stats().await.routes, 1);

        engine.shutdown(tasks, Duration::from_secs(1)).await;
    }
}
