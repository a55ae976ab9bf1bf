//! In-memory stand-ins for the cluster, the proxy and the metrics endpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use daas_kube::{
    KubeApi, KubeError, KubeResource, Labels, LoadBalancerIngress, LoadBalancerStatus,
    ReplicationControllerStatus, ResourceKind, WatchEvent, WatchEventType, WatchStream,
};
use daas_protocol::{CommandResult, QueryData, QueryResult, ResultSet, ResultSetRow, SqlError, SqlRequest};
use serde_json::json;
use tokio::sync::broadcast;

use crate::management_sql::DATABASE_NAME_PARAMETER;
use crate::metrics::{MetricsError, MetricsSource};
use crate::proxy::{DatabaseProxy, ProxyError};

pub const FAKE_INGRESS_IP: &str = "10.20.30.40";

/// Cluster state keyed by kind and name. Created objects can settle
/// immediately (`settle_on_create`) or on demand via [`FakeKube::settle`].
pub struct FakeKube {
    objects: Mutex<BTreeMap<(ResourceKind, String), KubeResource>>,
    settle_on_create: AtomicBool,
    hold_deletes: AtomicBool,
    fail_next: Mutex<Option<KubeError>>,
    fail_always: Mutex<Option<KubeError>>,
    vanish_before_delete: Mutex<Option<ResourceKind>>,
    delete_calls: Mutex<BTreeMap<ResourceKind, usize>>,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    watches: AtomicUsize,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for FakeKube {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            settle_on_create: AtomicBool::new(false),
            hold_deletes: AtomicBool::new(false),
            fail_next: Mutex::new(None),
            fail_always: Mutex::new(None),
            vanish_before_delete: Mutex::new(None),
            delete_calls: Mutex::new(BTreeMap::new()),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            watches: AtomicUsize::new(0),
            events,
        }
    }
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every created object reports ready straight away.
    pub fn settling() -> Self {
        let kube = Self::default();
        kube.settle_on_create.store(true, Ordering::SeqCst);
        kube
    }

    /// Deletes only mark objects terminating until [`FakeKube::finish_deletes`].
    pub fn hold_deletes(&self, hold: bool) {
        self.hold_deletes.store(hold, Ordering::SeqCst);
    }

    pub fn fail_next(&self, err: KubeError) {
        *self.fail_next.lock().expect("fail lock") = Some(err);
    }

    /// Every create and delete fails with `err` until cleared with `None`.
    pub fn fail_always(&self, err: Option<KubeError>) {
        *self.fail_always.lock().expect("fail lock") = err;
    }

    /// The next delete of `kind` finds the object already removed by
    /// someone else and reports NotFound.
    pub fn vanish_before_delete(&self, kind: ResourceKind) {
        *self.vanish_before_delete.lock().expect("vanish lock") = Some(kind);
    }

    /// Delete calls issued per kind, including ones that failed.
    pub fn delete_calls(&self, kind: ResourceKind) -> usize {
        self.delete_calls
            .lock()
            .expect("calls lock")
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn watches(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.objects
            .lock()
            .expect("objects lock")
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().expect("objects lock").is_empty()
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<KubeResource> {
        self.objects
            .lock()
            .expect("objects lock")
            .get(&(kind, name.to_string()))
            .cloned()
    }

    pub fn insert(&self, resource: KubeResource) {
        let key = (resource.kind(), resource.name().to_string());
        self.objects.lock().expect("objects lock").insert(key, resource);
    }

    /// Marks one object ready and announces it on the watch feed.
    pub fn settle(&self, kind: ResourceKind, name: &str) {
        let settled = {
            let mut objects = self.objects.lock().expect("objects lock");
            objects.get_mut(&(kind, name.to_string())).map(|resource| {
                make_ready(resource);
                resource.clone()
            })
        };
        if let Some(resource) = settled {
            let _ = self.events.send(WatchEvent::new(WatchEventType::Modified, resource));
        }
    }

    /// Removes every terminating object.
    pub fn finish_deletes(&self) {
        self.objects
            .lock()
            .expect("objects lock")
            .retain(|_, resource| !resource.is_terminating());
    }

    fn take_failure(&self) -> Option<KubeError> {
        if let Some(err) = self.fail_always.lock().expect("fail lock").clone() {
            return Some(err);
        }
        self.fail_next.lock().expect("fail lock").take()
    }
}

fn make_ready(resource: &mut KubeResource) {
    match resource {
        KubeResource::ReplicationController(rc) => {
            rc.status = Some(ReplicationControllerStatus {
                replicas: 1,
                ready_replicas: Some(1),
                available_replicas: Some(1),
            });
        }
        KubeResource::Service(svc) => {
            svc.spec.cluster_ip = Some("10.96.0.12".to_string());
        }
        KubeResource::Ingress(ing) => {
            ing.status = Some(daas_kube::IngressStatus {
                load_balancer: LoadBalancerStatus {
                    ingress: vec![LoadBalancerIngress {
                        ip: Some(FAKE_INGRESS_IP.to_string()),
                        hostname: None,
                    }],
                },
            });
        }
        KubeResource::PersistentVolumeClaim(pvc) => {
            pvc.status = Some(daas_kube::PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
            });
        }
    }
}

fn labels_cover(labels: Option<&Labels>, selector: &Labels) -> bool {
    selector.iter().all(|(key, value)| {
        labels
            .and_then(|labels| labels.get(key))
            .map(|found| found == value)
            .unwrap_or(false)
    })
}

#[async_trait]
impl KubeApi for FakeKube {
    async fn find(
        &self,
        kind: ResourceKind,
        selector: &Labels,
    ) -> Result<Option<KubeResource>, KubeError> {
        Ok(self
            .objects
            .lock()
            .expect("objects lock")
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, resource)| resource)
            .find(|resource| labels_cover(resource.metadata().labels.as_ref(), selector))
            .cloned())
    }

    async fn create(&self, resource: &KubeResource) -> Result<KubeResource, KubeError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let key = (resource.kind(), resource.name().to_string());
        let mut created = resource.clone();
        {
            let mut objects = self.objects.lock().expect("objects lock");
            if objects.contains_key(&key) {
                return Err(KubeError::AlreadyExists {
                    kind: key.0,
                    name: key.1,
                });
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            if self.settle_on_create.load(Ordering::SeqCst) {
                make_ready(&mut created);
            }
            objects.insert(key, created.clone());
        }
        let _ = self
            .events
            .send(WatchEvent::new(WatchEventType::Added, created.clone()));
        Ok(created)
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), KubeError> {
        *self
            .delete_calls
            .lock()
            .expect("calls lock")
            .entry(kind)
            .or_insert(0) += 1;
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let removed = {
            let mut objects = self.objects.lock().expect("objects lock");
            let key = (kind, name.to_string());
            let vanish = {
                let mut pending = self.vanish_before_delete.lock().expect("vanish lock");
                if *pending == Some(kind) {
                    pending.take()
                } else {
                    None
                }
            };
            if vanish.is_some() {
                objects.remove(&key);
            }
            if !objects.contains_key(&key) {
                return Err(KubeError::NotFound {
                    kind,
                    name: name.to_string(),
                });
            }
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.hold_deletes.load(Ordering::SeqCst) {
                let resource = objects.get_mut(&key).expect("present");
                resource.metadata_mut().deletion_timestamp =
                    Some("2026-01-01T00:00:00Z".to_string());
                resource.clone()
            } else {
                objects.remove(&key).expect("present")
            }
        };
        let _ = self
            .events
            .send(WatchEvent::new(WatchEventType::Deleted, removed));
        Ok(())
    }

    async fn watch(
        &self,
        _kinds: &[ResourceKind],
        _label_selector: &str,
    ) -> Result<WatchStream, KubeError> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        let rx = self.events.subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Records every request; databases listed in `existing` are reported present.
#[derive(Default)]
pub struct FakeProxy {
    pub commands: Mutex<Vec<SqlRequest>>,
    pub queries: Mutex<Vec<SqlRequest>>,
    pub initialized: Mutex<Vec<String>>,
    existing: Mutex<BTreeSet<String>>,
    command_errors: Mutex<Vec<SqlError>>,
    fail_next: Mutex<Option<ProxyError>>,
}

impl FakeProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing(self, name: &str) -> Self {
        self.existing.lock().expect("existing lock").insert(name.to_string());
        self
    }

    pub fn fail_commands_with(&self, errors: Vec<SqlError>) {
        *self.command_errors.lock().expect("errors lock") = errors;
    }

    pub fn fail_next(&self, err: ProxyError) {
        *self.fail_next.lock().expect("fail lock") = Some(err);
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().expect("commands lock").len()
    }

    pub fn initialize_count(&self) -> usize {
        self.initialized.lock().expect("init lock").len()
    }

    fn take_failure(&self) -> Option<ProxyError> {
        self.fail_next.lock().expect("fail lock").take()
    }
}

#[async_trait]
impl DatabaseProxy for FakeProxy {
    async fn execute_command(&self, request: SqlRequest) -> Result<CommandResult, ProxyError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.commands.lock().expect("commands lock").push(request);
        Ok(CommandResult {
            result_code: 0,
            messages: vec!["Commands completed successfully.".to_string()],
            errors: self.command_errors.lock().expect("errors lock").clone(),
        })
    }

    async fn execute_query(&self, request: SqlRequest) -> Result<QueryResult, ProxyError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let name = request
            .parameters
            .iter()
            .find(|parameter| parameter.name == DATABASE_NAME_PARAMETER)
            .and_then(|parameter| parameter.value.as_ref())
            .and_then(|value| value.as_str())
            .map(str::to_string);
        self.queries.lock().expect("queries lock").push(request);
        let rows = match name {
            Some(name) if self.existing.lock().expect("existing lock").contains(&name) => {
                vec![ResultSetRow {
                    columns: BTreeMap::from([("name".to_string(), json!(name))]),
                }]
            }
            _ => Vec::new(),
        };
        Ok(QueryResult {
            result_sets: vec![ResultSet { rows }],
            ..QueryResult::default()
        })
    }

    async fn initialize_server_configuration(&self, server_id: &str) -> Result<(), ProxyError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.initialized
            .lock()
            .expect("init lock")
            .push(server_id.to_string());
        Ok(())
    }
}

/// Answers every query with the same vector; counts calls.
pub struct FakeMetrics {
    pub data: QueryData,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeMetrics {
    pub fn new(data: QueryData) -> Self {
        Self {
            data,
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn query(&self, _query: &str) -> Result<QueryData, MetricsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(MetricsError::Transport("metrics endpoint down".into()));
        }
        Ok(self.data.clone())
    }
}
