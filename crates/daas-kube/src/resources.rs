//! Typed shapes for the four object kinds a database server is made of.
//!
//! Only the fields the provisioner sets or inspects are modelled; the pod
//! template stays free-form JSON because nothing reads it back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::meta::ObjectMeta;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    ReplicationController,
    Service,
    Ingress,
    PersistentVolumeClaim,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::ReplicationController,
        ResourceKind::Service,
        ResourceKind::Ingress,
        ResourceKind::PersistentVolumeClaim,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ReplicationController => "ReplicationController",
            ResourceKind::Service => "Service",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::Ingress => VOYAGER_API_VERSION,
            _ => "v1",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const VOYAGER_API_VERSION: &str = "voyager.appscode.com/v1beta1";

fn core_api_version() -> String {
    "v1".to_string()
}

fn voyager_api_version() -> String {
    VOYAGER_API_VERSION.to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationController {
    #[serde(default = "core_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ReplicationControllerSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReplicationControllerStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationControllerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub template: Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationControllerStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
}

impl ReplicationController {
    /// Every desired replica reports available.
    pub fn is_ready(&self) -> bool {
        let desired = self.spec.replicas.unwrap_or(1);
        let available = self
            .status
            .as_ref()
            .and_then(|status| status.available_replicas)
            .unwrap_or(0);
        available >= desired
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default = "core_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "clusterIP", default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

impl Service {
    /// The cluster has allocated an address (headless services never are).
    pub fn is_ready(&self) -> bool {
        self.spec
            .cluster_ip
            .as_deref()
            .is_some_and(|ip| !ip.is_empty() && ip != "None")
    }
}

/// A Voyager ingress that forwards one TCP host port to a service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    #[serde(default = "voyager_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: IngressSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<IngressStatus>,
}

impl Default for Ingress {
    fn default() -> Self {
        Self {
            api_version: voyager_api_version(),
            metadata: ObjectMeta::default(),
            spec: IngressSpec::default(),
            status: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    #[serde(default)]
    pub rules: Vec<IngressRule>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpIngressRule>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TcpIngressRule {
    pub port: String,
    pub backend: IngressBackend,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressBackend {
    pub service_name: String,
    pub service_port: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressStatus {
    #[serde(default)]
    pub load_balancer: LoadBalancerStatus,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub ingress: Vec<LoadBalancerIngress>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerIngress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Ingress {
    /// First address the load balancer published, IP preferred over hostname.
    pub fn external_address(&self) -> Option<&str> {
        let entries = &self.status.as_ref()?.load_balancer.ingress;
        entries
            .iter()
            .find_map(|entry| entry.ip.as_deref().filter(|ip| !ip.is_empty()))
            .or_else(|| {
                entries
                    .iter()
                    .find_map(|entry| entry.hostname.as_deref().filter(|h| !h.is_empty()))
            })
    }

    /// Host port of the first TCP rule.
    pub fn host_port(&self) -> Option<u16> {
        self.spec
            .rules
            .iter()
            .find_map(|rule| rule.tcp.as_ref())
            .and_then(|tcp| tcp.port.trim().parse().ok())
    }

    pub fn is_ready(&self) -> bool {
        self.external_address().is_some()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaim {
    #[serde(default = "core_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PersistentVolumeClaimStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSpec {
    #[serde(default)]
    pub access_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistentVolumeClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl PersistentVolumeClaim {
    /// Pending claims are fine; the controller's pod binds them on schedule.
    pub fn is_usable(&self) -> bool {
        !matches!(
            self.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Lost")
        )
    }
}

/// Any object the provisioner manages, tagged by `kind` as on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum KubeResource {
    ReplicationController(ReplicationController),
    Service(Service),
    Ingress(Ingress),
    PersistentVolumeClaim(PersistentVolumeClaim),
}

impl KubeResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            KubeResource::ReplicationController(_) => ResourceKind::ReplicationController,
            KubeResource::Service(_) => ResourceKind::Service,
            KubeResource::Ingress(_) => ResourceKind::Ingress,
            KubeResource::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            KubeResource::ReplicationController(rc) => &rc.metadata,
            KubeResource::Service(svc) => &svc.metadata,
            KubeResource::Ingress(ing) => &ing.metadata,
            KubeResource::PersistentVolumeClaim(pvc) => &pvc.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            KubeResource::ReplicationController(rc) => &mut rc.metadata,
            KubeResource::Service(svc) => &mut svc.metadata,
            KubeResource::Ingress(ing) => &mut ing.metadata,
            KubeResource::PersistentVolumeClaim(pvc) => &mut pvc.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name_or_empty()
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata().is_terminating()
    }

    /// Whether the object has settled enough for the next phase to start.
    pub fn is_ready(&self) -> bool {
        if self.is_terminating() {
            return false;
        }
        match self {
            KubeResource::ReplicationController(rc) => rc.is_ready(),
            KubeResource::Service(svc) => svc.is_ready(),
            KubeResource::Ingress(ing) => ing.is_ready(),
            KubeResource::PersistentVolumeClaim(pvc) => pvc.is_usable(),
        }
    }

    pub fn as_service(&self) -> Option<&Service> {
        match self {
            KubeResource::Service(svc) => Some(svc),
            _ => None,
        }
    }

    pub fn as_ingress(&self) -> Option<&Ingress> {
        match self {
            KubeResource::Ingress(ing) => Some(ing),
            _ => None,
        }
    }
}

impl From<ReplicationController> for KubeResource {
    fn from(value: ReplicationController) -> Self {
        KubeResource::ReplicationController(value)
    }
}

impl From<Service> for KubeResource {
    fn from(value: Service) -> Self {
        KubeResource::Service(value)
    }
}

impl From<Ingress> for KubeResource {
    fn from(value: Ingress) -> Self {
        KubeResource::Ingress(value)
    }
}

impl From<PersistentVolumeClaim> for KubeResource {
    fn from(value: PersistentVolumeClaim) -> Self {
        KubeResource::PersistentVolumeClaim(value)
    }
}
