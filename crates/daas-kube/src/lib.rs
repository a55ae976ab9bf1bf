//! Kubernetes object model, watch routing and the client seam.

pub mod bus;
pub mod client;
pub mod filter;
pub mod meta;
pub mod resources;

pub use bus::{forward_watch, BusStats, ResourceEventBus};
pub use client::{KubeApi, KubeApiExt, KubeError, WatchEvent, WatchEventType, WatchStream};
pub use filter::ResourceEventFilter;
pub use meta::{validate_name, Labels, ObjectMeta};
pub use resources::{
    Ingress, IngressBackend, IngressRule, IngressSpec, IngressStatus, KubeResource,
    LoadBalancerIngress, LoadBalancerStatus, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, ReplicationController, ReplicationControllerSpec,
    ReplicationControllerStatus, ResourceKind, ResourceRequirements, Service, ServicePort,
    ServiceSpec, TcpIngressRule, VOYAGER_API_VERSION,
};
