//! Names, labels and object shapes for the Kubernetes side of a server.

use std::collections::BTreeMap;

use daas_kube::{
    validate_name, Ingress, IngressBackend, IngressRule, IngressSpec, KubeError, KubeResource,
    Labels, ObjectMeta, PersistentVolumeClaim, PersistentVolumeClaimSpec, ReplicationController,
    ReplicationControllerSpec, ResourceKind, ResourceRequirements, Service, ServicePort,
    ServiceSpec, TcpIngressRule,
};
use daas_runtime::{DatabaseServer, DatabaseServerKind, ProvisioningError};
use serde_json::json;

use crate::options::KubeOptions;

pub const LABEL_APP: &str = "k8s-app";
pub const LABEL_SERVER_ID: &str = "cloud.dimensiondata.daas.server-id";
pub const LABEL_SERVICE_TYPE: &str = "cloud.dimensiondata.daas.service-type";
pub const SERVICE_TYPE_INTERNAL: &str = "internal";

pub const ANNOTATION_INGRESS_TYPE: &str = "ingress.appscode.com/type";
pub const ANNOTATION_INGRESS_CLASS: &str = "kubernetes.io/ingress.class";

pub const SQL_SERVER_PORT: u16 = 1433;
pub const RAVENDB_PORT: u16 = 8080;

const DATA_VOLUME: &str = "sql-data";
const TERMINATION_GRACE_SECS: u32 = 60;

pub fn base_name(server_id: &str) -> String {
    format!("sql-server-{server_id}")
}

pub fn data_volume_claim_name(server_id: &str) -> String {
    format!("{}-data", base_name(server_id))
}

pub fn controller_name(server_id: &str) -> String {
    base_name(server_id)
}

pub fn service_name(server_id: &str) -> String {
    format!("{}-service", base_name(server_id))
}

pub fn ingress_name(server_id: &str) -> String {
    format!("{}-ingress", base_name(server_id))
}

/// The label set every object of a server carries; also the lookup selector.
pub fn server_labels(server_id: &str) -> Labels {
    Labels::from([
        (LABEL_APP.to_string(), base_name(server_id)),
        (LABEL_SERVER_ID.to_string(), server_id.to_string()),
    ])
}

/// Metadata of the server's controller; the actor's watch filter is built from it.
pub fn server_metadata(server_id: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta::named(controller_name(server_id))
        .with_namespace(namespace)
        .with_labels(server_labels(server_id))
}

pub fn container_port(kind: DatabaseServerKind) -> u16 {
    match kind {
        DatabaseServerKind::SqlServer => SQL_SERVER_PORT,
        DatabaseServerKind::RavenDb => RAVENDB_PORT,
    }
}

/// `base` plus a per-server offset that never changes for a given id.
///
/// Numeric ids map to `base + id`; anything else is hashed (FNV-1a). Either
/// way the offset wraps so the port stays below 65536.
pub fn ingress_host_port(server_id: &str, base: u16) -> u16 {
    let span = u64::from(u16::MAX - base).max(1);
    let raw = server_id
        .trim()
        .parse::<u64>()
        .unwrap_or_else(|_| fnv1a(server_id.as_bytes()));
    let offset = raw % span;
    // offset < span <= u16::MAX - base, so the sum fits.
    base.saturating_add(offset as u16)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Builds the objects for one server. Every builder validates the name it
/// produces; an id that cannot form a valid object name is fatal.
pub struct ResourceFactory<'a> {
    options: &'a KubeOptions,
}

impl<'a> ResourceFactory<'a> {
    pub fn new(options: &'a KubeOptions) -> Self {
        Self { options }
    }

    fn metadata(&self, name: String, labels: Labels) -> Result<ObjectMeta, ProvisioningError> {
        validate_name(&name).map_err(kube_failure)?;
        Ok(ObjectMeta::named(name)
            .with_namespace(self.options.namespace.clone())
            .with_labels(labels))
    }

    pub fn data_volume_claim(
        &self,
        server: &DatabaseServer,
    ) -> Result<KubeResource, ProvisioningError> {
        let storage_mb = server.storage_mb.unwrap_or(self.options.data_volume_mb);
        let claim = PersistentVolumeClaim {
            api_version: ResourceKind::PersistentVolumeClaim.api_version().to_string(),
            metadata: self.metadata(data_volume_claim_name(&server.id), server_labels(&server.id))?,
            spec: PersistentVolumeClaimSpec {
                access_modes: vec!["ReadWriteOnce".to_string()],
                storage_class_name: self.options.storage_class.clone(),
                resources: ResourceRequirements {
                    requests: BTreeMap::from([("storage".to_string(), format!("{storage_mb}Mi"))]),
                },
            },
            status: None,
        };
        Ok(claim.into())
    }

    pub fn replication_controller(
        &self,
        server: &DatabaseServer,
    ) -> Result<KubeResource, ProvisioningError> {
        let base = base_name(&server.id);
        let labels = server_labels(&server.id);
        let port = container_port(server.kind);
        let container = match server.kind {
            DatabaseServerKind::SqlServer => json!({
                "name": base,
                "image": self.options.sql_server_image,
                "env": [
                    {"name": "ACCEPT_EULA", "value": "Y"},
                    {"name": "SA_PASSWORD", "value": server.admin_password},
                ],
                "ports": [{"containerPort": port}],
                "volumeMounts": [
                    {"name": DATA_VOLUME, "subPath": base, "mountPath": "/var/opt/mssql"}
                ],
            }),
            DatabaseServerKind::RavenDb => json!({
                "name": base,
                "image": self.options.ravendb_image,
                "env": [
                    {"name": "UNSECURED_ACCESS_ALLOWED", "value": "PublicNetwork"},
                    {"name": "PUBLIC_SERVER_URL", "value": format!("http://{}:{port}", service_name(&server.id))},
                ],
                "ports": [{"containerPort": port}],
                "volumeMounts": [
                    {"name": DATA_VOLUME, "subPath": base, "mountPath": "/opt/RavenDB/Server/RavenData"}
                ],
            }),
        };
        let template = json!({
            "metadata": {"labels": labels},
            "spec": {
                "terminationGracePeriodSeconds": TERMINATION_GRACE_SECS,
                "containers": [container],
                "volumes": [{
                    "name": DATA_VOLUME,
                    "persistentVolumeClaim": {"claimName": data_volume_claim_name(&server.id)}
                }],
            },
        });
        let controller = ReplicationController {
            api_version: ResourceKind::ReplicationController.api_version().to_string(),
            metadata: self.metadata(controller_name(&server.id), labels)?,
            spec: ReplicationControllerSpec {
                replicas: Some(1),
                selector: BTreeMap::from([(LABEL_APP.to_string(), base)]),
                template,
            },
            status: None,
        };
        Ok(controller.into())
    }

    pub fn internal_service(
        &self,
        server: &DatabaseServer,
    ) -> Result<KubeResource, ProvisioningError> {
        let mut labels = server_labels(&server.id);
        labels.insert(
            LABEL_SERVICE_TYPE.to_string(),
            SERVICE_TYPE_INTERNAL.to_string(),
        );
        let port = i32::from(container_port(server.kind));
        let port_name = match server.kind {
            DatabaseServerKind::SqlServer => "sql-server",
            DatabaseServerKind::RavenDb => "ravendb",
        };
        let service = Service {
            api_version: ResourceKind::Service.api_version().to_string(),
            metadata: self.metadata(service_name(&server.id), labels)?,
            spec: ServiceSpec {
                cluster_ip: None,
                service_type: Some("ClusterIP".to_string()),
                ports: vec![ServicePort {
                    name: Some(port_name.to_string()),
                    port,
                    target_port: Some(port),
                    protocol: Some("TCP".to_string()),
                    node_port: None,
                }],
                selector: BTreeMap::from([(LABEL_APP.to_string(), base_name(&server.id))]),
            },
        };
        Ok(service.into())
    }

    pub fn ingress(&self, server: &DatabaseServer) -> Result<KubeResource, ProvisioningError> {
        let annotations = Labels::from([
            (ANNOTATION_INGRESS_TYPE.to_string(), "HostPort".to_string()),
            (ANNOTATION_INGRESS_CLASS.to_string(), "voyager".to_string()),
        ]);
        let host_port = ingress_host_port(&server.id, self.options.ingress_port_base);
        let ingress = Ingress {
            api_version: ResourceKind::Ingress.api_version().to_string(),
            metadata: self
                .metadata(ingress_name(&server.id), server_labels(&server.id))?
                .with_annotations(annotations),
            spec: IngressSpec {
                rules: vec![IngressRule {
                    host: Some(format!("{}.local", server.name)),
                    tcp: Some(TcpIngressRule {
                        port: host_port.to_string(),
                        backend: IngressBackend {
                            service_name: service_name(&server.id),
                            service_port: container_port(server.kind).to_string(),
                        },
                    }),
                }],
            },
            status: None,
        };
        Ok(ingress.into())
    }
}

/// Rejected or malformed requests need a person; everything else is retried.
pub fn kube_failure(err: KubeError) -> ProvisioningError {
    if err.is_transient() {
        ProvisioningError::retryable(err.to_string())
    } else {
        ProvisioningError::fatal(err.to_string())
    }
}
