use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::meta::Labels;
use crate::resources::{KubeResource, ResourceKind};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KubeError {
    #[error("{kind} `{name}` not found")]
    NotFound { kind: ResourceKind, name: String },
    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: ResourceKind, name: String },
    #[error("kubernetes API returned {status} ({reason}): {message}")]
    Api {
        status: u16,
        reason: String,
        message: String,
    },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("kubernetes transport error: {0}")]
    Transport(String),
}

impl KubeError {
    /// Worth another attempt later: connectivity, throttling, conflicts, 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            KubeError::Transport(_) => true,
            KubeError::Api { status, .. } => *status >= 500 || matches!(status, 409 | 429),
            KubeError::NotFound { .. } | KubeError::AlreadyExists { .. } | KubeError::Invalid(_) => {
                false
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::Added => "ADDED",
            WatchEventType::Modified => "MODIFIED",
            WatchEventType::Deleted => "DELETED",
            WatchEventType::Bookmark => "BOOKMARK",
            WatchEventType::Error => "ERROR",
        }
    }
}

/// One change notification from the cluster-wide watch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: KubeResource,
}

impl WatchEvent {
    pub fn new(event_type: WatchEventType, object: impl Into<KubeResource>) -> Self {
        Self {
            event_type,
            object: object.into(),
        }
    }

    /// Carries an object worth routing (not a bookmark or error frame).
    pub fn is_routable(&self) -> bool {
        matches!(
            self.event_type,
            WatchEventType::Added | WatchEventType::Modified | WatchEventType::Deleted
        )
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, KubeError>>;

/// The cluster operations the provisioner needs. All calls are scoped to the
/// namespace the implementation was built for.
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// First object of `kind` carrying every label in `selector`.
    async fn find(
        &self,
        kind: ResourceKind,
        selector: &Labels,
    ) -> Result<Option<KubeResource>, KubeError>;

    async fn create(&self, resource: &KubeResource) -> Result<KubeResource, KubeError>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), KubeError>;

    /// Streams changes for `kinds` whose labels satisfy `label_selector`
    /// (Kubernetes selector syntax, e.g. `cloud.dimensiondata.daas.server-id`).
    async fn watch(
        &self,
        kinds: &[ResourceKind],
        label_selector: &str,
    ) -> Result<WatchStream, KubeError>;
}

/// Create/delete that treat "already there" and "already gone" as success.
#[async_trait]
pub trait KubeApiExt: KubeApi {
    /// Returns `false` when the object already existed.
    async fn create_if_absent(&self, resource: &KubeResource) -> Result<bool, KubeError> {
        match self.create(resource).await {
            Ok(_) => Ok(true),
            Err(KubeError::AlreadyExists { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Returns `false` when the object was already gone.
    async fn delete_if_present(&self, kind: ResourceKind, name: &str) -> Result<bool, KubeError> {
        match self.delete(kind, name).await {
            Ok(()) => Ok(true),
            Err(KubeError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl<T: KubeApi + ?Sized> KubeApiExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ObjectMeta;
    use crate::resources::Service;
    use serde_json::json;

    #[test]
    fn transient_classification() {
        assert!(KubeError::Transport("reset".into()).is_transient());
        for status in [409, 429, 500, 503] {
            let err = KubeError::Api {
                status,
                reason: "r".into(),
                message: "m".into(),
            };
            assert!(err.is_transient(), "{status}");
        }
        let forbidden = KubeError::Api {
            status: 403,
            reason: "Forbidden".into(),
            message: "no".into(),
        };
        assert!(!forbidden.is_transient());
        assert!(!KubeError::Invalid("bad".into()).is_transient());
    }

    #[test]
    fn watch_event_wire_shape() {
        let event = WatchEvent::new(
            WatchEventType::Deleted,
            Service {
                metadata: ObjectMeta::named("sql-server-1-service"),
                ..Service::default()
            },
        );
        let encoded = serde_json::to_value(&event).expect("encode");
        assert_eq!(encoded["type"], json!("DELETED"));
        assert_eq!(encoded["object"]["kind"], json!("Service"));
        assert!(event.is_routable());
        let decoded: WatchEvent = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, event);
    }
}
