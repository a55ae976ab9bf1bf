use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Lifecycle event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// Broadcast bus for provisioning lifecycle events.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// simply dropped, and a lagging subscriber loses the oldest envelopes.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let _ = self.tx.send(Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_envelopes() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish("server.provisioned", &json!({"server_id": "4"}));
        let env = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("envelope in time")
            .expect("envelope");
        assert_eq!(env.kind, "server.provisioned");
        assert_eq!(env.payload["server_id"], json!("4"));
        assert!(env.time.ends_with('Z'));
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let bus = Bus::new(0);
        bus.publish("server.deprovisioned", &json!({"server_id": "1"}));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
