//! Routes the shared watch stream to per-subscriber mailboxes.
//!
//! Delivery uses `try_send`: a slow subscriber never stalls the stream. A full
//! mailbox drops the event (the subscriber re-reads cluster state on its next
//! tick anyway) and a closed mailbox is pruned on the spot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{KubeError, WatchEvent, WatchStream};
use crate::filter::ResourceEventFilter;

struct Route<M> {
    subscriber: String,
    sender: mpsc::Sender<M>,
}

pub struct ResourceEventBus<M> {
    routes: RwLock<HashMap<ResourceEventFilter, Vec<Route<M>>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl<M> Default for ResourceEventBus<M> {
    fn default() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    pub filters: usize,
    pub routes: usize,
    pub delivered: u64,
    pub dropped: u64,
}

impl<M> ResourceEventBus<M>
where
    M: From<Arc<WatchEvent>> + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sender` for events matching `filter`. Subscribing the same
    /// subscriber to an equal filter again replaces the earlier mailbox.
    pub async fn subscribe(
        &self,
        subscriber: impl Into<String>,
        filter: ResourceEventFilter,
        sender: mpsc::Sender<M>,
    ) {
        let subscriber = subscriber.into();
        let mut routes = self.routes.write().await;
        let entry = routes.entry(filter).or_default();
        match entry.iter_mut().find(|route| route.subscriber == subscriber) {
            Some(route) => route.sender = sender,
            None => entry.push(Route { subscriber, sender }),
        }
    }

    pub async fn unsubscribe(&self, subscriber: &str, filter: &ResourceEventFilter) -> bool {
        let mut routes = self.routes.write().await;
        let Some(entry) = routes.get_mut(filter) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|route| route.subscriber != subscriber);
        let removed = entry.len() != before;
        if entry.is_empty() {
            routes.remove(filter);
        }
        removed
    }

    /// Drops every route owned by `subscriber`; returns how many were removed.
    pub async fn unsubscribe_all(&self, subscriber: &str) -> usize {
        let mut routes = self.routes.write().await;
        let mut removed = 0;
        routes.retain(|_, entry| {
            let before = entry.len();
            entry.retain(|route| route.subscriber != subscriber);
            removed += before - entry.len();
            !entry.is_empty()
        });
        removed
    }

    /// Offers `event` to every subscriber whose filter matches the object.
    /// Returns the number of mailboxes that accepted it.
    pub async fn dispatch(&self, event: Arc<WatchEvent>) -> usize {
        let metadata = event.object.metadata();
        let mut delivered = 0usize;
        let mut closed: Vec<(ResourceEventFilter, String)> = Vec::new();
        {
            let routes = self.routes.read().await;
            for (filter, entry) in routes.iter() {
                if !filter.matches(metadata) {
                    continue;
                }
                for route in entry {
                    match route.sender.try_send(M::from(Arc::clone(&event))) {
                        Ok(()) => delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                target: "daas::watch",
                                subscriber = %route.subscriber,
                                filter = %filter,
                                object = %metadata.name_or_empty(),
                                "mailbox full; event dropped"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            closed.push((filter.clone(), route.subscriber.clone()));
                        }
                    }
                }
            }
        }
        for (filter, subscriber) in closed {
            if self.unsubscribe(&subscriber, &filter).await {
                debug!(
                    target: "daas::watch",
                    subscriber = %subscriber,
                    filter = %filter,
                    "pruned closed mailbox"
                );
            }
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Dispatches the shared watch feed until it closes or `cancel` fires.
    /// Non-routable frames are skipped; a lagging feed is logged and the
    /// affected subscribers catch up on their next periodic reconcile.
    pub async fn run(
        &self,
        mut feed: broadcast::Receiver<Arc<WatchEvent>>,
        cancel: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = feed.recv() => received,
            };
            match received {
                Ok(event) if event.is_routable() => {
                    self.dispatch(event).await;
                }
                Ok(event) => {
                    debug!(
                        target: "daas::watch",
                        kind = %event.object.kind(),
                        event = event.event_type.as_str(),
                        "skipping non-routable watch frame"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!(
                        target: "daas::watch",
                        skipped,
                        "watch dispatcher lagged; events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub async fn stats(&self) -> BusStats {
        let routes = self.routes.read().await;
        BusStats {
            filters: routes.len(),
            routes: routes.values().map(Vec::len).sum(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Forwards a watch stream into `feed` until it ends, yields an error, or
/// `cancel` fires. Returns how many events were forwarded.
pub async fn forward_watch(
    mut stream: WatchStream,
    feed: &broadcast::Sender<Arc<WatchEvent>>,
    cancel: &CancellationToken,
) -> Result<u64, KubeError> {
    let mut forwarded = 0u64;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(forwarded),
            next = stream.next() => next,
        };
        match next {
            None => return Ok(forwarded),
            Some(Err(err)) => return Err(err),
            Some(Ok(event)) => {
                // No receiver only means the dispatcher is restarting.
                let _ = feed.send(Arc::new(event));
                forwarded += 1;
            }
        }
    }
}
