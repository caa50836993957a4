use dashmap::DashMap;
use mythrill_storage_core::{DocumentRef, DocumentSubscription, RemoteChange};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 64;

/// Per-document fan-out of change notifications to live subscriptions.
pub struct ChangeFeed {
    /// (user_id, doc) -> sender
    channels: DashMap<(String, DocumentRef), broadcast::Sender<RemoteChange>>,
    capacity: usize,
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("channels", &self.channels.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    fn key(user_id: &str, doc: &DocumentRef) -> (String, DocumentRef) {
        (user_id.to_string(), doc.clone())
    }

    /// Open a subscription for future changes of one document.
    pub fn subscribe(&self, user_id: &str, doc: &DocumentRef) -> DocumentSubscription {
        let rx = self
            .channels
            .entry(Self::key(user_id, doc))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let watched = doc.clone();
        let changes = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(change) => Some(change),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Subscription for {} lagged, {} changes skipped", watched, skipped);
                None
            }
        });

        debug!("Subscribed to {} for user {}", doc, user_id);
        DocumentSubscription::new(doc.clone(), changes)
    }

    /// Deliver a change to every live subscription of its document.
    pub fn publish(&self, user_id: &str, change: RemoteChange) {
        let key = Self::key(user_id, &change.doc);
        let delivered = match self.channels.get(&key) {
            Some(tx) => tx.send(change).unwrap_or(0),
            None => return,
        };
        if delivered == 0 {
            self.channels
                .remove_if(&key, |_, tx| tx.receiver_count() == 0);
        }
    }

    /// Number of live subscriptions on a document.
    pub fn subscriber_count(&self, user_id: &str, doc: &DocumentRef) -> usize {
        self.channels
            .get(&Self::key(user_id, doc))
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}
