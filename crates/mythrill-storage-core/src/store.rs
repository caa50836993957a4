use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::usage::{Category, StorageLedger};

/// Identity of one persisted document within a user's space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub category: Category,
    pub id: String,
}

impl DocumentRef {
    pub fn new(category: Category, id: impl Into<String>) -> Self {
        Self {
            category,
            id: id.into(),
        }
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.id)
    }
}

/// A document as held by the store, which is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistableDocument {
    pub owner_id: String,
    pub doc: DocumentRef,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Monotonic per-document version, 1 on first save.
    pub version: u64,
    /// Server timestamp of the last write, in milliseconds since the Unix epoch.
    pub server_timestamp: i64,
}

impl PersistableDocument {
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Lightweight listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub doc: DocumentRef,
    pub size_bytes: u64,
    pub version: u64,
    pub server_timestamp: i64,
}

/// Result of a successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReceipt {
    pub server_timestamp: i64,
    pub version: u64,
    /// True when this save created the document.
    pub created: bool,
}

/// A change notification delivered to document subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub doc: DocumentRef,
    /// New payload, or `None` when the document was deleted.
    pub payload: Option<Vec<u8>>,
    pub version: u64,
    pub server_timestamp: i64,
}

/// Live feed of changes to one document.
///
/// Dropping the subscription (or calling [`DocumentSubscription::unsubscribe`])
/// detaches it from the store.
pub struct DocumentSubscription {
    doc: DocumentRef,
    changes: BoxStream<'static, RemoteChange>,
}

impl DocumentSubscription {
    pub fn new(
        doc: DocumentRef,
        changes: impl Stream<Item = RemoteChange> + Send + 'static,
    ) -> Self {
        Self {
            doc,
            changes: changes.boxed(),
        }
    }

    pub fn doc(&self) -> &DocumentRef {
        &self.doc
    }

    /// Wait for the next change. Returns `None` once the store closes the feed.
    pub async fn next_change(&mut self) -> Option<RemoteChange> {
        self.changes.next().await
    }

    /// Detach from the store. Same as dropping the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for DocumentSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentSubscription")
            .field("doc", &self.doc)
            .finish_non_exhaustive()
    }
}

/// Remote key/value document store with per-document subscriptions.
///
/// Contract: at-least-once delivery of changes to subscriptions while connected,
/// monotonic per-document timestamps and versions, no cross-document ordering.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "file").
    fn backend_name(&self) -> &'static str;

    /// Persist a payload, creating the document if needed.
    async fn save(
        &self,
        user_id: &str,
        doc: &DocumentRef,
        payload: &[u8],
    ) -> Result<SaveReceipt, StoreError>;

    /// Load a document, `None` if it was never saved.
    async fn load(
        &self,
        user_id: &str,
        doc: &DocumentRef,
    ) -> Result<Option<PersistableDocument>, StoreError>;

    /// Subscribe to future changes of one document.
    async fn subscribe(
        &self,
        user_id: &str,
        doc: &DocumentRef,
    ) -> Result<DocumentSubscription, StoreError>;

    /// Delete a document. Returns whether it existed.
    async fn delete(&self, user_id: &str, doc: &DocumentRef) -> Result<bool, StoreError>;

    /// List all documents owned by a user.
    async fn list(&self, user_id: &str) -> Result<Vec<DocumentInfo>, StoreError>;

    /// Cheap availability probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Stored per-user account data relevant to quotas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Tier assignment as written by billing, e.g. "premium".
    #[serde(default)]
    pub subscription_tier: Option<String>,
    #[serde(default)]
    pub storage_usage: Option<StorageLedger>,
}

/// Store for per-user account records (tier assignment and usage ledger).
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn load_account(&self, user_id: &str) -> Result<Option<AccountRecord>, StoreError>;

    /// Merge the usage ledger into the account, creating it if needed.
    async fn save_usage(&self, user_id: &str, usage: &StorageLedger) -> Result<(), StoreError>;

    /// Merge a tier assignment into the account, creating it if needed.
    async fn save_tier(&self, user_id: &str, tier: &str) -> Result<(), StoreError>;
}
