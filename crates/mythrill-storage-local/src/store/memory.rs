use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use mythrill_storage_core::{
    AccountRecord, AccountStore, DocumentInfo, DocumentRef, DocumentStore, DocumentSubscription,
    PersistableDocument, RemoteChange, SaveReceipt, StorageLedger, StoreError,
};
use tracing::{debug, instrument};

use super::feed::ChangeFeed;
use super::next_timestamp;

/// Process-local document and account store.
///
/// Behaves like the remote store from the engine's point of view: per-document
/// versions and timestamps are monotonic and every write is fanned out to
/// subscribers, including the writer's own (its self-echo). Failure injection
/// (offline, denied users, save latency) makes the engine's error paths testable.
pub struct MemoryDocumentStore {
    /// (user_id, doc) -> document
    documents: DashMap<(String, DocumentRef), PersistableDocument>,
    /// (user_id, doc) -> (version, timestamp) of the delete, so a recreate continues numbering
    tombstones: DashMap<(String, DocumentRef), (u64, i64)>,
    /// user_id -> account
    accounts: DashMap<String, AccountRecord>,
    feed: ChangeFeed,
    denied: DashSet<String>,
    offline: AtomicBool,
    usage_writes_failing: AtomicBool,
    save_delay: Mutex<Option<Duration>>,
    saves: AtomicU64,
}

impl std::fmt::Debug for MemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDocumentStore")
            .field("documents", &self.documents.len())
            .field("accounts", &self.accounts.len())
            .field("offline", &self.offline.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            tombstones: DashMap::new(),
            accounts: DashMap::new(),
            feed: ChangeFeed::default(),
            denied: DashSet::new(),
            offline: AtomicBool::new(false),
            usage_writes_failing: AtomicBool::new(false),
            save_delay: Mutex::new(None),
            saves: AtomicU64::new(0),
        }
    }

    fn key(user_id: &str, doc: &DocumentRef) -> (String, DocumentRef) {
        (user_id.to_string(), doc.clone())
    }

    fn check_access(&self, user_id: &str) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        if self.denied.contains(user_id) {
            return Err(StoreError::PermissionDenied(format!(
                "access to {} is not allowed",
                user_id
            )));
        }
        Ok(())
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Refuse every operation on a user's data.
    pub fn deny_user(&self, user_id: &str) {
        self.denied.insert(user_id.to_string());
    }

    /// Fail usage ledger writes while documents still save.
    pub fn set_usage_writes_failing(&self, failing: bool) {
        self.usage_writes_failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every save by `delay` before it is applied.
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        if let Ok(mut guard) = self.save_delay.lock() {
            *guard = delay;
        }
    }

    /// Total number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Write a document as another device would, notifying subscribers.
    ///
    /// The timestamp is kept strictly after the document's previous write.
    pub fn write_from_peer(
        &self,
        user_id: &str,
        doc: &DocumentRef,
        payload: &[u8],
        server_timestamp: i64,
    ) -> SaveReceipt {
        let (receipt, change) = self.apply_write(user_id, doc, payload, Some(server_timestamp));
        self.feed.publish(user_id, change);
        receipt
    }

    fn apply_write(
        &self,
        user_id: &str,
        doc: &DocumentRef,
        payload: &[u8],
        timestamp: Option<i64>,
    ) -> (SaveReceipt, RemoteChange) {
        let key = Self::key(user_id, doc);
        let tombstone = self.tombstones.get(&key).map(|t| *t.value());
        let mut created = false;
        let mut entry = self.documents.entry(key.clone()).or_insert_with(|| {
            created = true;
            let (version, server_timestamp) = tombstone.unwrap_or((0, i64::MIN));
            PersistableDocument {
                owner_id: user_id.to_string(),
                doc: doc.clone(),
                payload: Vec::new(),
                version,
                server_timestamp,
            }
        });
        if created {
            self.tombstones.remove(&key);
        }

        let previous = (entry.server_timestamp != i64::MIN).then_some(entry.server_timestamp);
        let server_timestamp = match (timestamp, previous) {
            (Some(ts), Some(prev)) if ts <= prev => prev + 1,
            (Some(ts), _) => ts,
            (None, prev) => next_timestamp(prev),
        };

        entry.payload = payload.to_vec();
        entry.version += 1;
        entry.server_timestamp = server_timestamp;

        let receipt = SaveReceipt {
            server_timestamp,
            version: entry.version,
            created,
        };
        let change = RemoteChange {
            doc: doc.clone(),
            payload: Some(entry.payload.clone()),
            version: entry.version,
            server_timestamp,
        };
        (receipt, change)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, payload), level = "debug", fields(payload_len = payload.len()))]
    async fn save(
        &self,
        user_id: &str,
        doc: &DocumentRef,
        payload: &[u8],
    ) -> Result<SaveReceipt, StoreError> {
        self.check_access(user_id)?;

        let delay = self.save_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.check_access(user_id)?;
        }

        let (receipt, change) = self.apply_write(user_id, doc, payload, None);
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.feed.publish(user_id, change);

        debug!(
            "Saved {} v{} ({} bytes) for {}",
            doc,
            receipt.version,
            payload.len(),
            user_id
        );
        Ok(receipt)
    }

    #[instrument(skip(self), level = "debug")]
    async fn load(
        &self,
        user_id: &str,
        doc: &DocumentRef,
    ) -> Result<Option<PersistableDocument>, StoreError> {
        self.check_access(user_id)?;
        Ok(self
            .documents
            .get(&Self::key(user_id, doc))
            .map(|d| d.value().clone()))
    }

    async fn subscribe(
        &self,
        user_id: &str,
        doc: &DocumentRef,
    ) -> Result<DocumentSubscription, StoreError> {
        self.check_access(user_id)?;
        Ok(self.feed.subscribe(user_id, doc))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, user_id: &str, doc: &DocumentRef) -> Result<bool, StoreError> {
        self.check_access(user_id)?;
        let Some((_, removed)) = self.documents.remove(&Self::key(user_id, doc)) else {
            return Ok(false);
        };

        let version = removed.version + 1;
        let server_timestamp = next_timestamp(Some(removed.server_timestamp));
        self.tombstones
            .insert(Self::key(user_id, doc), (version, server_timestamp));
        self.feed.publish(
            user_id,
            RemoteChange {
                doc: doc.clone(),
                payload: None,
                version,
                server_timestamp,
            },
        );
        debug!("Deleted {} for {}", doc, user_id);
        Ok(true)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<DocumentInfo>, StoreError> {
        self.check_access(user_id)?;
        let mut docs: Vec<DocumentInfo> = self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| DocumentInfo {
                doc: entry.doc.clone(),
                size_bytes: entry.size_bytes(),
                version: entry.version,
                server_timestamp: entry.server_timestamp,
            })
            .collect();
        docs.sort_by(|a, b| a.doc.cmp(&b.doc));
        Ok(docs)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryDocumentStore {
    async fn load_account(&self, user_id: &str) -> Result<Option<AccountRecord>, StoreError> {
        self.check_access(user_id)?;
        Ok(self.accounts.get(user_id).map(|a| a.value().clone()))
    }

    async fn save_usage(&self, user_id: &str, usage: &StorageLedger) -> Result<(), StoreError> {
        self.check_access(user_id)?;
        if self.usage_writes_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("account writes are failing".into()));
        }
        self.accounts
            .entry(user_id.to_string())
            .or_default()
            .storage_usage = Some(usage.clone());
        Ok(())
    }

    async fn save_tier(&self, user_id: &str, tier: &str) -> Result<(), StoreError> {
        self.check_access(user_id)?;
        self.accounts
            .entry(user_id.to_string())
            .or_default()
            .subscription_tier = Some(tier.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mythrill_storage_core::Category;

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let store = MemoryDocumentStore::new();
        let doc = DocumentRef::new(Category::Rooms, "room-1");
        let payload = br#"{"tokens":{}}"#;

        assert!(store.load("u1", &doc).await.unwrap().is_none());

        let first = store.save("u1", &doc, payload).await.unwrap();
        assert!(first.created);
        assert_eq!(first.version, 1);

        let second = store.save("u1", &doc, payload).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.version, 2);
        assert!(second.server_timestamp > first.server_timestamp);

        let loaded = store.load("u1", &doc).await.unwrap().unwrap();
        assert_eq!(loaded.payload, payload);
        assert_eq!(loaded.owner_id, "u1");
        assert!(store.load("u2", &doc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_own_writes_and_deletes() {
        let store = MemoryDocumentStore::new();
        let doc = DocumentRef::new(Category::Journals, "journal");
        let mut sub = store.subscribe("u1", &doc).await.unwrap();

        let receipt = store.save("u1", &doc, b"a").await.unwrap();
        let echo = sub.next_change().await.unwrap();
        assert_eq!(echo.server_timestamp, receipt.server_timestamp);
        assert_eq!(echo.payload.as_deref(), Some(&b"a"[..]));

        assert!(store.delete("u1", &doc).await.unwrap());
        let deletion = sub.next_change().await.unwrap();
        assert!(deletion.payload.is_none());
        assert!(deletion.version > receipt.version);

        assert!(!store.delete("u1", &doc).await.unwrap());
    }

    #[tokio::test]
    async fn test_recreate_after_delete_continues_versions() {
        let store = MemoryDocumentStore::new();
        let doc = DocumentRef::new(Category::Rooms, "room-1");
        let mut sub = store.subscribe("u1", &doc).await.unwrap();

        store.save("u1", &doc, b"1").await.unwrap();
        let before = store.save("u1", &doc, b"2").await.unwrap();
        assert!(store.delete("u1", &doc).await.unwrap());

        let recreated = store.save("u1", &doc, b"3").await.unwrap();
        assert!(recreated.created);
        assert_eq!(recreated.version, 4);
        assert!(recreated.server_timestamp > before.server_timestamp);

        let mut versions = Vec::new();
        for _ in 0..4 {
            versions.push(sub.next_change().await.unwrap().version);
        }
        assert_eq!(versions, vec![1, 2, 3, 4]);

        // Peer writes continue the same numbering.
        assert!(store.delete("u1", &doc).await.unwrap());
        let peer = store.write_from_peer("u1", &doc, b"4", 0);
        assert!(peer.created);
        assert_eq!(peer.version, 6);
    }

    #[tokio::test]
    async fn test_peer_timestamps_stay_monotonic() {
        let store = MemoryDocumentStore::new();
        let doc = DocumentRef::new(Category::Campaigns, "c1");

        let a = store.write_from_peer("u1", &doc, b"a", 500);
        let b = store.write_from_peer("u1", &doc, b"b", 100);
        assert_eq!(a.server_timestamp, 500);
        assert_eq!(b.server_timestamp, 501);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryDocumentStore::new();
        let doc = DocumentRef::new(Category::Rooms, "room-1");

        store.set_offline(true);
        assert!(matches!(
            store.save("u1", &doc, b"x").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.ping().await.is_err());
        store.set_offline(false);

        store.set_usage_writes_failing(true);
        assert!(store.save("u1", &doc, b"x").await.is_ok());
        assert!(matches!(
            store.save_usage("u1", &StorageLedger::empty()).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_usage_writes_failing(false);

        store.deny_user("u2");
        assert!(matches!(
            store.load_account("u2").await,
            Err(StoreError::PermissionDenied(_))
        ));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_list_is_per_user() {
        let store = MemoryDocumentStore::new();
        store
            .save("u1", &DocumentRef::new(Category::Rooms, "r"), b"12")
            .await
            .unwrap();
        store
            .save("u1", &DocumentRef::new(Category::Characters, "c"), b"1")
            .await
            .unwrap();
        store
            .save("u2", &DocumentRef::new(Category::Rooms, "r"), b"1")
            .await
            .unwrap();

        let docs = store.list("u1").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].doc.category, Category::Characters);
        assert_eq!(docs[1].size_bytes, 2);
    }
}
