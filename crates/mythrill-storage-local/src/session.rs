use std::sync::Arc;

use futures::future::join_all;
use mythrill_storage_core::{AccountStore, ChangeCollector, DocumentRef, DocumentStore};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::capability::PersistenceCapability;
use crate::config::SyncConfig;
use crate::coordinator::{ConnectionState, DocumentSyncStatus, SyncCoordinator};
use crate::error::SyncError;
use crate::events::{ConflictDescriptor, EventBus, SyncEvent};
use crate::ledger::{QuotaEnforcer, TierAssignment};
use crate::registry::DomainRegistry;
use crate::scheduler::{AutoSaveScheduler, SaveOutcome};

/// Summary of a session, for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub user_id: String,
    pub can_persist: bool,
    pub online: bool,
    pub domains: Vec<DocumentRef>,
    pub pending_saves: Vec<DocumentRef>,
    pub documents: Vec<DocumentSyncStatus>,
}

impl SessionStatus {
    pub fn conflicts(&self) -> impl Iterator<Item = &DocumentSyncStatus> {
        self.documents.iter().filter(|d| d.conflicted)
    }
}

/// Persistence context for one signed-in (or guest) user.
///
/// Created by [`PersistenceSession::attach`] and torn down with
/// [`PersistenceSession::detach`]. Owns the domain registry, the auto-save
/// scheduler and the sync coordinator; the capability is resolved once here
/// and injected into each of them.
pub struct PersistenceSession {
    user_id: String,
    capability: PersistenceCapability,
    store: Arc<dyn DocumentStore>,
    quota: Arc<QuotaEnforcer>,
    registry: Arc<DomainRegistry>,
    coordinator: Arc<SyncCoordinator>,
    scheduler: Arc<AutoSaveScheduler>,
    events: EventBus,
}

impl std::fmt::Debug for PersistenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceSession")
            .field("user_id", &self.user_id)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl PersistenceSession {
    pub fn attach(
        user_id: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        accounts: Arc<dyn AccountStore>,
        config: SyncConfig,
    ) -> Self {
        let user_id = user_id.into();
        let capability = PersistenceCapability::resolve(&user_id);
        let events = EventBus::default();
        let registry = Arc::new(DomainRegistry::new());
        let quota = Arc::new(QuotaEnforcer::new(accounts, config.tiers.clone()));

        let coordinator = Arc::new(SyncCoordinator::new(
            user_id.clone(),
            capability,
            store.clone(),
            registry.clone(),
            &config,
            events.clone(),
        ));
        let scheduler = Arc::new(AutoSaveScheduler::new(
            user_id.clone(),
            capability,
            store.clone(),
            registry.clone(),
            coordinator.clone(),
            quota.clone(),
            &config,
            events.clone(),
        ));

        info!(
            "Attached persistence session for {} ({}, policy {})",
            if user_id.is_empty() { "<anonymous>" } else { user_id.as_str() },
            if capability.can_persist() { "persistent" } else { "guest" },
            config.conflict_policy
        );
        Self {
            user_id,
            capability,
            store,
            quota,
            registry,
            coordinator,
            scheduler,
            events,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn capability(&self) -> PersistenceCapability {
        self.capability
    }

    pub fn quota(&self) -> &QuotaEnforcer {
        &self.quota
    }

    pub async fn tier(&self) -> TierAssignment {
        self.quota.get_user_tier(&self.user_id).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Register a domain and load its persisted state into the collector.
    ///
    /// Returns whether a stored document was found.
    pub async fn open_domain(
        &self,
        doc: DocumentRef,
        collector: Arc<dyn ChangeCollector>,
    ) -> Result<bool, SyncError> {
        let slot = self.registry.register(doc.clone(), collector);
        if !self.capability.can_persist() {
            return Ok(false);
        }

        let stored = match self.store.load(&self.user_id, &doc).await {
            Ok(stored) => stored,
            Err(e) if e.is_transient() => {
                warn!("Could not load {}: {}; starting from local state", doc, e);
                self.coordinator.set_online(false);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(stored) = stored else {
            debug!("No stored state for {}", doc);
            return Ok(false);
        };
        slot.apply_remote(&stored.payload)?;
        self.coordinator
            .note_loaded(&doc, stored.version, stored.server_timestamp);
        debug!("Loaded {} v{} ({} bytes)", doc, stored.version, stored.size_bytes());
        Ok(true)
    }

    /// Flush and forget a domain.
    pub async fn close_domain(&self, doc: &DocumentRef) -> Result<(), SyncError> {
        let flushed = self.flush(doc).await;
        self.coordinator.stop_sync(doc);
        self.registry.unregister(doc);
        flushed
    }

    /// Record a local edit and (re)arm the domain's auto-save.
    pub fn mark_changed(&self, doc: &DocumentRef, change_id: impl Into<String>) -> Result<(), SyncError> {
        self.coordinator.mark_local_change(doc, change_id);
        self.scheduler.schedule_auto_save(doc)
    }

    pub fn schedule_auto_save(&self, doc: &DocumentRef) -> Result<(), SyncError> {
        self.scheduler.schedule_auto_save(doc)
    }

    pub async fn force_save(&self, doc: &DocumentRef) -> Result<SaveOutcome, SyncError> {
        self.scheduler.force_save(doc).await
    }

    pub async fn start_sync(&self, doc: &DocumentRef) -> Result<ConnectionState, SyncError> {
        self.coordinator.start_sync(doc).await
    }

    pub fn stop_sync(&self, doc: &DocumentRef) {
        self.coordinator.stop_sync(doc);
    }

    pub fn conflict(&self, doc: &DocumentRef) -> Option<ConflictDescriptor> {
        self.coordinator.conflict(doc)
    }

    /// Adopt the remote side of a pending conflict.
    pub fn resolve_with_remote(&self, doc: &DocumentRef) -> Result<(), SyncError> {
        self.coordinator.resolve_with_remote(doc)
    }

    /// Keep the local side of a pending conflict and overwrite the remote.
    pub async fn resolve_with_local(&self, doc: &DocumentRef) -> Result<SaveOutcome, SyncError> {
        self.coordinator.resolve_with_local(doc)?;
        self.scheduler.force_save(doc).await
    }

    pub fn status(&self) -> SessionStatus {
        let domains = self.registry.docs();
        let mut docs = self.coordinator.docs();
        for doc in &domains {
            if !docs.contains(doc) {
                docs.push(doc.clone());
            }
        }
        docs.sort();

        SessionStatus {
            user_id: self.user_id.clone(),
            can_persist: self.capability.can_persist(),
            online: self.coordinator.is_online(),
            pending_saves: self.scheduler.pending_docs(),
            documents: docs
                .iter()
                .filter_map(|doc| self.coordinator.status(doc))
                .collect(),
            domains,
        }
    }

    async fn flush(&self, doc: &DocumentRef) -> Result<(), SyncError> {
        let pending = self.scheduler.has_pending(doc) || self.coordinator.has_pending_changes(doc);
        if !pending {
            return Ok(());
        }
        self.scheduler.force_save(doc).await.map(|_| ())
    }

    /// Flush every domain with unsaved edits, then stop all subscriptions.
    ///
    /// Every domain is attempted; the first failure is returned.
    pub async fn detach(self) -> Result<(), SyncError> {
        let docs = self.registry.docs();
        let results = join_all(docs.iter().map(|doc| self.flush(doc))).await;

        let mut first_error = None;
        for (doc, result) in docs.iter().zip(results) {
            if let Err(e) = result {
                warn!("Could not flush {} on detach: {}", doc, e);
                first_error.get_or_insert(e);
            }
        }
        self.scheduler.cancel_all();
        self.coordinator.stop_all();
        info!("Detached persistence session for {}", self.user_id);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictPolicy, DebounceConfig};
    use crate::registry::testing::RoomState;
    use crate::store::MemoryDocumentStore;
    use mythrill_storage_core::Category;
    use serde_json::json;
    use std::time::Duration;

    fn config(policy: ConflictPolicy) -> SyncConfig {
        SyncConfig {
            debounce: DebounceConfig::uniform(3_000),
            ..SyncConfig::default()
        }
        .with_policy(policy)
    }

    fn attach(store: &Arc<MemoryDocumentStore>, user: &str, policy: ConflictPolicy) -> PersistenceSession {
        PersistenceSession::attach(user, store.clone(), store.clone(), config(policy))
    }

    fn room_doc() -> DocumentRef {
        DocumentRef::new(Category::Rooms, "room-1")
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<SyncEvent>,
        pred: impl Fn(&SyncEvent) -> bool,
    ) -> SyncEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_domain_loads_without_resaving() {
        let store = Arc::new(MemoryDocumentStore::new());
        let payload = RoomState::snapshot_bytes("room-1", json!({"map": "keep"}));
        store.write_from_peer("u1", &room_doc(), &payload, 1_000);

        let session = attach(&store, "u1", ConflictPolicy::RemoteWins);
        let room = Arc::new(RoomState::new("room-1"));
        assert!(session.open_domain(room_doc(), room.clone()).await.unwrap());
        assert_eq!(room.get(), json!({"map": "keep"}));

        session.mark_changed(&room_doc(), "open").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.save_count(), 0);
        assert_eq!(session.status().documents[0].pending_changes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_flushes_pending_edits() {
        let store = Arc::new(MemoryDocumentStore::new());
        let session = attach(&store, "u1", ConflictPolicy::RemoteWins);
        let room = Arc::new(RoomState::new("room-1"));
        session.open_domain(room_doc(), room.clone()).await.unwrap();

        room.set(json!({"tokens": ["elf"]}));
        session.mark_changed(&room_doc(), "add-token").unwrap();
        assert_eq!(session.status().pending_saves, vec![room_doc()]);

        session.detach().await.unwrap();
        let stored = store.load("u1", &room_doc()).await.unwrap().unwrap();
        assert_eq!(
            stored.payload,
            RoomState::snapshot_bytes("room-1", json!({"tokens": ["elf"]}))
        );
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_session_is_inert() {
        let store = Arc::new(MemoryDocumentStore::new());
        let session = attach(&store, "guest-9", ConflictPolicy::RemoteWins);
        let room = Arc::new(RoomState::new("room-1"));

        assert!(!session.open_domain(room_doc(), room.clone()).await.unwrap());
        room.set(json!({"x": 1}));
        session.mark_changed(&room_doc(), "edit").unwrap();
        assert_eq!(
            session.start_sync(&room_doc()).await.unwrap(),
            ConnectionState::Disconnected
        );
        assert!(!session.status().can_persist);
        session.detach().await.unwrap();

        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_edits_leave_no_pending_changes() {
        let store = Arc::new(MemoryDocumentStore::new());
        let session = attach(&store, "anonymous", ConflictPolicy::RemoteWins);
        let room = Arc::new(RoomState::new("room-1"));
        session.open_domain(room_doc(), room.clone()).await.unwrap();

        for i in 0..200 {
            session.mark_changed(&room_doc(), format!("edit-{}", i)).unwrap();
        }

        let status = session.status();
        assert!(status.pending_saves.is_empty());
        assert!(status.documents.iter().all(|d| d.pending_changes == 0));
        assert!(!session.coordinator.has_pending_changes(&room_doc()));
        session.detach().await.unwrap();
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_recreate_after_delete_reaches_other_device() {
        let store = Arc::new(MemoryDocumentStore::new());
        let device_a = attach(&store, "u1", ConflictPolicy::RemoteWins);
        let room_a = Arc::new(RoomState::new("room-1"));
        device_a.open_domain(room_doc(), room_a.clone()).await.unwrap();
        device_a.start_sync(&room_doc()).await.unwrap();
        let mut events = device_a.subscribe_events();

        let device_b = attach(&store, "u1", ConflictPolicy::RemoteWins);
        let room_b = Arc::new(RoomState::new("room-1"));
        device_b.open_domain(room_doc(), room_b.clone()).await.unwrap();
        for v in 1..=2 {
            room_b.set(json!({ "v": v }));
            device_b.mark_changed(&room_doc(), format!("edit-{}", v)).unwrap();
            device_b.force_save(&room_doc()).await.unwrap();
        }
        assert!(store.delete("u1", &room_doc()).await.unwrap());
        next_matching(&mut events, |e| matches!(e, SyncEvent::RemoteDeleted { .. })).await;

        room_b.set(json!({"v": 3}));
        device_b.mark_changed(&room_doc(), "recreate").unwrap();
        let outcome = device_b.force_save(&room_doc()).await.unwrap();
        let SaveOutcome::Saved(receipt) = outcome else {
            panic!("expected a save, got {:?}", outcome);
        };
        assert_eq!(receipt.version, 4);

        let applied = next_matching(&mut events, |e| matches!(e, SyncEvent::RemoteApplied { .. })).await;
        assert!(matches!(applied, SyncEvent::RemoteApplied { version: 4, .. }));
        assert_eq!(room_a.get(), json!({"v": 3}));
        assert_eq!(device_a.status().documents[0].last_known_version, 4);

        device_b.detach().await.unwrap();
        device_a.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_devices_remote_wins() {
        // Device A holds an unsaved edit when device B's save lands.
        let store = Arc::new(MemoryDocumentStore::new());
        let device_a = attach(&store, "u1", ConflictPolicy::RemoteWins);
        let room_a = Arc::new(RoomState::new("room-1"));
        device_a.open_domain(room_doc(), room_a.clone()).await.unwrap();
        device_a.start_sync(&room_doc()).await.unwrap();
        let mut events = device_a.subscribe_events();

        room_a.set(json!({"x": "a"}));
        device_a.mark_changed(&room_doc(), "edit-a").unwrap();

        let b_state = RoomState::snapshot_bytes("room-1", json!({"x": "b"}));
        let ts = chrono::Utc::now().timestamp_millis() + 60_000;
        store.write_from_peer("u1", &room_doc(), &b_state, ts);

        next_matching(&mut events, |e| matches!(e, SyncEvent::ConflictResolved { .. })).await;
        assert_eq!(room_a.get(), json!({"x": "b"}));
        let status = device_a.status();
        assert_eq!(status.documents[0].pending_changes, 0);
        assert_eq!(status.conflicts().count(), 0);

        device_a.stop_sync(&room_doc());
    }

    #[tokio::test]
    async fn test_ask_user_then_keep_local() {
        let store = Arc::new(MemoryDocumentStore::new());
        let session = attach(&store, "u1", ConflictPolicy::AskUser);
        let room = Arc::new(RoomState::new("room-1"));
        session.open_domain(room_doc(), room.clone()).await.unwrap();
        session.start_sync(&room_doc()).await.unwrap();
        let mut events = session.subscribe_events();

        room.set(json!({"x": "mine"}));
        session.mark_changed(&room_doc(), "edit").unwrap();

        let theirs = RoomState::snapshot_bytes("room-1", json!({"x": "theirs"}));
        let ts = chrono::Utc::now().timestamp_millis() + 60_000;
        store.write_from_peer("u1", &room_doc(), &theirs, ts);

        next_matching(&mut events, |e| matches!(e, SyncEvent::Conflict { .. })).await;
        assert!(session.conflict(&room_doc()).is_some());
        assert_eq!(room.get(), json!({"x": "mine"}));

        let outcome = session.resolve_with_local(&room_doc()).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Saved(_)));

        let stored = store.load("u1", &room_doc()).await.unwrap().unwrap();
        assert_eq!(
            stored.payload,
            RoomState::snapshot_bytes("room-1", json!({"x": "mine"}))
        );
        assert!(session.conflict(&room_doc()).is_none());
        session.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_own_save_is_not_a_conflict() {
        let store = Arc::new(MemoryDocumentStore::new());
        let session = attach(&store, "u1", ConflictPolicy::AskUser);
        let room = Arc::new(RoomState::new("room-1"));
        session.open_domain(room_doc(), room.clone()).await.unwrap();
        session.start_sync(&room_doc()).await.unwrap();
        let mut events = session.subscribe_events();

        room.set(json!({"x": 1}));
        session.mark_changed(&room_doc(), "edit").unwrap();
        session.force_save(&room_doc()).await.unwrap();

        // Another edit right after, so a misread echo would raise a conflict.
        session.mark_changed(&room_doc(), "edit-2").unwrap();
        next_matching(&mut events, |e| matches!(e, SyncEvent::SaveResult { .. })).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(session.conflict(&room_doc()).is_none());
        session.scheduler.cancel_all();
        session.stop_sync(&room_doc());
    }
}
