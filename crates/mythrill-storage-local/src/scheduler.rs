use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mythrill_storage_core::{DocumentRef, DocumentStore, SaveReceipt};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::capability::PersistenceCapability;
use crate::config::{DebounceConfig, SyncConfig};
use crate::coordinator::SyncCoordinator;
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::ledger::QuotaEnforcer;
use crate::registry::{Baseline, DomainRegistry, DomainSlot};

/// Result of one save attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(SaveReceipt),
    /// The snapshot matched what the store already holds.
    Unchanged,
    /// Persistence is disabled for this user.
    Skipped,
}

struct PendingTimer {
    generation: u64,
    /// Dropping the sender cancels the timer task.
    _cancel: oneshot::Sender<()>,
}

/// Debounced auto-save for every registered domain of one user.
///
/// Each schedule call restarts the domain's timer; when it fires, the domain is
/// collected, compared against the persisted baseline and written through the
/// quota check. Saves of one domain are serialized by the slot's save lock, so
/// they reach the store in the order they were started.
pub struct AutoSaveScheduler {
    user_id: String,
    capability: PersistenceCapability,
    store: Arc<dyn DocumentStore>,
    registry: Arc<DomainRegistry>,
    coordinator: Arc<SyncCoordinator>,
    quota: Arc<QuotaEnforcer>,
    debounce: DebounceConfig,
    save_timeout: Duration,
    events: EventBus,
    /// Armed timers: document -> pending timer
    timers: DashMap<DocumentRef, PendingTimer>,
    /// Usage owed by saves whose ledger update failed: document -> (bytes, items)
    unbilled: DashMap<DocumentRef, (i64, i64)>,
    generation: AtomicU64,
}

impl std::fmt::Debug for AutoSaveScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSaveScheduler")
            .field("user_id", &self.user_id)
            .field("pending", &self.timers.len())
            .finish_non_exhaustive()
    }
}

impl AutoSaveScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        capability: PersistenceCapability,
        store: Arc<dyn DocumentStore>,
        registry: Arc<DomainRegistry>,
        coordinator: Arc<SyncCoordinator>,
        quota: Arc<QuotaEnforcer>,
        config: &SyncConfig,
        events: EventBus,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            capability,
            store,
            registry,
            coordinator,
            quota,
            debounce: config.debounce.clone(),
            save_timeout: config.save_timeout(),
            events,
            timers: DashMap::new(),
            unbilled: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// (Re)arm the debounce timer of a domain.
    pub fn schedule_auto_save(self: &Arc<Self>, doc: &DocumentRef) -> Result<(), SyncError> {
        if !self.capability.can_persist() {
            return Ok(());
        }
        self.registry.get(doc)?;

        let delay = self.debounce.delay(doc.category);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        // Replacing the entry drops the previous sender, cancelling its timer.
        self.timers.insert(
            doc.clone(),
            PendingTimer {
                generation,
                _cancel: cancel_tx,
            },
        );

        let weak = Arc::downgrade(self);
        let target = doc.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut cancel_rx => return,
            }
            let Some(scheduler) = weak.upgrade() else {
                return;
            };
            if scheduler
                .timers
                .remove_if(&target, |_, timer| timer.generation == generation)
                .is_none()
            {
                return;
            }
            if let Err(e) = scheduler.run_save(&target, false).await {
                debug!("Auto-save of {} did not complete: {}", target, e);
            }
        });

        debug!("Auto-save of {} scheduled in {}ms", doc, delay.as_millis());
        Ok(())
    }

    /// Cancel the pending timer of a domain. Returns whether one was armed.
    pub fn cancel(&self, doc: &DocumentRef) -> bool {
        self.timers.remove(doc).is_some()
    }

    pub fn cancel_all(&self) {
        self.timers.clear();
    }

    pub fn has_pending(&self, doc: &DocumentRef) -> bool {
        self.timers.contains_key(doc)
    }

    pub fn pending_docs(&self) -> Vec<DocumentRef> {
        let mut docs: Vec<DocumentRef> = self.timers.iter().map(|t| t.key().clone()).collect();
        docs.sort();
        docs
    }

    /// Save a domain now, skipping the debounce and the unchanged check.
    pub async fn force_save(&self, doc: &DocumentRef) -> Result<SaveOutcome, SyncError> {
        self.cancel(doc);
        self.run_save(doc, true).await
    }

    /// Save a domain now if its state differs from the persisted baseline.
    pub async fn save_if_changed(&self, doc: &DocumentRef) -> Result<SaveOutcome, SyncError> {
        self.cancel(doc);
        self.run_save(doc, false).await
    }

    #[instrument(skip(self), level = "debug", fields(user_id = %self.user_id))]
    async fn run_save(&self, doc: &DocumentRef, force: bool) -> Result<SaveOutcome, SyncError> {
        if !self.capability.can_persist() {
            return Ok(SaveOutcome::Skipped);
        }
        let slot = self.registry.get(doc)?;

        let result = {
            let _ordered = slot.lock_for_save().await;
            self.save_locked(&slot, force).await
        };

        match &result {
            Ok(SaveOutcome::Saved(_)) => self.events.emit(SyncEvent::SaveResult {
                doc: doc.clone(),
                success: true,
                error: None,
            }),
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to save {} for {}: {}", doc, self.user_id, e);
                self.events.emit(SyncEvent::SaveResult {
                    doc: doc.clone(),
                    success: false,
                    error: Some(e.to_string()),
                });
            }
        }
        result
    }

    async fn save_locked(&self, slot: &DomainSlot, force: bool) -> Result<SaveOutcome, SyncError> {
        let doc = slot.doc();
        if self.coordinator.conflict(doc).is_some() {
            return Err(SyncError::ConflictUnresolved(doc.clone()));
        }

        let watermark = self.coordinator.change_watermark(doc);
        let snapshot = slot.collect()?;
        let baseline = slot.baseline();

        if !force && baseline.digest == Some(snapshot.digest) {
            self.coordinator.discard_changes_through(doc, watermark);
            self.settle_usage(doc, 0, 0).await;
            debug!("{} unchanged since last save", doc);
            return Ok(SaveOutcome::Unchanged);
        }

        let size = match baseline.size_bytes {
            None => {
                self.quota
                    .validate_data_size(&self.user_id, &snapshot.bytes, doc.category)
                    .await?
            }
            Some(previous) => {
                self.quota
                    .validate_replacement(&self.user_id, &snapshot.bytes, doc.category, previous)
                    .await?
            }
        };

        self.coordinator.begin_local_save(doc)?;
        let receipt = match tokio::time::timeout(
            self.save_timeout,
            self.store.save(&self.user_id, doc, &snapshot.bytes),
        )
        .await
        {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                self.coordinator.abort_local_save(doc);
                if e.is_transient() {
                    self.coordinator.set_online(false);
                }
                return Err(e.into());
            }
            Err(_) => {
                self.coordinator.abort_local_save(doc);
                self.coordinator.set_online(false);
                return Err(SyncError::StoreUnavailable(format!(
                    "save of {} timed out after {}ms",
                    doc,
                    self.save_timeout.as_millis()
                )));
            }
        };

        let byte_delta = size as i64 - baseline.size_bytes.unwrap_or(0) as i64;
        self.settle_usage(doc, byte_delta, i64::from(receipt.created)).await;

        slot.set_baseline(Baseline {
            digest: Some(snapshot.digest),
            size_bytes: Some(size),
        });
        self.coordinator.complete_local_save(doc, &receipt, watermark);

        debug!(
            "Saved {} v{} ({} bytes, digest {})",
            doc,
            receipt.version,
            size,
            hex::encode(&snapshot.digest[..6])
        );
        Ok(SaveOutcome::Saved(receipt))
    }
}

impl AutoSaveScheduler {
    /// Owed usage of a domain, as (bytes, items).
    pub fn unbilled_usage(&self, doc: &DocumentRef) -> (i64, i64) {
        self.unbilled.get(doc).map_or((0, 0), |d| *d.value())
    }

    /// Charge the ledger for a save plus whatever earlier saves left unbilled.
    /// Called with the slot's save lock held.
    async fn settle_usage(&self, doc: &DocumentRef, byte_delta: i64, item_delta: i64) {
        let (owed_bytes, owed_items) = self.unbilled.remove(doc).map_or((0, 0), |(_, d)| d);
        let bytes = byte_delta + owed_bytes;
        let items = item_delta + owed_items;
        if bytes == 0 && items == 0 {
            return;
        }

        match self
            .quota
            .record_usage_change(&self.user_id, doc.category, bytes, items)
            .await
        {
            Ok(_) if owed_bytes != 0 || owed_items != 0 => {
                info!("Billed {} bytes, {} items carried over for {}", owed_bytes, owed_items, doc);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "Could not record usage of {} ({:+} bytes, {:+} items), retrying on next save: {}",
                    doc, bytes, items, e
                );
                self.unbilled.insert(doc.clone(), (bytes, items));
                self.events.emit(SyncEvent::UsageDeferred {
                    doc: doc.clone(),
                    byte_delta: bytes,
                    item_delta: items,
                    error: e.to_string(),
                });
            }
        }
    }
}

impl Drop for AutoSaveScheduler {
    fn drop(&mut self) {
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::RoomState;
    use crate::store::MemoryDocumentStore;
    use mythrill_storage_core::{AccountStore, Category, StorageLedger, TierTable};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: Arc<MemoryDocumentStore>,
        room: Arc<RoomState>,
        coordinator: Arc<SyncCoordinator>,
        quota: Arc<QuotaEnforcer>,
        scheduler: Arc<AutoSaveScheduler>,
        registry: Arc<DomainRegistry>,
        events: EventBus,
        doc: DocumentRef,
    }

    fn setup_with(user_id: &str, config: SyncConfig) -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = Arc::new(DomainRegistry::new());
        let events = EventBus::default();
        let room = Arc::new(RoomState::new("room-1"));
        let doc = DocumentRef::new(Category::Rooms, "room-1");
        registry.register(doc.clone(), room.clone());

        let capability = PersistenceCapability::resolve(user_id);
        let coordinator = Arc::new(SyncCoordinator::new(
            user_id,
            capability,
            store.clone(),
            registry.clone(),
            &config,
            events.clone(),
        ));
        let quota = Arc::new(QuotaEnforcer::new(store.clone(), TierTable::default()));
        let scheduler = Arc::new(AutoSaveScheduler::new(
            user_id,
            capability,
            store.clone(),
            registry.clone(),
            coordinator.clone(),
            quota.clone(),
            &config,
            events.clone(),
        ));
        Fixture {
            store,
            room,
            coordinator,
            quota,
            scheduler,
            registry,
            events,
            doc,
        }
    }

    fn setup() -> Fixture {
        let config = SyncConfig {
            debounce: DebounceConfig::uniform(3_000),
            ..SyncConfig::default()
        };
        setup_with("user-a", config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_restarts_on_each_edit() {
        let f = setup();

        f.room.set(json!({"tokens": 1}));
        f.scheduler.schedule_auto_save(&f.doc).unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        f.room.set(json!({"tokens": 2}));
        f.scheduler.schedule_auto_save(&f.doc).unwrap();

        // The first timer would have fired at 3s; it was restarted at 1s.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(f.store.save_count(), 0);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(f.store.save_count(), 1);
        assert!(!f.scheduler.has_pending(&f.doc));

        let stored = f.store.load("user-a", &f.doc).await.unwrap().unwrap();
        assert_eq!(
            stored.payload,
            RoomState::snapshot_bytes("room-1", json!({"tokens": 2}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_updates_ledger_and_baseline() {
        let f = setup();
        f.room.set(json!({"map": "cave"}));

        let outcome = f.scheduler.force_save(&f.doc).await.unwrap();
        let SaveOutcome::Saved(receipt) = outcome else {
            panic!("expected a save, got {:?}", outcome);
        };
        assert!(receipt.created);

        let size = RoomState::snapshot_bytes("room-1", json!({"map": "cave"})).len() as u64;
        let usage = f.quota.get_storage_usage("user-a").await;
        assert_eq!(usage.bytes(Category::Rooms), size);
        assert_eq!(usage.items(Category::Rooms), 1);

        // Same state again is not rewritten.
        assert_eq!(
            f.scheduler.save_if_changed(&f.doc).await.unwrap(),
            SaveOutcome::Unchanged
        );
        assert_eq!(f.store.save_count(), 1);

        f.room.set(json!({"map": "cave", "fog": true}));
        f.scheduler.save_if_changed(&f.doc).await.unwrap();
        let grown = f.quota.get_storage_usage("user-a").await;
        assert_eq!(grown.items(Category::Rooms), 1);
        assert!(grown.bytes(Category::Rooms) > size);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_save_clears_pending_changes() {
        let f = setup();
        f.scheduler.force_save(&f.doc).await.unwrap();

        f.coordinator.mark_local_change(&f.doc, "noop");
        f.scheduler.schedule_auto_save(&f.doc).unwrap();
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        assert_eq!(f.store.save_count(), 1);
        assert!(!f.coordinator.has_pending_changes(&f.doc));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialization_failure_is_isolated() {
        let f = setup();
        let journal = Arc::new(RoomState::new("room-2"));
        let other = DocumentRef::new(Category::Rooms, "room-2");
        f.registry.register(other.clone(), journal.clone());
        let mut rx = f.events.subscribe();

        f.room.fail_collect.store(true, Ordering::SeqCst);
        f.coordinator.mark_local_change(&f.doc, "edit");
        let err = f.scheduler.force_save(&f.doc).await.unwrap_err();
        assert!(matches!(err, SyncError::Serialization(_)));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncEvent::SaveResult { success: false, .. }
        ));
        assert!(f.coordinator.has_pending_changes(&f.doc));

        journal.set(json!({"ok": true}));
        assert!(matches!(
            f.scheduler.force_save(&other).await.unwrap(),
            SaveOutcome::Saved(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_save_keeps_changes() {
        let f = setup();
        f.store.set_offline(true);
        f.room.set(json!({"hp": 3}));
        f.coordinator.mark_local_change(&f.doc, "damage");

        let err = f.scheduler.force_save(&f.doc).await.unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable(_)));
        assert!(f.coordinator.has_pending_changes(&f.doc));
        assert!(!f.coordinator.is_online());

        f.store.set_offline(false);
        assert!(matches!(
            f.scheduler.force_save(&f.doc).await.unwrap(),
            SaveOutcome::Saved(_)
        ));
        assert!(!f.coordinator.has_pending_changes(&f.doc));
        assert!(f.coordinator.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_save_times_out() {
        let f = setup();
        f.store.set_save_delay(Some(Duration::from_secs(30)));
        f.room.set(json!({"slow": true}));

        let err = f.scheduler.force_save(&f.doc).await.unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable(_)));
        assert_eq!(f.store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_refusal_does_not_write() {
        let f = setup();
        let mut usage = StorageLedger::empty();
        usage.apply(Category::Journals, (50 * 1024 * 1024) as i64, 0);
        f.store.save_usage("user-a", &usage).await.unwrap();
        f.room.set(json!({"big": true}));

        let err = f.scheduler.force_save(&f.doc).await.unwrap_err();
        assert!(matches!(err, SyncError::QuotaExceeded { .. }));
        assert_eq!(f.store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicted_domain_is_not_saved() {
        let config = SyncConfig {
            debounce: DebounceConfig::uniform(3_000),
            ..SyncConfig::default()
        }
        .with_policy(crate::config::ConflictPolicy::AskUser);
        let f = setup_with("user-a", config);
        f.coordinator.note_loaded(&f.doc, 1, 1_000);
        f.coordinator.mark_local_change(&f.doc, "edit");
        f.coordinator
            .handle_remote_update(mythrill_storage_core::RemoteChange {
                doc: f.doc.clone(),
                payload: Some(RoomState::snapshot_bytes("room-1", json!({"peer": 1}))),
                version: 2,
                server_timestamp: 50_000,
            });

        let err = f.scheduler.force_save(&f.doc).await.unwrap_err();
        assert!(matches!(err, SyncError::ConflictUnresolved(_)));
        assert!(err.is_retryable());
        assert_eq!(f.store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_never_saves() {
        let f = setup_with("guest-7", SyncConfig::default());
        f.room.set(json!({"x": 1}));
        f.scheduler.schedule_auto_save(&f.doc).unwrap();
        assert!(!f.scheduler.has_pending(&f.doc));
        assert_eq!(
            f.scheduler.force_save(&f.doc).await.unwrap(),
            SaveOutcome::Skipped
        );
        assert_eq!(f.store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_usage_write_is_billed_later() {
        let f = setup();
        let mut rx = f.events.subscribe();
        f.store.set_usage_writes_failing(true);
        f.room.set(json!({"map": "cave"}));
        let size = RoomState::snapshot_bytes("room-1", json!({"map": "cave"})).len() as i64;

        let outcome = f.scheduler.force_save(&f.doc).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Saved(r) if r.created));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SyncEvent::UsageDeferred { byte_delta, item_delta: 1, .. } if byte_delta == size
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SyncEvent::SaveResult { success: true, .. }
        ));
        assert_eq!(f.quota.get_storage_usage("user-a").await.total_bytes, 0);
        assert_eq!(f.scheduler.unbilled_usage(&f.doc), (size, 1));

        // Still failing: the next save adds its own growth to what is owed.
        f.room.set(json!({"map": "cave", "fog": true}));
        let grown = RoomState::snapshot_bytes("room-1", json!({"map": "cave", "fog": true})).len() as i64;
        f.scheduler.save_if_changed(&f.doc).await.unwrap();
        assert_eq!(f.scheduler.unbilled_usage(&f.doc), (grown, 1));

        // Once writes recover, even an unchanged pass settles the debt.
        f.store.set_usage_writes_failing(false);
        assert_eq!(
            f.scheduler.save_if_changed(&f.doc).await.unwrap(),
            SaveOutcome::Unchanged
        );
        let usage = f.quota.get_storage_usage("user-a").await;
        assert_eq!(usage.bytes(Category::Rooms), grown as u64);
        assert_eq!(usage.items(Category::Rooms), 1);
        assert_eq!(f.scheduler.unbilled_usage(&f.doc), (0, 0));
        assert_eq!(f.store.save_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_domains_debounce_independently() {
        let f = setup();
        f.store.save_tier("user-a", "premium").await.unwrap();
        let second = Arc::new(RoomState::new("room-2"));
        let other = DocumentRef::new(Category::Rooms, "room-2");
        f.registry.register(other.clone(), second.clone());

        f.room.set(json!({"first": true}));
        f.scheduler.schedule_auto_save(&f.doc).unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        second.set(json!({"second": true}));
        f.scheduler.schedule_auto_save(&other).unwrap();
        assert_eq!(f.scheduler.pending_docs(), vec![f.doc.clone(), other.clone()]);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(f.store.load("user-a", &f.doc).await.unwrap().is_some());
        assert!(f.store.load("user-a", &other).await.unwrap().is_none());
        assert_eq!(f.scheduler.pending_docs(), vec![other.clone()]);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let stored = f.store.load("user-a", &other).await.unwrap().unwrap();
        assert_eq!(
            stored.payload,
            RoomState::snapshot_bytes("room-2", json!({"second": true}))
        );
        assert_eq!(f.store.save_count(), 2);
        assert_eq!(f.quota.get_storage_usage("user-a").await.items(Category::Rooms), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_timer() {
        let f = setup();
        f.room.set(json!({"x": 1}));
        f.scheduler.schedule_auto_save(&f.doc).unwrap();
        assert!(f.scheduler.cancel(&f.doc));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.store.save_count(), 0);
    }
}
