use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use mythrill_storage_core::{DocumentRef, DocumentStore, RemoteChange, SaveReceipt, StoreError};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capability::PersistenceCapability;
use crate::config::{ConflictPolicy, SyncConfig};
use crate::error::SyncError;
use crate::events::{ConflictDescriptor, EventBus, Resolution, SyncEvent};
use crate::registry::{Baseline, DomainRegistry};

/// Connection state of one document's subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// What the coordinator did with one remote notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Our own save reflected back by the store.
    SelfEcho,
    /// Not newer than what this client already knows.
    Stale,
    /// Held until the in-flight save settles.
    Queued,
    /// No local edits were pending; the remote state was adopted.
    Applied,
    /// The document was deleted remotely.
    Deleted,
    /// Conflict resolved by adopting the remote state.
    AdoptedRemote,
    /// Conflict resolved by keeping local edits.
    KeptLocal,
    /// Conflict held for the caller.
    AwaitingResolution,
    /// No session, or the payload could not be applied.
    Ignored,
}

/// Point-in-time view of one document's sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSyncStatus {
    pub doc: DocumentRef,
    pub connection: ConnectionState,
    pub pending_changes: usize,
    pub last_local_save_timestamp: Option<i64>,
    pub last_remote_timestamp: Option<i64>,
    pub last_known_version: u64,
    pub conflicted: bool,
    pub save_in_flight: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    connection: ConnectionState,
    last_remote_timestamp: Option<i64>,
    last_local_save_timestamp: Option<i64>,
    last_known_version: u64,
    /// Local edits since the last save: sequence -> change id
    changes: BTreeMap<u64, String>,
    next_seq: u64,
    conflict: Option<ConflictDescriptor>,
    save_in_flight: bool,
    /// Remote notifications that arrived during a save.
    deferred: VecDeque<RemoteChange>,
}

struct SyncSession {
    doc: DocumentRef,
    state: Mutex<SessionState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    fn new(doc: DocumentRef) -> Self {
        Self {
            doc,
            state: Mutex::new(SessionState::default()),
            listener: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_listener(&self) -> Option<JoinHandle<()>> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn has_listener(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

/// Sync coordinator for one user.
///
/// Tracks, per document, the subscription, the local changes made since the
/// last save and any pending conflict. Remote notifications are classified as
/// self-echo, stale, clean (adopted) or conflicting; conflicts are settled by
/// the configured [`ConflictPolicy`].
///
/// Session state is guarded by a plain mutex that is never held across an
/// await point.
pub struct SyncCoordinator {
    user_id: String,
    capability: PersistenceCapability,
    store: Arc<dyn DocumentStore>,
    registry: Arc<DomainRegistry>,
    policy: ConflictPolicy,
    echo_epsilon_ms: i64,
    probe_timeout: Duration,
    events: EventBus,
    online: AtomicBool,
    sessions: DashMap<DocumentRef, Arc<SyncSession>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("user_id", &self.user_id)
            .field("policy", &self.policy)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    pub fn new(
        user_id: impl Into<String>,
        capability: PersistenceCapability,
        store: Arc<dyn DocumentStore>,
        registry: Arc<DomainRegistry>,
        config: &SyncConfig,
        events: EventBus,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            capability,
            store,
            registry,
            policy: config.conflict_policy,
            echo_epsilon_ms: config.echo_epsilon_ms,
            probe_timeout: config.probe_timeout(),
            events,
            online: AtomicBool::new(true),
            sessions: DashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn session(&self, doc: &DocumentRef) -> Arc<SyncSession> {
        self.sessions
            .entry(doc.clone())
            .or_insert_with(|| Arc::new(SyncSession::new(doc.clone())))
            .value()
            .clone()
    }

    fn existing(&self, doc: &DocumentRef) -> Option<Arc<SyncSession>> {
        self.sessions.get(doc).map(|s| s.value().clone())
    }

    // =========================================================================
    // Connectivity
    // =========================================================================

    /// Probe the store with a bounded timeout and record the result.
    pub async fn probe(&self) -> bool {
        let online = match tokio::time::timeout(self.probe_timeout, self.store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Store probe failed: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    "Store probe timed out after {}ms",
                    self.probe_timeout.as_millis()
                );
                false
            }
        };
        self.set_online(online);
        online
    }

    /// Flip the online flag, updating every subscribed document.
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        info!(
            "Store for {} is now {}",
            self.user_id,
            if online { "online" } else { "offline" }
        );

        let target = if online {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        for entry in self.sessions.iter() {
            let session = entry.value();
            if online && !session.has_listener() {
                continue;
            }
            let changed = {
                let mut state = session.lock();
                let changed = state.connection != target;
                state.connection = target;
                changed
            };
            if changed {
                self.events.emit(SyncEvent::ConnectionChanged {
                    doc: session.doc.clone(),
                    connected: online,
                });
            }
        }
    }

    fn set_connection(&self, session: &SyncSession, connection: ConnectionState) {
        let changed = {
            let mut state = session.lock();
            let changed = state.connection != connection;
            state.connection = connection;
            changed
        };
        if changed {
            self.events.emit(SyncEvent::ConnectionChanged {
                doc: session.doc.clone(),
                connected: connection == ConnectionState::Connected,
            });
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe to remote changes of `doc`.
    ///
    /// An unreachable store leaves the document `Disconnected` without failing.
    #[instrument(skip(self), level = "debug", fields(user_id = %self.user_id))]
    pub async fn start_sync(self: &Arc<Self>, doc: &DocumentRef) -> Result<ConnectionState, SyncError> {
        if !self.capability.can_persist() {
            debug!("Persistence disabled for {}, not syncing {}", self.user_id, doc);
            return Ok(ConnectionState::Disconnected);
        }

        let session = self.session(doc);
        if session.has_listener() {
            return Ok(session.lock().connection);
        }

        if !self.probe().await {
            self.set_connection(&session, ConnectionState::Disconnected);
            return Ok(ConnectionState::Disconnected);
        }

        let mut subscription = match self.store.subscribe(&self.user_id, doc).await {
            Ok(subscription) => subscription,
            Err(StoreError::PermissionDenied(msg)) => {
                debug!("Subscription to {} refused: {}", doc, msg);
                self.set_connection(&session, ConnectionState::Disconnected);
                return Ok(ConnectionState::Disconnected);
            }
            Err(e) if e.is_transient() => {
                warn!("Could not subscribe to {}: {}", doc, e);
                self.set_online(false);
                self.set_connection(&session, ConnectionState::Disconnected);
                return Ok(ConnectionState::Disconnected);
            }
            Err(e) => return Err(e.into()),
        };

        let weak = Arc::downgrade(self);
        let listened = doc.clone();
        let handle = tokio::spawn(async move {
            while let Some(change) = subscription.next_change().await {
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                coordinator.handle_remote_update(change);
            }
            subscription.unsubscribe();
            debug!("Subscription to {} closed", listened);
        });

        if let Some(previous) = session
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            previous.abort();
        }
        self.set_connection(&session, ConnectionState::Connected);
        info!("Started sync of {} for {}", doc, self.user_id);
        Ok(ConnectionState::Connected)
    }

    /// Cancel the subscription of `doc`. Safe to call repeatedly.
    pub fn stop_sync(&self, doc: &DocumentRef) {
        let Some(session) = self.existing(doc) else {
            return;
        };
        if let Some(handle) = session.take_listener() {
            handle.abort();
            debug!("Stopped sync of {}", doc);
        }
        self.set_connection(&session, ConnectionState::Disconnected);
    }

    pub fn stop_all(&self) {
        let docs: Vec<DocumentRef> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for doc in docs {
            self.stop_sync(&doc);
        }
    }

    // =========================================================================
    // Local change bookkeeping
    // =========================================================================

    /// Record a local edit. Returns its sequence number, or 0 for users
    /// without persistent storage, whose edits are never tracked.
    pub fn mark_local_change(&self, doc: &DocumentRef, change_id: impl Into<String>) -> u64 {
        if !self.capability.can_persist() {
            return 0;
        }
        let session = self.session(doc);
        let mut state = session.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.changes.insert(seq, change_id.into());
        seq
    }

    /// Sequence number of the newest recorded local edit.
    pub fn change_watermark(&self, doc: &DocumentRef) -> u64 {
        self.existing(doc).map_or(0, |s| s.lock().next_seq)
    }

    pub fn has_pending_changes(&self, doc: &DocumentRef) -> bool {
        self.existing(doc)
            .is_some_and(|s| !s.lock().changes.is_empty())
    }

    /// Drop edits up to `watermark` whose state turned out to be persisted already.
    pub fn discard_changes_through(&self, doc: &DocumentRef, watermark: u64) {
        if let Some(session) = self.existing(doc) {
            let mut state = session.lock();
            state.changes.retain(|seq, _| *seq > watermark);
        }
    }

    /// Mark a save as started. Fails while a conflict is pending.
    pub fn begin_local_save(&self, doc: &DocumentRef) -> Result<(), SyncError> {
        let session = self.session(doc);
        let mut state = session.lock();
        if state.conflict.is_some() {
            return Err(SyncError::ConflictUnresolved(doc.clone()));
        }
        state.save_in_flight = true;
        Ok(())
    }

    /// Record a completed save, clearing edits up to `watermark`.
    pub fn complete_local_save(&self, doc: &DocumentRef, receipt: &SaveReceipt, watermark: u64) {
        let session = self.session(doc);
        {
            let mut state = session.lock();
            state.changes.retain(|seq, _| *seq > watermark);
            state.last_local_save_timestamp = Some(receipt.server_timestamp);
            state.last_known_version = state.last_known_version.max(receipt.version);
            state.conflict = None;
            state.save_in_flight = false;
        }
        debug!(
            "Marked local save of {} at {} (v{})",
            doc, receipt.server_timestamp, receipt.version
        );
        self.set_online(true);
        self.drain_deferred(&session);
    }

    /// Record a save performed outside the scheduler: all edits are persisted.
    pub fn mark_local_save(&self, doc: &DocumentRef, server_timestamp: i64) {
        let watermark = self.change_watermark(doc);
        let version = self.existing(doc).map_or(0, |s| s.lock().last_known_version);
        let receipt = SaveReceipt {
            server_timestamp,
            version,
            created: false,
        };
        self.complete_local_save(doc, &receipt, watermark);
    }

    /// Record a failed save; pending edits are kept.
    pub fn abort_local_save(&self, doc: &DocumentRef) {
        let session = self.session(doc);
        session.lock().save_in_flight = false;
        self.drain_deferred(&session);
    }

    fn drain_deferred(&self, session: &SyncSession) {
        loop {
            let state = session.lock();
            if state.save_in_flight || state.deferred.is_empty() {
                return;
            }
            self.evaluate(session, state);
        }
    }

    // =========================================================================
    // Remote updates
    // =========================================================================

    /// Classify and act on one remote notification.
    pub fn handle_remote_update(&self, change: RemoteChange) -> RemoteOutcome {
        let Some(session) = self.existing(&change.doc) else {
            debug!("Ignoring change to {}: no session", change.doc);
            return RemoteOutcome::Ignored;
        };
        let mut state = session.lock();
        state.deferred.push_back(change);
        if state.save_in_flight {
            return RemoteOutcome::Queued;
        }
        self.evaluate(&session, state)
    }

    /// Process the oldest deferred change. The guard is released before any
    /// collector callback runs.
    fn evaluate(&self, session: &SyncSession, mut state: MutexGuard<'_, SessionState>) -> RemoteOutcome {
        let Some(change) = state.deferred.pop_front() else {
            return RemoteOutcome::Ignored;
        };
        let doc = &session.doc;

        if let Some(local) = state.last_local_save_timestamp {
            if (change.server_timestamp - local).abs() < self.echo_epsilon_ms {
                state.last_known_version = state.last_known_version.max(change.version);
                debug!("Ignoring self-echo on {} at {}", doc, change.server_timestamp);
                return RemoteOutcome::SelfEcho;
            }
        }

        if change.version <= state.last_known_version {
            debug!(
                "Ignoring stale change to {} (v{} <= v{})",
                doc, change.version, state.last_known_version
            );
            return RemoteOutcome::Stale;
        }
        state.last_known_version = change.version;
        state.last_remote_timestamp = Some(change.server_timestamp);

        let Some(payload) = change.payload else {
            drop(state);
            if let Ok(slot) = self.registry.get(doc) {
                slot.set_baseline(Baseline::default());
            }
            info!("{} was deleted remotely", doc);
            self.events.emit(SyncEvent::RemoteDeleted { doc: doc.clone() });
            return RemoteOutcome::Deleted;
        };

        if state.changes.is_empty() && state.conflict.is_none() {
            drop(state);
            return if self.apply_payload(doc, &payload, change.version, change.server_timestamp) {
                RemoteOutcome::Applied
            } else {
                RemoteOutcome::Ignored
            };
        }

        let conflict = ConflictDescriptor {
            doc: doc.clone(),
            remote_payload: payload,
            remote_version: change.version,
            remote_timestamp: change.server_timestamp,
            local_timestamp: state.last_local_save_timestamp,
            pending_changes: state.changes.len(),
        };
        info!(
            "Conflict on {}: remote v{} vs {} local change(s), policy {}",
            doc, conflict.remote_version, conflict.pending_changes, self.policy
        );
        self.events.emit(SyncEvent::Conflict {
            conflict: conflict.clone(),
        });

        match self.policy {
            ConflictPolicy::RemoteWins => {
                state.changes.clear();
                state.conflict = None;
                drop(state);
                self.apply_payload(
                    doc,
                    &conflict.remote_payload,
                    conflict.remote_version,
                    conflict.remote_timestamp,
                );
                self.events.emit(SyncEvent::ConflictResolved {
                    doc: doc.clone(),
                    resolution: Resolution::Remote,
                });
                RemoteOutcome::AdoptedRemote
            }
            ConflictPolicy::LocalWins => {
                state.conflict = None;
                drop(state);
                self.events.emit(SyncEvent::ConflictResolved {
                    doc: doc.clone(),
                    resolution: Resolution::Local,
                });
                RemoteOutcome::KeptLocal
            }
            ConflictPolicy::AskUser => {
                state.conflict = Some(conflict);
                RemoteOutcome::AwaitingResolution
            }
        }
    }

    fn apply_payload(&self, doc: &DocumentRef, payload: &[u8], version: u64, server_timestamp: i64) -> bool {
        let slot = match self.registry.get(doc) {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Cannot apply remote state: {}", e);
                return false;
            }
        };
        if let Err(e) = slot.apply_remote(payload) {
            warn!("Failed to apply remote state to {}: {}", doc, e);
            return false;
        }
        self.events.emit(SyncEvent::RemoteApplied {
            doc: doc.clone(),
            version,
            server_timestamp,
        });
        true
    }

    // =========================================================================
    // Conflict resolution
    // =========================================================================

    pub fn conflict(&self, doc: &DocumentRef) -> Option<ConflictDescriptor> {
        self.existing(doc).and_then(|s| s.lock().conflict.clone())
    }

    /// Adopt the pending remote state, dropping local edits.
    pub fn resolve_with_remote(&self, doc: &DocumentRef) -> Result<(), SyncError> {
        let session = self
            .existing(doc)
            .ok_or_else(|| SyncError::NoConflict(doc.clone()))?;
        let conflict = {
            let mut state = session.lock();
            let conflict = state
                .conflict
                .take()
                .ok_or_else(|| SyncError::NoConflict(doc.clone()))?;
            state.changes.clear();
            conflict
        };

        self.apply_payload(
            doc,
            &conflict.remote_payload,
            conflict.remote_version,
            conflict.remote_timestamp,
        );
        self.events.emit(SyncEvent::ConflictResolved {
            doc: doc.clone(),
            resolution: Resolution::Remote,
        });
        info!("Resolved conflict on {} with remote state", doc);
        Ok(())
    }

    /// Keep local edits. The caller re-saves to overwrite the remote.
    pub fn resolve_with_local(&self, doc: &DocumentRef) -> Result<(), SyncError> {
        let session = self
            .existing(doc)
            .ok_or_else(|| SyncError::NoConflict(doc.clone()))?;
        if session.lock().conflict.take().is_none() {
            return Err(SyncError::NoConflict(doc.clone()));
        }
        self.events.emit(SyncEvent::ConflictResolved {
            doc: doc.clone(),
            resolution: Resolution::Local,
        });
        info!("Resolved conflict on {} with local state", doc);
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn status(&self, doc: &DocumentRef) -> Option<DocumentSyncStatus> {
        let session = self.existing(doc)?;
        let state = session.lock();
        Some(DocumentSyncStatus {
            doc: doc.clone(),
            connection: state.connection,
            pending_changes: state.changes.len(),
            last_local_save_timestamp: state.last_local_save_timestamp,
            last_remote_timestamp: state.last_remote_timestamp,
            last_known_version: state.last_known_version,
            conflicted: state.conflict.is_some(),
            save_in_flight: state.save_in_flight,
        })
    }

    /// Seed the known version of a document loaded at open time.
    pub fn note_loaded(&self, doc: &DocumentRef, version: u64, server_timestamp: i64) {
        let session = self.session(doc);
        let mut state = session.lock();
        state.last_known_version = state.last_known_version.max(version);
        state.last_remote_timestamp = Some(server_timestamp);
    }

    pub fn docs(&self) -> Vec<DocumentRef> {
        let mut docs: Vec<DocumentRef> = self.sessions.iter().map(|s| s.key().clone()).collect();
        docs.sort();
        docs
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        for entry in self.sessions.iter() {
            if let Some(handle) = entry.value().take_listener() {
                handle.abort();
            }
        }
    }
}
