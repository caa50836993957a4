use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use mythrill_storage_core::{ChangeCollector, CollectError, DocumentRef, DomainSnapshot};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::SyncError;

pub type SnapshotDigest = [u8; 32];

pub fn digest(bytes: &[u8]) -> SnapshotDigest {
    Sha256::digest(bytes).into()
}

/// What the store is known to hold for a domain, as last seen by this client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Baseline {
    pub digest: Option<SnapshotDigest>,
    /// Recorded size of the persisted document; `None` if it does not exist yet.
    pub size_bytes: Option<u64>,
}

/// A serialized snapshot ready to be persisted.
#[derive(Debug, Clone)]
pub struct CollectedSnapshot {
    pub bytes: Vec<u8>,
    pub digest: SnapshotDigest,
}

/// One registered domain: its collector, baseline and save ordering lock.
pub struct DomainSlot {
    doc: DocumentRef,
    collector: Arc<dyn ChangeCollector>,
    baseline: Mutex<Baseline>,
    /// Held for the whole save path so saves of one domain never overlap.
    save_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DomainSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainSlot")
            .field("doc", &self.doc)
            .field("baseline", &self.baseline())
            .finish_non_exhaustive()
    }
}

impl DomainSlot {
    pub fn doc(&self) -> &DocumentRef {
        &self.doc
    }

    fn lock_baseline(&self) -> MutexGuard<'_, Baseline> {
        self.baseline.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn baseline(&self) -> Baseline {
        *self.lock_baseline()
    }

    pub fn set_baseline(&self, baseline: Baseline) {
        *self.lock_baseline() = baseline;
    }

    pub(crate) async fn lock_for_save(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.save_lock.lock().await
    }

    /// Collect and encode the domain's current state.
    pub fn collect(&self) -> Result<CollectedSnapshot, SyncError> {
        let snapshot = self.collector.collect()?;
        if snapshot.category() != self.doc.category {
            return Err(CollectError::WrongDomain(format!(
                "{} collector produced a {} snapshot",
                self.doc,
                snapshot.category()
            ))
            .into());
        }
        let bytes = snapshot.to_bytes()?;
        let digest = digest(&bytes);
        Ok(CollectedSnapshot { bytes, digest })
    }

    /// Hand a persisted payload to the collector and adopt it as the baseline.
    pub fn apply_remote(&self, payload: &[u8]) -> Result<(), SyncError> {
        let snapshot = DomainSnapshot::from_bytes(payload)?;
        if snapshot.category() != self.doc.category {
            return Err(CollectError::WrongDomain(format!(
                "{} received a {} snapshot",
                self.doc,
                snapshot.category()
            ))
            .into());
        }
        self.collector.apply_remote(snapshot)?;

        let digest = digest(payload);
        self.set_baseline(Baseline {
            digest: Some(digest),
            size_bytes: Some(payload.len() as u64),
        });
        debug!(
            "Applied remote state to {} ({} bytes, digest {})",
            self.doc,
            payload.len(),
            hex::encode(&digest[..6])
        );
        Ok(())
    }
}

/// Domains registered for one session, keyed by document.
#[derive(Default)]
pub struct DomainRegistry {
    slots: DashMap<DocumentRef, Arc<DomainSlot>>,
}

impl std::fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRegistry")
            .field("domains", &self.slots.len())
            .finish()
    }
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the collector for a document.
    pub fn register(&self, doc: DocumentRef, collector: Arc<dyn ChangeCollector>) -> Arc<DomainSlot> {
        let slot = Arc::new(DomainSlot {
            doc: doc.clone(),
            collector,
            baseline: Mutex::new(Baseline::default()),
            save_lock: tokio::sync::Mutex::new(()),
        });
        self.slots.insert(doc, slot.clone());
        slot
    }

    pub fn unregister(&self, doc: &DocumentRef) -> Option<Arc<DomainSlot>> {
        self.slots.remove(doc).map(|(_, slot)| slot)
    }

    pub fn get(&self, doc: &DocumentRef) -> Result<Arc<DomainSlot>, SyncError> {
        self.slots
            .get(doc)
            .map(|s| s.value().clone())
            .ok_or_else(|| SyncError::UnknownDomain(doc.clone()))
    }

    pub fn docs(&self) -> Vec<DocumentRef> {
        let mut docs: Vec<DocumentRef> = self.slots.iter().map(|s| s.key().clone()).collect();
        docs.sort();
        docs
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use mythrill_storage_core::{ChangeCollector, CollectError, DomainSnapshot, RoomSnapshot};
    use serde_json::{json, Value};

    /// In-memory room domain used across the engine's tests.
    pub struct RoomState {
        pub room_id: String,
        pub state: Mutex<Value>,
        pub fail_collect: AtomicBool,
    }

    impl RoomState {
        pub fn new(room_id: &str) -> Self {
            Self {
                room_id: room_id.to_string(),
                state: Mutex::new(json!({})),
                fail_collect: AtomicBool::new(false),
            }
        }

        pub fn set(&self, value: Value) {
            *self.state.lock().unwrap() = value;
        }

        pub fn get(&self) -> Value {
            self.state.lock().unwrap().clone()
        }

        pub fn snapshot_bytes(room_id: &str, value: Value) -> Vec<u8> {
            DomainSnapshot::Room(RoomSnapshot {
                room_id: room_id.to_string(),
                state: value,
            })
            .to_bytes()
            .unwrap()
        }
    }

    impl ChangeCollector for RoomState {
        fn collect(&self) -> Result<DomainSnapshot, CollectError> {
            if self.fail_collect.load(Ordering::SeqCst) {
                return Err(CollectError::Serialization("non-finite number".into()));
            }
            Ok(DomainSnapshot::Room(RoomSnapshot {
                room_id: self.room_id.clone(),
                state: self.get(),
            }))
        }

        fn apply_remote(&self, snapshot: DomainSnapshot) -> Result<(), CollectError> {
            match snapshot {
                DomainSnapshot::Room(room) => {
                    self.set(room.state);
                    Ok(())
                }
                other => Err(CollectError::WrongDomain(format!("{:?}", other.category()))),
            }
        }
    }
}
