use mythrill_storage_core::DocumentRef;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Which side won a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Remote,
    Local,
}

/// Competing remote write held while local edits are pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictDescriptor {
    pub doc: DocumentRef,
    #[serde(skip)]
    pub remote_payload: Vec<u8>,
    pub remote_version: u64,
    pub remote_timestamp: i64,
    /// Server timestamp of our last successful save, if any.
    pub local_timestamp: Option<i64>,
    /// Local edits made since that save.
    pub pending_changes: usize,
}

/// Events published by a persistence session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectionChanged {
        doc: DocumentRef,
        connected: bool,
    },
    Conflict {
        conflict: ConflictDescriptor,
    },
    ConflictResolved {
        doc: DocumentRef,
        resolution: Resolution,
    },
    RemoteApplied {
        doc: DocumentRef,
        version: u64,
        server_timestamp: i64,
    },
    RemoteDeleted {
        doc: DocumentRef,
    },
    SaveResult {
        doc: DocumentRef,
        success: bool,
        error: Option<String>,
    },
    /// A save landed but the usage ledger could not be charged. The amount is
    /// carried over and billed by the domain's next save.
    UsageDeferred {
        doc: DocumentRef,
        byte_delta: i64,
        item_delta: i64,
        error: String,
    },
}

impl SyncEvent {
    pub fn doc(&self) -> &DocumentRef {
        match self {
            SyncEvent::ConnectionChanged { doc, .. }
            | SyncEvent::ConflictResolved { doc, .. }
            | SyncEvent::RemoteApplied { doc, .. }
            | SyncEvent::RemoteDeleted { doc }
            | SyncEvent::SaveResult { doc, .. }
            | SyncEvent::UsageDeferred { doc, .. } => doc,
            SyncEvent::Conflict { conflict } => &conflict.doc,
        }
    }
}

/// Fan-out of [`SyncEvent`]s to any number of listeners.
///
/// Publishing never blocks; listeners that fall behind lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        trace!("event: {:?}", event);
        // No listeners is not an error.
        let _ = self.tx.send(event);
    }
}
