//! Per-user persistence and synchronization engine for Mythrill.
//!
//! - `ledger`: tier resolution, storage ledger and quota enforcement
//! - `scheduler`: debounced auto-save of registered domains
//! - `coordinator`: live subscriptions, self-echo suppression, conflict policy
//! - `session`: per-user context tying the above together
//! - `store`: in-memory and filesystem `DocumentStore`/`AccountStore` adapters

pub mod capability;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ledger;
pub mod persist;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod store;

pub use capability::PersistenceCapability;
pub use config::{ConflictPolicy, DebounceConfig, SyncConfig};
pub use coordinator::{ConnectionState, DocumentSyncStatus, RemoteOutcome, SyncCoordinator};
pub use error::{QuotaReason, SyncError};
pub use events::{ConflictDescriptor, EventBus, Resolution, SyncEvent};
pub use ledger::{QuotaEnforcer, TierAssignment, WriteRequest};
pub use persist::{
    export_user_data, purge_user_data, remove_document, write_document, PurgeReport,
    UserDataExport,
};
pub use registry::DomainRegistry;
pub use scheduler::{AutoSaveScheduler, SaveOutcome};
pub use session::{PersistenceSession, SessionStatus};
pub use store::{FileDocumentStore, MemoryDocumentStore};
