//! Core traits and types for Mythrill per-user persistence.
//!
//! This crate defines the abstractions shared between the sync engine and store adapters:
//! - `DocumentStore`: remote key/value documents with per-document subscriptions
//! - `AccountStore`: tier assignment and storage usage per user
//! - `ChangeCollector`: per-domain snapshot producer/consumer
//! - `StorageTier`/`TierTable`/`StorageLedger`: quota configuration and accounting

mod error;
mod snapshot;
mod store;
mod tier;
mod usage;

pub use error::{CollectError, StoreError};
pub use snapshot::{
    CampaignSnapshot, ChangeCollector, CharacterSnapshot, CollectionSnapshot, DomainSnapshot,
    JournalSnapshot, RoomSnapshot, SnapshotEnvelope, SNAPSHOT_SCHEMA_VERSION,
};
pub use store::{
    AccountRecord, AccountStore, DocumentInfo, DocumentRef, DocumentStore, DocumentSubscription,
    PersistableDocument, RemoteChange, SaveReceipt,
};
pub use tier::{StorageTier, TierLimits, TierTable};
pub use usage::{Category, StorageLedger};
