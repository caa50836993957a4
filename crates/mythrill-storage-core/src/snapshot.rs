use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CollectError;
use crate::usage::Category;

/// Current snapshot envelope schema.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Room state: tokens, grid items, map, combat, chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub state: Value,
}

/// A user's personal journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalSnapshot {
    pub state: Value,
}

/// GM campaign data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub campaign_id: String,
    pub state: Value,
}

/// Character state: resources, inventory, quest progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSnapshot {
    pub character_id: String,
    pub state: Value,
}

/// A per-item collection of custom content (creatures, spells, items).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub collection: String,
    #[serde(default)]
    pub items: BTreeMap<String, Value>,
}

/// Serializable state of one domain at a point in time.
///
/// The engine never looks inside the payloads; it only needs the category and
/// a deterministic byte encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain", rename_all = "snake_case")]
pub enum DomainSnapshot {
    Room(RoomSnapshot),
    Journal(JournalSnapshot),
    Campaign(CampaignSnapshot),
    Character(CharacterSnapshot),
    Collection(CollectionSnapshot),
}

impl DomainSnapshot {
    /// Storage category this snapshot is accounted under.
    pub fn category(&self) -> Category {
        match self {
            DomainSnapshot::Room(_) => Category::Rooms,
            DomainSnapshot::Journal(_) => Category::Journals,
            DomainSnapshot::Campaign(_) => Category::Campaigns,
            DomainSnapshot::Character(_) => Category::Characters,
            DomainSnapshot::Collection(_) => Category::Collections,
        }
    }

    /// Encode inside a versioned envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CollectError> {
        let envelope = SnapshotEnvelopeRef {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            snapshot: self,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decode an envelope written by [`DomainSnapshot::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CollectError> {
        let envelope: SnapshotEnvelope = serde_json::from_slice(bytes)?;
        if envelope.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(CollectError::UnsupportedSchema {
                found: envelope.schema_version,
                supported: SNAPSHOT_SCHEMA_VERSION,
            });
        }
        Ok(envelope.snapshot)
    }
}

/// On-the-wire envelope around a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub schema_version: u32,
    pub snapshot: DomainSnapshot,
}

#[derive(Serialize)]
struct SnapshotEnvelopeRef<'a> {
    schema_version: u32,
    snapshot: &'a DomainSnapshot,
}

/// Produces the current in-memory state of one domain and accepts remote state.
///
/// `collect` must be deterministic: collecting twice without an intervening
/// mutation yields byte-identical encodings.
pub trait ChangeCollector: Send + Sync {
    fn collect(&self) -> Result<DomainSnapshot, CollectError>;

    /// Replace the in-memory state with a snapshot adopted from the store.
    fn apply_remote(&self, snapshot: DomainSnapshot) -> Result<(), CollectError>;
}
