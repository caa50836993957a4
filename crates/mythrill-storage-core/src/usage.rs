use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage category a document is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Characters,
    Rooms,
    Journals,
    Campaigns,
    /// Per-item custom content (creatures, spells, items, packs).
    Collections,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Characters,
        Category::Rooms,
        Category::Journals,
        Category::Campaigns,
        Category::Collections,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Characters => "characters",
            Category::Rooms => "rooms",
            Category::Journals => "journals",
            Category::Campaigns => "campaigns",
            Category::Collections => "collections",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown storage category '{}'", s))
    }
}

/// Per-user record of bytes and items consumed.
///
/// `total_bytes` always equals the sum of `bytes_by_category`; all mutation goes
/// through [`StorageLedger::apply`], which clamps every counter at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLedger {
    #[serde(default)]
    pub bytes_by_category: BTreeMap<Category, u64>,
    #[serde(default)]
    pub items_by_category: BTreeMap<Category, u64>,
    #[serde(default)]
    pub total_bytes: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for StorageLedger {
    fn default() -> Self {
        Self::empty()
    }
}

impl StorageLedger {
    /// A zeroed ledger, used when a user has never stored anything.
    pub fn empty() -> Self {
        Self {
            bytes_by_category: BTreeMap::new(),
            items_by_category: BTreeMap::new(),
            total_bytes: 0,
            last_updated: Utc::now(),
        }
    }

    pub fn bytes(&self, category: Category) -> u64 {
        self.bytes_by_category.get(&category).copied().unwrap_or(0)
    }

    pub fn items(&self, category: Category) -> u64 {
        self.items_by_category.get(&category).copied().unwrap_or(0)
    }

    /// Apply a signed byte and item delta to one category.
    pub fn apply(&mut self, category: Category, byte_delta: i64, item_delta: i64) {
        let bytes = clamp_add(self.bytes(category), byte_delta);
        self.bytes_by_category.insert(category, bytes);

        if item_delta != 0 || self.items_by_category.contains_key(&category) {
            let items = clamp_add(self.items(category), item_delta);
            self.items_by_category.insert(category, items);
        }

        self.recompute_total();
        self.last_updated = Utc::now();
    }

    /// Restore the `total_bytes == sum(bytes_by_category)` invariant.
    ///
    /// Records written by older clients may carry a total that drifted.
    pub fn recompute_total(&mut self) {
        self.total_bytes = self
            .bytes_by_category
            .values()
            .fold(0u64, |acc, v| acc.saturating_add(*v));
    }
}

fn clamp_add(current: u64, delta: i64) -> u64 {
    if delta >= 0 {
        current.saturating_add(delta as u64)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}
