use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::usage::Category;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Subscription level that defines storage quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageTier {
    Guest,
    Free,
    Subscriber,
    Premium,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Guest => "GUEST",
            StorageTier::Free => "FREE",
            StorageTier::Subscriber => "SUBSCRIBER",
            StorageTier::Premium => "PREMIUM",
        }
    }

    /// Parse a stored tier assignment. Matching is case-insensitive.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GUEST" => Some(StorageTier::Guest),
            "FREE" => Some(StorageTier::Free),
            "SUBSCRIBER" => Some(StorageTier::Subscriber),
            "PREMIUM" => Some(StorageTier::Premium),
            _ => None,
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota attached to a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub total_bytes: u64,
    /// Maximum number of documents per category. Categories absent here are unbounded.
    #[serde(default)]
    pub item_limits: BTreeMap<Category, u64>,
}

impl TierLimits {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            item_limits: BTreeMap::new(),
        }
    }

    pub fn with_item_limit(mut self, category: Category, limit: u64) -> Self {
        self.item_limits.insert(category, limit);
        self
    }

    pub fn item_limit(&self, category: Category) -> Option<u64> {
        self.item_limits.get(&category).copied()
    }

    /// Zero-byte tiers cannot persist anything at all.
    pub fn allows_persistence(&self) -> bool {
        self.total_bytes > 0
    }
}

/// Immutable tier configuration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    pub guest: TierLimits,
    pub free: TierLimits,
    pub subscriber: TierLimits,
    pub premium: TierLimits,
}

impl TierTable {
    pub fn limits(&self, tier: StorageTier) -> &TierLimits {
        match tier {
            StorageTier::Guest => &self.guest,
            StorageTier::Free => &self.free,
            StorageTier::Subscriber => &self.subscriber,
            StorageTier::Premium => &self.premium,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            guest: TierLimits::new(0),
            free: TierLimits::new(50 * MB)
                .with_item_limit(Category::Characters, 50)
                .with_item_limit(Category::Campaigns, 1)
                .with_item_limit(Category::Rooms, 1),
            subscriber: TierLimits::new(500 * MB)
                .with_item_limit(Category::Characters, 6)
                .with_item_limit(Category::Campaigns, 5)
                .with_item_limit(Category::Rooms, 5),
            premium: TierLimits::new(2 * GB)
                .with_item_limit(Category::Characters, 24)
                .with_item_limit(Category::Campaigns, 20)
                .with_item_limit(Category::Rooms, 20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(StorageTier::parse("premium"), Some(StorageTier::Premium));
        assert_eq!(StorageTier::parse(" Subscriber "), Some(StorageTier::Subscriber));
        assert_eq!(StorageTier::parse("platinum"), None);
    }

    #[test]
    fn test_default_table() {
        let table = TierTable::default();
        assert!(!table.limits(StorageTier::Guest).allows_persistence());
        assert_eq!(table.limits(StorageTier::Free).total_bytes, 50 * 1024 * 1024);
        assert_eq!(table.limits(StorageTier::Free).item_limit(Category::Rooms), Some(1));
        assert_eq!(table.limits(StorageTier::Premium).item_limit(Category::Journals), None);
    }
}
