use std::sync::Arc;

use dashmap::DashMap;
use mythrill_storage_core::{
    AccountStore, Category, StorageLedger, StorageTier, StoreError, TierLimits, TierTable,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::capability::PersistenceCapability;
use crate::error::{QuotaReason, SyncError};

/// A user's resolved tier and its limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierAssignment {
    pub tier: StorageTier,
    pub limits: TierLimits,
}

/// A prospective write, as seen by the quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub category: Category,
    /// Bytes the write adds on top of current usage.
    pub growth_bytes: u64,
    /// Whether the write creates a new document in `category`.
    pub new_item: bool,
}

/// Storage ledger and quota enforcer.
///
/// Usage is read from and written to the account store. Ledger updates for a
/// user are serialized through a per-user writer lock so concurrent saves from
/// independent domains of the same process never lose an increment.
pub struct QuotaEnforcer {
    accounts: Arc<dyn AccountStore>,
    tiers: TierTable,
    /// Per-user writer locks: user_id -> lock
    writers: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for QuotaEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaEnforcer")
            .field("tiers", &self.tiers)
            .finish_non_exhaustive()
    }
}

impl QuotaEnforcer {
    pub fn new(accounts: Arc<dyn AccountStore>, tiers: TierTable) -> Self {
        Self {
            accounts,
            tiers,
            writers: DashMap::new(),
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    fn assignment(&self, tier: StorageTier) -> TierAssignment {
        TierAssignment {
            tier,
            limits: self.tiers.limits(tier).clone(),
        }
    }

    fn writer(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.writers
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Resolve a user's tier.
    ///
    /// Guests resolve to GUEST; authenticated users without an account or with an
    /// unreadable assignment default to FREE.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_user_tier(&self, user_id: &str) -> TierAssignment {
        if !PersistenceCapability::resolve(user_id).can_persist() {
            return self.assignment(StorageTier::Guest);
        }

        let record = match self.accounts.load_account(user_id).await {
            Ok(record) => record,
            Err(e) => {
                log_read_failure("tier", user_id, &e);
                return self.assignment(StorageTier::Free);
            }
        };

        let tier = record
            .and_then(|r| r.subscription_tier)
            .and_then(|t| {
                let parsed = StorageTier::parse(&t);
                if parsed.is_none() {
                    warn!("Unknown tier '{}' for user {}, using FREE", t, user_id);
                }
                parsed
            })
            .unwrap_or(StorageTier::Free);

        self.assignment(tier)
    }

    /// Current usage for a user, zeroed if nothing has been recorded yet.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_storage_usage(&self, user_id: &str) -> StorageLedger {
        if !PersistenceCapability::resolve(user_id).can_persist() {
            return StorageLedger::empty();
        }

        match self.read_usage(user_id).await {
            Ok(ledger) => ledger,
            Err(e) => {
                log_read_failure("usage", user_id, &e);
                StorageLedger::empty()
            }
        }
    }

    async fn read_usage(&self, user_id: &str) -> Result<StorageLedger, StoreError> {
        let mut ledger = self
            .accounts
            .load_account(user_id)
            .await?
            .and_then(|r| r.storage_usage)
            .unwrap_or_default();
        ledger.recompute_total();
        Ok(ledger)
    }

    /// Check a prospective write against the user's tier.
    pub async fn check_write(&self, user_id: &str, request: WriteRequest) -> Result<(), SyncError> {
        let assignment = self.get_user_tier(user_id).await;
        let limits = &assignment.limits;

        if !limits.allows_persistence() {
            return Err(SyncError::QuotaExceeded {
                category: request.category,
                reason: QuotaReason::NoPersistence,
                current_bytes: 0,
                limit_bytes: 0,
                requested_bytes: request.growth_bytes,
            });
        }

        let usage = self.get_storage_usage(user_id).await;

        if usage.total_bytes.saturating_add(request.growth_bytes) > limits.total_bytes {
            return Err(SyncError::QuotaExceeded {
                category: request.category,
                reason: QuotaReason::TotalBytes,
                current_bytes: usage.total_bytes,
                limit_bytes: limits.total_bytes,
                requested_bytes: request.growth_bytes,
            });
        }

        if request.new_item {
            if let Some(max_items) = limits.item_limit(request.category) {
                if usage.items(request.category) >= max_items {
                    return Err(SyncError::QuotaExceeded {
                        category: request.category,
                        reason: QuotaReason::ItemLimit,
                        current_bytes: usage.total_bytes,
                        limit_bytes: limits.total_bytes,
                        requested_bytes: request.growth_bytes,
                    });
                }
            }
        }

        Ok(())
    }

    /// Whether a new document of `size_bytes` fits in `category`.
    pub async fn can_store_data(&self, user_id: &str, size_bytes: u64, category: Category) -> bool {
        let request = WriteRequest {
            category,
            growth_bytes: size_bytes,
            new_item: true,
        };
        self.check_write(user_id, request).await.is_ok()
    }

    /// Size a payload for a new document and refuse it if it does not fit.
    pub async fn validate_data_size(
        &self,
        user_id: &str,
        payload: &[u8],
        category: Category,
    ) -> Result<u64, SyncError> {
        let size = payload.len() as u64;
        self.check_write(
            user_id,
            WriteRequest {
                category,
                growth_bytes: size,
                new_item: true,
            },
        )
        .await
        .inspect_err(|e| debug!("Refused {} byte {} write for {}: {}", size, category, user_id, e))?;
        Ok(size)
    }

    /// Size a payload replacing an existing document; only growth is charged.
    pub async fn validate_replacement(
        &self,
        user_id: &str,
        payload: &[u8],
        category: Category,
        previous_bytes: u64,
    ) -> Result<u64, SyncError> {
        let size = payload.len() as u64;
        self.check_write(
            user_id,
            WriteRequest {
                category,
                growth_bytes: size.saturating_sub(previous_bytes),
                new_item: false,
            },
        )
        .await
        .inspect_err(|e| debug!("Refused {} byte {} rewrite for {}: {}", size, category, user_id, e))?;
        Ok(size)
    }

    /// Add a signed byte delta to a category, clamped at zero.
    pub async fn update_storage_usage(
        &self,
        user_id: &str,
        category: Category,
        size_delta: i64,
    ) -> Result<StorageLedger, SyncError> {
        self.record_usage_change(user_id, category, size_delta, 0).await
    }

    /// Apply byte and item deltas for a category in one ledger write.
    #[instrument(skip(self), level = "debug")]
    pub async fn record_usage_change(
        &self,
        user_id: &str,
        category: Category,
        byte_delta: i64,
        item_delta: i64,
    ) -> Result<StorageLedger, SyncError> {
        if !PersistenceCapability::resolve(user_id).can_persist() {
            return Ok(StorageLedger::empty());
        }

        let writer = self.writer(user_id);
        let _guard = writer.lock().await;

        let mut ledger = self.read_usage(user_id).await?;
        ledger.apply(category, byte_delta, item_delta);
        self.accounts.save_usage(user_id, &ledger).await?;

        debug!(
            "Usage for {} {}: {:+} bytes, {:+} items -> total {}",
            user_id, category, byte_delta, item_delta, ledger.total_bytes
        );
        Ok(ledger)
    }

    /// Reset a user's ledger to zero.
    pub async fn reset_usage(&self, user_id: &str) -> Result<StorageLedger, SyncError> {
        if !PersistenceCapability::resolve(user_id).can_persist() {
            return Ok(StorageLedger::empty());
        }

        let writer = self.writer(user_id);
        let _guard = writer.lock().await;

        let ledger = StorageLedger::empty();
        self.accounts.save_usage(user_id, &ledger).await?;
        Ok(ledger)
    }

    /// Assign a tier to a user.
    pub async fn set_user_tier(&self, user_id: &str, tier: StorageTier) -> Result<(), SyncError> {
        if !PersistenceCapability::resolve(user_id).can_persist() {
            return Err(SyncError::PermissionDenied(format!(
                "guest user {} cannot hold a tier",
                user_id
            )));
        }
        self.accounts
            .save_tier(user_id, &tier.as_str().to_ascii_lowercase())
            .await?;
        Ok(())
    }
}

fn log_read_failure(what: &str, user_id: &str, err: &StoreError) {
    match err {
        StoreError::PermissionDenied(_) | StoreError::Unavailable(_) | StoreError::Timeout(_) => {
            debug!("Could not read {} for {}: {}", what, user_id, err)
        }
        _ => warn!("Error reading {} for {}: {}", what, user_id, err),
    }
}
