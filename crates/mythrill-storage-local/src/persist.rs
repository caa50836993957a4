//! Quota-validated document writes outside the auto-save path, plus bulk
//! export and purge of a user's data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mythrill_storage_core::{Category, DocumentRef, DocumentStore, SaveReceipt, StorageLedger};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::capability::PersistenceCapability;
use crate::error::SyncError;
use crate::ledger::QuotaEnforcer;

pub const EXPORT_FORMAT_VERSION: u32 = 1;

fn require_persistence(user_id: &str) -> Result<(), SyncError> {
    if PersistenceCapability::resolve(user_id).can_persist() {
        Ok(())
    } else {
        Err(SyncError::PermissionDenied(format!(
            "{} has no persistent storage",
            user_id
        )))
    }
}

/// Write a payload, charging the ledger for size growth and new documents.
#[instrument(skip(store, quota, payload), level = "debug", fields(payload_len = payload.len()))]
pub async fn write_document(
    store: &dyn DocumentStore,
    quota: &QuotaEnforcer,
    user_id: &str,
    doc: &DocumentRef,
    payload: &[u8],
) -> Result<SaveReceipt, SyncError> {
    require_persistence(user_id)?;

    let previous = store.load(user_id, doc).await?.map(|d| d.size_bytes());
    let size = match previous {
        Some(previous) => {
            quota
                .validate_replacement(user_id, payload, doc.category, previous)
                .await?
        }
        None => quota.validate_data_size(user_id, payload, doc.category).await?,
    };

    let receipt = store.save(user_id, doc, payload).await?;
    let byte_delta = size as i64 - previous.unwrap_or(0) as i64;
    quota
        .record_usage_change(user_id, doc.category, byte_delta, i64::from(receipt.created))
        .await?;
    Ok(receipt)
}

/// Delete a document and release its bytes and item slot.
#[instrument(skip(store, quota), level = "debug")]
pub async fn remove_document(
    store: &dyn DocumentStore,
    quota: &QuotaEnforcer,
    user_id: &str,
    doc: &DocumentRef,
) -> Result<bool, SyncError> {
    require_persistence(user_id)?;

    let Some(existing) = store.load(user_id, doc).await? else {
        return Ok(false);
    };
    if !store.delete(user_id, doc).await? {
        return Ok(false);
    }
    quota
        .record_usage_change(user_id, doc.category, -(existing.size_bytes() as i64), -1)
        .await?;
    Ok(true)
}

/// One document in an export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedDocument {
    pub id: String,
    pub version: u64,
    pub server_timestamp: i64,
    pub size_bytes: u64,
    /// Decoded payload; non-JSON payloads are exported as lossy text.
    pub content: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserDataExport {
    pub format_version: u32,
    pub user_id: String,
    pub tier: String,
    pub usage: StorageLedger,
    pub exported_at: DateTime<Utc>,
    pub documents: BTreeMap<Category, Vec<ExportedDocument>>,
}

impl UserDataExport {
    pub fn document_count(&self) -> usize {
        self.documents.values().map(Vec::len).sum()
    }
}

/// Gather every document of a user. Guests have nothing to export.
#[instrument(skip(store, quota), level = "debug")]
pub async fn export_user_data(
    store: &dyn DocumentStore,
    quota: &QuotaEnforcer,
    user_id: &str,
) -> Result<Option<UserDataExport>, SyncError> {
    if !PersistenceCapability::resolve(user_id).can_persist() {
        return Ok(None);
    }

    let mut documents: BTreeMap<Category, Vec<ExportedDocument>> = BTreeMap::new();
    for info in store.list(user_id).await? {
        let Some(document) = store.load(user_id, &info.doc).await? else {
            // Deleted between list and load.
            continue;
        };
        let content = serde_json::from_slice(&document.payload).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&document.payload).into_owned())
        });
        documents
            .entry(info.doc.category)
            .or_default()
            .push(ExportedDocument {
                size_bytes: document.size_bytes(),
                id: document.doc.id,
                version: document.version,
                server_timestamp: document.server_timestamp,
                content,
            });
    }

    let tier = quota.get_user_tier(user_id).await.tier;
    Ok(Some(UserDataExport {
        format_version: EXPORT_FORMAT_VERSION,
        user_id: user_id.to_string(),
        tier: tier.as_str().to_ascii_lowercase(),
        usage: quota.get_storage_usage(user_id).await,
        exported_at: Utc::now(),
        documents,
    }))
}

/// What a purge removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub documents: usize,
    pub bytes: u64,
}

/// Delete every document of a user and zero the ledger.
#[instrument(skip(store, quota), level = "debug")]
pub async fn purge_user_data(
    store: &dyn DocumentStore,
    quota: &QuotaEnforcer,
    user_id: &str,
) -> Result<PurgeReport, SyncError> {
    if !PersistenceCapability::resolve(user_id).can_persist() {
        return Ok(PurgeReport::default());
    }

    let mut report = PurgeReport::default();
    for info in store.list(user_id).await? {
        match store.delete(user_id, &info.doc).await {
            Ok(true) => {
                report.documents += 1;
                report.bytes += info.size_bytes;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to delete {} for {}: {}", info.doc, user_id, e);
                return Err(e.into());
            }
        }
    }
    quota.reset_usage(user_id).await?;

    info!(
        "Purged {} document(s), {} bytes for {}",
        report.documents, report.bytes, user_id
    );
    Ok(report)
}
