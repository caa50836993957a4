use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mythrill_storage_core::{
    AccountRecord, AccountStore, Category, DocumentInfo, DocumentRef, DocumentStore,
    DocumentSubscription, PersistableDocument, RemoteChange, SaveReceipt, StorageLedger,
    StoreError,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::feed::ChangeFeed;
use super::next_timestamp;

/// Metadata stored beside each payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentMeta {
    owner_id: String,
    doc: DocumentRef,
    version: u64,
    server_timestamp: i64,
    size_bytes: u64,
}

/// Version and timestamp of a deleted document, kept so a recreate continues after them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Tombstone {
    version: u64,
    server_timestamp: i64,
}

/// Local filesystem document and account store.
///
/// Organizes data by user:
/// ```text
/// {base_dir}/
///   {user_id}/
///     account.json
///     {category}/
///       {doc_id}.payload
///       {doc_id}.meta.json
///       {doc_id}.tombstone.json   (after a delete)
/// ```
/// Subscriptions observe writes made through this instance.
pub struct FileDocumentStore {
    base_dir: PathBuf,
    feed: ChangeFeed,
    /// Serializes writes so versions stay monotonic.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for FileDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDocumentStore")
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

impl FileDocumentStore {
    /// Create a new FileDocumentStore with the given base directory.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            feed: ChangeFeed::default(),
            write_lock: Mutex::new(()),
        }
    }

    /// Reject ids that could escape the user's directory.
    fn check_segment(kind: &str, value: &str) -> Result<(), StoreError> {
        let bad = value.is_empty()
            || value.starts_with('.')
            || value.contains(['/', '\\', '\0'])
            || value.contains("..");
        if bad {
            return Err(StoreError::InvalidArgument(format!(
                "invalid {} '{}'",
                kind, value
            )));
        }
        Ok(())
    }

    fn user_dir(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        Self::check_segment("user id", user_id)?;
        Ok(self.base_dir.join(user_id))
    }

    fn category_dir(&self, user_id: &str, category: Category) -> Result<PathBuf, StoreError> {
        Ok(self.user_dir(user_id)?.join(category.as_str()))
    }

    /// Get the payload and metadata paths of a document.
    fn doc_paths(&self, user_id: &str, doc: &DocumentRef) -> Result<(PathBuf, PathBuf), StoreError> {
        Self::check_segment("document id", &doc.id)?;
        let dir = self.category_dir(user_id, doc.category)?;
        Ok((
            dir.join(format!("{}.payload", doc.id)),
            dir.join(format!("{}.meta.json", doc.id)),
        ))
    }

    fn tombstone_path(&self, user_id: &str, doc: &DocumentRef) -> Result<PathBuf, StoreError> {
        Self::check_segment("document id", &doc.id)?;
        Ok(self
            .category_dir(user_id, doc.category)?
            .join(format!("{}.tombstone.json", doc.id)))
    }

    async fn read_tombstone(path: &Path) -> Result<Option<Tombstone>, StoreError> {
        match Self::read_optional(path).await? {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e))),
            None => Ok(None),
        }
    }

    async fn remove_optional(path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn account_path(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.user_dir(user_id)?.join("account.json"))
    }

    async fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(dir).await.map_err(|e| {
            StoreError::Io(format!("Failed to create dir {}: {}", dir.display(), e))
        })
    }

    /// Write atomically via temp file.
    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, data).await.map_err(|e| {
            StoreError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, path).await.map_err(|e| {
            StoreError::Io(format!("Failed to rename to {}: {}", path.display(), e))
        })
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(
                StoreError::PermissionDenied(format!("{}: {}", path.display(), e)),
            ),
            Err(e) => Err(StoreError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn read_meta(path: &Path) -> Result<Option<DocumentMeta>, StoreError> {
        match Self::read_optional(path).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e))),
            None => Ok(None),
        }
    }

    async fn read_account(&self, user_id: &str) -> Result<Option<AccountRecord>, StoreError> {
        let path = self.account_path(user_id)?;
        match Self::read_optional(&path).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e))),
            None => Ok(None),
        }
    }

    async fn write_account(&self, user_id: &str, record: &AccountRecord) -> Result<(), StoreError> {
        let path = self.account_path(user_id)?;
        Self::ensure_dir(&self.user_dir(user_id)?).await?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Self::write_atomic(&path, &json).await
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self, payload), level = "debug", fields(payload_len = payload.len()))]
    async fn save(
        &self,
        user_id: &str,
        doc: &DocumentRef,
        payload: &[u8],
    ) -> Result<SaveReceipt, StoreError> {
        let (payload_path, meta_path) = self.doc_paths(user_id, doc)?;
        let _guard = self.write_lock.lock().await;

        Self::ensure_dir(&self.category_dir(user_id, doc.category)?).await?;
        let previous = Self::read_meta(&meta_path).await?;
        let tombstone_path = self.tombstone_path(user_id, doc)?;
        let (last_version, last_timestamp) = match &previous {
            Some(meta) => (meta.version, Some(meta.server_timestamp)),
            None => match Self::read_tombstone(&tombstone_path).await? {
                Some(t) => (t.version, Some(t.server_timestamp)),
                None => (0, None),
            },
        };

        let meta = DocumentMeta {
            owner_id: user_id.to_string(),
            doc: doc.clone(),
            version: last_version + 1,
            server_timestamp: next_timestamp(last_timestamp),
            size_bytes: payload.len() as u64,
        };
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Payload first: a crash in between leaves the old metadata, which load() trusts.
        Self::write_atomic(&payload_path, payload).await?;
        Self::write_atomic(&meta_path, &meta_json).await?;
        if previous.is_none() {
            Self::remove_optional(&tombstone_path).await?;
        }

        self.feed.publish(
            user_id,
            RemoteChange {
                doc: doc.clone(),
                payload: Some(payload.to_vec()),
                version: meta.version,
                server_timestamp: meta.server_timestamp,
            },
        );

        debug!("Saved {} v{} ({} bytes)", doc, meta.version, payload.len());
        Ok(SaveReceipt {
            server_timestamp: meta.server_timestamp,
            version: meta.version,
            created: previous.is_none(),
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn load(
        &self,
        user_id: &str,
        doc: &DocumentRef,
    ) -> Result<Option<PersistableDocument>, StoreError> {
        let (payload_path, meta_path) = self.doc_paths(user_id, doc)?;
        let Some(meta) = Self::read_meta(&meta_path).await? else {
            return Ok(None);
        };
        let Some(payload) = Self::read_optional(&payload_path).await? else {
            warn!("Metadata without payload for {} ({})", doc, meta_path.display());
            return Ok(None);
        };

        Ok(Some(PersistableDocument {
            owner_id: meta.owner_id,
            doc: meta.doc,
            payload,
            version: meta.version,
            server_timestamp: meta.server_timestamp,
        }))
    }

    async fn subscribe(
        &self,
        user_id: &str,
        doc: &DocumentRef,
    ) -> Result<DocumentSubscription, StoreError> {
        self.doc_paths(user_id, doc)?;
        Ok(self.feed.subscribe(user_id, doc))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, user_id: &str, doc: &DocumentRef) -> Result<bool, StoreError> {
        let (payload_path, meta_path) = self.doc_paths(user_id, doc)?;
        let _guard = self.write_lock.lock().await;

        let Some(meta) = Self::read_meta(&meta_path).await? else {
            return Ok(false);
        };

        let tombstone = Tombstone {
            version: meta.version + 1,
            server_timestamp: next_timestamp(Some(meta.server_timestamp)),
        };
        let tombstone_json = serde_json::to_vec(&tombstone)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Self::write_atomic(&self.tombstone_path(user_id, doc)?, &tombstone_json).await?;

        Self::remove_optional(&meta_path).await?;
        Self::remove_optional(&payload_path).await?;

        self.feed.publish(
            user_id,
            RemoteChange {
                doc: doc.clone(),
                payload: None,
                version: tombstone.version,
                server_timestamp: tombstone.server_timestamp,
            },
        );
        debug!("Deleted {}", doc);
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, user_id: &str) -> Result<Vec<DocumentInfo>, StoreError> {
        let mut docs = Vec::new();

        for category in Category::ALL {
            let dir = self.category_dir(user_id, category)?;
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StoreError::Io(format!(
                        "Failed to read dir {}: {}",
                        dir.display(),
                        e
                    )))
                }
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?
            {
                let path = entry.path();
                let is_meta = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".meta.json"));
                if !is_meta {
                    continue;
                }
                match Self::read_meta(&path).await {
                    Ok(Some(meta)) => docs.push(DocumentInfo {
                        doc: meta.doc,
                        size_bytes: meta.size_bytes,
                        version: meta.version,
                        server_timestamp: meta.server_timestamp,
                    }),
                    Ok(None) => {}
                    Err(e) => warn!("Skipping unreadable metadata {}: {}", path.display(), e),
                }
            }
        }

        docs.sort_by(|a, b| a.doc.cmp(&b.doc));
        Ok(docs)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Self::ensure_dir(&self.base_dir)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl AccountStore for FileDocumentStore {
    async fn load_account(&self, user_id: &str) -> Result<Option<AccountRecord>, StoreError> {
        self.read_account(user_id).await
    }

    async fn save_usage(&self, user_id: &str, usage: &StorageLedger) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read_account(user_id).await?.unwrap_or_default();
        record.storage_usage = Some(usage.clone());
        self.write_account(user_id, &record).await
    }

    async fn save_tier(&self, user_id: &str, tier: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read_account(user_id).await?.unwrap_or_default();
        record.subscription_tier = Some(tier.to_string());
        self.write_account(user_id, &record).await
    }
}
