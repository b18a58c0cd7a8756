//! Bounded attachment metadata store with conversation reference counting
//! and on-disk lifecycle (`storage_dir/<type>/<id>/...`).
//!
//! Grounded on `original_source/core/cache/attachment_cache.py`. Deviation:
//! the original's `_enforce_age_limit`/`_enforce_total_limit` hold
//! `self._lock` and then call `self.remove_attachment()`, which reacquires
//! the same lock — a reentrancy bug. Here the public `remove_attachment` and
//! the maintenance sweep both delegate to `remove_attachment_locked`, which
//! assumes the lock is already held.

use crate::config::Config;
use crate::core::conversation::data_classes::{AttachmentFields, CachedAttachment};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Inner {
    attachments: HashMap<String, CachedAttachment>,
}

pub struct AttachmentCache {
    inner: Mutex<Inner>,
    storage_dir: PathBuf,
    max_total_attachments: usize,
    max_age_seconds: i64,
    maintenance_interval_secs: u64,
}

impl AttachmentCache {
    pub fn new(
        storage_dir: impl Into<PathBuf>,
        max_total_attachments: usize,
        max_age_hours: u64,
        maintenance_interval_secs: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                attachments: HashMap::new(),
            }),
            storage_dir: storage_dir.into(),
            max_total_attachments,
            max_age_seconds: (max_age_hours * 3600) as i64,
            maintenance_interval_secs,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.get_or("attachments", "storage_dir", "attachments".to_string()),
            config.get_or("attachments", "max_total_attachments", 1000),
            config.get_or("attachments", "max_age_hours", 72u64),
            config.get_or("caching", "cache_maintenance_interval", 300u64),
        )
    }

    /// Register a new attachment for `conversation_id`, writing its metadata
    /// JSON to disk. Idempotent: re-adding the same attachment id only grows
    /// the `conversations` set.
    pub async fn add_attachment(
        &self,
        fields: AttachmentFields,
        conversation_id: &str,
        created_at: impl Into<String>,
    ) -> crate::error::Result<CachedAttachment> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.attachments.get_mut(&fields.attachment_id) {
            existing.conversations.insert(conversation_id.to_string());
            return Ok(existing.clone());
        }

        let attachment = CachedAttachment {
            attachment_id: fields.attachment_id,
            attachment_type: fields.attachment_type,
            file_extension: fields.file_extension,
            created_at: created_at.into(),
            size: fields.size,
            conversations: [conversation_id.to_string()].into_iter().collect(),
        };

        self.write_metadata(&attachment).await?;
        inner
            .attachments
            .insert(attachment.attachment_id.clone(), attachment.clone());
        Ok(attachment)
    }

    pub async fn get_attachment(&self, attachment_id: &str) -> Option<CachedAttachment> {
        let inner = self.inner.lock().await;
        inner.attachments.get(attachment_id).cloned()
    }

    /// Drop `conversation_id`'s reference to the attachment. The attachment
    /// (and its files) are only removed once no conversation references it.
    pub async fn release_from_conversation(&self, attachment_id: &str, conversation_id: &str) -> crate::error::Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(attachment) = inner.attachments.get_mut(attachment_id) else {
            return Ok(());
        };
        attachment.conversations.remove(conversation_id);

        if attachment.conversations.is_empty() {
            self.remove_attachment_locked(&mut inner, attachment_id).await?;
        }
        Ok(())
    }

    /// Unconditionally remove an attachment (metadata + files), regardless of
    /// remaining conversation references.
    pub async fn remove_attachment(&self, attachment_id: &str) -> crate::error::Result<()> {
        let mut inner = self.inner.lock().await;
        self.remove_attachment_locked(&mut inner, attachment_id).await
    }

    /// Assumes `inner`'s lock is already held by the caller. Never call
    /// `self.inner.lock()` from within this function or its callees.
    async fn remove_attachment_locked(&self, inner: &mut Inner, attachment_id: &str) -> crate::error::Result<()> {
        let Some(attachment) = inner.attachments.remove(attachment_id) else {
            return Ok(());
        };

        let dir = self.storage_dir.join(&attachment.attachment_type).join(&attachment.attachment_id);
        if dir.exists() {
            tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&dir))
                .await
                .map_err(|e| crate::error::Error::Other(anyhow::anyhow!(e)))?
                .map_err(|e| {
                    crate::error::ConversationError::StorageUnwritable {
                        path: attachment.file_path(),
                        source: e,
                    }
                })?;
        }
        Ok(())
    }

    /// Move an already-registered attachment's file from a staging path into
    /// its canonical `storage_dir`-relative location.
    pub async fn move_staged_file(&self, attachment: &CachedAttachment, staged_path: &std::path::Path) -> crate::error::Result<()> {
        let dest = self.storage_dir.join(attachment.file_path());
        let staged_path = staged_path.to_path_buf();
        let dest_for_error = dest.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::rename(&staged_path, &dest) {
                Ok(()) => Ok(()),
                Err(_) => {
                    std::fs::copy(&staged_path, &dest)?;
                    std::fs::remove_file(&staged_path)
                }
            }
        })
        .await
        .map_err(|e| crate::error::Error::Other(anyhow::anyhow!(e)))?
        .map_err(|e| {
            crate::error::Error::Conversation(crate::error::ConversationError::StorageUnwritable {
                path: dest_for_error.display().to_string(),
                source: e,
            })
        })
    }

    async fn write_metadata(&self, attachment: &CachedAttachment) -> crate::error::Result<()> {
        let path = self.storage_dir.join(attachment.metadata_path());
        let json = serde_json::to_vec_pretty(attachment).map_err(|e| anyhow::anyhow!(e))?;

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, json)
        })
        .await
        .map_err(|e| crate::error::Error::Other(anyhow::anyhow!(e)))?
        .map_err(|e| {
            crate::error::Error::Conversation(crate::error::ConversationError::StorageUnwritable {
                path: attachment.metadata_path(),
                source: e,
            })
        })
    }

    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(cache.maintenance_interval_secs.max(1));
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = cache.run_maintenance().await {
                            tracing::warn!(%err, "attachment cache maintenance failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn run_maintenance(&self) -> crate::error::Result<()> {
        self.enforce_age_limit().await?;
        self.enforce_total_limit().await?;
        Ok(())
    }

    async fn enforce_age_limit(&self) -> crate::error::Result<()> {
        let now = chrono::Utc::now();
        let stale: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .attachments
                .values()
                .filter(|a| {
                    chrono::DateTime::parse_from_rfc3339(&a.created_at)
                        .map(|created| (now - created.with_timezone(&chrono::Utc)).num_seconds() > self.max_age_seconds)
                        .unwrap_or(false)
                })
                .map(|a| a.attachment_id.clone())
                .collect()
        };

        let mut inner = self.inner.lock().await;
        for id in stale {
            self.remove_attachment_locked(&mut inner, &id).await?;
        }
        Ok(())
    }

    async fn enforce_total_limit(&self) -> crate::error::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.attachments.len() <= self.max_total_attachments {
            return Ok(());
        }
        let to_remove = inner.attachments.len() - self.max_total_attachments;

        let mut sorted: Vec<(String, String)> = inner
            .attachments
            .values()
            .map(|a| (a.created_at.clone(), a.attachment_id.clone()))
            .collect();
        sorted.sort();

        for (_, id) in sorted.into_iter().take(to_remove) {
            self.remove_attachment_locked(&mut inner, &id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(id: &str) -> AttachmentFields {
        AttachmentFields {
            attachment_id: id.into(),
            attachment_type: "image".into(),
            file_extension: Some("png".into()),
            size: 1024,
        }
    }

    #[tokio::test]
    async fn add_attachment_is_idempotent_across_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AttachmentCache::new(dir.path(), 100, 72, 300);

        cache.add_attachment(fields("a1"), "c1", "2026-01-01T00:00:00Z").await.unwrap();
        let again = cache.add_attachment(fields("a1"), "c2", "2026-01-01T00:00:00Z").await.unwrap();

        assert_eq!(again.conversations.len(), 2);
    }

    #[tokio::test]
    async fn release_from_last_conversation_removes_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AttachmentCache::new(dir.path(), 100, 72, 300);

        cache.add_attachment(fields("a1"), "c1", "2026-01-01T00:00:00Z").await.unwrap();
        cache.release_from_conversation("a1", "c1").await.unwrap();

        assert!(cache.get_attachment("a1").await.is_none());
    }

    #[tokio::test]
    async fn release_with_remaining_reference_keeps_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AttachmentCache::new(dir.path(), 100, 72, 300);

        cache.add_attachment(fields("a1"), "c1", "2026-01-01T00:00:00Z").await.unwrap();
        cache.add_attachment(fields("a1"), "c2", "2026-01-01T00:00:00Z").await.unwrap();
        cache.release_from_conversation("a1", "c1").await.unwrap();

        assert!(cache.get_attachment("a1").await.is_some());
    }

    #[tokio::test]
    async fn total_limit_evicts_oldest_by_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AttachmentCache::new(dir.path(), 1, 72, 300);

        cache.add_attachment(fields("a1"), "c1", "2026-01-01T00:00:00Z").await.unwrap();
        cache.add_attachment(fields("a2"), "c1", "2026-01-02T00:00:00Z").await.unwrap();

        cache.run_maintenance().await.unwrap();

        assert!(cache.get_attachment("a1").await.is_none());
        assert!(cache.get_attachment("a2").await.is_some());
    }
}
