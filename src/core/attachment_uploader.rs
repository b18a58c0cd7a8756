//! Validates, rate-limits, and relocates a staged outbound attachment into
//! the canonical attachment directory after a platform accepts it.
//!
//! Grounded on `original_source/adapters/slack_adapter/adapter/attachment_loaders/uploader.py`'s
//! `Uploader`: check the staged file exists and is within the configured size
//! limit, acquire a rate-limit ticket, then move the file from its staging
//! path to `<type>/<id>/<id>[.ext]` under the attachment store. The platform
//! API call that actually hands the bytes to Discord/Slack/Telegram/Zulip is
//! adapter-specific and stays on `OutgoingActions::upload_attachment`; this
//! type only owns the shared rate-limit-then-relocate contract, since the
//! source's own shared relocation helpers (`core/utils/attachment_loading.py`)
//! were never part of this retrieval.

use crate::config::Config;
use crate::core::cache::attachment_cache::AttachmentCache;
use crate::core::conversation::data_classes::{AttachmentFields, CachedAttachment};
use crate::core::rate_limiter::{RateLimitKind, RateLimiter};
use crate::error::{ConversationError, Error, Result};
use std::path::Path;
use std::sync::Arc;

pub struct AttachmentUploader {
    cache: Arc<AttachmentCache>,
    rate_limiter: Arc<RateLimiter>,
    max_file_size_bytes: u64,
}

impl AttachmentUploader {
    pub fn new(cache: Arc<AttachmentCache>, rate_limiter: Arc<RateLimiter>, max_file_size_bytes: u64) -> Self {
        Self {
            cache,
            rate_limiter,
            max_file_size_bytes,
        }
    }

    pub fn from_config(config: &Config, cache: Arc<AttachmentCache>, rate_limiter: Arc<RateLimiter>) -> Self {
        let max_file_size_mb: u64 = config.get_or("attachments", "max_file_size_mb", 25u64);
        Self::new(cache, rate_limiter, max_file_size_mb * 1024 * 1024)
    }

    /// Validate `staged_path`, rate-limit the upload, then move the file into
    /// the canonical attachment directory and register it in the cache.
    /// Errors if the file is missing or over the configured size limit.
    pub async fn relocate(
        &self,
        fields: AttachmentFields,
        conversation_id: &str,
        staged_path: &Path,
        created_at: impl Into<String>,
    ) -> Result<CachedAttachment> {
        let metadata = tokio::fs::metadata(staged_path).await.map_err(|source| {
            Error::Conversation(ConversationError::StorageUnwritable {
                path: staged_path.display().to_string(),
                source,
            })
        })?;

        if metadata.len() > self.max_file_size_bytes {
            return Err(Error::Other(anyhow::anyhow!(
                "attachment {} ({} bytes) exceeds the configured limit of {} bytes",
                fields.attachment_id,
                metadata.len(),
                self.max_file_size_bytes
            )));
        }

        self.rate_limiter
            .limit_request(RateLimitKind::Upload, Some(conversation_id))
            .await;

        let attachment = self
            .cache
            .add_attachment(fields, conversation_id, created_at)
            .await?;
        self.cache.move_staged_file(&attachment, staged_path).await?;
        Ok(attachment)
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
            size: 4,
        }
    }

    #[tokio::test]
    async fn relocate_moves_staged_file_into_canonical_layout() {
        let storage = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let staged_path = staging.path().join("upload.png");
        tokio::fs::write(&staged_path, b"data").await.unwrap();

        let cache = Arc::new(AttachmentCache::new(storage.path(), 100, 72, 300));
        let rate_limiter = Arc::new(RateLimiter::new(6000, 6000, 6000));
        let uploader = AttachmentUploader::new(cache, rate_limiter, 1024);

        let attachment = uploader
            .relocate(fields("a1"), "c1", &staged_path, "2026-01-01T00:00:00Z")
            .await
            .unwrap();

        assert!(storage.path().join(attachment.file_path()).exists());
        assert!(!staged_path.exists());
    }

    #[tokio::test]
    async fn relocate_rejects_files_over_the_size_limit() {
        let storage = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let staged_path = staging.path().join("upload.png");
        tokio::fs::write(&staged_path, b"too big for the limit").await.unwrap();

        let cache = Arc::new(AttachmentCache::new(storage.path(), 100, 72, 300));
        let rate_limiter = Arc::new(RateLimiter::new(6000, 6000, 6000));
        let uploader = AttachmentUploader::new(cache, rate_limiter, 4);

        let result = uploader
            .relocate(fields("a1"), "c1", &staged_path, "2026-01-01T00:00:00Z")
            .await;

        assert!(result.is_err());
        assert!(staged_path.exists());
    }
}
