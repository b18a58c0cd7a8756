//! Per-file undo log with on-disk backups. Grounded on
//! `original_source/adapters/text_file_adapter/adapter/event_processor/file_event_cache.py`.
//!
//! A single async lock serializes every mutation of the log and its backups,
//! per spec.md §4.11; backup copy/remove-tree work runs through `tokio::fs`,
//! which itself offloads to the blocking-I/O thread pool.

use crate::config::Config;
use crate::error::PlatformError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
struct BackupInfo {
    original_file_path: PathBuf,
    backup_file_path: PathBuf,
}

struct RecordedEvent {
    action: EventAction,
    recorded_at: Instant,
    backup: Option<BackupInfo>,
}

pub struct FileEventCache {
    backup_dir: PathBuf,
    event_ttl: Duration,
    max_events_per_file: usize,
    events: Mutex<HashMap<PathBuf, Vec<RecordedEvent>>>,
}

impl FileEventCache {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backup_dir: PathBuf::from(config.get_or("adapter", "backup_directory", "backups".to_string())),
            event_ttl: Duration::from_secs(config.get_or::<u64>("adapter", "event_ttl_hours", 24) * 3600),
            max_events_per_file: config.get_or("adapter", "max_events_per_file", 20),
            events: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self) -> crate::error::Result<()> {
        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| PlatformError::TextFile(format!("failed to create backup directory: {e}")))?;
        Ok(())
    }

    /// Pushes a `{action: delete}` entry so undo deletes the just-created file.
    pub async fn record_create_event(&self, path: &Path) {
        let mut events = self.events.lock().await;
        Self::push_event(&mut events, self.max_events_per_file, path, EventAction::Delete, None).await;
    }

    pub async fn record_update_event(&self, path: &Path) -> crate::error::Result<()> {
        let backup = self.create_backup(path).await?;
        let mut events = self.events.lock().await;
        Self::push_event(&mut events, self.max_events_per_file, path, EventAction::Update, Some(backup)).await;
        Ok(())
    }

    pub async fn record_delete_event(&self, path: &Path) -> crate::error::Result<()> {
        let backup = self.create_backup(path).await?;
        let mut events = self.events.lock().await;
        Self::push_event(&mut events, self.max_events_per_file, path, EventAction::Create, Some(backup)).await;
        Ok(())
    }

    /// Moves drop history for the source path — moves are non-undoable.
    pub async fn record_move_event(&self, old_path: &Path, _new_path: &Path) {
        self.events.lock().await.remove(old_path);
    }

    pub async fn undo_recorded_event(&self, path: &Path) -> bool {
        let event = {
            let mut events = self.events.lock().await;
            let Some(list) = events.get_mut(path) else { return false };
            let event = list.pop();
            if list.is_empty() {
                events.remove(path);
            }
            event
        };

        let Some(event) = event else { return false };

        match event.action {
            EventAction::Create | EventAction::Update => {
                let Some(backup) = event.backup else { return false };
                let restored = self.restore_from_backup(&backup).await;
                self.cleanup_backup(&backup).await;
                restored
            }
            EventAction::Delete => tokio::fs::remove_file(path).await.is_ok(),
        }
    }

    /// Evicts events older than `event_ttl_hours`, deleting their backups.
    pub async fn cleanup_expired(&self) {
        let expired_backups = {
            let mut events = self.events.lock().await;
            let mut expired_backups = Vec::new();

            for path in events.keys().cloned().collect::<Vec<_>>() {
                let Some(list) = events.get_mut(&path) else { continue };
                let mut retained = Vec::with_capacity(list.len());
                for event in list.drain(..) {
                    if event.recorded_at.elapsed() >= self.event_ttl {
                        if let Some(backup) = event.backup {
                            expired_backups.push(backup);
                        }
                    } else {
                        retained.push(event);
                    }
                }
                if retained.is_empty() {
                    events.remove(&path);
                } else {
                    *list = retained;
                }
            }

            expired_backups
        };

        for backup in expired_backups {
            self.cleanup_backup(&backup).await;
        }
    }

    /// Appends `event` to `path`'s log, evicting the oldest entry (with its
    /// backup) if `max_events_per_file` is exceeded.
    async fn push_event(
        events: &mut HashMap<PathBuf, Vec<RecordedEvent>>,
        max_events_per_file: usize,
        path: &Path,
        action: EventAction,
        backup: Option<BackupInfo>,
    ) {
        let list = events.entry(path.to_path_buf()).or_default();
        list.push(RecordedEvent { action, recorded_at: Instant::now(), backup });

        if list.len() > max_events_per_file {
            let oldest = list.remove(0);
            if let Some(backup) = oldest.backup {
                tokio::fs::remove_dir_all(backup.backup_file_path.parent().unwrap_or(&backup.backup_file_path))
                    .await
                    .ok();
            }
        }
    }

    async fn create_backup(&self, path: &Path) -> crate::error::Result<BackupInfo> {
        let backup_id = uuid::Uuid::new_v4().to_string();
        let backup_subdir = self.backup_dir.join(&backup_id);
        tokio::fs::create_dir_all(&backup_subdir)
            .await
            .map_err(|e| PlatformError::TextFile(format!("failed to create backup directory: {e}")))?;

        let backup_file_path = backup_subdir.join("original_content.bak");
        tokio::fs::copy(path, &backup_file_path)
            .await
            .map_err(|e| PlatformError::TextFile(format!("failed to back up {}: {e}", path.display())))?;

        Ok(BackupInfo { original_file_path: path.to_path_buf(), backup_file_path })
    }

    async fn cleanup_backup(&self, backup: &BackupInfo) {
        if let Some(dir) = backup.backup_file_path.parent() {
            if let Err(error) = tokio::fs::remove_dir_all(dir).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(%error, path = %dir.display(), "error cleaning up backup");
                }
            }
        }
    }

    async fn restore_from_backup(&self, backup: &BackupInfo) -> bool {
        if let Some(parent) = backup.original_file_path.parent() {
            if tokio::fs::create_dir_all(parent).await.is_err() {
                return false;
            }
        }
        tokio::fs::copy(&backup.backup_file_path, &backup.original_file_path).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(backup_dir: &Path) -> FileEventCache {
        FileEventCache {
            backup_dir: backup_dir.to_path_buf(),
            event_ttl: Duration::from_secs(3600),
            max_events_per_file: 3,
            events: Mutex::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn undo_create_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        let cache = cache_with(&backups);
        cache.start().await.unwrap();

        let file = dir.path().join("new.txt");
        tokio::fs::write(&file, b"hi").await.unwrap();
        cache.record_create_event(&file).await;

        assert!(cache.undo_recorded_event(&file).await);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn undo_update_restores_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        let cache = cache_with(&backups);
        cache.start().await.unwrap();

        let file = dir.path().join("existing.txt");
        tokio::fs::write(&file, b"original").await.unwrap();
        cache.record_update_event(&file).await.unwrap();
        tokio::fs::write(&file, b"changed").await.unwrap();

        assert!(cache.undo_recorded_event(&file).await);
        assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "original");
    }

    #[tokio::test]
    async fn move_event_drops_history_for_old_path() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        let cache = cache_with(&backups);
        cache.start().await.unwrap();

        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, b"x").await.unwrap();
        cache.record_create_event(&file).await;
        cache.record_move_event(&file, &dir.path().join("b.txt")).await;

        assert!(!cache.undo_recorded_event(&file).await);
    }

    #[tokio::test]
    async fn per_file_cap_evicts_oldest_event() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        let cache = cache_with(&backups);
        cache.start().await.unwrap();

        let file = dir.path().join("churned.txt");
        tokio::fs::write(&file, b"v0").await.unwrap();
        for v in 1..=5 {
            cache.record_update_event(&file).await.unwrap();
            tokio::fs::write(&file, format!("v{v}")).await.unwrap();
        }

        let events = cache.events.lock().await;
        assert_eq!(events.get(&file).map(Vec::len), Some(3));
    }
}
