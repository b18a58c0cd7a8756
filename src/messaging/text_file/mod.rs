//! Text-file adapter: filesystem operations (view/read/create/delete/move/
//! update/insert/replace/undo) exposed over the same WebSocket event bus as
//! the chat-platform adapters. Like the shell adapter, this has no
//! conversation/message semantics, so `TextFileAdapter` implements
//! `core::socket_io::OutgoingDispatch` directly rather than `PlatformAdapter`.
//!
//! Grounded on
//! `original_source/adapters/text_file_adapter/adapter/event_processor/processor.py`
//! for the nine event handlers and path sanitization, and on `FileEventCache`
//! (§4.11, `file_event_cache.rs`) for undo support. `FileValidator`
//! (`file_validator.rs`) gates `read` on size/extension/textual-content/
//! token-count policy, matching the source's `_handle_read_event`.

mod file_event_cache;
mod file_validator;

use crate::config::Config;
use crate::core::socket_io::OutgoingDispatch;
use crate::error::PlatformError;
use crate::messaging::traits::Messaging;
use file_event_cache::FileEventCache;
use file_validator::{FileValidator, SecurityMode};

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone)]
pub struct TextFileAdapter {
    adapter_name: Arc<String>,
    base_directory: Arc<PathBuf>,
    allowed_directories: Arc<Vec<PathBuf>>,
    max_file_size: u64,
    max_token_count: usize,
    security_mode: SecurityMode,
    allowed_extensions: Arc<Vec<String>>,
    blocked_extensions: Arc<Vec<String>>,
    cache: Arc<FileEventCache>,
}

impl TextFileAdapter {
    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        let base_directory: String = config.get_or(
            "adapter",
            "base_directory",
            std::env::temp_dir().to_string_lossy().to_string(),
        );
        let max_file_size_mb: u64 = config.get_or("adapter", "max_file_size", 10);

        Ok(Self {
            adapter_name: Arc::new(config.get_or("adapter", "adapter_name", "text_file".to_string())),
            base_directory: Arc::new(PathBuf::from(base_directory)),
            allowed_directories: Arc::new(
                config
                    .get_or::<Vec<String>>("adapter", "allowed_directories", Vec::new())
                    .into_iter()
                    .map(PathBuf::from)
                    .collect(),
            ),
            max_file_size: max_file_size_mb * 1024 * 1024,
            max_token_count: config.get_or("adapter", "max_token_count", 50_000),
            security_mode: SecurityMode::parse(&config.get_or("adapter", "security_mode", "strict".to_string())),
            allowed_extensions: Arc::new(config.get_or("adapter", "allowed_extensions", Vec::new())),
            blocked_extensions: Arc::new(config.get_or("adapter", "blocked_extensions", Vec::new())),
            cache: Arc::new(FileEventCache::from_config(config)),
        })
    }

    /// Resolves a request path against `base_directory`/`allowed_directories`,
    /// rejecting traversal outside them. Uses `Path::starts_with` (component
    /// comparison) rather than the source's raw string-prefix check, which
    /// would treat `/data` as a prefix of `/data-secret` — a directory
    /// traversal edge case closed here rather than carried over.
    fn sanitize_path(&self, requested: &str) -> crate::error::Result<PathBuf> {
        let requested = Path::new(requested);
        let absolute = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.base_directory.join(requested)
        };
        let absolute = normalize(&absolute);

        if self.allowed_directories.is_empty() || self.allowed_directories.iter().any(|dir| absolute.starts_with(dir)) {
            Ok(absolute)
        } else {
            Err(PlatformError::TextFile(format!("access denied to path outside allowed directories: {}", absolute.display())).into())
        }
    }

    async fn handle_view(&self, data: &Value) -> crate::error::Result<Value> {
        let path = self.sanitize_path(required_str(data, "path")?)?;
        if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            return Err(PlatformError::TextFile(format!("path is not a directory: {}", path.display())).into());
        }

        let mut files = Vec::new();
        let mut directories = Vec::new();
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| PlatformError::TextFile(format!("failed to read directory: {e}")))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| PlatformError::TextFile(e.to_string()))? {
            let name = entry.file_name().to_string_lossy().to_string();
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => directories.push(name),
                Ok(_) => files.push(name),
                Err(_) => continue,
            }
        }

        Ok(json!({ "directories": directories, "files": files }))
    }

    async fn handle_read(&self, data: &Value) -> crate::error::Result<Value> {
        let path = self.sanitize_path(required_str(data, "path")?)?;

        let mut validator = FileValidator::new(
            &path,
            self.max_file_size,
            self.max_token_count,
            self.security_mode,
            &self.allowed_extensions,
            &self.blocked_extensions,
        );
        if !validator.validate().await {
            return Err(PlatformError::TextFile(format!("file validation failed: {}", validator.errors.join(" "))).into());
        }

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PlatformError::TextFile(format!("error reading file: {e}")))?;

        let content = match data.get("view_range").and_then(Value::as_array) {
            Some(range) if range.len() == 2 => {
                let start = range[0].as_u64().unwrap_or(0) as usize;
                let end = range[1].as_u64().unwrap_or(u64::MAX) as usize;
                text.lines().skip(start).take(end.saturating_sub(start)).collect::<Vec<_>>().join("\n")
            }
            _ => text,
        };

        Ok(json!({ "content": content }))
    }

    async fn handle_create(&self, data: &Value) -> crate::error::Result<Value> {
        let path = self.sanitize_path(required_str(data, "path")?)?;
        let content = required_str(data, "content")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| PlatformError::TextFile(e.to_string()))?;
        }
        self.cache.record_create_event(&path).await;
        tokio::fs::write(&path, content).await.map_err(|e| PlatformError::TextFile(format!("error creating file: {e}")))?;

        Ok(Value::Null)
    }

    async fn handle_delete(&self, data: &Value) -> crate::error::Result<Value> {
        let path = self.sanitize_path(required_str(data, "path")?)?;
        check_exists(&path).await?;
        self.cache.record_delete_event(&path).await?;
        tokio::fs::remove_file(&path).await.map_err(|e| PlatformError::TextFile(format!("error deleting file: {e}")))?;
        Ok(Value::Null)
    }

    async fn handle_move(&self, data: &Value) -> crate::error::Result<Value> {
        let source = self.sanitize_path(required_str(data, "source_path")?)?;
        check_exists(&source).await?;
        let destination = self.sanitize_path(required_str(data, "destination_path")?)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| PlatformError::TextFile(e.to_string()))?;
        }

        self.cache.record_move_event(&source, &destination).await;
        tokio::fs::rename(&source, &destination)
            .await
            .map_err(|e| PlatformError::TextFile(format!("error moving file: {e}")))?;
        tracing::warn!(from = %source.display(), to = %destination.display(), "moved file; move cannot be undone");

        Ok(Value::Null)
    }

    async fn handle_update(&self, data: &Value) -> crate::error::Result<Value> {
        let path = self.sanitize_path(required_str(data, "path")?)?;
        let content = required_str(data, "content")?;
        check_exists(&path).await?;
        self.cache.record_update_event(&path).await?;
        tokio::fs::write(&path, content).await.map_err(|e| PlatformError::TextFile(format!("error updating file: {e}")))?;
        Ok(Value::Null)
    }

    async fn handle_insert(&self, data: &Value) -> crate::error::Result<Value> {
        let path = self.sanitize_path(required_str(data, "path")?)?;
        let content = required_str(data, "content")?;
        check_exists(&path).await?;
        self.cache.record_update_event(&path).await?;

        let existing = tokio::fs::read_to_string(&path).await.map_err(|e| PlatformError::TextFile(e.to_string()))?;
        let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
        let line_number = data.get("line").and_then(Value::as_u64).unwrap_or(0) as usize;

        if line_number == 0 {
            lines.insert(0, content.to_string());
        } else if line_number > lines.len() {
            lines.push(content.to_string());
        } else {
            lines.insert(line_number, content.to_string());
        }

        tokio::fs::write(&path, lines.join("\n"))
            .await
            .map_err(|e| PlatformError::TextFile(format!("error inserting into file: {e}")))?;
        Ok(Value::Null)
    }

    async fn handle_replace(&self, data: &Value) -> crate::error::Result<Value> {
        let path = self.sanitize_path(required_str(data, "path")?)?;
        let old_string = required_str(data, "old_string")?;
        let new_string = required_str(data, "new_string")?;
        check_exists(&path).await?;
        self.cache.record_update_event(&path).await?;

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| PlatformError::TextFile(e.to_string()))?;
        let replaced = content.replace(old_string, new_string);
        tokio::fs::write(&path, replaced)
            .await
            .map_err(|e| PlatformError::TextFile(format!("error replacing text in file: {e}")))?;
        Ok(Value::Null)
    }

    async fn handle_undo(&self, data: &Value) -> crate::error::Result<Value> {
        let path = self.sanitize_path(required_str(data, "path")?)?;
        if self.cache.undo_recorded_event(&path).await {
            Ok(Value::Null)
        } else {
            Err(PlatformError::TextFile(format!("no undo history for {}", path.display())).into())
        }
    }
}

fn required_str<'a>(data: &'a Value, field: &str) -> crate::error::Result<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PlatformError::TextFile(format!("{field} is required")).into())
}

async fn check_exists(path: &Path) -> crate::error::Result<()> {
    if tokio::fs::metadata(path).await.is_ok() {
        Ok(())
    } else {
        Err(PlatformError::TextFile(format!("path does not exist: {}", path.display())).into())
    }
}

/// Collapses `.`/`..` components lexically without requiring the path to
/// exist (`std::fs::canonicalize` would fail for a not-yet-created file).
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                result.pop();
            }
            std::path::Component::CurDir => {}
            other => result.push(other.as_os_str()),
        }
    }
    result
}

impl OutgoingDispatch for TextFileAdapter {
    async fn process_outgoing_event(&self, event_type: &str, data: Value) -> Value {
        let result = match event_type {
            "view" => self.handle_view(&data).await,
            "read" => self.handle_read(&data).await,
            "create" => self.handle_create(&data).await,
            "delete" => self.handle_delete(&data).await,
            "move" => self.handle_move(&data).await,
            "update" => self.handle_update(&data).await,
            "insert" => self.handle_insert(&data).await,
            "replace" => self.handle_replace(&data).await,
            "undo" => self.handle_undo(&data).await,
            other => {
                tracing::warn!(event_type = other, "unknown text-file event type");
                Err(PlatformError::TextFile(format!("unknown event type: {other}")).into())
            }
        };

        match result {
            Ok(extra) => {
                let mut payload = json!({ "request_completed": true });
                if let Value::Object(map) = extra {
                    payload.as_object_mut().unwrap().extend(map);
                }
                payload
            }
            Err(error) => {
                tracing::error!(%error, event_type, "text-file event failed");
                json!({ "request_completed": false })
            }
        }
    }
}

impl Messaging for TextFileAdapter {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> crate::error::Result<()> {
        self.cache.start().await?;

        let (socket, queue_rx) = crate::core::socket_io::SocketIoServer::new(self.adapter_name.as_str(), self.clone());

        let queue_shutdown = shutdown.clone();
        tokio::spawn(Arc::clone(&socket).run_queue(queue_rx, queue_shutdown));

        let router = socket.router();
        let listener = tokio::net::TcpListener::bind("0.0.0.0:8770")
            .await
            .map_err(|e| PlatformError::TextFile(format!("failed to bind text-file socket server: {e}")))?;
        let mut axum_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = axum_shutdown.wait_for(|v| *v).await;
            });
            if let Err(error) = serve.await {
                tracing::error!(%error, "text-file socket server exited");
            }
        });

        let cache = Arc::clone(&self.cache);
        let mut cleanup_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                        cache.cleanup_expired().await;
                    }
                    _ = cleanup_shutdown.changed() => {
                        if *cleanup_shutdown.borrow() { break; }
                    }
                }
            }
        });

        tracing::info!("text-file adapter listening on 0.0.0.0:8770");
        shutdown.changed().await.ok();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(base: &Path) -> TextFileAdapter {
        TextFileAdapter {
            adapter_name: Arc::new("text_file".to_string()),
            base_directory: Arc::new(base.to_path_buf()),
            allowed_directories: Arc::new(vec![base.to_path_buf()]),
            max_file_size: 10 * 1024 * 1024,
            max_token_count: 50_000,
            security_mode: SecurityMode::Unrestricted,
            allowed_extensions: Arc::new(Vec::new()),
            blocked_extensions: Arc::new(Vec::new()),
            cache: Arc::new(FileEventCache::from_config(&Config::default())),
        }
    }

    #[test]
    fn relative_path_resolves_under_base_directory() {
        let base = Path::new("/workspace");
        let adapter = adapter(base);
        let resolved = adapter.sanitize_path("notes/today.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/workspace/notes/today.txt"));
    }

    #[test]
    fn traversal_outside_allowed_directories_is_rejected() {
        let base = Path::new("/workspace");
        let adapter = adapter(base);
        assert!(adapter.sanitize_path("/etc/passwd").is_err());
    }

    #[test]
    fn prefix_lookalike_directory_is_rejected() {
        let adapter = TextFileAdapter {
            allowed_directories: Arc::new(vec![PathBuf::from("/data")]),
            ..adapter(Path::new("/data"))
        };
        assert!(adapter.sanitize_path("/data-secret/file.txt").is_err());
    }

    #[test]
    fn dot_dot_components_are_collapsed_before_the_allow_check() {
        let base = Path::new("/workspace");
        let adapter = adapter(base);
        assert!(adapter.sanitize_path("../etc/passwd").is_err());
    }
}
