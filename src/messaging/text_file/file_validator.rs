//! File validation ahead of a read: existence, extension policy, textual
//! content, and a coarse context-length estimate. Grounded on
//! `original_source/adapters/text_file_adapter/adapter/event_processor/file_validator.py`.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    Strict,
    Permissive,
    Unrestricted,
}

impl SecurityMode {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "permissive" => Self::Permissive,
            "unrestricted" => Self::Unrestricted,
            _ => Self::Strict,
        }
    }
}

pub struct FileValidator<'a> {
    path: &'a Path,
    max_file_size: u64,
    max_token_count: usize,
    security_mode: SecurityMode,
    allowed_extensions: &'a [String],
    blocked_extensions: &'a [String],
    pub errors: Vec<String>,
}

impl<'a> FileValidator<'a> {
    pub fn new(
        path: &'a Path,
        max_file_size: u64,
        max_token_count: usize,
        security_mode: SecurityMode,
        allowed_extensions: &'a [String],
        blocked_extensions: &'a [String],
    ) -> Self {
        Self {
            path,
            max_file_size,
            max_token_count,
            security_mode,
            allowed_extensions,
            blocked_extensions,
            errors: Vec::new(),
        }
    }

    fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_lowercase()
    }

    fn validate_type_against_policy(&mut self) -> bool {
        let extension = self.extension();
        match self.security_mode {
            SecurityMode::Unrestricted => true,
            SecurityMode::Permissive => !self.blocked_extensions.iter().any(|e| e == &extension),
            SecurityMode::Strict => self.allowed_extensions.iter().any(|e| e == &extension),
        }
    }

    fn validate_is_textual(&mut self, sample: &[u8]) -> bool {
        if std::str::from_utf8(sample).is_ok() {
            true
        } else {
            self.errors.push(format!("file is not textual: {}", self.path.display()));
            false
        }
    }

    fn validate_context_length(&mut self, file_size: u64, sample: &str) -> bool {
        let chars_per_token = 4.0;
        let estimated_tokens = if sample.is_empty() {
            (file_size as f64 / chars_per_token) as usize
        } else {
            let sample_ratio = (file_size as f64 / sample.len() as f64).min(1.0);
            ((sample.chars().count() as f64 / chars_per_token) * sample_ratio) as usize
        };

        if estimated_tokens > self.max_token_count {
            self.errors.push(format!("estimated token count ({estimated_tokens}) exceeds limit"));
            return false;
        }
        true
    }

    /// Reads the file (twice, once for the textual/sample check and once for
    /// size) to mirror the source's sequence of checks; this is a config-path
    /// validation, not a hot loop, so the extra read is not worth avoiding by
    /// complicating the control flow.
    pub async fn validate(&mut self) -> bool {
        if !self.path.is_file() {
            self.errors.push(format!("file does not exist: {}", self.path.display()));
            return false;
        }

        if !self.validate_type_against_policy() {
            self.errors.push(format!("extension not permitted: {}", self.extension()));
            return false;
        }

        let bytes = match tokio::fs::read(self.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.errors.push(format!("error reading file: {e}"));
                return false;
            }
        };

        let sample_bytes = &bytes[..bytes.len().min(10_000)];
        if !self.validate_is_textual(&bytes[..bytes.len().min(1024)]) {
            return false;
        }

        let file_size = bytes.len() as u64;
        if file_size > self.max_file_size {
            self.errors.push(format!("file size {file_size}B exceeds limit for files"));
            return false;
        }

        let sample = String::from_utf8_lossy(sample_bytes);
        self.validate_context_length(file_size, &sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_missing_file() {
        let path = std::path::Path::new("/nonexistent/path/to/file.txt");
        let allowed = vec!["txt".to_string()];
        let blocked = vec![];
        let mut validator = FileValidator::new(path, 1_000_000, 10_000, SecurityMode::Strict, &allowed, &blocked);
        assert!(!validator.validate().await);
        assert!(!validator.errors.is_empty());
    }

    #[tokio::test]
    async fn strict_mode_rejects_disallowed_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.exe");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let allowed = vec!["txt".to_string()];
        let blocked = vec![];
        let mut validator = FileValidator::new(&path, 1_000_000, 10_000, SecurityMode::Strict, &allowed, &blocked);
        assert!(!validator.validate().await);
    }

    #[tokio::test]
    async fn permissive_mode_allows_unblocked_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.exe");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let allowed = vec![];
        let blocked = vec!["bin".to_string()];
        let mut validator = FileValidator::new(&path, 1_000_000, 10_000, SecurityMode::Permissive, &allowed, &blocked);
        assert!(validator.validate().await);
    }
}
