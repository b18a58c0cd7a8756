//! Typed YAML configuration loading.
//!
//! Mirrors the category/key model of the source adapter's `Config`: a YAML file
//! partitioned into named sections (`adapter`, `attachments`, `caching`,
//! `rate_limit`, `logging`, `socketio`, plus adapter-specific sections), looked
//! up as `(section, key)` pairs with optional caller-supplied defaults. Missing
//! required keys are a configuration error raised at load/lookup time, never a
//! silent default.

use crate::error::{ConfigError, Result};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;

/// The config sections the core cares about. Adapters may stash additional
/// adapter-specific sections (e.g. `discord`, `slack`) under the same map.
pub const CATEGORIES: &[&str] = &[
    "adapter",
    "attachments",
    "caching",
    "rate_limit",
    "logging",
    "socketio",
];

/// Loaded configuration, partitioned into sections.
#[derive(Debug, Clone, Default)]
pub struct Config {
    sections: HashMap<String, serde_yaml::Value>,
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse configuration from an in-memory YAML string (used by tests and by
    /// callers who already have the file contents).
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut sections = HashMap::new();
        if let serde_yaml::Value::Mapping(map) = raw {
            for (k, v) in map {
                if let serde_yaml::Value::String(key) = k {
                    sections.insert(key, v);
                }
            }
        }

        Ok(Self { sections })
    }

    /// Add or override a dynamic setting, mirroring the source's `add_setting`.
    /// Errors if the section doesn't exist or the key is already set.
    pub fn add_setting<T: serde::Serialize>(
        &mut self,
        section: &str,
        key: &str,
        value: T,
    ) -> Result<()> {
        let entry = self
            .sections
            .entry(section.to_string())
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));

        let serde_yaml::Value::Mapping(map) = entry else {
            return Err(ConfigError::Invalid(format!("section {section} is not a mapping")).into());
        };

        let key_val = serde_yaml::Value::String(key.to_string());
        if map.contains_key(&key_val) {
            return Err(ConfigError::Invalid(format!(
                "setting {section}.{key} already exists"
            ))
            .into());
        }

        map.insert(
            key_val,
            serde_yaml::to_value(value).map_err(|e| ConfigError::Invalid(e.to_string()))?,
        );
        Ok(())
    }

    /// Look up a setting, returning `None` if the section or key is absent.
    pub fn get<T: DeserializeOwned>(&self, section: &str, key: &str) -> Option<T> {
        let section = self.sections.get(section)?;
        let value = section.get(key)?;
        serde_yaml::from_value(value.clone()).ok()
    }

    /// Look up a setting with a caller-supplied default.
    pub fn get_or<T: DeserializeOwned>(&self, section: &str, key: &str, default: T) -> T {
        self.get(section, key).unwrap_or(default)
    }

    /// Look up a required setting; errors if missing.
    pub fn require<T: DeserializeOwned>(&self, section: &str, key: &str) -> Result<T> {
        self.get(section, key).ok_or_else(|| {
            ConfigError::MissingKey {
                section: section.to_string(),
                key: key.to_string(),
            }
            .into()
        })
    }

    /// Whether a setting is present.
    pub fn has_setting(&self, section: &str, key: &str) -> bool {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
adapter:
  adapter_name: test_adapter
  adapter_type: discord
  max_message_length: 2000
caching:
  max_messages_per_conversation: 100
  max_total_messages: 1000
  max_age_hours: 24
  cache_maintenance_interval: 300
"#;

    #[test]
    fn get_returns_typed_value() {
        let cfg = Config::from_yaml_str(SAMPLE).unwrap();
        let name: String = cfg.get("adapter", "adapter_name").unwrap();
        assert_eq!(name, "test_adapter");
        let len: u32 = cfg.get("adapter", "max_message_length").unwrap();
        assert_eq!(len, 2000);
    }

    #[test]
    fn get_missing_key_is_none() {
        let cfg = Config::from_yaml_str(SAMPLE).unwrap();
        assert!(cfg.get::<String>("adapter", "nonexistent").is_none());
    }

    #[test]
    fn get_or_falls_back_to_default() {
        let cfg = Config::from_yaml_str(SAMPLE).unwrap();
        let v: u32 = cfg.get_or("caching", "max_age_days", 7);
        assert_eq!(v, 7);
    }

    #[test]
    fn require_errors_on_missing_key() {
        let cfg = Config::from_yaml_str(SAMPLE).unwrap();
        let err = cfg.require::<String>("adapter", "missing").unwrap_err();
        assert!(err.to_string().contains("missing required config key"));
    }

    #[test]
    fn add_setting_rejects_duplicate() {
        let mut cfg = Config::from_yaml_str(SAMPLE).unwrap();
        assert!(cfg.add_setting("adapter", "new_key", "value").is_ok());
        assert!(cfg.add_setting("adapter", "new_key", "value2").is_err());
    }
}
