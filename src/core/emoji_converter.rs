//! Bidirectional mapping between platform-specific emoji names and a
//! canonical name set.
//!
//! The canonical name for an emoji with no explicit overlay entry is just its
//! platform-specific name standardized to lowercase-with-underscores; this
//! module only ever deals in names, never glyphs or codepoints. A CSV overlay
//! (`platform_specific_name,standard_name`) supplies the platform-specific
//! names that differ from the canonical ones, mirroring
//! `original_source/core/utils/emoji_converter.py`. The Zulip adapter is the
//! primary caller, normalizing `reaction` event emoji names on the way in and
//! converting back on the way out.

use crate::config::Config;
use std::collections::HashMap;

pub struct EmojiConverter {
    standard_to_platform_specific: HashMap<String, String>,
    platform_specific_to_standard: HashMap<String, String>,
}

impl EmojiConverter {
    /// Build the converter with no platform-specific overlay.
    pub fn new() -> Self {
        Self {
            standard_to_platform_specific: HashMap::new(),
            platform_specific_to_standard: HashMap::new(),
        }
    }

    /// Build from config's `adapter.emoji_mappings` CSV path, if set and
    /// readable. Mirrors the source's best-effort loading: a missing or
    /// unreadable file yields an empty overlay rather than an error.
    pub fn from_config(config: &Config) -> Self {
        let mut converter = Self::new();

        let Some(path) = config.get::<String>("adapter", "emoji_mappings") else {
            return converter;
        };

        let Ok(text) = std::fs::read_to_string(&path) else {
            tracing::warn!(path = %path, "could not read emoji mappings file");
            return converter;
        };

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        for result in reader.records() {
            let Ok(record) = result else { continue };
            let (Some(platform_specific), Some(standard)) = (record.get(0), record.get(1)) else {
                continue;
            };
            converter.add_mapping(platform_specific, standard);
        }

        converter
    }

    /// Register one platform-specific <-> standard name pair.
    pub fn add_mapping(&mut self, platform_specific_name: &str, standard_name: &str) {
        self.platform_specific_to_standard
            .insert(platform_specific_name.to_string(), standard_name.to_string());
        self.standard_to_platform_specific
            .insert(standard_name.to_string(), platform_specific_name.to_string());
    }

    /// Convert a platform-specific emoji name to the canonical (standardized)
    /// name. Falls back to the input unchanged if no mapping exists — the
    /// platform name and the canonical name are assumed equal in that case.
    pub fn platform_specific_to_standard(&self, emoji_name: &str) -> String {
        self.platform_specific_to_standard
            .get(emoji_name)
            .cloned()
            .unwrap_or_else(|| standardize(emoji_name))
    }

    /// Convert a canonical (standardized) emoji name back to the
    /// platform-specific spelling, falling back to the input unchanged.
    pub fn standard_to_platform_specific(&self, emoji_name: &str) -> String {
        let standard = standardize(emoji_name);
        self.standard_to_platform_specific
            .get(&standard)
            .cloned()
            .unwrap_or_else(|| emoji_name.to_string())
    }
}

impl Default for EmojiConverter {
    fn default() -> Self {
        Self::new()
    }
}

/// Standardize an emoji name the way the source does: lowercase, hyphens to
/// underscores, with surrounding colons stripped.
fn standardize(name: &str) -> String {
    name.trim_matches(':').to_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_no_overlay_is_identity_after_standardization() {
        let converter = EmojiConverter::new();
        let standard = converter.platform_specific_to_standard("thumbsup");
        let back = converter.standard_to_platform_specific(&standard);
        assert_eq!(back, standard);
    }

    #[test]
    fn overlay_round_trips_exactly() {
        let mut converter = EmojiConverter::new();
        converter.add_mapping("slightly_smiling_face", "slight_smile");

        let standard = converter.platform_specific_to_standard("slightly_smiling_face");
        assert_eq!(standard, "slight_smile");

        let back = converter.standard_to_platform_specific(&standard);
        assert_eq!(back, "slightly_smiling_face");
    }

    #[test]
    fn unknown_name_falls_back_unchanged() {
        let converter = EmojiConverter::new();
        assert_eq!(
            converter.standard_to_platform_specific("totally_made_up"),
            "totally_made_up"
        );
    }
}
