//! Canonical data types shared by every conversation manager: cached messages,
//! cached attachments, thread info, conversation info, user info, and the
//! delta emitted by every manager operation.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// A canonical message, the unit tracked by `MessageCache`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub thread_id: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub sender_id: String,
    pub sender_name: String,
    pub is_from_bot: bool,
    pub text: Option<String>,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub edit_timestamp: Option<i64>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub is_pinned: bool,
    /// Canonical emoji name -> count. Invariant: a count of zero implies the
    /// key is absent (enforced by `add_reaction`/`remove_reaction`).
    #[serde(default)]
    pub reactions: HashMap<String, u32>,
    #[serde(default)]
    pub attachments: HashSet<String>,
}

impl CachedMessage {
    /// Age of the message in seconds relative to `now_ms` (milliseconds since
    /// epoch), mirroring the source's `age_seconds` property.
    pub fn age_seconds(&self, now_ms: i64) -> f64 {
        (now_ms - self.timestamp) as f64 / 1000.0
    }
}

/// Fields needed to construct a `CachedMessage`, produced by `MessageBuilder`.
#[derive(Debug, Clone, Default)]
pub struct MessageFields {
    pub message_id: String,
    pub conversation_id: String,
    pub thread_id: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub sender_id: String,
    pub sender_name: String,
    pub is_from_bot: bool,
    pub text: Option<String>,
    pub timestamp: i64,
}

/// A cached attachment record, the unit tracked by `AttachmentCache`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAttachment {
    pub attachment_id: String,
    pub attachment_type: String,
    pub file_extension: Option<String>,
    /// ISO-8601 timestamp.
    pub created_at: String,
    pub size: u64,
    #[serde(default)]
    pub conversations: HashSet<String>,
}

impl CachedAttachment {
    /// Path relative to `storage_dir`: `<type>/<id>/<id>[.ext]`.
    pub fn file_path(&self) -> String {
        match &self.file_extension {
            Some(ext) if !ext.is_empty() => format!(
                "{}/{}/{}.{}",
                self.attachment_type, self.attachment_id, self.attachment_id, ext
            ),
            _ => format!(
                "{}/{}/{}",
                self.attachment_type, self.attachment_id, self.attachment_id
            ),
        }
    }

    /// Path to the sibling metadata JSON file: `<type>/<id>/<id>.json`.
    pub fn metadata_path(&self) -> String {
        format!(
            "{}/{}/{}.json",
            self.attachment_type, self.attachment_id, self.attachment_id
        )
    }
}

/// Fields supplied by an adapter to describe a new attachment.
#[derive(Debug, Clone)]
pub struct AttachmentFields {
    pub attachment_id: String,
    pub attachment_type: String,
    pub file_extension: Option<String>,
    pub size: u64,
}

/// A reply-chain's metadata.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub thread_id: String,
    pub root_message_id: String,
    pub title: Option<String>,
    pub last_activity: i64,
    pub messages: HashSet<String>,
}

impl ThreadInfo {
    pub fn new(thread_id: impl Into<String>, root_message_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            thread_id: thread_id.into(),
            root_message_id: root_message_id.into(),
            title: None,
            last_activity: now_ms,
            messages: HashSet::new(),
        }
    }
}

/// A known conversation member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub is_bot: bool,
}

impl UserInfo {
    /// Derived display name: username, else concatenated name parts, else
    /// email, else `"User <id>"`.
    pub fn display_name(&self) -> String {
        if let Some(username) = &self.username {
            if !username.is_empty() {
                return username.clone();
            }
        }

        let full_name = [&self.first_name, &self.last_name]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        if !full_name.is_empty() {
            return full_name;
        }

        if let Some(email) = &self.email {
            if !email.is_empty() {
                return email.clone();
            }
        }

        format!("User {}", self.user_id)
    }

    /// The mention token recognized for this user, adapter-formatting aside:
    /// by default the user id itself (platforms format mentions around it).
    pub fn mention(&self) -> String {
        self.user_id.clone()
    }
}

/// In-memory state for a single conversation.
#[derive(Debug, Clone)]
pub struct ConversationInfo {
    pub conversation_id: String,
    pub platform_conversation_id: String,
    pub conversation_type: String,
    pub conversation_name: Option<String>,
    pub server_id: Option<String>,
    pub server_name: Option<String>,
    pub created_at: i64,
    pub last_activity: i64,
    pub known_members: HashMap<String, UserInfo>,
    pub messages: HashSet<String>,
    pub pinned_messages: HashSet<String>,
    pub threads: HashMap<String, ThreadInfo>,
    pub attachments: HashSet<String>,
    /// True until the first delta is emitted; causes `fetch_history=true`.
    pub just_started: bool,
}

impl ConversationInfo {
    pub fn new(
        conversation_id: impl Into<String>,
        platform_conversation_id: impl Into<String>,
        conversation_type: impl Into<String>,
        conversation_name: Option<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            platform_conversation_id: platform_conversation_id.into(),
            conversation_type: conversation_type.into(),
            conversation_name,
            server_id: None,
            server_name: None,
            created_at: now_ms,
            last_activity: now_ms,
            known_members: HashMap::new(),
            messages: HashSet::new(),
            pinned_messages: HashSet::new(),
            threads: HashMap::new(),
            attachments: HashSet::new(),
            just_started: true,
        }
    }
}

/// A single message record as it appears in a delta's added/updated lists.
#[derive(Debug, Clone, Serialize)]
pub struct DeltaMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub sender: DeltaSender,
    pub text: Option<String>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_timestamp: Option<i64>,
    #[serde(default)]
    pub edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub is_direct_message: bool,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
    #[serde(default)]
    pub mentions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeltaSender {
    pub user_id: String,
    pub display_name: String,
}

/// The diff produced by every `ConversationManager` public operation.
/// Empty lists / false flags are omitted on the wire (see `Serialize` impl
/// driven by `skip_serializing_if`).
#[derive(Debug, Clone, Serialize, Default)]
pub struct ConversationDelta {
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fetch_history: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub history_fetching_in_progress: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_messages: Vec<DeltaMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updated_messages: Vec<DeltaMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted_message_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_reactions: Vec<ReactionDelta>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed_reactions: Vec<ReactionDelta>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pinned_message_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unpinned_message_ids: Vec<String>,
    /// Whether bot-originated messages should be included in `added_messages`
    /// (set during history replay). Not part of the wire shape.
    #[serde(skip)]
    pub display_bot_messages: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactionDelta {
    pub message_id: String,
    pub conversation_id: String,
    pub emoji: String,
}

impl ConversationDelta {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Default::default()
        }
    }
}

/// Derive the canonical `<adapter>_<21char>` conversation id from a platform's
/// native conversation identifier: SHA-256 the platform id, take the first 16
/// bytes, standard-base64-encode them, substitute `+`->`A` and `/`->`B`, and
/// keep the first 21 characters. Deterministic per `(adapter, platform_id)`.
pub fn canonical_conversation_id(adapter: &str, platform_id: &str) -> String {
    let digest = Sha256::digest(platform_id.as_bytes());
    let encoded = base64::engine::general_purpose::STANDARD.encode(&digest[..16]);
    let substituted: String = encoded
        .chars()
        .map(|c| match c {
            '+' => 'A',
            '/' => 'B',
            other => other,
        })
        .take(21)
        .collect();
    format!("{adapter}_{substituted}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_id_is_deterministic() {
        let a = canonical_conversation_id("discord", "123:456");
        let b = canonical_conversation_id("discord", "123:456");
        assert_eq!(a, b);
        assert!(a.starts_with("discord_"));
        assert_eq!(a.len(), "discord_".len() + 21);
    }

    #[test]
    fn canonical_id_differs_by_platform_id() {
        let a = canonical_conversation_id("discord", "123:456");
        let b = canonical_conversation_id("discord", "123:457");
        assert_ne!(a, b);
    }

    #[test]
    fn display_name_prefers_username() {
        let user = UserInfo {
            user_id: "u1".into(),
            username: Some("alice".into()),
            first_name: Some("Alice".into()),
            last_name: None,
            email: None,
            is_bot: false,
        };
        assert_eq!(user.display_name(), "alice");
    }

    #[test]
    fn display_name_falls_back_to_name_parts() {
        let user = UserInfo {
            user_id: "u1".into(),
            username: None,
            first_name: Some("Alice".into()),
            last_name: Some("Smith".into()),
            email: None,
            is_bot: false,
        };
        assert_eq!(user.display_name(), "Alice Smith");
    }

    #[test]
    fn display_name_falls_back_to_user_id() {
        let user = UserInfo {
            user_id: "u1".into(),
            username: None,
            first_name: None,
            last_name: None,
            email: None,
            is_bot: false,
        };
        assert_eq!(user.display_name(), "User u1");
    }

    #[test]
    fn delta_omits_empty_lists() {
        let delta = ConversationDelta::new("c1");
        let json = serde_json::to_value(&delta).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("added_messages"));
        assert!(!obj.contains_key("fetch_history"));
        assert_eq!(obj.get("conversation_id").unwrap(), "c1");
    }
}
