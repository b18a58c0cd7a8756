//! Reaction count bookkeeping on a `CachedMessage`.
//!
//! Grounded on `original_source/src/core/conversation/base_reaction_handler.py`:
//! plain counter add/remove, zero-count entries pruned from the map.

use crate::core::conversation::data_classes::CachedMessage;

pub fn add_reaction(message: &mut CachedMessage, emoji: &str) {
    *message.reactions.entry(emoji.to_string()).or_insert(0) += 1;
}

/// No-op if `emoji` isn't present. Drops the entry once its count reaches
/// zero, so presence in the map always implies a positive count.
pub fn remove_reaction(message: &mut CachedMessage, emoji: &str) {
    if let Some(count) = message.reactions.get_mut(emoji) {
        *count -= 1;
        if *count == 0 {
            message.reactions.remove(emoji);
        }
    }
}

/// Diff two reaction snapshots (e.g. before/after a Telegram `message_reaction`
/// update, which reports the full current set rather than a single add/remove),
/// returning `(added, removed)` emoji lists.
pub fn diff_snapshots(before: &[String], after: &[String]) -> (Vec<String>, Vec<String>) {
    let added = after.iter().filter(|e| !before.contains(e)).cloned().collect();
    let removed = before.iter().filter(|e| !after.contains(e)).cloned().collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn message() -> CachedMessage {
        CachedMessage {
            message_id: "m1".into(),
            conversation_id: "c1".into(),
            thread_id: None,
            reply_to_message_id: None,
            sender_id: "u1".into(),
            sender_name: "Alice".into(),
            is_from_bot: false,
            text: None,
            timestamp: 0,
            edit_timestamp: None,
            edited: false,
            is_pinned: false,
            reactions: HashMap::new(),
            attachments: Default::default(),
        }
    }

    #[test]
    fn add_then_remove_clears_entry() {
        let mut msg = message();
        add_reaction(&mut msg, "thumbsup");
        add_reaction(&mut msg, "thumbsup");
        assert_eq!(msg.reactions["thumbsup"], 2);

        remove_reaction(&mut msg, "thumbsup");
        assert_eq!(msg.reactions["thumbsup"], 1);
        remove_reaction(&mut msg, "thumbsup");
        assert!(!msg.reactions.contains_key("thumbsup"));
    }

    #[test]
    fn remove_reaction_on_absent_emoji_is_noop() {
        let mut msg = message();
        remove_reaction(&mut msg, "ghost");
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn diff_snapshots_reports_added_and_removed() {
        let before = vec!["a".to_string(), "b".to_string()];
        let after = vec!["b".to_string(), "c".to_string()];
        let (added, removed) = diff_snapshots(&before, &after);
        assert_eq!(added, vec!["c".to_string()]);
        assert_eq!(removed, vec!["a".to_string()]);
    }
}
