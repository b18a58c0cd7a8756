//! Bounded, age-evicted store of `conversation_id -> message_id -> CachedMessage`.
//!
//! Grounded on `original_source/core/cache/message_cache.py`. A single mutex
//! guards the whole map, matching the source's single `asyncio.Lock`.

use crate::config::Config;
use crate::core::conversation::data_classes::{CachedMessage, MessageFields};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Inner {
    messages: HashMap<String, HashMap<String, CachedMessage>>,
}

pub struct MessageCache {
    inner: Mutex<Inner>,
    max_messages_per_conversation: usize,
    max_total_messages: usize,
    max_age_seconds: i64,
    maintenance_interval_secs: u64,
}

impl MessageCache {
    pub fn new(
        max_messages_per_conversation: usize,
        max_total_messages: usize,
        max_age_hours: u64,
        maintenance_interval_secs: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: HashMap::new(),
            }),
            max_messages_per_conversation,
            max_total_messages,
            max_age_seconds: (max_age_hours * 3600) as i64,
            maintenance_interval_secs,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.get_or("caching", "max_messages_per_conversation", 500),
            config.get_or("caching", "max_total_messages", 5000),
            config.get_or("caching", "max_age_hours", 24u64),
            config.get_or("caching", "cache_maintenance_interval", 300u64),
        )
    }

    /// All message ids cached for a conversation, in arbitrary (map) order.
    pub async fn ids_for_conversation(&self, conversation_id: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .messages
            .get(conversation_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_message_by_id(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Option<CachedMessage> {
        let inner = self.inner.lock().await;
        inner
            .messages
            .get(conversation_id)
            .and_then(|m| m.get(message_id))
            .cloned()
    }

    /// Idempotent: if `(conversation_id, message_id)` already exists, the
    /// existing record is returned unchanged.
    pub async fn add_message(&self, fields: MessageFields) -> CachedMessage {
        let mut inner = self.inner.lock().await;
        let conv = inner
            .messages
            .entry(fields.conversation_id.clone())
            .or_default();

        if let Some(existing) = conv.get(&fields.message_id) {
            return existing.clone();
        }

        let message = CachedMessage {
            message_id: fields.message_id.clone(),
            conversation_id: fields.conversation_id,
            thread_id: fields.thread_id,
            reply_to_message_id: fields.reply_to_message_id,
            sender_id: fields.sender_id,
            sender_name: fields.sender_name,
            is_from_bot: fields.is_from_bot,
            text: fields.text,
            timestamp: fields.timestamp,
            edit_timestamp: None,
            edited: false,
            is_pinned: false,
            reactions: HashMap::new(),
            attachments: Default::default(),
        };

        conv.insert(fields.message_id, message.clone());
        message
    }

    /// Mutate a cached message in place via `f`, returning the updated
    /// record, or `None` if absent.
    pub async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        f: impl FnOnce(&mut CachedMessage),
    ) -> Option<CachedMessage> {
        let mut inner = self.inner.lock().await;
        let message = inner.messages.get_mut(conversation_id)?.get_mut(message_id)?;
        f(message);
        Some(message.clone())
    }

    /// Atomically move a message's record to a new conversation id, updating
    /// its `conversation_id` field, used for cross-conversation migration.
    pub async fn migrate_message(&self, old_conversation_id: &str, new_conversation_id: &str, message_id: &str) {
        let mut inner = self.inner.lock().await;

        let Some(mut message) = inner
            .messages
            .get_mut(old_conversation_id)
            .and_then(|m| m.remove(message_id))
        else {
            return;
        };

        message.conversation_id = new_conversation_id.to_string();
        inner
            .messages
            .entry(new_conversation_id.to_string())
            .or_default()
            .insert(message_id.to_string(), message);
    }

    pub async fn delete_message(&self, conversation_id: &str, message_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner
            .messages
            .get_mut(conversation_id)
            .map(|m| m.remove(message_id).is_some())
            .unwrap_or(false)
    }

    /// Spawn the background maintenance loop. Exits when `shutdown` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(cache.maintenance_interval_secs.max(1));
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        cache.run_maintenance().await;
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

    async fn run_maintenance(&self) {
        let mut inner = self.inner.lock().await;

        let conversation_ids: Vec<String> = inner.messages.keys().cloned().collect();
        for conversation_id in conversation_ids {
            enforce_conversation_limit(&mut inner, &conversation_id, self.max_messages_per_conversation);
        }
        enforce_total_limit(&mut inner, self.max_total_messages);
        inner.messages.retain(|_, msgs| !msgs.is_empty());

        tracing::debug!(
            total = inner.messages.values().map(|m| m.len()).sum::<usize>(),
            "message cache maintenance completed"
        );
    }
}

fn enforce_conversation_limit(inner: &mut Inner, conversation_id: &str, max: usize) {
    let Some(conv) = inner.messages.get(conversation_id) else {
        return;
    };
    if conv.len() <= max {
        return;
    }

    let mut sorted: Vec<CachedMessage> = conv.values().cloned().collect();
    sorted.sort_by_key(|m| m.timestamp);
    let keep: HashMap<String, CachedMessage> = sorted
        .into_iter()
        .rev()
        .take(max)
        .map(|m| (m.message_id.clone(), m))
        .collect();

    inner.messages.insert(conversation_id.to_string(), keep);
}

fn enforce_total_limit(inner: &mut Inner, max_total: usize) {
    let total: usize = inner.messages.values().map(|m| m.len()).sum();
    if total <= max_total {
        return;
    }
    let to_remove = total - max_total;

    let mut all: Vec<(String, String, i64)> = inner
        .messages
        .iter()
        .flat_map(|(conv_id, msgs)| {
            msgs.values()
                .map(move |m| (conv_id.clone(), m.message_id.clone(), m.timestamp))
        })
        .collect();
    all.sort_by_key(|(_, _, ts)| *ts);

    for (conv_id, msg_id, _) in all.into_iter().take(to_remove) {
        if let Some(conv) = inner.messages.get_mut(&conv_id) {
            conv.remove(&msg_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(conv: &str, id: &str, ts: i64) -> MessageFields {
        MessageFields {
            message_id: id.into(),
            conversation_id: conv.into(),
            thread_id: None,
            reply_to_message_id: None,
            sender_id: "u1".into(),
            sender_name: "Alice".into(),
            is_from_bot: false,
            text: Some("hi".into()),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn add_message_is_idempotent() {
        let cache = MessageCache::new(100, 1000, 24, 300);
        let a = cache.add_message(fields("c1", "m1", 1)).await;
        let b = cache.add_message(fields("c1", "m1", 2)).await;
        assert_eq!(a.timestamp, b.timestamp);
    }

    #[tokio::test]
    async fn add_then_delete_idempotence() {
        let cache = MessageCache::new(100, 1000, 24, 300);
        cache.add_message(fields("c1", "m1", 1)).await;
        assert!(cache.delete_message("c1", "m1").await);
        assert!(!cache.delete_message("c1", "m1").await);
    }

    #[tokio::test]
    async fn migrate_message_moves_conversation() {
        let cache = MessageCache::new(100, 1000, 24, 300);
        cache.add_message(fields("c1", "m1", 1)).await;
        cache.migrate_message("c1", "c2", "m1").await;

        assert!(cache.get_message_by_id("c1", "m1").await.is_none());
        let moved = cache.get_message_by_id("c2", "m1").await.unwrap();
        assert_eq!(moved.conversation_id, "c2");
    }

    #[tokio::test]
    async fn conversation_limit_keeps_newest() {
        let cache = MessageCache::new(2, 1000, 24, 300);
        cache.add_message(fields("c1", "m1", 1)).await;
        cache.add_message(fields("c1", "m2", 2)).await;
        cache.add_message(fields("c1", "m3", 3)).await;

        cache.run_maintenance().await;

        assert!(cache.get_message_by_id("c1", "m1").await.is_none());
        assert!(cache.get_message_by_id("c1", "m2").await.is_some());
        assert!(cache.get_message_by_id("c1", "m3").await.is_some());
    }

    #[tokio::test]
    async fn total_limit_evicts_oldest_across_conversations() {
        let cache = MessageCache::new(100, 1, 24, 300);
        cache.add_message(fields("c1", "m1", 1)).await;
        cache.add_message(fields("c2", "m2", 2)).await;

        cache.run_maintenance().await;

        assert!(cache.get_message_by_id("c1", "m1").await.is_none());
        assert!(cache.get_message_by_id("c2", "m2").await.is_some());
    }
}
