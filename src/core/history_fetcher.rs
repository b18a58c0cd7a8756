//! Serves a bounded, ordered history window for a conversation, merging the
//! local message cache with API backfill.
//!
//! Grounded directly on spec.md §4.7 (no original-source module was
//! retrieved for this component specifically; the Python project fetches
//! history inline within each adapter's history handler instead of through a
//! dedicated class). Built as a small generic wrapper over `MessageCache`
//! plus a platform-supplied `HistoryApi`, following the same
//! one-small-trait-per-concern shape as `PlatformAdapter`.

use crate::core::cache::message_cache::MessageCache;
use crate::core::conversation::data_classes::CachedMessage;
use crate::core::rate_limiter::{RateLimitKind, RateLimiter};
use std::sync::Arc;

/// Where the fetch window is anchored.
#[derive(Debug, Clone)]
pub enum HistoryAnchor {
    /// Skip the cache; fetch from the API starting at this message id.
    Message(String),
    Before(i64),
    After(i64),
}

/// Platform-supplied raw history access. One batch per call; the fetcher
/// keeps calling until `history_limit` is reached or a batch comes back
/// short (signaling exhaustion).
pub trait HistoryApi: Send + Sync {
    fn fetch_batch(
        &self,
        conversation_id: &str,
        anchor: &HistoryAnchor,
        limit: usize,
    ) -> impl std::future::Future<Output = crate::error::Result<Vec<CachedMessage>>> + Send;
}

pub struct HistoryFetcher<A: HistoryApi> {
    api: A,
    message_cache: Arc<MessageCache>,
    rate_limiter: Arc<RateLimiter>,
}

impl<A: HistoryApi> HistoryFetcher<A> {
    pub fn new(api: A, message_cache: Arc<MessageCache>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            api,
            message_cache,
            rate_limiter,
        }
    }

    /// Fetch up to `history_limit` messages for `conversation_id`, ordered
    /// ascending by timestamp. Cooperatively cancellable: dropping the
    /// returned future aborts any outstanding batch fetch.
    pub async fn fetch(&self, conversation_id: &str, anchor: HistoryAnchor, history_limit: usize) -> crate::error::Result<Vec<CachedMessage>> {
        let mut result = match &anchor {
            HistoryAnchor::Message(_) => self.fetch_from_api(conversation_id, &anchor, history_limit).await?,
            HistoryAnchor::Before(_) | HistoryAnchor::After(_) => {
                self.fetch_merged(conversation_id, &anchor, history_limit).await?
            }
        };

        result.sort_by_key(|m| m.timestamp);
        result.truncate(history_limit);
        Ok(result)
    }

    async fn fetch_from_api(&self, conversation_id: &str, anchor: &HistoryAnchor, limit: usize) -> crate::error::Result<Vec<CachedMessage>> {
        let mut collected = Vec::new();
        loop {
            self.rate_limiter
                .limit_request(RateLimitKind::FetchHistory, Some(conversation_id))
                .await;

            let remaining = limit.saturating_sub(collected.len());
            if remaining == 0 {
                break;
            }

            let batch = self.api.fetch_batch(conversation_id, anchor, remaining).await?;
            let batch_len = batch.len();
            collected.extend(batch);

            if batch_len < remaining || collected.len() >= limit {
                break;
            }
        }
        Ok(collected)
    }

    /// Cache-first: filter the cached window by `before`/`after`, and only
    /// hit the API for the shortfall.
    async fn fetch_merged(&self, conversation_id: &str, anchor: &HistoryAnchor, limit: usize) -> crate::error::Result<Vec<CachedMessage>> {
        let cached_ids = self.message_cache.ids_for_conversation(conversation_id).await;
        let mut cached = Vec::with_capacity(cached_ids.len());
        for id in cached_ids {
            if let Some(message) = self.message_cache.get_message_by_id(conversation_id, &id).await {
                cached.push(message);
            }
        }

        let bound = match anchor {
            HistoryAnchor::Before(ts) => *ts,
            HistoryAnchor::After(ts) => *ts,
            HistoryAnchor::Message(_) => unreachable!("handled by fetch_from_api"),
        };
        cached.retain(|m| match anchor {
            HistoryAnchor::Before(_) => m.timestamp < bound,
            HistoryAnchor::After(_) => m.timestamp > bound,
            HistoryAnchor::Message(_) => true,
        });
        cached.sort_by_key(|m| m.timestamp);
        cached.truncate(limit);

        if cached.len() >= limit {
            return Ok(cached);
        }

        let shortfall = limit - cached.len();
        let api_anchor = match (anchor, cached.first(), cached.last()) {
            (HistoryAnchor::Before(_), Some(oldest), _) => HistoryAnchor::Before(oldest.timestamp),
            (HistoryAnchor::After(_), _, Some(newest)) => HistoryAnchor::After(newest.timestamp),
            (other, _, _) => other.clone(),
        };

        let fetched = self.fetch_from_api(conversation_id, &api_anchor, shortfall).await?;
        cached.extend(fetched);
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeApi {
        calls: AtomicUsize,
    }

    fn msg(id: &str, ts: i64) -> CachedMessage {
        CachedMessage {
            message_id: id.into(),
            conversation_id: "c1".into(),
            thread_id: None,
            reply_to_message_id: None,
            sender_id: "u1".into(),
            sender_name: "Alice".into(),
            is_from_bot: false,
            text: Some("hi".into()),
            timestamp: ts,
            edit_timestamp: None,
            edited: false,
            is_pinned: false,
            reactions: Default::default(),
            attachments: Default::default(),
        }
    }

    impl HistoryApi for FakeApi {
        async fn fetch_batch(&self, _conversation_id: &str, _anchor: &HistoryAnchor, limit: usize) -> crate::error::Result<Vec<CachedMessage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..limit.min(2)).map(|i| msg(&format!("api{i}"), 100 + i as i64)).collect())
        }
    }

    #[tokio::test]
    async fn results_are_sorted_ascending_by_timestamp() {
        let cache = Arc::new(MessageCache::new(100, 1000, 24, 300));
        let rate_limiter = Arc::new(RateLimiter::new(6000, 6000, 6000));
        let fetcher = HistoryFetcher::new(FakeApi { calls: AtomicUsize::new(0) }, cache, rate_limiter);

        let history = fetcher.fetch("c1", HistoryAnchor::Message("m1".into()), 2).await.unwrap();
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn cache_hit_avoids_api_call() {
        let cache = Arc::new(MessageCache::new(100, 1000, 24, 300));
        cache
            .add_message(crate::core::conversation::data_classes::MessageFields {
                message_id: "m1".into(),
                conversation_id: "c1".into(),
                thread_id: None,
                reply_to_message_id: None,
                sender_id: "u1".into(),
                sender_name: "Alice".into(),
                is_from_bot: false,
                text: Some("hi".into()),
                timestamp: 50,
            })
            .await;

        let rate_limiter = Arc::new(RateLimiter::new(6000, 6000, 6000));
        let fetcher = HistoryFetcher::new(FakeApi { calls: AtomicUsize::new(0) }, Arc::clone(&cache), rate_limiter);

        let history = fetcher.fetch("c1", HistoryAnchor::Before(100), 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message_id, "m1");
    }
}
