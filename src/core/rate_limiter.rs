//! Process-wide rate limiter enforcing a three-tier RPM budget: global,
//! per-conversation, and per-request-class.
//!
//! Hand-rolled rather than built on the `governor` crate: governor's GCRA
//! model doesn't cleanly expose a query-then-commit `wait_time`/`limit_request`
//! pair across three independently keyed scopes, nor the zero-RPM 1-second
//! fallback this component requires.

use crate::config::Config;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// The scope-selecting tag attached to every outgoing API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitKind {
    General,
    Message,
    FetchHistory,
    AddReaction,
    RemoveReaction,
    EditMessage,
    DeleteMessage,
    Download,
    GetUserInfo,
    Upload,
}

impl RateLimitKind {
    /// Whether this kind engages the `message_rpm` scope in addition to the
    /// global scope.
    fn engages_message_scope(self) -> bool {
        matches!(
            self,
            RateLimitKind::Message | RateLimitKind::EditMessage | RateLimitKind::DeleteMessage
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ScopeState {
    last: Option<Instant>,
    count: u64,
}

struct Inner {
    global: ScopeState,
    per_class: HashMap<RateLimitKind, ScopeState>,
    per_conversation: HashMap<String, ScopeState>,
}

/// Fallback wait when an RPM budget is misconfigured as zero.
const ZERO_RPM_FALLBACK: Duration = Duration::from_secs(1);

pub struct RateLimiter {
    global_rpm: u32,
    per_conversation_rpm: u32,
    message_rpm: u32,
    state: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(global_rpm: u32, per_conversation_rpm: u32, message_rpm: u32) -> Self {
        Self {
            global_rpm,
            per_conversation_rpm,
            message_rpm,
            state: Mutex::new(Inner {
                global: ScopeState::default(),
                per_class: HashMap::new(),
                per_conversation: HashMap::new(),
            }),
        }
    }

    /// Build from the `rate_limit` config section's `global_rpm`,
    /// `per_conversation_rpm`, and `message_rpm` keys.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.get_or("rate_limit", "global_rpm", 60),
            config.get_or("rate_limit", "per_conversation_rpm", 20),
            config.get_or("rate_limit", "message_rpm", 20),
        )
    }

    fn window(rpm: u32) -> Option<Duration> {
        if rpm == 0 {
            None
        } else {
            Some(Duration::from_secs_f64(60.0 / rpm as f64))
        }
    }

    fn remaining(window: Duration, last: Option<Instant>, now: Instant) -> Duration {
        match last {
            Some(last) => window.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Compute how long the caller must wait before this `kind` of call
    /// (optionally scoped to `conversation_id`) is permitted.
    pub async fn wait_time(&self, kind: RateLimitKind, conversation_id: Option<&str>) -> Duration {
        let now = Instant::now();
        let state = self.state.lock().await;

        let global_window = match Self::window(self.global_rpm) {
            Some(w) => w,
            None => return ZERO_RPM_FALLBACK,
        };
        let t_global = Self::remaining(global_window, state.global.last, now);

        let t_conversation = match conversation_id {
            Some(conv) => match Self::window(self.per_conversation_rpm) {
                Some(w) => {
                    let last = state.per_conversation.get(conv).and_then(|s| s.last);
                    Self::remaining(w, last, now)
                }
                None => return ZERO_RPM_FALLBACK,
            },
            None => Duration::ZERO,
        };

        let t_class = if kind.engages_message_scope() {
            match Self::window(self.message_rpm) {
                Some(w) => {
                    let last = state.per_class.get(&kind).and_then(|s| s.last);
                    Self::remaining(w, last, now)
                }
                None => return ZERO_RPM_FALLBACK,
            }
        } else {
            Duration::ZERO
        };

        t_global.max(t_conversation).max(t_class)
    }

    /// Wait the computed `wait_time`, then atomically update the relevant
    /// scope timestamps/counters. Cancellation (dropping the future) aborts
    /// the wait without touching state, since `tokio::time::sleep` is itself
    /// cancel-safe.
    pub async fn limit_request(&self, kind: RateLimitKind, conversation_id: Option<&str>) {
        let wait = self.wait_time(kind, conversation_id).await;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let now = Instant::now();
        let mut state = self.state.lock().await;

        state.global.last = Some(now);
        state.global.count += 1;

        if let Some(conv) = conversation_id {
            let entry = state.per_conversation.entry(conv.to_string()).or_default();
            entry.last = Some(now);
            entry.count += 1;
        }

        if kind.engages_message_scope() {
            let entry = state.per_class.entry(kind).or_default();
            entry.last = Some(now);
            entry.count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_never_waits() {
        let limiter = RateLimiter::new(60, 60, 60);
        let wait = limiter.wait_time(RateLimitKind::General, None).await;
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn zero_rpm_falls_back_to_one_second() {
        let limiter = RateLimiter::new(0, 60, 60);
        let wait = limiter.wait_time(RateLimitKind::General, None).await;
        assert_eq!(wait, ZERO_RPM_FALLBACK);
    }

    #[tokio::test]
    async fn second_call_waits_out_the_window() {
        // 60 rpm => a 1-second window.
        let limiter = RateLimiter::new(60, 60, 60);
        limiter.limit_request(RateLimitKind::General, None).await;
        let wait = limiter.wait_time(RateLimitKind::General, None).await;
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn message_scope_only_engaged_by_message_kinds() {
        let limiter = RateLimiter::new(6000, 6000, 1);
        limiter.limit_request(RateLimitKind::Message, None).await;
        // A non-message kind shouldn't be slowed by the message scope.
        let wait = limiter.wait_time(RateLimitKind::General, None).await;
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn per_conversation_scope_is_independent() {
        let limiter = RateLimiter::new(6000, 1, 6000);
        limiter
            .limit_request(RateLimitKind::General, Some("c1"))
            .await;
        let wait_same = limiter.wait_time(RateLimitKind::General, Some("c1")).await;
        let wait_other = limiter.wait_time(RateLimitKind::General, Some("c2")).await;
        assert!(wait_same > Duration::ZERO);
        assert_eq!(wait_other, Duration::ZERO);
    }
}
