//! Slack adapter: Socket Mode ingestion plus the canonical
//! `PlatformAdapter`/`OutgoingActions`/`HistoryApi` seams.
//!
//! Built on `slack-morphism`'s Socket Mode client (session construction,
//! listener startup, per-action request shapes). Edits/deletes/inbound
//! reactions aren't wired up: Slack's Socket Mode push events filter out
//! message subtypes and never deliver a `reaction_added`/`reaction_removed`
//! push, so this adapter only produces `message_received` inbound. Outbound
//! add/remove reaction is still implemented since `reactions_add`/
//! `reactions_remove` are real API calls regardless.

use crate::config::Config;
use crate::core::cache::{AttachmentCache, MessageCache};
use crate::core::conversation::data_classes::{CachedMessage, ConversationDelta, ConversationInfo, MessageFields, UserInfo};
use crate::core::conversation::{ConversationManager, PlatformAdapter};
use crate::core::event_processors::incoming::IncomingEventBuilder;
use crate::core::event_processors::outgoing::{OutgoingActions, OutgoingEventProcessor};
use crate::core::history_fetcher::{HistoryAnchor, HistoryApi, HistoryFetcher};
use crate::core::rate_limiter::RateLimiter;
use crate::core::AttachmentUploader;
use crate::core::socket_io::SocketIoServer;
use crate::error::PlatformError;
use crate::messaging::traits::Messaging;

use anyhow::Context as _;
use serde_json::{json, Value};
use slack_morphism::prelude::*;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

/// State shared with Socket Mode callbacks via `SlackClientEventsUserState`.
struct SlackUserState {
    event_tx: mpsc::Sender<SlackMessageEvent>,
    bot_user_id: String,
}

#[derive(Clone)]
pub struct SlackAdapter {
    adapter_name: Arc<String>,
    bot_token: Arc<String>,
    app_token: Arc<String>,
    max_message_length: usize,
    history_limit: usize,
    /// Constructed once alongside the shared REST client; the Socket Mode
    /// listener opens its own client instance since it owns a persistent
    /// websocket connection for the process lifetime.
    client: Arc<SlackHyperClient>,
    token: Arc<SlackApiToken>,
    bot_user_id: Arc<RwLock<Option<String>>>,
}

impl SlackAdapter {
    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        let bot_token: String = config.require("slack", "bot_token")?;
        let app_token: String = config.require("slack", "app_token")?;
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack http connector")?,
        ));
        let token = Arc::new(SlackApiToken::new(SlackApiTokenValue(bot_token.clone())));
        Ok(Self {
            adapter_name: Arc::new(config.get_or("adapter", "adapter_name", "slack".to_string())),
            bot_token: Arc::new(bot_token),
            app_token: Arc::new(app_token),
            max_message_length: config.get_or("adapter", "max_message_length", 12_000),
            history_limit: config.get_or("adapter", "history_limit", 50),
            client,
            token,
            bot_user_id: Arc::new(RwLock::new(None)),
        })
    }

    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }

    fn required_str(data: &Value, field: &str) -> crate::error::Result<String> {
        data.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PlatformError::Slack(format!("missing {field}")).into())
    }

    fn channel_and_ts(data: &Value) -> crate::error::Result<(SlackChannelId, SlackTs)> {
        let conversation_id = data
            .get("conversation_id")
            .and_then(Value::as_str)
            .ok_or_else(|| PlatformError::Slack("missing conversation_id".into()))?;
        // The canonical conversation id is a hash; outbound commands carry the
        // raw platform channel id separately so we don't need to invert it.
        let channel = data
            .get("platform_conversation_id")
            .and_then(Value::as_str)
            .unwrap_or(conversation_id);
        let ts = Self::required_str(data, "message_id")?;
        Ok((SlackChannelId(channel.to_string()), SlackTs(ts)))
    }
}

fn conversation_id_for(channel_id: &str) -> String {
    crate::core::conversation::data_classes::canonical_conversation_id("slack", channel_id)
}

/// Strip surrounding colons and lowercase, the way Slack reaction names are
/// written back from `:thumbsup:` shortcodes.
fn sanitize_reaction_name(emoji: &str) -> String {
    emoji.trim().trim_start_matches(':').trim_end_matches(':').to_lowercase()
}

impl PlatformAdapter for SlackAdapter {
    type Message = SlackMessageEvent;
    type Event = SlackMessageEvent;

    fn name(&self) -> &str {
        &self.adapter_name
    }

    fn conversation_id(&self, message: &SlackMessageEvent) -> Option<String> {
        let channel_id = message.origin.channel.as_ref()?.0.clone();
        Some(conversation_id_for(&channel_id))
    }

    fn conversation_id_from_update(&self, message: &SlackMessageEvent) -> Option<String> {
        self.conversation_id(message)
    }

    fn conversation_type(&self, message: &SlackMessageEvent) -> Option<String> {
        let channel_id = message.origin.channel.as_ref()?.0.clone();
        Some(if channel_id.starts_with('D') { "direct".to_string() } else { "channel".to_string() })
    }

    fn conversation_name(&self, _message: &SlackMessageEvent) -> Option<String> {
        None
    }

    fn user_info(&self, event: &SlackMessageEvent, _conversation: &ConversationInfo) -> UserInfo {
        let user_id = event.sender.user.as_ref().map(|u| u.0.clone()).unwrap_or_else(|| "unknown".into());
        UserInfo {
            user_id,
            username: None,
            first_name: None,
            last_name: None,
            email: None,
            is_bot: event.sender.bot_id.is_some(),
        }
    }

    fn extract_reply_to_id(&self, message: &SlackMessageEvent) -> Option<String> {
        message.origin.thread_ts.as_ref().map(|ts| ts.0.clone())
    }

    fn basic_info(&self, message: &SlackMessageEvent, conversation_id: &str) -> MessageFields {
        let ts = message.origin.ts.0.clone();
        MessageFields {
            message_id: ts.clone(),
            conversation_id: conversation_id.to_string(),
            thread_id: message.origin.thread_ts.as_ref().map(|t| t.0.clone()),
            reply_to_message_id: self.extract_reply_to_id(message),
            sender_id: message.sender.user.as_ref().map(|u| u.0.clone()).unwrap_or_default(),
            sender_name: message.sender.user.as_ref().map(|u| u.0.clone()).unwrap_or_default(),
            is_from_bot: message.sender.bot_id.is_some(),
            text: None,
            timestamp: slack_ts_millis(&ts),
        }
    }

    fn content(&self, message: &SlackMessageEvent, fields: &mut MessageFields) {
        let text = message.content.as_ref().and_then(|c| c.text.clone());
        fields.text = text.filter(|t| !t.is_empty());
    }

    fn deleted_message_ids(&self, _event: &SlackMessageEvent) -> Vec<String> {
        // No grounding for inbound delete events; see module doc.
        Vec::new()
    }

    fn conversation_info_to_delete_from(&self, _event: &SlackMessageEvent) -> Option<String> {
        None
    }

    fn process_event(&self, _event: &SlackMessageEvent, _conversation: &mut ConversationInfo, _delta: &mut ConversationDelta) {
        // Unreachable in practice: this adapter only ever calls
        // `add_to_conversation` for inbound events (see module doc).
    }

    fn message_from_event<'a>(&self, event: &'a SlackMessageEvent) -> Option<&'a SlackMessageEvent> {
        Some(event)
    }
}

/// Slack timestamps are `"<seconds>.<micros>"` strings; convert to
/// milliseconds since epoch for `MessageFields::timestamp`.
fn slack_ts_millis(ts: &str) -> i64 {
    let seconds: f64 = ts.parse().unwrap_or(0.0);
    (seconds * 1000.0) as i64
}

impl OutgoingActions for SlackAdapter {
    async fn send_message(&self, data: &Value) -> crate::error::Result<Value> {
        let conversation_id = data.get("conversation_id").and_then(Value::as_str).ok_or_else(|| PlatformError::Slack("missing conversation_id".into()))?;
        let channel = data.get("platform_conversation_id").and_then(Value::as_str).unwrap_or(conversation_id);
        let thread_ts = data.get("thread_id").and_then(Value::as_str).map(|s| SlackTs(s.to_string()));
        let text = Self::required_str(data, "text")?;

        let session = self.session();
        let mut message_ids = Vec::new();
        for chunk in split_message(&text, self.max_message_length) {
            let mut req = SlackApiChatPostMessageRequest::new(
                SlackChannelId(channel.to_string()),
                SlackMessageContent::new().with_text(chunk),
            );
            req = req.opt_thread_ts(thread_ts.clone());
            let response = session.chat_post_message(&req).await.map_err(|e| PlatformError::Slack(e.to_string()))?;
            message_ids.push(response.ts.0);
        }
        Ok(json!({ "request_completed": true, "message_ids": message_ids }))
    }

    async fn edit_message(&self, data: &Value) -> crate::error::Result<Value> {
        let (channel_id, ts) = Self::channel_and_ts(data)?;
        let text = Self::required_str(data, "text")?;
        let req = SlackApiChatUpdateRequest::new(channel_id, SlackMessageContent::new().with_text(text), ts);
        self.session().chat_update(&req).await.map_err(|e| PlatformError::Slack(e.to_string()))?;
        Ok(json!({ "request_completed": true }))
    }

    async fn delete_message(&self, data: &Value) -> crate::error::Result<Value> {
        let (channel_id, ts) = Self::channel_and_ts(data)?;
        let req = SlackApiChatDeleteRequest::new(channel_id, ts);
        self.session().chat_delete(&req).await.map_err(|e| PlatformError::Slack(e.to_string()))?;
        Ok(json!({ "request_completed": true }))
    }

    async fn add_reaction(&self, data: &Value) -> crate::error::Result<Value> {
        let (channel_id, ts) = Self::channel_and_ts(data)?;
        let emoji = Self::required_str(data, "emoji")?;
        let req = SlackApiReactionsAddRequest::new(channel_id, SlackReactionName(sanitize_reaction_name(&emoji)), ts);
        self.session().reactions_add(&req).await.map_err(|e| PlatformError::Slack(e.to_string()))?;
        Ok(json!({ "request_completed": true }))
    }

    async fn remove_reaction(&self, data: &Value) -> crate::error::Result<Value> {
        let (channel_id, ts) = Self::channel_and_ts(data)?;
        let emoji = Self::required_str(data, "emoji")?;
        let req = SlackApiReactionsRemoveRequest::new(SlackReactionName(sanitize_reaction_name(&emoji)))
            .with_channel(channel_id)
            .with_timestamp(ts);
        self.session().reactions_remove(&req).await.map_err(|e| PlatformError::Slack(e.to_string()))?;
        Ok(json!({ "request_completed": true }))
    }

    async fn fetch_history(&self, data: &Value) -> crate::error::Result<Value> {
        let conversation_id = data.get("conversation_id").and_then(Value::as_str).ok_or_else(|| PlatformError::Slack("missing conversation_id".into()))?;
        let channel = data.get("platform_conversation_id").and_then(Value::as_str).unwrap_or(conversation_id);
        let limit = data.get("limit").and_then(Value::as_u64).unwrap_or(self.history_limit as u64).min(100) as u16;
        let thread_ts = data.get("thread_id").and_then(Value::as_str).map(|s| SlackTs(s.to_string()));

        let messages = self.fetch_raw_messages(channel, thread_ts, limit).await?;
        let history: Vec<Value> = messages
            .into_iter()
            .rev()
            .map(|msg| {
                json!({
                    "message_id": msg.origin.ts.0,
                    "text": msg.content.and_then(|c| c.text).unwrap_or_default(),
                    "timestamp": slack_ts_millis(&msg.origin.ts.0),
                })
            })
            .collect();
        Ok(json!({ "request_completed": true, "history": history }))
    }
}

impl SlackAdapter {
    async fn fetch_raw_messages(&self, channel: &str, thread_ts: Option<SlackTs>, limit: u16) -> crate::error::Result<Vec<SlackHistoryMessage>> {
        let session = self.session();
        let channel_id = SlackChannelId(channel.to_string());
        let messages = if let Some(ts) = thread_ts {
            let req = SlackApiConversationsRepliesRequest::new(channel_id, ts).with_limit(limit);
            session.conversations_replies(&req).await.map_err(|e| PlatformError::Slack(e.to_string()))?.messages
        } else {
            let req = SlackApiConversationsHistoryRequest::new().with_channel(channel_id).with_limit(limit);
            session.conversations_history(&req).await.map_err(|e| PlatformError::Slack(e.to_string()))?.messages
        };
        Ok(messages)
    }
}

/// Split on line boundaries first, then hard-wrap anything still too long;
/// mirrors the Discord adapter's plain length-based splitting since Slack's
/// markdown blocks don't require anything fancier at this layer.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.chars().count() + line.chars().count() > max_len && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        while current.chars().count() > max_len {
            let split_at = current.char_indices().nth(max_len).map(|(i, _)| i).unwrap_or(current.len());
            chunks.push(current[..split_at].to_string());
            current = current[split_at..].to_string();
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

impl HistoryApi for SlackAdapter {
    async fn fetch_batch(&self, _conversation_id: &str, _anchor: &HistoryAnchor, _limit: usize) -> crate::error::Result<Vec<CachedMessage>> {
        // `HistoryFetcher` only carries the canonical hash, not the raw
        // Slack channel id; real backfill goes through `fetch_history` on
        // the outgoing path instead (same limitation as the Discord adapter).
        Ok(Vec::new())
    }
}

fn handle_message(event: SlackPushEventCallback, _client: Arc<SlackHyperClient>, states: SlackClientEventsUserState) -> UserCallbackResult<()> {
    tokio::spawn(async move {
        let SlackEventCallbackBody::Message(msg) = event.event else { return };
        if msg.subtype.is_some() {
            return; // edits/deletes/bot_message subtypes — no grounding to act on
        }
        let guard = states.read().await;
        let Some(state) = guard.get_user_state::<Arc<SlackUserState>>() else { return };
        let sender_user_id = msg.sender.user.as_ref().map(|u| u.0.clone());
        if sender_user_id.as_deref() == Some(&state.bot_user_id) {
            return;
        }
        let _ = state.event_tx.send(msg).await;
    });
    Ok(())
}

fn slack_error_handler(
    error: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> http::StatusCode {
    tracing::error!(%error, "slack socket mode error");
    http::StatusCode::OK
}

impl Messaging for SlackAdapter {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> crate::error::Result<()> {
        let message_cache = Arc::new(MessageCache::new(1000, 10_000, 24, 300));
        let attachment_cache = Arc::new(AttachmentCache::new(std::path::PathBuf::from("attachments"), 1000, 24 * 7, 300));
        let rate_limiter = Arc::new(RateLimiter::new(60, 20, 20));

        let manager = ConversationManager::new(self.clone(), Arc::clone(&message_cache), Arc::clone(&attachment_cache));
        let history_fetcher = HistoryFetcher::new(self.clone(), Arc::clone(&message_cache), Arc::clone(&rate_limiter));
        let attachment_uploader = Arc::new(AttachmentUploader::new(Arc::clone(&attachment_cache), Arc::clone(&rate_limiter), 25 * 1024 * 1024));
        let processor = OutgoingEventProcessor::new(self.clone(), Arc::clone(&rate_limiter), self.max_message_length)
            .with_attachment_uploader(attachment_uploader);
        let (socket, queue_rx) = SocketIoServer::new(self.adapter_name.as_str(), processor);

        let queue_shutdown = shutdown.clone();
        tokio::spawn(Arc::clone(&socket).run_queue(queue_rx, queue_shutdown));

        let router = socket.router();
        let listener = tokio::net::TcpListener::bind("0.0.0.0:8766").await.context("failed to bind slack socket server")?;
        let mut axum_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = axum_shutdown.wait_for(|v| *v).await;
            });
            if let Err(error) = serve.await {
                tracing::error!(%error, "slack socket server exited");
            }
        });

        let auth_response = self.session().auth_test().await.context("failed to call slack auth.test for bot user id")?;
        let bot_user_id = auth_response.user_id.0.clone();
        *self.bot_user_id.write().await = Some(bot_user_id.clone());
        tracing::info!(%bot_user_id, "slack bot user id resolved");

        let (event_tx, mut event_rx) = mpsc::channel::<SlackMessageEvent>(256);
        let user_state = Arc::new(SlackUserState { event_tx, bot_user_id });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_message);

        // The socket mode listener owns a persistent websocket connection for
        // its lifetime and needs a dedicated client instance; `self.client`
        // stays reserved for REST calls.
        let listener_client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack socket mode connector")?,
        ));
        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client)
                .with_error_handler(slack_error_handler)
                .with_user_state(user_state),
        );
        let listener = SlackClientSocketModeListener::new(&SlackClientSocketModeConfig::new(), listener_environment, callbacks);
        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.as_str().to_string()));

        let mut listener_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                tracing::error!(%error, "failed to start slack socket mode listener");
                return;
            }
            tracing::info!("slack socket mode connected");
            tokio::select! {
                exit_code = listener.serve() => {
                    tracing::info!(exit_code, "slack socket mode listener stopped");
                }
                _ = listener_shutdown.changed() => {
                    listener.shutdown().await;
                }
            }
        });

        let builder = IncomingEventBuilder::new(self.adapter_name.as_str(), "slack");

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let delta = manager.add_to_conversation(&event, now_ms).await;
                    let history = if delta.fetch_history {
                        let messages = history_fetcher
                            .fetch(&delta.conversation_id, HistoryAnchor::Before(now_ms), self.history_limit)
                            .await
                            .unwrap_or_default();
                        Some(messages.into_iter().map(|m| json!({ "message_id": m.message_id, "text": m.text, "timestamp": m.timestamp })).collect())
                    } else {
                        None
                    };
                    for canonical in builder.events_for_delta(&delta, history) {
                        socket.emit_event(&canonical.event_type, canonical.data).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaction_name_strips_colons_and_lowercases() {
        assert_eq!(sanitize_reaction_name(":Thumbsup:"), "thumbsup");
        assert_eq!(sanitize_reaction_name("fire"), "fire");
    }

    #[test]
    fn slack_ts_parses_seconds_to_millis() {
        assert_eq!(slack_ts_millis("1700000000.000100"), 1_700_000_000_000);
        assert_eq!(slack_ts_millis("not-a-ts"), 0);
    }

    #[test]
    fn split_message_respects_max_len() {
        let text = "a".repeat(30);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn short_message_is_a_single_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello".to_string()]);
    }
}
