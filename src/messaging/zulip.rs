//! Zulip adapter: REST API (`/register` + long-polling `/events`) plus the
//! canonical `PlatformAdapter`/`OutgoingActions`/`HistoryApi` seams.
//!
//! No Zulip SDK crate fits this API shape, so this adapter is built directly
//! on `reqwest` against Zulip's plain HTTP API, the same way the other REST-
//! style adapters in this crate reach for `reqwest` when there's no
//! dedicated client crate. Reaction name canonicalization routes through
//! `EmojiConverter` rather than decoding Unicode codepoints ad hoc.

use crate::config::Config;
use crate::core::cache::{AttachmentCache, MessageCache};
use crate::core::conversation::data_classes::{CachedMessage, ConversationDelta, ConversationInfo, MessageFields, UserInfo};
use crate::core::conversation::{ConversationManager, PlatformAdapter};
use crate::core::emoji_converter::EmojiConverter;
use crate::core::event_processors::incoming::IncomingEventBuilder;
use crate::core::event_processors::outgoing::{OutgoingActions, OutgoingEventProcessor};
use crate::core::history_fetcher::{HistoryAnchor, HistoryApi, HistoryFetcher};
use crate::core::rate_limiter::RateLimiter;
use crate::core::AttachmentUploader;
use crate::core::socket_io::SocketIoServer;
use crate::error::PlatformError;
use crate::messaging::traits::Messaging;

use anyhow::Context as _;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::sync::{mpsc, watch, RwLock};

/// A decoded event off Zulip's `/events` long-poll stream. Mirrors
/// `ZulipEventType` from `adapter/conversation/manager.py`, plus an `id` for
/// advancing `last_event_id`.
#[derive(Debug, Clone)]
pub struct ZulipEvent {
    pub id: i64,
    pub kind: ZulipEventKind,
    pub message: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZulipEventKind {
    Message,
    UpdateMessage,
    ReactionAdd,
    ReactionRemove,
}

fn quote_reply_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[said\]\([^)]*?/near/(\d+)\)").unwrap())
}

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@\*\*(.*?)\*\*").unwrap())
}

fn user_id_mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@_\*\*(?:.*?)\|(.*?)\*\*").unwrap())
}

#[derive(Clone)]
pub struct ZulipAdapter {
    adapter_name: Arc<String>,
    adapter_id: Arc<String>,
    site: Arc<String>,
    email: Arc<String>,
    api_key: Arc<String>,
    max_message_length: usize,
    history_limit: usize,
    client: reqwest::Client,
    bot_user_id: Arc<RwLock<Option<i64>>>,
    /// `message_id -> conversation_id`, populated as messages are built;
    /// lets `conversation_id_from_update` replicate `manager.py`'s reverse
    /// lookup (`_get_conversation_id_from_update`) without giving the
    /// adapter access to `ConversationManager`'s own conversation map.
    message_index: Arc<StdMutex<HashMap<String, String>>>,
}

impl ZulipAdapter {
    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        let site: String = config.require("zulip", "site")?;
        let email: String = config.require("zulip", "email")?;
        let api_key: String = config.require("zulip", "api_key")?;
        Ok(Self {
            adapter_name: Arc::new(config.get_or("adapter", "adapter_name", "zulip".to_string())),
            adapter_id: Arc::new(config.get_or("adapter", "adapter_id", String::new())),
            site: Arc::new(site.trim_end_matches('/').to_string()),
            email: Arc::new(email),
            api_key: Arc::new(api_key),
            max_message_length: config.get_or("adapter", "max_message_length", 10_000),
            history_limit: config.get_or("adapter", "history_limit", 50),
            client: reqwest::Client::new(),
            bot_user_id: Arc::new(RwLock::new(None)),
            message_index: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.site, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.api_url(path))
            .basic_auth(self.email.as_str(), Some(self.api_key.as_str()))
    }

    fn required_str(data: &Value, field: &str) -> crate::error::Result<String> {
        data.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PlatformError::Zulip(format!("missing {field}")).into())
    }

    /// Channel/topic pair for stream sends, or the private-message recipient
    /// list, resolved the same way as `conversation_id_for`: prefer the raw
    /// `platform_conversation_id` an outgoing command carries alongside the
    /// canonical hash.
    fn raw_recipient<'a>(data: &'a Value) -> crate::error::Result<&'a str> {
        let conversation_id = data
            .get("conversation_id")
            .and_then(Value::as_str)
            .ok_or_else(|| PlatformError::Zulip("missing conversation_id".into()))?;
        Ok(data.get("platform_conversation_id").and_then(Value::as_str).unwrap_or(conversation_id))
    }

    fn record_message_id(&self, message_id: &str, conversation_id: &str) {
        self.message_index.lock().unwrap().insert(message_id.to_string(), conversation_id.to_string());
    }

    async fn check_response(response: reqwest::Response) -> crate::error::Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.map_err(|e| PlatformError::Zulip(e.to_string()))?;
        if !status.is_success() || body.get("result").and_then(Value::as_str) == Some("error") {
            let msg = body.get("msg").and_then(Value::as_str).unwrap_or("request failed");
            return Err(PlatformError::Zulip(msg.to_string()).into());
        }
        Ok(body)
    }
}

fn conversation_id_for(raw: &str) -> String {
    crate::core::conversation::data_classes::canonical_conversation_id("zulip", raw)
}

/// `stream_id/topic` for stream messages, sorted-and-joined recipient user
/// ids for private ones; mirrors `Manager::_get_conversation_id`.
fn raw_conversation_id(message: &Value) -> Option<String> {
    match message.get("type").and_then(Value::as_str)? {
        "private" => {
            let mut ids: Vec<String> = message
                .get("display_recipient")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|p| p.get("id"))
                .map(|id| id.to_string())
                .collect();
            ids.sort();
            Some(ids.join("_"))
        }
        "stream" => {
            let stream_id = message.get("stream_id")?.to_string();
            let topic = message.get("subject").and_then(Value::as_str)?;
            if topic.is_empty() {
                None
            } else {
                Some(format!("{stream_id}/{topic}"))
            }
        }
        _ => None,
    }
}

impl PlatformAdapter for ZulipAdapter {
    type Message = Value;
    type Event = ZulipEvent;

    fn name(&self) -> &str {
        &self.adapter_name
    }

    fn conversation_id(&self, message: &Value) -> Option<String> {
        raw_conversation_id(message).map(|raw| conversation_id_for(&raw))
    }

    fn conversation_id_from_update(&self, message: &Value) -> Option<String> {
        let message_id = message.get("message_id").map(|v| v.to_string())?;
        self.message_index.lock().unwrap().get(&message_id).cloned()
    }

    fn conversation_type(&self, message: &Value) -> Option<String> {
        match message.get("type").and_then(Value::as_str)? {
            "private" => Some("direct".to_string()),
            "stream" => Some("channel".to_string()),
            _ => None,
        }
    }

    fn conversation_name(&self, message: &Value) -> Option<String> {
        if message.get("type").and_then(Value::as_str) != Some("stream") {
            return None;
        }
        message
            .get("display_recipient")
            .and_then(Value::as_str)
            .or_else(|| message.get("stream_name").and_then(Value::as_str))
            .map(str::to_string)
    }

    fn user_info(&self, event: &ZulipEvent, conversation: &ConversationInfo) -> UserInfo {
        let message = &event.message;
        let user_id = message.get("sender_id").map(|v| v.to_string()).unwrap_or_default();

        if let Some(known) = conversation.known_members.get(&user_id) {
            return known.clone();
        }

        let email = message.get("sender_email").and_then(Value::as_str).map(str::to_string);
        // `UserBuilder.from_adapter` in the source compares against a
        // configured adapter id/email pair; this adapter instead compares
        // against the bot user id resolved from `users/me` at startup, the
        // same convention used by the Discord/Telegram adapters.
        let is_bot = message
            .get("sender_id")
            .and_then(Value::as_i64)
            .is_some_and(|id| self.bot_user_id.try_read().is_ok_and(|guard| *guard == Some(id)));
        UserInfo {
            user_id,
            username: message.get("sender_full_name").and_then(Value::as_str).map(str::to_string),
            first_name: None,
            last_name: None,
            email,
            is_bot,
        }
    }

    fn extract_reply_to_id(&self, message: &Value) -> Option<String> {
        let content = message.get("content").and_then(Value::as_str)?;
        quote_reply_pattern().captures(content).map(|c| c[1].to_string())
    }

    fn basic_info(&self, message: &Value, conversation_id: &str) -> MessageFields {
        let message_id = message.get("id").map(|v| v.to_string()).unwrap_or_default();
        self.record_message_id(&message_id, conversation_id);
        MessageFields {
            message_id,
            conversation_id: conversation_id.to_string(),
            thread_id: None,
            reply_to_message_id: self.extract_reply_to_id(message),
            sender_id: String::new(),
            sender_name: String::new(),
            is_from_bot: false,
            text: None,
            timestamp: message.get("timestamp").and_then(Value::as_i64).map(|s| s * 1000).unwrap_or(0),
        }
    }

    fn content(&self, message: &Value, fields: &mut MessageFields) {
        fields.text = message.get("content").and_then(Value::as_str).map(str::to_string);
    }

    fn mentions(&self, message: &Value) -> Vec<String> {
        let Some(text) = message.get("content").and_then(Value::as_str) else { return Vec::new() };
        let mut mentions = Vec::new();

        for capture in mention_pattern().captures_iter(text) {
            let name = &capture[1];
            if name.eq_ignore_ascii_case("all") {
                mentions.push("all".to_string());
            } else if !self.adapter_name.is_empty() && name == self.adapter_name.as_str() {
                mentions.push(self.adapter_id.as_str().to_string());
            }
        }
        for capture in user_id_mention_pattern().captures_iter(text) {
            if !self.adapter_id.is_empty() && &capture[1] == self.adapter_id.as_str() {
                mentions.push(self.adapter_id.as_str().to_string());
            }
        }

        mentions.sort();
        mentions.dedup();
        mentions
    }

    fn deleted_message_ids(&self, event: &ZulipEvent) -> Vec<String> {
        if let Some(ids) = event.message.get("deleted_ids").and_then(Value::as_array) {
            return ids.iter().map(|v| v.to_string()).collect();
        }
        event.message.get("message_id").map(|v| vec![v.to_string()]).unwrap_or_default()
    }

    fn conversation_info_to_delete_from(&self, event: &ZulipEvent) -> Option<String> {
        if let Some(conversation_id) = event.message.get("conversation_id").and_then(Value::as_str) {
            return Some(conversation_id.to_string());
        }
        self.conversation_id_from_update(&event.message)
    }

    fn process_event(&self, event: &ZulipEvent, conversation: &mut ConversationInfo, delta: &mut ConversationDelta) {
        let message_id = event.message.get("message_id").map(|v| v.to_string()).unwrap_or_default();

        match event.kind {
            ZulipEventKind::UpdateMessage => {
                let new_topic = event.message.get("subject").and_then(Value::as_str);
                if let Some(topic) = new_topic {
                    conversation.conversation_name = Some(topic.to_string());
                }
                delta.message_id = Some(message_id);
                if let Some(text) = event.message.get("content").and_then(Value::as_str) {
                    delta.updated_messages.push(crate::core::conversation::data_classes::DeltaMessage {
                        message_id: event.message.get("message_id").map(|v| v.to_string()).unwrap_or_default(),
                        conversation_id: conversation.conversation_id.clone(),
                        sender: crate::core::conversation::data_classes::DeltaSender { user_id: String::new(), display_name: String::new() },
                        text: Some(text.to_string()),
                        timestamp: chrono::Utc::now().timestamp_millis(),
                        edit_timestamp: Some(chrono::Utc::now().timestamp_millis()),
                        edited: true,
                        thread_id: None,
                        is_direct_message: conversation.conversation_type == "direct",
                        attachments: Vec::new(),
                        mentions: Vec::new(),
                    });
                }
            }
            ZulipEventKind::ReactionAdd | ZulipEventKind::ReactionRemove => {
                let emoji = zulip_reaction_name(&event.message);
                delta.message_id = Some(message_id.clone());
                if event.kind == ZulipEventKind::ReactionAdd {
                    delta.added_reactions.push(crate::core::conversation::data_classes::ReactionDelta {
                        message_id,
                        conversation_id: conversation.conversation_id.clone(),
                        emoji,
                    });
                } else {
                    delta.removed_reactions.push(crate::core::conversation::data_classes::ReactionDelta {
                        message_id,
                        conversation_id: conversation.conversation_id.clone(),
                        emoji,
                    });
                }
            }
            ZulipEventKind::Message => {
                // Unreachable: new messages go through `add_to_conversation`,
                // not `process_event` (see `message_from_event`).
            }
        }
    }

    fn message_from_event<'a>(&self, event: &'a ZulipEvent) -> Option<&'a Value> {
        (event.kind == ZulipEventKind::Message).then_some(&event.message)
    }
}

/// Normalize a reaction event's `emoji_name` to the canonical form via
/// `EmojiConverter`, the way `original_source/src/adapters/zulip_adapter/
/// conversation/reaction_handler.py` does (rather than resolving a live
/// Unicode glyph, which the newer tree's handler does instead).
fn zulip_reaction_name(message: &Value) -> String {
    let raw = message.get("emoji_name").and_then(Value::as_str).unwrap_or_default();
    EmojiConverter::new().platform_specific_to_standard(raw)
}

impl OutgoingActions for ZulipAdapter {
    async fn send_message(&self, data: &Value) -> crate::error::Result<Value> {
        let recipient = Self::raw_recipient(data)?;
        let text = Self::required_str(data, "text")?;
        let topic = data.get("thread_id").and_then(Value::as_str);

        // `platform_conversation_id` is `<stream_id>/<topic>` for stream
        // conversations (see `raw_conversation_id`) and an underscore-joined
        // user id list for private ones; branch on that shape.
        let mut message_ids = Vec::new();
        for chunk in split_message(&text, self.max_message_length) {
            let mut form = vec![("content", chunk)];
            if let Some((stream, default_topic)) = recipient.split_once('/') {
                form.push(("type", "stream".to_string()));
                form.push(("to", stream.to_string()));
                form.push(("topic", topic.unwrap_or(default_topic).to_string()));
            } else {
                form.push(("type", "private".to_string()));
                form.push(("to", json!(recipient.split('_').collect::<Vec<_>>()).to_string()));
            }
            let response = self
                .request(reqwest::Method::POST, "messages")
                .form(&form)
                .send()
                .await
                .map_err(|e| PlatformError::Zulip(e.to_string()))?;
            let body = Self::check_response(response).await?;
            if let Some(id) = body.get("id") {
                message_ids.push(id.to_string());
            }
        }
        Ok(json!({ "request_completed": true, "message_ids": message_ids }))
    }

    async fn edit_message(&self, data: &Value) -> crate::error::Result<Value> {
        let message_id = Self::required_str(data, "message_id")?;
        let text = Self::required_str(data, "text")?;
        let response = self
            .request(reqwest::Method::PATCH, &format!("messages/{message_id}"))
            .form(&[("content", text)])
            .send()
            .await
            .map_err(|e| PlatformError::Zulip(e.to_string()))?;
        Self::check_response(response).await?;
        Ok(json!({ "request_completed": true }))
    }

    async fn delete_message(&self, data: &Value) -> crate::error::Result<Value> {
        let message_id = Self::required_str(data, "message_id")?;
        let response = self
            .request(reqwest::Method::DELETE, &format!("messages/{message_id}"))
            .send()
            .await
            .map_err(|e| PlatformError::Zulip(e.to_string()))?;
        Self::check_response(response).await?;
        Ok(json!({ "request_completed": true }))
    }

    async fn add_reaction(&self, data: &Value) -> crate::error::Result<Value> {
        let message_id = Self::required_str(data, "message_id")?;
        let emoji = Self::required_str(data, "emoji")?;
        let platform_name = EmojiConverter::new().standard_to_platform_specific(&emoji);
        let response = self
            .request(reqwest::Method::POST, &format!("messages/{message_id}/reactions"))
            .form(&[("emoji_name", platform_name)])
            .send()
            .await
            .map_err(|e| PlatformError::Zulip(e.to_string()))?;
        Self::check_response(response).await?;
        Ok(json!({ "request_completed": true }))
    }

    async fn remove_reaction(&self, data: &Value) -> crate::error::Result<Value> {
        let message_id = Self::required_str(data, "message_id")?;
        let emoji = Self::required_str(data, "emoji")?;
        let platform_name = EmojiConverter::new().standard_to_platform_specific(&emoji);
        let response = self
            .request(reqwest::Method::DELETE, &format!("messages/{message_id}/reactions"))
            .form(&[("emoji_name", platform_name)])
            .send()
            .await
            .map_err(|e| PlatformError::Zulip(e.to_string()))?;
        Self::check_response(response).await?;
        Ok(json!({ "request_completed": true }))
    }

    async fn fetch_history(&self, data: &Value) -> crate::error::Result<Value> {
        let recipient = Self::raw_recipient(data)?;
        let limit = data.get("limit").and_then(Value::as_u64).unwrap_or(self.history_limit as u64).min(1000);

        let narrow = if let Some((stream, topic)) = recipient.split_once('/') {
            json!([
                { "operator": "stream", "operand": stream },
                { "operator": "topic", "operand": topic },
            ])
        } else {
            json!([{ "operator": "pm-with", "operand": recipient.replace('_', ",") }])
        };

        let response = self
            .request(reqwest::Method::GET, "messages")
            .query(&[
                ("anchor", "newest".to_string()),
                ("num_before", limit.to_string()),
                ("num_after", "0".to_string()),
                ("narrow", narrow.to_string()),
            ])
            .send()
            .await
            .map_err(|e| PlatformError::Zulip(e.to_string()))?;
        let body = Self::check_response(response).await?;

        let history: Vec<Value> = body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|m| {
                json!({
                    "message_id": m.get("id").map(|v| v.to_string()).unwrap_or_default(),
                    "text": m.get("content").and_then(Value::as_str).unwrap_or_default(),
                    "timestamp": m.get("timestamp").and_then(Value::as_i64).map(|s| s * 1000).unwrap_or(0),
                })
            })
            .collect();
        Ok(json!({ "request_completed": true, "history": history }))
    }
}

/// Split on line boundaries first, then hard-wrap; same plain strategy as
/// the other adapters' splitters, sized to Zulip's own message length cap.
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

impl HistoryApi for ZulipAdapter {
    async fn fetch_batch(&self, _conversation_id: &str, _anchor: &HistoryAnchor, _limit: usize) -> crate::error::Result<Vec<CachedMessage>> {
        // Same limitation as the other REST-backed adapters: `HistoryFetcher`
        // only carries the canonical hash, not the raw stream/topic or
        // recipient list, so real backfill goes through `fetch_history`
        // on the outgoing path instead.
        Ok(Vec::new())
    }
}

impl ZulipAdapter {
    /// Register a new event queue and return `(queue_id, last_event_id)`.
    async fn register_queue(&self) -> crate::error::Result<(String, i64)> {
        let response = self
            .request(reqwest::Method::POST, "register")
            .form(&[("event_types", json!(["message", "update_message", "reaction"]).to_string())])
            .send()
            .await
            .map_err(|e| PlatformError::Zulip(e.to_string()))?;
        let body = Self::check_response(response).await?;
        let queue_id = body.get("queue_id").and_then(Value::as_str).ok_or_else(|| PlatformError::Zulip("register response missing queue_id".into()))?.to_string();
        let last_event_id = body.get("last_event_id").and_then(Value::as_i64).unwrap_or(-1);
        Ok((queue_id, last_event_id))
    }

    async fn poll_events(&self, queue_id: &str, last_event_id: i64) -> crate::error::Result<Vec<ZulipEvent>> {
        let response = self
            .request(reqwest::Method::GET, "events")
            .query(&[("queue_id", queue_id), ("last_event_id", &last_event_id.to_string()), ("dont_block", "false")])
            .send()
            .await
            .map_err(|e| PlatformError::Zulip(e.to_string()))?;
        let body = Self::check_response(response).await?;

        let mut events = Vec::new();
        for raw in body.get("events").and_then(Value::as_array).into_iter().flatten() {
            let Some(id) = raw.get("id").and_then(Value::as_i64) else { continue };
            let kind = match raw.get("type").and_then(Value::as_str) {
                Some("message") => ZulipEventKind::Message,
                Some("update_message") => ZulipEventKind::UpdateMessage,
                Some("reaction") => match raw.get("op").and_then(Value::as_str) {
                    Some("add") => ZulipEventKind::ReactionAdd,
                    Some("remove") => ZulipEventKind::ReactionRemove,
                    _ => continue,
                },
                _ => continue,
            };
            // The event envelope carries its own flattened fields for
            // `update_message`/`reaction`; `message` events nest the full
            // message object under `"message"`. Use the envelope itself as
            // the `message` payload for the non-`message` kinds so
            // `event.message.get("message_id")` works uniformly.
            let message = if kind == ZulipEventKind::Message { raw.get("message").cloned().unwrap_or(Value::Null) } else { raw.clone() };
            events.push(ZulipEvent { id, kind, message });
        }
        Ok(events)
    }
}

impl Messaging for ZulipAdapter {
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
        let listener = tokio::net::TcpListener::bind("0.0.0.0:8768").await.context("failed to bind zulip socket server")?;
        let mut axum_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = axum_shutdown.wait_for(|v| *v).await;
            });
            if let Err(error) = serve.await {
                tracing::error!(%error, "zulip socket server exited");
            }
        });

        let me = self
            .request(reqwest::Method::GET, "users/me")
            .send()
            .await
            .context("failed to call zulip users/me for bot identity")?;
        let me_body = Self::check_response(me).await?;
        let bot_user_id = me_body.get("user_id").and_then(Value::as_i64);
        *self.bot_user_id.write().await = bot_user_id;
        tracing::info!(?bot_user_id, "zulip bot user id resolved");

        let (queue_id, mut last_event_id) = self.register_queue().await.context("failed to register zulip event queue")?;
        tracing::info!(%queue_id, "zulip event queue registered");

        let (event_tx, mut event_rx) = mpsc::channel::<ZulipEvent>(256);
        let adapter = self.clone();
        let mut poll_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = adapter.poll_events(&queue_id, last_event_id) => {
                        match result {
                            Ok(events) => {
                                for event in events {
                                    last_event_id = last_event_id.max(event.id);
                                    if event_tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(error) => {
                                tracing::warn!(%error, "zulip event poll failed, retrying");
                                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                            }
                        }
                    }
                    _ = poll_shutdown.changed() => return,
                }
            }
        });

        let builder = IncomingEventBuilder::new(self.adapter_name.as_str(), "zulip");

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let now_ms = chrono::Utc::now().timestamp_millis();

                    let bot_sender = bot_user_id.is_some()
                        && event.message.get("sender_id").and_then(Value::as_i64) == bot_user_id;

                    let delta = match event.kind {
                        ZulipEventKind::Message if !bot_sender => manager.add_to_conversation(&event, now_ms).await,
                        ZulipEventKind::Message => ConversationDelta::default(),
                        ZulipEventKind::UpdateMessage | ZulipEventKind::ReactionAdd | ZulipEventKind::ReactionRemove => {
                            manager.update_conversation(&event, &event.message, now_ms).await
                        }
                    };

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
    fn stream_conversation_id_combines_stream_and_topic() {
        let message = json!({ "type": "stream", "stream_id": 42, "subject": "old" });
        assert_eq!(raw_conversation_id(&message), Some("42/old".to_string()));
    }

    #[test]
    fn private_conversation_id_sorts_and_joins_ids() {
        let message = json!({ "type": "private", "display_recipient": [{ "id": 5 }, { "id": 2 }] });
        assert_eq!(raw_conversation_id(&message), Some("2_5".to_string()));
    }

    #[test]
    fn extract_reply_to_id_matches_quote_link() {
        let message = json!({ "content": "[said](https://zulip.example.com/#narrow/stream/1-x/near/123) hi" });
        let message_id = quote_reply_pattern().captures(message["content"].as_str().unwrap()).map(|c| c[1].to_string());
        assert_eq!(message_id.as_deref(), Some("123"));
    }

    #[test]
    fn split_message_respects_max_len() {
        let text = "a".repeat(30);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
    }
}
