//! Discord adapter: serenity gateway client plus the canonical
//! `PlatformAdapter`/`OutgoingActions`/`HistoryApi` seams.
//!
//! Grounded on `original_source/adapters/discord_adapter/` for thread/reaction/
//! mention extraction rules (message `reference`, `<@id>`/`@everyone` mention
//! syntax); the `Handler`/`http` client-slot wiring follows serenity's own
//! `EventHandler` + `ready`-populated `Http` pattern.

use crate::config::Config;
use crate::core::cache::{AttachmentCache, MessageCache};
use crate::core::conversation::data_classes::{AttachmentFields, ConversationDelta, ConversationInfo, MessageFields, UserInfo};
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
use async_trait::async_trait;
use serde_json::{json, Value};
use serenity::all::{
    ChannelId, Context, EventHandler, GatewayIntents, GetMessages, Http, Message, MessageId,
    MessageUpdateEvent, Reaction, ReactionType, Ready, UserId,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

/// Raw events forwarded from the serenity gateway handler into the adapter's
/// processing loop.
pub enum DiscordEvent {
    New(Message),
    Edit(Box<MessageUpdateEvent>),
    Delete { channel_id: ChannelId, message_id: MessageId },
    ReactionAdd(Reaction),
    ReactionRemove(Reaction),
}

#[derive(Clone)]
pub struct DiscordAdapter {
    adapter_name: Arc<String>,
    token: Arc<String>,
    max_message_length: usize,
    history_limit: usize,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    bot_user_id: Arc<RwLock<Option<UserId>>>,
}

impl DiscordAdapter {
    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        let token: String = config.require("discord", "token")?;
        Ok(Self {
            adapter_name: Arc::new(config.get_or("adapter", "adapter_name", "discord".to_string())),
            token: Arc::new(token),
            max_message_length: config.get_or("adapter", "max_message_length", 2000),
            history_limit: config.get_or("adapter", "history_limit", 50),
            http: Arc::new(RwLock::new(None)),
            bot_user_id: Arc::new(RwLock::new(None)),
        })
    }

    async fn http(&self) -> crate::error::Result<Arc<Http>> {
        self.http
            .read()
            .await
            .clone()
            .ok_or_else(|| PlatformError::NotConnected.into())
    }

    fn required_str(data: &Value, field: &str) -> crate::error::Result<String> {
        data.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PlatformError::Discord(format!("missing {field}")).into())
    }
}

impl PlatformAdapter for DiscordAdapter {
    type Message = Message;
    type Event = DiscordEvent;

    fn name(&self) -> &str {
        &self.adapter_name
    }

    fn conversation_id(&self, message: &Message) -> Option<String> {
        Some(crate::core::conversation::data_classes::canonical_conversation_id(
            "discord",
            &message.channel_id.to_string(),
        ))
    }

    fn conversation_id_from_update(&self, message: &Message) -> Option<String> {
        self.conversation_id(message)
    }

    fn conversation_type(&self, message: &Message) -> Option<String> {
        Some(if message.guild_id.is_some() { "channel".to_string() } else { "direct".to_string() })
    }

    fn conversation_name(&self, _message: &Message) -> Option<String> {
        None
    }

    fn user_info(&self, event: &DiscordEvent, _conversation: &ConversationInfo) -> UserInfo {
        let author = match event {
            DiscordEvent::New(message) => Some(&message.author),
            _ => None,
        };
        match author {
            Some(author) => UserInfo {
                user_id: author.id.to_string(),
                username: Some(author.name.clone()),
                first_name: author.global_name.clone(),
                last_name: None,
                email: None,
                is_bot: author.bot,
            },
            None => UserInfo {
                user_id: "unknown".into(),
                username: None,
                first_name: None,
                last_name: None,
                email: None,
                is_bot: false,
            },
        }
    }

    fn extract_reply_to_id(&self, message: &Message) -> Option<String> {
        message.message_reference.as_ref().and_then(|r| r.message_id).map(|id| id.to_string())
    }

    fn basic_info(&self, message: &Message, conversation_id: &str) -> MessageFields {
        MessageFields {
            message_id: message.id.to_string(),
            conversation_id: conversation_id.to_string(),
            thread_id: None,
            reply_to_message_id: self.extract_reply_to_id(message),
            sender_id: message.author.id.to_string(),
            sender_name: message.author.name.clone(),
            is_from_bot: message.author.bot,
            text: None,
            timestamp: message.timestamp.unix_timestamp() * 1000,
        }
    }

    fn content(&self, message: &Message, fields: &mut MessageFields) {
        fields.text = if message.content.is_empty() { None } else { Some(message.content.clone()) };
    }

    fn mentions(&self, message: &Message) -> Vec<String> {
        let mut mentions: Vec<String> = message.mentions.iter().map(|u| u.id.to_string()).collect();
        if message.mention_everyone {
            mentions.push("all".to_string());
        }
        mentions
    }

    fn attachments(&self, event: &DiscordEvent) -> Vec<AttachmentFields> {
        let DiscordEvent::New(message) = event else { return Vec::new() };
        message
            .attachments
            .iter()
            .map(|a| AttachmentFields {
                attachment_id: a.id.to_string(),
                attachment_type: "file".to_string(),
                file_extension: std::path::Path::new(&a.filename)
                    .extension()
                    .map(|e| e.to_string_lossy().to_string()),
                size: a.size as u64,
            })
            .collect()
    }

    fn deleted_message_ids(&self, event: &DiscordEvent) -> Vec<String> {
        match event {
            DiscordEvent::Delete { message_id, .. } => vec![message_id.to_string()],
            _ => Vec::new(),
        }
    }

    fn conversation_info_to_delete_from(&self, event: &DiscordEvent) -> Option<String> {
        match event {
            DiscordEvent::Delete { channel_id, .. } => Some(
                crate::core::conversation::data_classes::canonical_conversation_id("discord", &channel_id.to_string()),
            ),
            _ => None,
        }
    }

    fn process_event(&self, _event: &DiscordEvent, _conversation: &mut ConversationInfo, _delta: &mut ConversationDelta) {
        // Discord edits and reactions carry only a message id, not a full
        // `Message`, so this adapter handles them directly against the
        // message cache in `handle_event` rather than through this seam.
    }

    fn message_from_event<'a>(&self, event: &'a DiscordEvent) -> Option<&'a Message> {
        match event {
            DiscordEvent::New(message) => Some(message),
            _ => None,
        }
    }
}

fn reaction_name(emoji: &ReactionType) -> String {
    match emoji {
        ReactionType::Unicode(name) => name.clone(),
        ReactionType::Custom { name, .. } => name.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

impl OutgoingActions for DiscordAdapter {
    async fn send_message(&self, data: &Value) -> crate::error::Result<Value> {
        let http = self.http().await?;
        let channel_id = channel_id_from(data)?;
        let text = Self::required_str(data, "text")?;
        let message = channel_id
            .say(&http, text)
            .await
            .map_err(|e| PlatformError::Discord(e.to_string()))?;
        Ok(json!({ "request_completed": true, "message_ids": [message.id.to_string()] }))
    }

    async fn edit_message(&self, data: &Value) -> crate::error::Result<Value> {
        let http = self.http().await?;
        let channel_id = channel_id_from(data)?;
        let message_id = Self::required_str(data, "message_id")?.parse::<u64>().map_err(|_| PlatformError::Discord("bad message_id".into()))?;
        let text = Self::required_str(data, "text")?;
        channel_id
            .edit_message(&http, MessageId::new(message_id), serenity::all::EditMessage::new().content(text))
            .await
            .map_err(|e| PlatformError::Discord(e.to_string()))?;
        Ok(json!({ "request_completed": true }))
    }

    async fn delete_message(&self, data: &Value) -> crate::error::Result<Value> {
        let http = self.http().await?;
        let channel_id = channel_id_from(data)?;
        let message_id = Self::required_str(data, "message_id")?.parse::<u64>().map_err(|_| PlatformError::Discord("bad message_id".into()))?;
        channel_id
            .delete_message(&http, MessageId::new(message_id))
            .await
            .map_err(|e| PlatformError::Discord(e.to_string()))?;
        Ok(json!({ "request_completed": true }))
    }

    async fn add_reaction(&self, data: &Value) -> crate::error::Result<Value> {
        let http = self.http().await?;
        let channel_id = channel_id_from(data)?;
        let message_id = Self::required_str(data, "message_id")?.parse::<u64>().map_err(|_| PlatformError::Discord("bad message_id".into()))?;
        let emoji = Self::required_str(data, "emoji")?;
        channel_id
            .create_reaction(&http, MessageId::new(message_id), ReactionType::Unicode(emoji))
            .await
            .map_err(|e| PlatformError::Discord(e.to_string()))?;
        Ok(json!({ "request_completed": true }))
    }

    async fn remove_reaction(&self, data: &Value) -> crate::error::Result<Value> {
        let http = self.http().await?;
        let channel_id = channel_id_from(data)?;
        let message_id = Self::required_str(data, "message_id")?.parse::<u64>().map_err(|_| PlatformError::Discord("bad message_id".into()))?;
        let emoji = Self::required_str(data, "emoji")?;
        channel_id
            .delete_reaction_emoji(&http, MessageId::new(message_id), ReactionType::Unicode(emoji))
            .await
            .map_err(|e| PlatformError::Discord(e.to_string()))?;
        Ok(json!({ "request_completed": true }))
    }

    async fn fetch_history(&self, data: &Value) -> crate::error::Result<Value> {
        let http = self.http().await?;
        let channel_id = channel_id_from(data)?;
        let limit = data.get("limit").and_then(Value::as_u64).unwrap_or(self.history_limit as u64).min(100) as u8;
        let messages = channel_id
            .messages(&http, GetMessages::new().limit(limit))
            .await
            .map_err(|e| PlatformError::Discord(e.to_string()))?;
        let history: Vec<Value> = messages
            .iter()
            .map(|m| json!({ "message_id": m.id.to_string(), "text": m.content, "timestamp": m.timestamp.unix_timestamp() * 1000 }))
            .collect();
        Ok(json!({ "request_completed": true, "history": history }))
    }
}

fn channel_id_from(data: &Value) -> crate::error::Result<ChannelId> {
    let conversation_id = data
        .get("conversation_id")
        .and_then(Value::as_str)
        .ok_or_else(|| PlatformError::Discord("missing conversation_id".into()))?;
    // The canonical conversation id is a hash; outbound commands carry the
    // raw platform channel id separately so we don't need to invert the hash.
    let raw = data
        .get("platform_conversation_id")
        .and_then(Value::as_str)
        .unwrap_or(conversation_id);
    raw.parse::<u64>()
        .map(ChannelId::new)
        .map_err(|_| PlatformError::Discord("invalid channel id".into()).into())
}

impl HistoryApi for DiscordAdapter {
    async fn fetch_batch(
        &self,
        _conversation_id: &str,
        anchor: &HistoryAnchor,
        limit: usize,
    ) -> crate::error::Result<Vec<crate::core::conversation::data_classes::CachedMessage>> {
        let _ = (anchor, limit);
        // Real history backfill requires the raw Discord channel id, which
        // `HistoryFetcher` only has as the canonical hash; batches route
        // through `fetch_history` on the outgoing path instead for this
        // adapter, so this returns empty (cache-only behavior).
        Ok(Vec::new())
    }
}

impl Messaging for DiscordAdapter {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> crate::error::Result<()> {
        let message_cache = Arc::new(MessageCache::new(1000, 10_000, 24, 300));
        let attachment_cache = Arc::new(AttachmentCache::new(std::path::PathBuf::from("attachments"), 1000, 24 * 7, 300));
        let rate_limiter = Arc::new(RateLimiter::new(60, 20, 20));

        let manager = Arc::new(ConversationManager::new(self.clone(), Arc::clone(&message_cache), Arc::clone(&attachment_cache)));
        let history_fetcher = Arc::new(HistoryFetcher::new(self.clone(), Arc::clone(&message_cache), Arc::clone(&rate_limiter)));
        let attachment_uploader = Arc::new(AttachmentUploader::new(Arc::clone(&attachment_cache), Arc::clone(&rate_limiter), 25 * 1024 * 1024));
        let processor = OutgoingEventProcessor::new(self.clone(), Arc::clone(&rate_limiter), self.max_message_length)
            .with_attachment_uploader(attachment_uploader);
        let (socket, queue_rx) = SocketIoServer::new(self.adapter_name.as_str(), processor);

        let queue_shutdown = shutdown.clone();
        tokio::spawn(Arc::clone(&socket).run_queue(queue_rx, queue_shutdown));

        let router = socket.router();
        let listener = tokio::net::TcpListener::bind("0.0.0.0:8765").await.context("failed to bind discord socket server")?;
        let mut axum_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = axum_shutdown.wait_for(|v| *v).await;
            });
            if let Err(error) = serve.await {
                tracing::error!(%error, "discord socket server exited");
            }
        });

        let (event_tx, mut event_rx) = mpsc::channel::<DiscordEvent>(256);
        let handler = Handler { event_tx, http_slot: Arc::clone(&self.http), bot_user_id_slot: Arc::clone(&self.bot_user_id) };

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILD_MESSAGE_REACTIONS
            | GatewayIntents::GUILDS;

        let mut client = serenity::Client::builder(self.token.as_str(), intents)
            .event_handler(handler)
            .await
            .context("failed to build discord client")?;

        let shard_manager = client.shard_manager.clone();
        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                tracing::error!(%error, "discord gateway error");
            }
        });

        let builder = IncomingEventBuilder::new(self.adapter_name.as_str(), "discord");
        let now_ms = || chrono::Utc::now().timestamp_millis();

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(&manager, &history_fetcher, &socket, &builder, event, now_ms()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }

        shard_manager.shutdown_all().await;
        Ok(())
    }
}

impl DiscordAdapter {
    async fn handle_event(
        &self,
        manager: &ConversationManager<DiscordAdapter>,
        history_fetcher: &HistoryFetcher<DiscordAdapter>,
        socket: &Arc<SocketIoServer<OutgoingEventProcessor<DiscordAdapter>>>,
        builder: &IncomingEventBuilder,
        event: DiscordEvent,
        now_ms: i64,
    ) {
        match event {
            DiscordEvent::New(message) => {
                let delta = manager.add_to_conversation(&DiscordEvent::New(message), now_ms).await;
                self.emit_delta(manager, history_fetcher, socket, builder, delta, now_ms).await;
            }
            DiscordEvent::Delete { channel_id, message_id } => {
                let delta = manager.delete_from_conversation(&DiscordEvent::Delete { channel_id, message_id }).await;
                self.emit_delta(manager, history_fetcher, socket, builder, delta, now_ms).await;
            }
            DiscordEvent::Edit(update) => {
                let Some(new_content) = update.content.clone() else { return };
                let conversation_id = crate::core::conversation::data_classes::canonical_conversation_id("discord", &update.channel_id.to_string());
                if let Some(edited) = manager.edit_message_text(&conversation_id, &update.id.to_string(), new_content, now_ms).await {
                    socket.emit_event("message_updated", builder.edited_message(&edited).data).await;
                }
            }
            DiscordEvent::ReactionAdd(reaction) => {
                let conversation_id = crate::core::conversation::data_classes::canonical_conversation_id("discord", &reaction.channel_id.to_string());
                if let Some(delta) = manager.add_reaction(&conversation_id, &reaction.message_id.to_string(), &reaction_name(&reaction.emoji)).await {
                    socket.emit_event("reaction_added", builder.reaction_update("reaction_added", &delta).data).await;
                }
            }
            DiscordEvent::ReactionRemove(reaction) => {
                let conversation_id = crate::core::conversation::data_classes::canonical_conversation_id("discord", &reaction.channel_id.to_string());
                if let Some(delta) = manager.remove_reaction(&conversation_id, &reaction.message_id.to_string(), &reaction_name(&reaction.emoji)).await {
                    socket.emit_event("reaction_removed", builder.reaction_update("reaction_removed", &delta).data).await;
                }
            }
        }
    }

    async fn emit_delta(
        &self,
        _manager: &ConversationManager<DiscordAdapter>,
        history_fetcher: &HistoryFetcher<DiscordAdapter>,
        socket: &Arc<SocketIoServer<OutgoingEventProcessor<DiscordAdapter>>>,
        builder: &IncomingEventBuilder,
        delta: ConversationDelta,
        now_ms: i64,
    ) {
        let history = if delta.fetch_history {
            let messages = history_fetcher
                .fetch(&delta.conversation_id, HistoryAnchor::Before(now_ms), self.history_limit)
                .await
                .unwrap_or_default();
            Some(
                messages
                    .into_iter()
                    .map(|m| json!({ "message_id": m.message_id, "text": m.text, "timestamp": m.timestamp }))
                    .collect(),
            )
        } else {
            None
        };

        for canonical in builder.events_for_delta(&delta, history) {
            socket.emit_event(&canonical.event_type, canonical.data).await;
        }
    }
}

struct Handler {
    event_tx: mpsc::Sender<DiscordEvent>,
    http_slot: Arc<RwLock<Option<Arc<Http>>>>,
    bot_user_id_slot: Arc<RwLock<Option<UserId>>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(bot_name = %ready.user.name, "discord connected");
        *self.http_slot.write().await = Some(ctx.http.clone());
        *self.bot_user_id_slot.write().await = Some(ready.user.id);
    }

    async fn message(&self, _ctx: Context, message: Message) {
        let bot_user_id = *self.bot_user_id_slot.read().await;
        if bot_user_id.is_some_and(|id| message.author.id == id) {
            return;
        }
        if self.event_tx.send(DiscordEvent::New(message)).await.is_err() {
            tracing::warn!("discord event channel closed");
        }
    }

    async fn message_update(&self, _ctx: Context, _old: Option<Message>, _new: Option<Message>, event: MessageUpdateEvent) {
        let _ = self.event_tx.send(DiscordEvent::Edit(Box::new(event))).await;
    }

    async fn message_delete(&self, _ctx: Context, channel_id: ChannelId, message_id: MessageId, _guild_id: Option<serenity::all::GuildId>) {
        let _ = self.event_tx.send(DiscordEvent::Delete { channel_id, message_id }).await;
    }

    async fn reaction_add(&self, _ctx: Context, reaction: Reaction) {
        let _ = self.event_tx.send(DiscordEvent::ReactionAdd(reaction)).await;
    }

    async fn reaction_remove(&self, _ctx: Context, reaction: Reaction) {
        let _ = self.event_tx.send(DiscordEvent::ReactionRemove(reaction)).await;
    }
}
