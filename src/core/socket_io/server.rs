//! WebSocket event bus replacing Socket.IO: clients connect, submit
//! canonical outgoing commands (`bot_response`), receive queued canonical
//! incoming events and request-status replies, and may `cancel_request` a
//! not-yet-processed command.
//!
//! Grounded on `original_source/core/socket_io/server.py`. No Socket.IO
//! crate exists in the retrieved corpus, so this is built directly on
//! `axum`'s `ws` feature plus `tower-http` cors — the way
//! `inkolin-smartopol-ai` wires `axum = { features = ["ws"] }` for an
//! analogous gateway-websocket surface. Each connection gets one JSON
//! envelope protocol, `{"event": ..., "data": ...}`, in place of Socket.IO's
//! multiplexed namespaces/rooms; replies to a specific client are just sent
//! down that client's own channel instead of Socket.IO's `room=sid`.

use crate::core::socket_io::protocol::{BotResponse, CancelRequest, QueuedEvent, RequestEvent};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;

/// Platform-specific handling of a dequeued outgoing command. Mirrors
/// `Adapter.process_outgoing_event`.
pub trait OutgoingDispatch: Send + Sync + 'static {
    fn process_outgoing_event(&self, event_type: &str, data: Value) -> impl std::future::Future<Output = Value> + Send;
}

struct Connections {
    senders: HashMap<String, mpsc::UnboundedSender<Message>>,
}

pub struct SocketIoServer<D: OutgoingDispatch> {
    adapter_type: String,
    dispatch: D,
    connections: Mutex<Connections>,
    live_requests: Mutex<HashSet<String>>,
    queue_tx: mpsc::UnboundedSender<QueuedEvent>,
}

impl<D: OutgoingDispatch> SocketIoServer<D> {
    pub fn new(adapter_type: impl Into<String>, dispatch: D) -> (Arc<Self>, mpsc::UnboundedReceiver<QueuedEvent>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            adapter_type: adapter_type.into(),
            dispatch,
            connections: Mutex::new(Connections { senders: HashMap::new() }),
            live_requests: Mutex::new(HashSet::new()),
            queue_tx,
        });
        (server, queue_rx)
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(Self::ws_handler))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(self))
    }

    /// Drains the queue returned by `new`, dispatching each command in FIFO
    /// order. Run this as its own task; it exits when the queue sender is
    /// dropped (server shutdown) or `shutdown` fires.
    pub async fn run_queue(self: Arc<Self>, mut queue_rx: mpsc::UnboundedReceiver<QueuedEvent>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                event = queue_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            // Dequeue-time cancellation: if cancel_request already removed
            // this id, drop the command without calling the adapter.
            if !self.live_requests.lock().await.remove(&event.request_id) {
                continue;
            }

            let result = self.dispatch.process_outgoing_event(&event.event_type, event.data).await;
            let completed = result.get("request_completed").and_then(Value::as_bool).unwrap_or(false);

            let mut data = json!({});
            if completed {
                if let Some(ids) = result.get("message_ids") {
                    data["message_ids"] = ids.clone();
                } else if let Some(history) = result.get("history") {
                    data["history"] = history.clone();
                }
            }

            let status = if completed { "request_success" } else { "request_failed" };
            self.send_to(&event.socket_id, status, &RequestEvent {
                adapter_type: self.adapter_type.clone(),
                request_id: event.request_id,
                data,
            })
            .await;
        }
    }

    /// Broadcast an event to every connected client.
    pub async fn emit_event(&self, event: &str, data: Value) {
        let envelope = json!({ "event": event, "data": data }).to_string();
        let connections = self.connections.lock().await;
        for sender in connections.senders.values() {
            let _ = sender.send(Message::Text(envelope.clone().into()));
        }
    }

    async fn send_to(&self, socket_id: &str, event: &str, payload: &RequestEvent) {
        let envelope = json!({ "event": event, "data": payload }).to_string();
        let connections = self.connections.lock().await;
        if let Some(sender) = connections.senders.get(socket_id) {
            let _ = sender.send(Message::Text(envelope.into()));
        }
    }

    async fn ws_handler(State(server): State<Arc<Self>>, ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(move |socket| Self::handle_socket(server, socket))
    }

    async fn handle_socket(server: Arc<Self>, socket: WebSocket) {
        let socket_id = uuid::Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        server.connections.lock().await.senders.insert(socket_id.clone(), tx);
        tracing::info!(socket_id, "client connected");

        let forward = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(message)) = ws_rx.next().await {
            let Message::Text(text) = message else { continue };
            server.handle_message(&socket_id, &text).await;
        }

        forward.abort();
        server.connections.lock().await.senders.remove(&socket_id);
        tracing::info!(socket_id, "client disconnected");
    }

    async fn handle_message(&self, socket_id: &str, text: &str) {
        let Ok(envelope) = serde_json::from_str::<Value>(text) else {
            tracing::warn!("malformed client event");
            return;
        };
        let Some(event) = envelope.get("event").and_then(Value::as_str) else {
            return;
        };
        let data = envelope.get("data").cloned().unwrap_or(Value::Null);

        match event {
            "bot_response" => self.queue_event(socket_id, data).await,
            "cancel_request" => self.cancel_request(socket_id, data).await,
            other => tracing::debug!(event = other, "unhandled client event"),
        }
    }

    async fn queue_event(&self, socket_id: &str, data: Value) {
        let Ok(response) = serde_json::from_value::<BotResponse>(data) else {
            tracing::warn!("malformed bot_response payload");
            return;
        };

        let request_id = response
            .request_id
            .unwrap_or_else(|| format!("req_{socket_id}_{}", uuid::Uuid::new_v4()));

        self.live_requests.lock().await.insert(request_id.clone());

        let queued = QueuedEvent {
            event_type: response.event_type,
            data: response.data,
            socket_id: socket_id.to_string(),
            request_id: request_id.clone(),
            queued_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        if self.queue_tx.send(queued).is_err() {
            return;
        }

        self.send_to(socket_id, "request_queued", &RequestEvent {
            adapter_type: self.adapter_type.clone(),
            request_id,
            data: Value::Null,
        })
        .await;
    }

    async fn cancel_request(&self, socket_id: &str, data: Value) {
        let Ok(cancel) = serde_json::from_value::<CancelRequest>(data) else {
            return;
        };

        let removed = self.live_requests.lock().await.remove(&cancel.request_id);
        let status = if removed { "request_success" } else { "request_failed" };

        self.send_to(socket_id, status, &RequestEvent {
            adapter_type: self.adapter_type.clone(),
            request_id: cancel.request_id,
            data: Value::Null,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoDispatch;

    impl OutgoingDispatch for EchoDispatch {
        async fn process_outgoing_event(&self, _event_type: &str, _data: Value) -> Value {
            json!({ "request_completed": true, "message_ids": ["m1"] })
        }
    }

    #[tokio::test]
    async fn cancel_before_dequeue_prevents_dispatch() {
        let (server, queue_rx) = SocketIoServer::new("test", EchoDispatch);
        server.live_requests.lock().await.insert("r1".into());
        server.live_requests.lock().await.remove("r1");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&server).run_queue(queue_rx, shutdown_rx));

        server
            .queue_tx
            .send(QueuedEvent {
                event_type: "send_message".into(),
                data: json!({}),
                socket_id: "s1".into(),
                request_id: "r1".into(),
                queued_at_ms: 0,
            })
            .unwrap();

        shutdown_tx.send(true).unwrap();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn queued_request_dispatches_once_live() {
        let (server, queue_rx) = SocketIoServer::new("test", EchoDispatch);
        server.live_requests.lock().await.insert("r2".into());

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let server_clone = Arc::clone(&server);
        let handle = tokio::spawn(server_clone.run_queue(queue_rx, shutdown_rx));

        server
            .queue_tx
            .send(QueuedEvent {
                event_type: "send_message".into(),
                data: json!({}),
                socket_id: "s1".into(),
                request_id: "r2".into(),
                queued_at_ms: 0,
            })
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!server.live_requests.lock().await.contains("r2"));

        shutdown_tx.send(true).unwrap();
        let _ = handle.await;
    }
}
