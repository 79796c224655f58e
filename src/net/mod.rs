//! Message bus boundary: MQTT client, in-process local bus and the Home
//! Assistant discovery payloads.

pub mod discovery;
pub mod local;
pub mod mqtt;

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Outbound payload. Engines publish either plain text or a JSON document.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
    /// Empty retained message, used to clear one-shot click topics.
    Empty,
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Payload {
        match serde_json::to_value(value) {
            Ok(value) => Payload::Json(value),
            Err(err) => {
                log::error!("Cannot serialize payload: {err}");
                Payload::Empty
            }
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Payload::Text(text) => text,
            Payload::Json(value) => value.to_string(),
            Payload::Empty => String::new(),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

/// Callback invoked for messages on a dynamically subscribed topic.
pub type MessageCallback = Arc<
    dyn Fn(String, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// A remembered HA discovery message; the whole catalogue is re-emitted when
/// Home Assistant reports `online`.
#[derive(Debug, Clone)]
pub struct AutodiscoveryMessage {
    pub ha_type: String,
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Contract shared by the MQTT client and the in-process bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish; ordering is preserved per bus.
    fn send_message(&self, topic: &str, payload: Payload, retain: bool);

    fn is_connection_established(&self) -> bool;

    /// Remember (and immediately publish) a discovery message.
    fn add_autodiscovery_message(&self, message: AutodiscoveryMessage);

    /// Subscribe a callback to one topic filter.
    async fn subscribe_and_listen(&self, topic: String, callback: MessageCallback);

    /// Drop a dynamic subscription.
    async fn unsubscribe_and_stop_listen(&self, topic: String);
}
