//! In-process message bus for broker-less operation.
//!
//! Same contract as MQTT: retained values are replayed to late subscribers,
//! publishes fan out to every matching subscription. The UI consumes this
//! when no `mqtt:` section is configured.

use crate::net::{AutodiscoveryMessage, MessageBus, MessageCallback, Payload};
use crate::ONLINE;
use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct LocalInner {
    subscribers: Mutex<HashMap<String, Vec<MessageCallback>>>,
    retained: Mutex<HashMap<String, String>>,
}

#[derive(Clone, Default)]
pub struct LocalMessageBus {
    inner: Arc<LocalInner>,
}

impl LocalMessageBus {
    pub fn new(topic_prefix: &str) -> Self {
        info!("Starting LOCAL message bus!");
        let bus = LocalMessageBus::default();
        bus.send_message(
            &format!("{topic_prefix}/state"),
            Payload::Text(ONLINE.to_string()),
            true,
        );
        bus
    }

    /// Retained value for a topic, if any. Used by tests and the UI.
    pub fn retained(&self, topic: &str) -> Option<String> {
        self.inner.retained.lock().unwrap().get(topic).cloned()
    }
}

#[async_trait]
impl MessageBus for LocalMessageBus {
    fn send_message(&self, topic: &str, payload: Payload, retain: bool) {
        let payload = payload.into_string();
        if retain {
            self.inner
                .retained
                .lock()
                .unwrap()
                .insert(topic.to_string(), payload.clone());
        }
        let matching: Vec<MessageCallback> = {
            let subscribers = self.inner.subscribers.lock().unwrap();
            subscribers
                .iter()
                .filter(|(pattern, _)| crate::util::topic_matches(pattern, topic))
                .flat_map(|(_, callbacks)| callbacks.iter().cloned())
                .collect()
        };
        for callback in matching {
            tokio::spawn(callback(topic.to_string(), payload.clone()));
        }
    }

    fn is_connection_established(&self) -> bool {
        true
    }

    fn add_autodiscovery_message(&self, _message: AutodiscoveryMessage) {}

    async fn subscribe_and_listen(&self, topic: String, callback: MessageCallback) {
        let replay: Vec<(String, String)> = {
            let retained = self.inner.retained.lock().unwrap();
            retained
                .iter()
                .filter(|(t, _)| crate::util::topic_matches(&topic, t))
                .map(|(t, p)| (t.clone(), p.clone()))
                .collect()
        };
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .entry(topic)
            .or_default()
            .push(callback.clone());
        for (topic, payload) in replay {
            tokio::spawn(callback(topic, payload));
        }
    }

    async fn unsubscribe_and_stop_listen(&self, topic: String) {
        self.inner.subscribers.lock().unwrap().remove(&topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retained_values_replay_on_subscribe() {
        let bus = LocalMessageBus::new("boneio");
        bus.send_message("boneio/energy/r1", Payload::Text("{\"energy\": 1.0}".into()), true);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        bus.subscribe_and_listen(
            "boneio/energy/r1".to_string(),
            Arc::new(move |_, payload| {
                let seen = seen_cb.clone();
                Box::pin(async move {
                    assert!(payload.contains("energy"));
                    seen.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.retained("boneio/state").as_deref(), Some("online"));
    }
}
