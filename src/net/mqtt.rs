//! MQTT message bus.
//!
//! One task owns the broker connection and drains incoming packets; a second
//! drains the outbound queue so engine code never blocks on the socket.
//! `<prefix>/state = online` is retained and mirrored by a last-will
//! `offline`, the availability contract every discovery payload points at.

use crate::config::MqttConfig;
use crate::net::{AutodiscoveryMessage, MessageBus, MessageCallback, Payload};
use crate::runtime::EventBus;
use crate::util::topic_matches;
use crate::{OFFLINE, ONLINE};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event as MqttEvent, LastWill, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_CAP: Duration = Duration::from_secs(120);

struct OutMessage {
    topic: String,
    payload: Payload,
    retain: bool,
}

struct MqttInner {
    client: AsyncClient,
    topic_prefix: String,
    ha_status_topic: String,
    discovery_enabled: bool,
    connected: AtomicBool,
    out_tx: mpsc::UnboundedSender<OutMessage>,
    dynamic: Mutex<HashMap<String, MessageCallback>>,
    catalogue: Mutex<Vec<AutodiscoveryMessage>>,
    event_bus: EventBus,
    receive: MessageCallback,
}

#[derive(Clone)]
pub struct MqttMessageBus {
    inner: Arc<MqttInner>,
}

impl MqttMessageBus {
    /// Connect and spawn the connection and publisher tasks. `receive` gets
    /// every message that is not handled internally (HA status, dynamic
    /// subscriptions).
    pub fn new(config: &MqttConfig, event_bus: EventBus, receive: MessageCallback) -> Self {
        let mut options = MqttOptions::new(
            format!("boneio-{}", config.topic_prefix),
            config.host.clone(),
            config.port,
        );
        options.set_keep_alive(Duration::from_secs(15));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            format!("{}/state", config.topic_prefix),
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        let (client, eventloop) = AsyncClient::new(options, 64);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let bus = MqttMessageBus {
            inner: Arc::new(MqttInner {
                client,
                topic_prefix: config.topic_prefix.clone(),
                ha_status_topic: format!("{}/status", config.ha_discovery.topic_prefix),
                discovery_enabled: config.ha_discovery.enabled,
                connected: AtomicBool::new(false),
                out_tx,
                dynamic: Mutex::new(HashMap::new()),
                catalogue: Mutex::new(Vec::new()),
                event_bus,
                receive,
            }),
        };
        tokio::spawn(Self::publisher(bus.clone(), out_rx));
        tokio::spawn(Self::connection(bus.clone(), eventloop));
        bus
    }

    async fn publisher(bus: MqttMessageBus, mut rx: mpsc::UnboundedReceiver<OutMessage>) {
        while let Some(message) = rx.recv().await {
            debug!(
                "Sending message topic: {}, retain: {}",
                message.topic, message.retain
            );
            let publish = bus.inner.client.publish(
                message.topic.clone(),
                QoS::AtMostOnce,
                message.retain,
                message.payload.into_string(),
            );
            match tokio::time::timeout(PUBLISH_TIMEOUT, publish).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Publish to {} failed: {err}", message.topic),
                Err(_) => warn!("Publish to {} timed out.", message.topic),
            }
        }
    }

    async fn connection(bus: MqttMessageBus, mut eventloop: rumqttc::EventLoop) {
        let mut reconnect_interval = Duration::from_secs(1);
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker.");
                    reconnect_interval = Duration::from_secs(1);
                    bus.inner.connected.store(true, Ordering::SeqCst);
                    bus.on_connected().await;
                }
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    let payload = String::from_utf8_lossy(&publish.payload).to_string();
                    bus.handle_message(topic, payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    bus.inner.connected.store(false, Ordering::SeqCst);
                    error!(
                        "MQTT error: {err}. Reconnecting in {} seconds",
                        reconnect_interval.as_secs()
                    );
                    tokio::time::sleep(reconnect_interval).await;
                    reconnect_interval = (reconnect_interval * 2).min(RECONNECT_CAP);
                }
            }
        }
    }

    async fn on_connected(&self) {
        let inner = &self.inner;
        let mut topics = vec![
            format!("{}/cmd/+/+/#", inner.topic_prefix),
            inner.ha_status_topic.clone(),
            format!("{}/energy/#", inner.topic_prefix),
        ];
        topics.extend(inner.dynamic.lock().unwrap().keys().cloned());
        debug!("Subscribing to {topics:?}");
        for topic in topics {
            if let Err(err) = inner.client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                warn!("Cannot subscribe {topic}: {err}");
            }
        }
        let state_topic = format!("{}/state", inner.topic_prefix);
        info!("Sending message topic: {state_topic}, payload online.");
        self.send_message(&state_topic, Payload::Text(ONLINE.to_string()), true);
    }

    async fn handle_message(&self, topic: String, payload: String) {
        if topic == self.inner.ha_status_topic {
            if payload == ONLINE {
                info!("Home Assistant went online, re-sending discovery catalogue.");
                let catalogue = self.inner.catalogue.lock().unwrap().clone();
                for message in catalogue {
                    self.send_message(&message.topic, Payload::Json(message.payload), true);
                }
                self.inner.event_bus.signal_ha_online();
            }
            return;
        }
        let dynamic = {
            let listeners = self.inner.dynamic.lock().unwrap();
            listeners
                .iter()
                .find(|(pattern, _)| topic_matches(pattern, &topic))
                .map(|(_, callback)| callback.clone())
        };
        if let Some(callback) = dynamic {
            callback(topic, payload).await;
            return;
        }
        debug!("Received message topic: {topic}, payload: {payload}");
        (self.inner.receive)(topic, payload).await;
    }

    /// Graceful shutdown: retained `offline`, then a clean disconnect so the
    /// broker does not fire the last-will.
    pub async fn announce_offline(&self) {
        let topic = format!("{}/state", self.inner.topic_prefix);
        info!("Sending message topic: {topic}, payload: offline.");
        let publish =
            self.inner
                .client
                .publish(topic, QoS::AtLeastOnce, true, OFFLINE);
        if tokio::time::timeout(PUBLISH_TIMEOUT, publish).await.is_err() {
            warn!("Offline publish timed out.");
        }
        let _ = self.inner.client.disconnect().await;
    }
}

#[async_trait]
impl MessageBus for MqttMessageBus {
    fn send_message(&self, topic: &str, payload: Payload, retain: bool) {
        let message = OutMessage {
            topic: topic.to_string(),
            payload,
            retain,
        };
        if self.inner.out_tx.send(message).is_err() {
            error!("MQTT publisher task is gone.");
        }
    }

    fn is_connection_established(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn add_autodiscovery_message(&self, message: AutodiscoveryMessage) {
        if !self.inner.discovery_enabled {
            return;
        }
        debug!(
            "Sending HA discovery for {}: {}",
            message.ha_type, message.topic
        );
        self.send_message(&message.topic, Payload::Json(message.payload.clone()), true);
        self.inner.catalogue.lock().unwrap().push(message);
    }

    async fn subscribe_and_listen(&self, topic: String, callback: MessageCallback) {
        self.inner
            .dynamic
            .lock()
            .unwrap()
            .insert(topic.clone(), callback);
        if let Err(err) = self
            .inner
            .client
            .subscribe(topic.clone(), QoS::AtMostOnce)
            .await
        {
            warn!("Cannot subscribe {topic}: {err}");
        }
    }

    async fn unsubscribe_and_stop_listen(&self, topic: String) {
        self.inner.dynamic.lock().unwrap().remove(&topic);
        if let Err(err) = self.inner.client.unsubscribe(topic.clone()).await {
            warn!("Cannot unsubscribe {topic}: {err}");
        }
    }
}
