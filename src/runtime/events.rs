//! Typed event bus.
//!
//! Events are enqueued from anywhere and dispatched sequentially by a single
//! worker task, so listeners for one entity always observe emission order.
//! Listener registration is keyed by `(event_type, entity_id, listener_id)`;
//! the `listener_id` index lets a consumer (the UI, an output group) drop all
//! of its subscriptions in one call.

use crate::models::{CoverState, InputState, OutputState, SensorState};
use crate::util;
use log::{debug, error, info};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Input,
    Output,
    Cover,
    Sensor,
    ModbusDevice,
    Host,
}

/// An event with its state payload. `Host` exists for the UI event contract;
/// nothing in the core publishes it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", content = "event_state")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Input(InputState),
    Output(OutputState),
    Cover(CoverState),
    Sensor(SensorState),
    ModbusDevice(SensorState),
    Host,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Input(_) => EventType::Input,
            Event::Output(_) => EventType::Output,
            Event::Cover(_) => EventType::Cover,
            Event::Sensor(_) => EventType::Sensor,
            Event::ModbusDevice(_) => EventType::ModbusDevice,
            Event::Host => EventType::Host,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            Event::Input(state) => &state.pin,
            Event::Output(state) => &state.id,
            Event::Cover(state) => &state.id,
            Event::Sensor(state) => &state.id,
            Event::ModbusDevice(state) => &state.id,
            Event::Host => "",
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;
pub type AsyncCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
pub type HaOnlineCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    event: HashMap<EventType, HashMap<String, HashMap<String, EventCallback>>>,
    listener_index: HashMap<String, Vec<(EventType, String)>>,
    every_second: HashMap<String, AsyncCallback>,
    sigterm: Vec<AsyncCallback>,
    ha_online: Vec<HaOnlineCallback>,
}

struct BusInner {
    tx: mpsc::UnboundedSender<Event>,
    listeners: Mutex<Listeners>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create the bus and spawn its worker and 1 Hz tick tasks. Must be
    /// called with a tokio runtime active.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = EventBus {
            inner: Arc::new(BusInner {
                tx,
                listeners: Mutex::new(Listeners::default()),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        let worker = tokio::spawn(Self::event_worker(bus.clone(), rx));
        let ticker = tokio::spawn(Self::second_ticker(bus.clone()));
        info!("Event bus worker started.");
        bus.inner.tasks.lock().unwrap().extend([worker, ticker]);
        bus
    }

    async fn event_worker(bus: EventBus, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            bus.handle_event(&event);
            // One suspension point per event keeps dispatch cooperative.
            tokio::task::yield_now().await;
        }
    }

    fn handle_event(&self, event: &Event) {
        let callbacks: Vec<EventCallback> = {
            let listeners = self.inner.listeners.lock().unwrap();
            listeners
                .event
                .get(&event.event_type())
                .and_then(|by_entity| by_entity.get(event.entity_id()))
                .map(|by_listener| by_listener.values().cloned().collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    async fn second_ticker(bus: EventBus) {
        // Align ticks to second boundaries like a wall clock.
        let mut next = tokio::time::Instant::now() + std::time::Duration::from_millis(
            1000 - (util::timestamp().fract() * 1000.0) as u64 % 1000,
        );
        loop {
            tokio::time::sleep_until(next).await;
            next += std::time::Duration::from_secs(1);
            let callbacks: Vec<AsyncCallback> = {
                let listeners = bus.inner.listeners.lock().unwrap();
                listeners.every_second.values().cloned().collect()
            };
            for callback in callbacks {
                tokio::spawn(callback());
            }
        }
    }

    /// Enqueue an event for dispatch.
    pub fn trigger_event(&self, event: Event) {
        if self.inner.tx.send(event).is_err() {
            error!("Event bus worker is gone, dropping event.");
        }
    }

    pub fn add_event_listener(
        &self,
        event_type: EventType,
        entity_id: &str,
        listener_id: &str,
        callback: EventCallback,
    ) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        listeners
            .event
            .entry(event_type)
            .or_default()
            .entry(entity_id.to_string())
            .or_default()
            .insert(listener_id.to_string(), callback);
        listeners
            .listener_index
            .entry(listener_id.to_string())
            .or_default()
            .push((event_type, entity_id.to_string()));
    }

    /// Remove every registration made under `listener_id`.
    pub fn remove_listener(&self, listener_id: &str) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        let Some(entries) = listeners.listener_index.remove(listener_id) else {
            return;
        };
        for (event_type, entity_id) in entries {
            if let Some(by_entity) = listeners.event.get_mut(&event_type) {
                if let Some(by_listener) = by_entity.get_mut(&entity_id) {
                    by_listener.remove(listener_id);
                    if by_listener.is_empty() {
                        by_entity.remove(&entity_id);
                    }
                }
            }
        }
        debug!("Removed all listeners of {listener_id}.");
    }

    pub fn add_every_second_listener(&self, name: &str, callback: AsyncCallback) {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .every_second
            .insert(name.to_string(), callback);
    }

    pub fn remove_every_second_listener(&self, name: &str) {
        self.inner.listeners.lock().unwrap().every_second.remove(name);
    }

    pub fn add_sigterm_listener(&self, callback: AsyncCallback) {
        self.inner.listeners.lock().unwrap().sigterm.push(callback);
    }

    /// Run every sigterm listener to completion, in registration order.
    pub async fn run_sigterm_listeners(&self) {
        info!("Handling SIGTERM listeners...");
        let callbacks: Vec<AsyncCallback> = {
            let listeners = self.inner.listeners.lock().unwrap();
            listeners.sigterm.clone()
        };
        for callback in callbacks {
            callback().await;
        }
    }

    pub fn add_haonline_listener(&self, callback: HaOnlineCallback) {
        self.inner.listeners.lock().unwrap().ha_online.push(callback);
    }

    /// Notify listeners that Home Assistant reported `online`.
    pub fn signal_ha_online(&self) {
        let callbacks: Vec<HaOnlineCallback> = {
            let listeners = self.inner.listeners.lock().unwrap();
            listeners.ha_online.clone()
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Abort the worker tasks. Called at the end of the shutdown chain.
    pub fn close(&self) {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OnOff, OutputState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn output_event(id: &str) -> Event {
        Event::Output(OutputState {
            id: id.to_string(),
            name: id.to_string(),
            state: OnOff::On,
            output_type: "switch".to_string(),
            pin: "0".to_string(),
            timestamp: 0.0,
            expander_id: "mcp1".to_string(),
        })
    }

    #[tokio::test]
    async fn dispatches_to_entity_listeners_in_order(
    ) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        bus.add_event_listener(
            EventType::Output,
            "r1",
            "test",
            Arc::new(move |event| {
                seen_cb.lock().unwrap().push(event.entity_id().to_string());
            }),
        );
        bus.trigger_event(output_event("r1"));
        bus.trigger_event(output_event("other"));
        bus.trigger_event(output_event("r1"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["r1", "r1"]);
        bus.close();
    }

    #[tokio::test]
    async fn remove_listener_drops_all_registrations() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for entity in ["a", "b"] {
            let count = count.clone();
            bus.add_event_listener(
                EventType::Output,
                entity,
                "group1",
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        bus.remove_listener("group1");
        bus.trigger_event(output_event("a"));
        bus.trigger_event(output_event("b"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.close();
    }
}
