//! Output (relay) engine.
//!
//! A relay wraps one driver pin (GPIO or expander) with the control model:
//! interlock gating before any turn-on, optional momentary pulses back to
//! the opposite state, retained state publication and virtual energy
//! accounting. Cover-driver relays suppress momentary behaviour and are
//! never addressable over MQTT directly.

pub mod energy;
pub mod group;
pub mod interlock;

use crate::config::OutputType;
use crate::hardware::DriverPin;
use crate::models::{OnOff, OutputState};
use crate::net::{MessageBus, Payload};
use crate::relay::energy::VirtualEnergySensor;
use crate::relay::interlock::InterlockManager;
use crate::runtime::{Event, EventBus};
use crate::util;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Relay {
    pub id: String,
    pub name: String,
    pub output_type: OutputType,
    pub expander_id: String,
    pub pin_id: String,
    pub restore_state: bool,
    driver: Mutex<DriverPin>,
    state: Mutex<OnOff>,
    last_timestamp: Mutex<f64>,
    momentary_turn_on: Option<Duration>,
    momentary_turn_off: Option<Duration>,
    momentary_task: Mutex<Option<JoinHandle<()>>>,
    interlock: Mutex<Option<(Arc<InterlockManager>, Vec<String>)>>,
    energy: Option<Arc<VirtualEnergySensor>>,
    send_topic: String,
    message_bus: Arc<dyn MessageBus>,
    event_bus: EventBus,
}

pub struct RelayArgs {
    pub id: String,
    pub name: String,
    pub output_type: OutputType,
    pub expander_id: String,
    pub pin_id: String,
    pub restore_state: bool,
    pub driver: DriverPin,
    pub momentary_turn_on: Option<Duration>,
    pub momentary_turn_off: Option<Duration>,
    pub virtual_power_usage: Option<f64>,
    pub virtual_volume_flow_rate: Option<f64>,
    pub topic_prefix: String,
    pub topic_type: &'static str,
    pub message_bus: Arc<dyn MessageBus>,
    pub event_bus: EventBus,
}

impl Relay {
    pub fn new(args: RelayArgs) -> Arc<Relay> {
        let id = util::strip_accents(&args.id);
        // Cover-driver relays must never pulse back on their own.
        let (momentary_turn_on, momentary_turn_off) = if args.output_type == OutputType::Cover {
            (None, None)
        } else {
            (args.momentary_turn_on, args.momentary_turn_off)
        };
        let energy = if args.virtual_power_usage.is_some()
            || args.virtual_volume_flow_rate.is_some()
        {
            Some(VirtualEnergySensor::new(
                &id,
                &args.topic_prefix,
                args.virtual_power_usage,
                args.virtual_volume_flow_rate,
                args.message_bus.clone(),
            ))
        } else {
            None
        };
        Arc::new(Relay {
            send_topic: format!("{}/{}/{id}", args.topic_prefix, args.topic_type),
            id,
            name: args.name,
            output_type: args.output_type,
            expander_id: args.expander_id,
            pin_id: args.pin_id,
            restore_state: args.restore_state,
            driver: Mutex::new(args.driver),
            state: Mutex::new(OnOff::Off),
            last_timestamp: Mutex::new(0.0),
            momentary_turn_on,
            momentary_turn_off,
            momentary_task: Mutex::new(None),
            interlock: Mutex::new(None),
            energy,
            message_bus: args.message_bus,
            event_bus: args.event_bus,
        })
    }

    pub fn set_interlock(&self, manager: Arc<InterlockManager>, groups: Vec<String>) {
        *self.interlock.lock().unwrap() = Some((manager, groups));
    }

    pub fn energy_sensor(&self) -> Option<Arc<VirtualEnergySensor>> {
        self.energy.clone()
    }

    pub fn state(&self) -> OnOff {
        *self.state.lock().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.driver.lock().unwrap().is_active()
    }

    pub fn is_pwm(&self) -> bool {
        self.driver.lock().unwrap().is_pwm()
    }

    pub fn is_light(&self) -> bool {
        matches!(self.output_type, OutputType::Light | OutputType::Led)
    }

    pub fn check_interlock(&self) -> bool {
        let interlock = self.interlock.lock().unwrap();
        match interlock.as_ref() {
            Some((manager, groups)) if !groups.is_empty() => self.can_turn_on(manager, groups),
            _ => true,
        }
    }

    fn can_turn_on(&self, manager: &Arc<InterlockManager>, groups: &[String]) -> bool {
        manager.can_turn_on(self, groups)
    }

    pub async fn turn_on(self: &Arc<Self>) {
        if !self.check_interlock() {
            warn!("Interlock active: cannot turn on {}.", self.id);
            // HA flips its cache optimistically; publish the requested state
            // once, then the true one, so it re-syncs.
            self.publish_state(OnOff::On);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.send_state();
            return;
        }
        if let Err(err) = self.driver.lock().unwrap().set(true) {
            error!("Cannot turn on {}: {err}", self.id);
            return;
        }
        *self.state.lock().unwrap() = OnOff::On;
        self.schedule_momentary(OnOff::On);
        self.send_state();
    }

    pub async fn turn_off(self: &Arc<Self>) {
        if let Err(err) = self.driver.lock().unwrap().set(false) {
            error!("Cannot turn off {}: {err}", self.id);
            return;
        }
        *self.state.lock().unwrap() = OnOff::Off;
        self.schedule_momentary(OnOff::Off);
        self.send_state();
    }

    pub async fn toggle(self: &Arc<Self>) {
        debug!("Toggle relay {}, state: {}.", self.name, self.state());
        if self.state() == OnOff::On {
            self.turn_off().await;
        } else {
            self.turn_on().await;
        }
    }

    /// PCA9685 channels only; 16-bit brightness.
    pub async fn set_brightness(self: &Arc<Self>, value: u16) {
        let result = self.driver.lock().unwrap().set_duty(value);
        match result {
            None => warn!("Relay {} is not PWM capable.", self.id),
            Some(Err(err)) => error!("Cannot set brightness of {}: {err}", self.id),
            Some(Ok(())) => {
                *self.state.lock().unwrap() = OnOff::from_bool(value > 0);
                self.send_brightness_state(value);
            }
        }
    }

    /// Drive hardware to the snapshot state at boot. Returns false when the
    /// interlock gate refused the restore. Momentary pulses are not armed
    /// here; only user-triggered transitions pulse back.
    pub async fn restore(self: &Arc<Self>, desired_on: bool) -> bool {
        if desired_on && !self.check_interlock() {
            warn!(
                "Interlock active: not restoring {} to ON, forcing OFF.",
                self.id
            );
            self.apply_state(false);
            return false;
        }
        self.apply_state(desired_on);
        true
    }

    fn apply_state(&self, on: bool) {
        if let Err(err) = self.driver.lock().unwrap().set(on) {
            error!("Cannot restore {}: {err}", self.id);
            return;
        }
        *self.state.lock().unwrap() = OnOff::from_bool(on);
        self.send_state();
    }

    /// Cancel any pending pulse and, when a momentary duration is configured
    /// for the state just entered, schedule the automatic return.
    fn schedule_momentary(self: &Arc<Self>, entered: OnOff) {
        let mut slot = self.momentary_task.lock().unwrap();
        if let Some(previous) = slot.take() {
            debug!("Cancelling momentary action for {}", self.name);
            previous.abort();
        }
        let delay = match entered {
            OnOff::On => self.momentary_turn_on,
            OnOff::Off => self.momentary_turn_off,
        };
        let Some(delay) = delay else {
            return;
        };
        debug!("Applying momentary action for {} in {delay:?}", self.name);
        let relay = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Momentary callback for output {}", relay.name);
            match entered {
                OnOff::On => relay.turn_off().await,
                OnOff::Off => relay.turn_on().await,
            }
        }));
    }

    fn publish_state(&self, state: OnOff) {
        if matches!(self.output_type, OutputType::Cover | OutputType::None) {
            return;
        }
        self.message_bus.send_message(
            &self.send_topic,
            Payload::Json(serde_json::json!({ "state": state.to_string() })),
            true,
        );
    }

    /// Publish the true state, feed the energy accumulator and emit the
    /// output event.
    pub fn send_state(&self) {
        let state = self.state();
        self.publish_state(state);
        if let Some(energy) = &self.energy {
            energy.on_state(state.is_on());
        }
        let timestamp = util::timestamp();
        *self.last_timestamp.lock().unwrap() = timestamp;
        self.event_bus.trigger_event(Event::Output(OutputState {
            id: self.id.clone(),
            name: self.name.clone(),
            state,
            output_type: self.output_type.as_str().to_string(),
            pin: self.pin_id.clone(),
            timestamp,
            expander_id: self.expander_id.clone(),
        }));
    }

    fn send_brightness_state(&self, brightness: u16) {
        let state = self.state();
        if !matches!(self.output_type, OutputType::Cover | OutputType::None) {
            self.message_bus.send_message(
                &self.send_topic,
                Payload::Json(serde_json::json!({
                    "state": state.to_string(),
                    "brightness": brightness,
                })),
                true,
            );
        }
        let timestamp = util::timestamp();
        *self.last_timestamp.lock().unwrap() = timestamp;
        self.event_bus.trigger_event(Event::Output(OutputState {
            id: self.id.clone(),
            name: self.name.clone(),
            state,
            output_type: self.output_type.as_str().to_string(),
            pin: self.pin_id.clone(),
            timestamp,
            expander_id: self.expander_id.clone(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::dry::DryPinState;
    use crate::net::local::LocalMessageBus;

    fn relay(
        id: &str,
        pins: &DryPinState,
        bus: &LocalMessageBus,
        event_bus: &EventBus,
        momentary_on: Option<Duration>,
    ) -> Arc<Relay> {
        Relay::new(RelayArgs {
            id: id.to_string(),
            name: id.to_string(),
            output_type: OutputType::Switch,
            expander_id: "mcp1".to_string(),
            pin_id: "0".to_string(),
            restore_state: false,
            driver: DriverPin::Switch(Box::new(pins.pin(id))),
            momentary_turn_on: momentary_on,
            momentary_turn_off: None,
            virtual_power_usage: None,
            virtual_volume_flow_rate: None,
            topic_prefix: "boneio".to_string(),
            topic_type: "relay",
            message_bus: Arc::new(bus.clone()),
            event_bus: event_bus.clone(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn published_state_tracks_hardware() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let r1 = relay("r1", &pins, &bus, &event_bus, None);
        r1.turn_on().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pins.level("r1"));
        assert_eq!(
            bus.retained("boneio/relay/r1").as_deref(),
            Some("{\"state\":\"ON\"}")
        );
        r1.toggle().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pins.level("r1"));
        assert_eq!(
            bus.retained("boneio/relay/r1").as_deref(),
            Some("{\"state\":\"OFF\"}")
        );
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn momentary_pulse_returns_to_off() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let r1 = relay("r1", &pins, &bus, &event_bus, Some(Duration::from_millis(500)));
        r1.turn_on().await;
        assert!(pins.level("r1"));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!pins.level("r1"), "pulse should have turned the relay off");
        assert_eq!(r1.state(), OnOff::Off);
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn interlock_denial_publishes_optimistic_then_true_state() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let a = relay("a", &pins, &bus, &event_bus, None);
        let b = relay("b", &pins, &bus, &event_bus, None);
        let interlocks = InterlockManager::new();
        interlocks.register(&a, &["g".to_string()]);
        interlocks.register(&b, &["g".to_string()]);
        a.set_interlock(interlocks.clone(), vec!["g".to_string()]);
        b.set_interlock(interlocks.clone(), vec!["g".to_string()]);

        a.turn_on().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        b.turn_on().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        // B's hardware never energized; its retained state settled on OFF.
        assert!(!pins.level("b"));
        assert_eq!(b.state(), OnOff::Off);
        assert_eq!(
            bus.retained("boneio/relay/b").as_deref(),
            Some("{\"state\":\"OFF\"}")
        );
        // At most one member of the group is ON.
        assert!(pins.level("a"));
        event_bus.close();
    }
}
