//! Output groups: an aggregate switch over a set of relays.
//!
//! Group state is ON iff any member is ON; mutations fan out to all
//! members. The group listens for its members' output events on the bus
//! (keyed by its own id, so one call removes all registrations) and
//! publishes once at construction, then on change only.

use crate::models::{OnOff, OutputState};
use crate::net::{MessageBus, Payload};
use crate::relay::Relay;
use crate::runtime::{Event, EventBus, EventType};
use crate::util;
use log::debug;
use std::sync::{Arc, Mutex, Weak};

pub struct OutputGroup {
    pub id: String,
    pub name: String,
    members: Vec<Arc<Relay>>,
    state: Mutex<OnOff>,
    send_topic: String,
    message_bus: Arc<dyn MessageBus>,
    event_bus: EventBus,
}

impl OutputGroup {
    /// Cover-driver relays are filtered out upstream; `members` is the final
    /// list.
    pub fn new(
        id: &str,
        name: &str,
        members: Vec<Arc<Relay>>,
        topic_prefix: &str,
        message_bus: Arc<dyn MessageBus>,
        event_bus: EventBus,
    ) -> Arc<OutputGroup> {
        let id = util::strip_accents(id);
        let group = Arc::new(OutputGroup {
            send_topic: format!("{topic_prefix}/group/{id}"),
            id: id.clone(),
            name: name.to_string(),
            state: Mutex::new(OnOff::Off),
            members,
            message_bus,
            event_bus: event_bus.clone(),
        });
        *group.state.lock().unwrap() = group.aggregate_state();
        for member in &group.members {
            let weak: Weak<OutputGroup> = Arc::downgrade(&group);
            event_bus.add_event_listener(
                EventType::Output,
                &member.id,
                &group.id,
                Arc::new(move |_event| {
                    if let Some(group) = weak.upgrade() {
                        group.member_changed();
                    }
                }),
            );
        }
        group.send_state();
        group
    }

    pub fn state(&self) -> OnOff {
        *self.state.lock().unwrap()
    }

    pub fn members(&self) -> &[Arc<Relay>] {
        &self.members
    }

    fn aggregate_state(&self) -> OnOff {
        OnOff::from_bool(self.members.iter().any(|m| m.state() == OnOff::On))
    }

    fn member_changed(&self) {
        let state = self.aggregate_state();
        let changed = {
            let mut current = self.state.lock().unwrap();
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        };
        if changed {
            self.send_state();
        }
    }

    fn send_state(&self) {
        let state = self.state();
        self.message_bus.send_message(
            &self.send_topic,
            Payload::Json(serde_json::json!({ "state": state.to_string() })),
            false,
        );
        self.event_bus.trigger_event(Event::Output(OutputState {
            id: self.id.clone(),
            name: self.name.clone(),
            state,
            output_type: "group".to_string(),
            pin: String::new(),
            timestamp: util::timestamp(),
            expander_id: String::new(),
        }));
    }

    pub async fn turn_on(&self) {
        debug!("Turning on group {}.", self.id);
        for member in &self.members {
            let member = member.clone();
            tokio::spawn(async move { member.turn_on().await });
        }
    }

    pub async fn turn_off(&self) {
        debug!("Turning off group {}.", self.id);
        for member in &self.members {
            let member = member.clone();
            tokio::spawn(async move { member.turn_off().await });
        }
    }

    pub async fn toggle(&self) {
        if self.state() == OnOff::On {
            self.turn_off().await;
        } else {
            self.turn_on().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputType;
    use crate::hardware::dry::DryPinState;
    use crate::hardware::DriverPin;
    use crate::net::local::LocalMessageBus;
    use crate::relay::{RelayArgs};
    use std::time::Duration;

    fn relay(id: &str, pins: &DryPinState, bus: &LocalMessageBus, event_bus: &EventBus) -> Arc<Relay> {
        Relay::new(RelayArgs {
            id: id.to_string(),
            name: id.to_string(),
            output_type: OutputType::Switch,
            expander_id: String::new(),
            pin_id: "0".to_string(),
            restore_state: false,
            driver: DriverPin::Switch(Box::new(pins.pin(id))),
            momentary_turn_on: None,
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
    async fn group_state_follows_members() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let r1 = relay("r1", &pins, &bus, &event_bus);
        let r2 = relay("r2", &pins, &bus, &event_bus);
        let group = OutputGroup::new(
            "g1",
            "Group 1",
            vec![r1.clone(), r2.clone()],
            "boneio",
            Arc::new(bus.clone()),
            event_bus.clone(),
        );
        assert_eq!(group.state(), OnOff::Off);
        r1.turn_on().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(group.state(), OnOff::On);
        r1.turn_off().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(group.state(), OnOff::Off);

        group.turn_on().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pins.level("r1") && pins.level("r2"));
        event_bus.close();
    }
}
