//! The original boneIO cover algorithm: position steps on the 1 Hz event-bus
//! tick by `100 / travel_time_s` per second.
//!
//! Published positions snap to the nearest 10 while a `set_position` target
//! is active, except inside the 5-unit end zones which report at 1-unit
//! precision. This is observable MQTT policy kept for compatibility, not a
//! physical model.

use crate::cover::{Cover, CoverArgs, CoverCore};
use crate::models::{CoverOperation, CoverState};
use crate::net::Payload;
use crate::runtime::Event;
use crate::util;
use async_trait::async_trait;
use log::{debug, info};
use std::sync::{Arc, Mutex, Weak};

pub struct PreviousCover {
    core: CoverCore,
    open_steps: f64,
    close_steps: f64,
    set_position: Mutex<Option<f64>>,
    requested_closing: Mutex<bool>,
    weak_self: Weak<PreviousCover>,
}

fn snap10(value: f64) -> f64 {
    (value / 10.0).round() * 10.0
}

impl PreviousCover {
    pub fn new(args: CoverArgs) -> Arc<PreviousCover> {
        let open_steps = 100.0 / args.open_time.as_secs_f64().max(1.0);
        let close_steps = 100.0 / args.close_time.as_secs_f64().max(1.0);
        let cover = Arc::new_cyclic(|weak_self| PreviousCover {
            core: CoverCore::new(args, false),
            open_steps,
            close_steps,
            set_position: Mutex::new(None),
            requested_closing: Mutex::new(true),
            weak_self: weak_self.clone(),
        });
        cover.core.send_state();
        cover
    }

    fn tick_name(&self) -> String {
        format!("cover{}", self.core.id)
    }

    async fn stop_cover(&self, on_exit: bool) {
        self.core.open_relay.turn_off().await;
        self.core.close_relay.turn_off().await;
        self.core.event_bus.remove_every_second_listener(&self.tick_name());
        *self.set_position.lock().unwrap() = None;
        self.core.set_operation(CoverOperation::Idle);
        if !on_exit {
            self.core.send_state_and_save();
        }
    }

    /// One 1 Hz step of the position estimate.
    async fn on_tick(&self) {
        if self.core.current_operation() == CoverOperation::Idle {
            return;
        }
        let closing = *self.requested_closing.lock().unwrap();
        let step = if closing {
            -self.close_steps
        } else {
            self.open_steps
        };
        let position = self.core.position() + step;
        self.core.dynamic.lock().unwrap().position = position;
        let target = *self.set_position.lock().unwrap();

        let mut reported = position.round();
        if target.is_some() {
            if reported > 5.0 && reported < 95.0 {
                reported = snap10(position);
            }
        }
        reported = reported.clamp(0.0, 100.0);
        self.send_position(reported as i64);

        let done = match target {
            Some(target) => {
                reported == target
                    || (closing && position <= target)
                    || (!closing && position >= target)
            }
            None => reported >= 100.0 || reported <= 0.0,
        };
        if done {
            self.core.set_position_value(target.unwrap_or(reported));
            self.stop_cover(false).await;
        }
    }

    fn send_position(&self, reported: i64) {
        self.core.message_bus.send_message(
            &format!("{}/pos", self.core.send_topic),
            Payload::Json(serde_json::json!({ "position": reported })),
            false,
        );
        self.core.event_bus.trigger_event(Event::Cover(CoverState {
            id: self.core.id.clone(),
            name: self.core.name.clone(),
            state: self.core.state_kind(),
            position: reported,
            tilt: None,
            current_operation: self.core.current_operation(),
            timestamp: util::timestamp(),
        }));
    }
}

#[async_trait]
impl Cover for PreviousCover {
    fn core(&self) -> &CoverCore {
        &self.core
    }

    async fn run_cover(
        &self,
        operation: CoverOperation,
        target_position: Option<f64>,
        _target_tilt: Option<f64>,
    ) {
        if self.core.current_operation() != CoverOperation::Idle {
            self.stop_cover(true).await;
        }
        let closing = operation == CoverOperation::Closing;
        *self.requested_closing.lock().unwrap() = closing;
        *self.set_position.lock().unwrap() = target_position;
        self.core.set_operation(operation);

        let (relay, opposing) = if closing {
            (&self.core.close_relay, &self.core.open_relay)
        } else {
            (&self.core.open_relay, &self.core.close_relay)
        };
        if opposing.is_active() {
            opposing.turn_off().await;
        }
        let weak = self.weak_self.clone();
        self.core.event_bus.add_every_second_listener(
            &self.tick_name(),
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(cover) = weak.upgrade() {
                        cover.on_tick().await;
                    }
                })
            }),
        );
        relay.turn_on().await;
        self.core.send_state();
    }

    async fn stop_with(&self, on_exit: bool) {
        info!("Stopping cover {}.", self.core.name);
        self.core.signal_stop();
        self.stop_cover(on_exit).await;
    }

    async fn set_cover_position(&self, position: f64) {
        let target = snap10(position.clamp(0.0, 100.0));
        let current = self.core.position();
        if (current - position).abs() < 1.0
            || *self.set_position.lock().unwrap() == Some(target)
        {
            return;
        }
        info!("Setting cover at position {target}.");
        let operation = if target < current {
            CoverOperation::Closing
        } else {
            CoverOperation::Opening
        };
        debug!(
            "Requested set position {target}. Operation {operation:?}",
            operation = operation
        );
        self.run_cover(operation, Some(target), None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::testutil::cover_relay;
    use crate::hardware::dry::DryPinState;
    use crate::net::local::LocalMessageBus;
    use crate::runtime::EventBus;
    use std::time::Duration;

    fn cover(
        pins: &DryPinState,
        bus: &LocalMessageBus,
        event_bus: &EventBus,
        initial_position: f64,
    ) -> Arc<PreviousCover> {
        PreviousCover::new(CoverArgs {
            id: "garaz".to_string(),
            name: "Garaż".to_string(),
            device_class: "shutter".to_string(),
            open_relay: cover_relay("open", pins, bus, event_bus),
            close_relay: cover_relay("close", pins, bus, event_bus),
            open_time: Duration::from_secs(10),
            close_time: Duration::from_secs(10),
            restore_state: false,
            initial_position,
            initial_tilt: 0.0,
            topic_prefix: "boneio".to_string(),
            message_bus: Arc::new(bus.clone()),
            event_bus: event_bus.clone(),
            persist: Arc::new(|_, _, _| {}),
        })
    }

    #[test]
    fn snapping_is_to_nearest_ten() {
        assert_eq!(snap10(43.0), 40.0);
        assert_eq!(snap10(45.0), 50.0);
        assert_eq!(snap10(97.0), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn steps_on_second_ticks_until_target() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let cover = cover(&pins, &bus, &event_bus, 0.0);
        cover.set_cover_position(50.0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pins.level("open"));
        assert_eq!(cover.core().current_operation(), CoverOperation::Opening);
        // 10 units per second; the 50% target needs five ticks.
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(cover.core().current_operation(), CoverOperation::Idle);
        assert!(!pins.level("open"));
        assert_eq!(cover.core().position(), 50.0);
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn free_run_saturates_at_limits() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let cover = cover(&pins, &bus, &event_bus, 80.0);
        cover.open().await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(cover.core().current_operation(), CoverOperation::Idle);
        assert_eq!(cover.core().position(), 100.0);
        assert!(!pins.level("open"));
        event_bus.close();
    }
}
