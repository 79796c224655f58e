//! Venetian cover: the time-based model extended with slat tilt.
//!
//! A motion runs through three phases from start: the actuator dead time
//! (nothing moves), the tilt swing (only tilt changes), then position
//! travel with the remaining duration. Tilt-only moves drop to a 10 ms tick
//! close to the target and clamp exactly on stop.

use crate::cover::{
    Cover, CoverArgs, CoverCore, MotionEnd, COVER_MOVE_UPDATE_INTERVAL, TILT_HOMING_INTERVAL,
};
use crate::models::CoverOperation;
use crate::relay::Relay;
use async_trait::async_trait;
use log::warn;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

pub struct VenetianCover {
    core: CoverCore,
    tilt_duration: Duration,
    actuator_activation: Duration,
    weak_self: Weak<VenetianCover>,
}

impl VenetianCover {
    pub fn new(
        args: CoverArgs,
        tilt_duration: Duration,
        actuator_activation: Duration,
    ) -> Arc<VenetianCover> {
        let cover = Arc::new_cyclic(|weak_self| VenetianCover {
            core: CoverCore::new(args, true),
            tilt_duration,
            actuator_activation,
            weak_self: weak_self.clone(),
        });
        cover.core.send_state();
        cover
    }

    #[allow(clippy::too_many_lines)]
    async fn move_cover(
        self: Arc<Self>,
        operation: CoverOperation,
        duration: Duration,
        target_position: Option<f64>,
        target_tilt: Option<f64>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let core = &self.core;
        let initial_position = core.position();
        let initial_tilt = core.tilt();
        let opening = operation == CoverOperation::Opening;

        // Nothing to do when already at the requested extreme.
        let tilt_travel = if opening {
            100.0 - initial_tilt
        } else {
            initial_tilt
        };
        let position_travel = if opening {
            100.0 - initial_position
        } else {
            initial_position
        };
        if target_tilt.is_none() && position_travel <= 0.0 && tilt_travel <= 0.0 {
            core.set_operation(CoverOperation::Idle);
            core.send_state();
            return;
        }

        let (relay, opposing): (&Arc<Relay>, &Arc<Relay>) = if opening {
            (&core.open_relay, &core.close_relay)
        } else {
            (&core.close_relay, &core.open_relay)
        };
        opposing.turn_off().await;
        relay.turn_on().await;
        let start = tokio::time::Instant::now();

        let actuator_ms = self.actuator_activation.as_millis() as f64;
        let tilt_ms = self.tilt_duration.as_millis() as f64;
        let duration_ms = duration.as_millis() as f64;
        // Position phase length; floor of 1 ms keeps the division sane when
        // the configured times contradict each other.
        let position_ms = (duration_ms - tilt_ms - actuator_ms).max(1.0);

        let end = loop {
            if *stop_rx.borrow() {
                break MotionEnd::Stopped;
            }
            let elapsed_ms = start.elapsed().as_millis() as f64;

            let (tilt_progress, position_progress) = if elapsed_ms < actuator_ms {
                (0.0, 0.0)
            } else if elapsed_ms - actuator_ms < tilt_ms {
                ((elapsed_ms - actuator_ms) / tilt_ms, 0.0)
            } else {
                (1.0, (elapsed_ms - actuator_ms - tilt_ms) / position_ms)
            };

            let tilt = if opening {
                (initial_tilt + tilt_progress * 100.0).min(100.0)
            } else {
                (initial_tilt - tilt_progress * 100.0).max(0.0)
            };
            core.set_tilt_value(tilt);

            // Position only travels in phase 3; tilt-only moves stay put.
            if target_tilt.is_none() || target_position.is_some() {
                let position = if opening {
                    (initial_position + position_progress * 100.0).min(100.0)
                } else {
                    (initial_position - position_progress * 100.0).max(0.0)
                };
                core.set_position_value(position);
            }
            core.maybe_send_state();

            if let Some(target) = target_tilt {
                if (opening && tilt >= target) || (!opening && tilt <= target) {
                    core.set_tilt_value(target);
                    break MotionEnd::Finished;
                }
            }
            if let Some(target) = target_position {
                let position = core.position();
                if (opening && position >= target) || (!opening && position <= target) {
                    core.set_position_value(target);
                    break MotionEnd::Finished;
                }
            }
            if target_tilt.is_none() {
                let position = core.position();
                if (opening && position >= 100.0) || (!opening && position <= 0.0) {
                    break MotionEnd::Finished;
                }
            } else if tilt_progress >= 1.0 {
                // Tilt saturated before reaching the target value.
                break MotionEnd::Finished;
            }

            let tick = match target_tilt {
                Some(target) if (core.tilt() - target).abs() < 5.0 => TILT_HOMING_INTERVAL,
                _ => COVER_MOVE_UPDATE_INTERVAL,
            };
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = stop_rx.changed() => {}
            }
        };

        if end == MotionEnd::Finished {
            relay.turn_off().await;
            core.set_operation(CoverOperation::Idle);
            core.send_state_and_save();
        }
    }
}

#[async_trait]
impl Cover for VenetianCover {
    fn core(&self) -> &CoverCore {
        &self.core
    }

    fn has_tilt(&self) -> bool {
        true
    }

    async fn run_cover(
        &self,
        operation: CoverOperation,
        target_position: Option<f64>,
        target_tilt: Option<f64>,
    ) {
        if self.core.current_operation() != CoverOperation::Idle {
            warn!("Cover movement is already in progress. Stopping first.");
            self.stop().await;
        }
        let duration = match operation {
            CoverOperation::Opening => self.core.open_time,
            CoverOperation::Closing => self.core.close_time,
            CoverOperation::Idle => return,
        };
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.core.set_operation(operation);
        self.core.reset_publish_throttle();
        let stop_rx = self.core.arm_motion();
        let task = tokio::spawn(this.move_cover(
            operation,
            duration,
            target_position,
            target_tilt,
            stop_rx,
        ));
        self.core.store_motion_task(task);
    }

    async fn set_tilt(&self, tilt: f64) {
        let tilt = tilt.clamp(0.0, 100.0);
        let current = self.core.tilt();
        if (current - tilt).abs() < 1.0 {
            return;
        }
        let operation = if tilt > current {
            CoverOperation::Opening
        } else {
            CoverOperation::Closing
        };
        self.run_cover(operation, None, Some(tilt)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::testutil::cover_relay;
    use crate::hardware::dry::DryPinState;
    use crate::net::local::LocalMessageBus;
    use crate::runtime::EventBus;

    fn venetian(
        pins: &DryPinState,
        bus: &LocalMessageBus,
        event_bus: &EventBus,
        position: f64,
        tilt: f64,
    ) -> Arc<VenetianCover> {
        VenetianCover::new(
            CoverArgs {
                id: "salon".to_string(),
                name: "Salon".to_string(),
                device_class: "shutter".to_string(),
                open_relay: cover_relay("open", pins, bus, event_bus),
                close_relay: cover_relay("close", pins, bus, event_bus),
                open_time: Duration::from_millis(30_000),
                close_time: Duration::from_millis(30_000),
                restore_state: false,
                initial_position: position,
                initial_tilt: tilt,
                topic_prefix: "boneio".to_string(),
                message_bus: Arc::new(bus.clone()),
                event_bus: event_bus.clone(),
                persist: Arc::new(|_, _, _| {}),
            },
            Duration::from_millis(1_500),
            Duration::from_millis(100),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn tilt_only_move_keeps_position(
    ) {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let cover = venetian(&pins, &bus, &event_bus, 50.0, 100.0);
        cover.set_tilt(0.0).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(pins.level("close"));
        assert!(!pins.level("open"));
        // Dead time 100 ms + full swing 1500 ms.
        tokio::time::sleep(Duration::from_millis(1_700)).await;
        assert_eq!(cover.core().current_operation(), CoverOperation::Idle);
        assert!(!pins.level("close"));
        assert_eq!(cover.core().tilt(), 0.0);
        let position = cover.core().position();
        assert!((49.0..=51.0).contains(&position), "position {position}");
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn position_move_saturates_tilt_first() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let cover = venetian(&pins, &bus, &event_bus, 0.0, 0.0);
        cover.set_cover_position(50.0).await;
        // During the tilt phase the position must not change yet.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(cover.core().position() < 1.0);
        assert!(cover.core().tilt() > 40.0);
        // Position phase: 30 s - 1.5 s - 0.1 s left for 100 units, so 50
        // units take ~14.2 s past the tilt phase.
        tokio::time::sleep(Duration::from_millis(16_000)).await;
        assert_eq!(cover.core().current_operation(), CoverOperation::Idle);
        assert_eq!(cover.core().tilt(), 100.0);
        let position = cover.core().position();
        assert!((49.0..=51.0).contains(&position), "position {position}");
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn partial_tilt_stops_near_target() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let cover = venetian(&pins, &bus, &event_bus, 50.0, 0.0);
        cover.set_tilt(40.0).await;
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(cover.core().current_operation(), CoverOperation::Idle);
        assert_eq!(cover.core().tilt(), 40.0);
        event_bus.close();
    }
}
