//! Time-based cover, the ESPHome-style algorithm: position is estimated
//! from elapsed time against the configured full-travel duration.

use crate::cover::{Cover, CoverArgs, CoverCore, MotionEnd, COVER_MOVE_UPDATE_INTERVAL};
use crate::models::CoverOperation;
use crate::relay::Relay;
use async_trait::async_trait;
use log::warn;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

pub struct TimeBasedCover {
    core: CoverCore,
    weak_self: Weak<TimeBasedCover>,
}

impl TimeBasedCover {
    pub fn new(args: CoverArgs) -> Arc<TimeBasedCover> {
        let cover = Arc::new_cyclic(|weak_self| TimeBasedCover {
            core: CoverCore::new(args, false),
            weak_self: weak_self.clone(),
        });
        cover.core.send_state();
        cover
    }

    async fn move_cover(
        self: Arc<Self>,
        operation: CoverOperation,
        duration: Duration,
        target_position: Option<f64>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let core = &self.core;
        let initial_position = core.position();
        let opening = operation == CoverOperation::Opening;
        let total_steps = if opening {
            100.0 - initial_position
        } else {
            initial_position
        };
        if total_steps <= 0.0 || duration.is_zero() {
            core.set_operation(CoverOperation::Idle);
            core.send_state();
            return;
        }
        let (relay, opposing): (&Arc<Relay>, &Arc<Relay>) = if opening {
            (&core.open_relay, &core.close_relay)
        } else {
            (&core.close_relay, &core.open_relay)
        };
        // Never both energized: opposing relay goes off first.
        opposing.turn_off().await;
        relay.turn_on().await;
        let start = tokio::time::Instant::now();
        let duration_ms = duration.as_millis() as f64;

        let end = loop {
            if *stop_rx.borrow() {
                break MotionEnd::Stopped;
            }
            let elapsed_ms = start.elapsed().as_millis() as f64;
            let delta = elapsed_ms / duration_ms * 100.0;
            let position = if opening {
                (initial_position + delta).min(100.0)
            } else {
                (initial_position - delta).max(0.0)
            };
            core.set_position_value(position);
            core.maybe_send_state();

            if let Some(target) = target_position {
                if (opening && position >= target) || (!opening && position <= target) {
                    break MotionEnd::Finished;
                }
            }
            if (opening && position >= 100.0) || (!opening && position <= 0.0) {
                break MotionEnd::Finished;
            }
            tokio::select! {
                _ = tokio::time::sleep(COVER_MOVE_UPDATE_INTERVAL) => {}
                _ = stop_rx.changed() => {}
            }
        };

        if end == MotionEnd::Finished {
            if let Some(target) = target_position {
                core.set_position_value(target);
            }
            relay.turn_off().await;
            core.set_operation(CoverOperation::Idle);
            core.send_state_and_save();
        }
    }
}

#[async_trait]
impl Cover for TimeBasedCover {
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
        let task = tokio::spawn(this.move_cover(operation, duration, target_position, stop_rx));
        self.core.store_motion_task(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::testutil::cover_relay;
    use crate::hardware::dry::DryPinState;
    use crate::models::CoverStateKind;
    use crate::net::local::LocalMessageBus;
    use crate::net::MessageBus;
    use crate::runtime::EventBus;

    fn cover(
        pins: &DryPinState,
        bus: &LocalMessageBus,
        event_bus: &EventBus,
        initial_position: f64,
    ) -> Arc<TimeBasedCover> {
        TimeBasedCover::new(CoverArgs {
            id: "salon".to_string(),
            name: "Salon".to_string(),
            device_class: "shutter".to_string(),
            open_relay: cover_relay("open", pins, bus, event_bus),
            close_relay: cover_relay("close", pins, bus, event_bus),
            open_time: Duration::from_millis(20_000),
            close_time: Duration::from_millis(20_000),
            restore_state: false,
            initial_position,
            initial_tilt: 0.0,
            topic_prefix: "boneio".to_string(),
            message_bus: Arc::new(bus.clone()),
            event_bus: event_bus.clone(),
            persist: Arc::new(|_, _, _| {}),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn closes_to_target_position() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let cover = cover(&pins, &bus, &event_bus, 100.0);
        cover.set_cover_position(40.0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cover.core().current_operation(), CoverOperation::Closing);
        assert!(pins.level("close"));
        assert!(!pins.level("open"));
        // 60% of travel at 20 s full travel = 12 s.
        tokio::time::sleep(Duration::from_millis(13_000)).await;
        assert_eq!(cover.core().current_operation(), CoverOperation::Idle);
        assert!(!pins.level("close"));
        let position = cover.core().position();
        assert!((39.0..=41.0).contains(&position), "position {position}");
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_motion_and_releases_relays() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let cover = cover(&pins, &bus, &event_bus, 0.0);
        cover.open().await;
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert!(pins.level("open"));
        cover.stop().await;
        assert!(!pins.level("open") && !pins.level("close"));
        assert_eq!(cover.core().current_operation(), CoverOperation::Idle);
        let position = cover.core().position();
        assert!((20.0..=30.0).contains(&position), "position {position}");
        assert_eq!(cover.core().state_kind(), CoverStateKind::Open);
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn reversal_never_energizes_both_relays() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let cover = cover(&pins, &bus, &event_bus, 0.0);
        cover.open().await;
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        cover.close().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!(pins.level("open") && pins.level("close")));
        assert!(pins.level("close"));
        assert_eq!(cover.core().current_operation(), CoverOperation::Closing);
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn full_open_saturates_and_publishes_pos() {
        let pins = DryPinState::new();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let cover = cover(&pins, &bus, &event_bus, 90.0);
        cover.open().await;
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(cover.core().position(), 100.0);
        assert_eq!(cover.core().state_kind(), CoverStateKind::Open);
        assert!(!pins.level("open"));
        // /pos is not retained; watch the live topic instead.
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        bus.subscribe_and_listen(
            "boneio/cover/salon/pos".to_string(),
            Arc::new(move |_t, payload| {
                let seen = seen_cb.clone();
                Box::pin(async move {
                    seen.lock().unwrap().push(payload);
                })
            }),
        )
        .await;
        cover.core().send_state();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().map(String::as_str), Some("{\"position\":100}"));
        event_bus.close();
    }
}
