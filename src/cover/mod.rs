//! Cover (shutter) engine.
//!
//! Three variants drive two antagonistic relays under a time model:
//!
//! * [`previous::PreviousCover`] steps its position estimate on the 1 Hz
//!   event-bus tick,
//! * [`time_based::TimeBasedCover`] recomputes position every 50 ms from the
//!   motion start time,
//! * [`venetian::VenetianCover`] extends the time model with slat tilt.
//!
//! At no instant are both relays energized: every motion stops the previous
//! one first and turns the opposing relay off before energizing.

pub mod previous;
pub mod time_based;
pub mod venetian;

use crate::models::{CoverOperation, CoverState, CoverStateKind};
use crate::net::{MessageBus, Payload};
use crate::relay::Relay;
use crate::runtime::{Event, EventBus};
use crate::util;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Driver-level recompute interval for the time-based variants.
pub const COVER_MOVE_UPDATE_INTERVAL: Duration = Duration::from_millis(50);
/// Finer tick while homing in on a tilt target.
pub const TILT_HOMING_INTERVAL: Duration = Duration::from_millis(10);

/// Persist hook: `(cover_id, position, tilt)` written to the state snapshot.
pub type CoverPersist = Arc<dyn Fn(&str, i64, Option<i64>) + Send + Sync>;

pub struct CoverDynamic {
    pub position: f64,
    pub tilt: f64,
    pub current_operation: CoverOperation,
}

/// State and plumbing shared by all cover variants.
pub struct CoverCore {
    pub id: String,
    pub name: String,
    pub device_class: String,
    pub open_relay: Arc<Relay>,
    pub close_relay: Arc<Relay>,
    pub open_time: Duration,
    pub close_time: Duration,
    pub restore_state: bool,
    has_tilt: bool,
    dynamic: Mutex<CoverDynamic>,
    stop_tx: Mutex<watch::Sender<bool>>,
    motion_task: Mutex<Option<JoinHandle<()>>>,
    last_publish: Mutex<tokio::time::Instant>,
    send_topic: String,
    message_bus: Arc<dyn MessageBus>,
    event_bus: EventBus,
    persist: CoverPersist,
}

pub struct CoverArgs {
    pub id: String,
    pub name: String,
    pub device_class: String,
    pub open_relay: Arc<Relay>,
    pub close_relay: Arc<Relay>,
    pub open_time: Duration,
    pub close_time: Duration,
    pub restore_state: bool,
    pub initial_position: f64,
    pub initial_tilt: f64,
    pub topic_prefix: String,
    pub message_bus: Arc<dyn MessageBus>,
    pub event_bus: EventBus,
    pub persist: CoverPersist,
}

impl CoverCore {
    fn new(args: CoverArgs, has_tilt: bool) -> CoverCore {
        let id = util::strip_accents(&args.id);
        // A fresh channel is created per motion; the initial one just says
        // "nothing is running".
        let (stop_tx, _) = watch::channel(true);
        CoverCore {
            send_topic: format!("{}/cover/{id}", args.topic_prefix),
            id,
            name: args.name,
            device_class: args.device_class,
            open_relay: args.open_relay,
            close_relay: args.close_relay,
            open_time: args.open_time,
            close_time: args.close_time,
            restore_state: args.restore_state,
            has_tilt,
            dynamic: Mutex::new(CoverDynamic {
                position: args.initial_position,
                tilt: args.initial_tilt,
                current_operation: CoverOperation::Idle,
            }),
            stop_tx: Mutex::new(stop_tx),
            motion_task: Mutex::new(None),
            last_publish: Mutex::new(tokio::time::Instant::now()),
            message_bus: args.message_bus,
            event_bus: args.event_bus,
            persist: args.persist,
        }
    }

    pub fn position(&self) -> f64 {
        self.dynamic.lock().unwrap().position
    }

    pub fn tilt(&self) -> f64 {
        self.dynamic.lock().unwrap().tilt
    }

    pub fn current_operation(&self) -> CoverOperation {
        self.dynamic.lock().unwrap().current_operation
    }

    pub fn set_position_value(&self, position: f64) {
        self.dynamic.lock().unwrap().position = position.clamp(0.0, 100.0);
    }

    pub fn set_tilt_value(&self, tilt: f64) {
        self.dynamic.lock().unwrap().tilt = tilt.clamp(0.0, 100.0);
    }

    pub fn set_operation(&self, operation: CoverOperation) {
        self.dynamic.lock().unwrap().current_operation = operation;
    }

    /// `position = 0` reports closed, anything else open, unless moving.
    pub fn state_kind(&self) -> CoverStateKind {
        let dynamic = self.dynamic.lock().unwrap();
        match dynamic.current_operation {
            CoverOperation::Opening => CoverStateKind::Opening,
            CoverOperation::Closing => CoverStateKind::Closing,
            CoverOperation::Idle => {
                if dynamic.position.round() as i64 <= 0 {
                    CoverStateKind::Closed
                } else {
                    CoverStateKind::Open
                }
            }
        }
    }

    fn signal_stop(&self) {
        let _ = self.stop_tx.lock().unwrap().send(true);
    }

    fn arm_motion(&self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = tx;
        rx
    }

    fn store_motion_task(&self, task: JoinHandle<()>) {
        *self.motion_task.lock().unwrap() = Some(task);
    }

    async fn join_motion_task(&self) {
        let task = self.motion_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Publish state + position, emit the cover event.
    pub fn send_state(&self) {
        let state = self.state_kind();
        let (position, tilt, operation) = {
            let dynamic = self.dynamic.lock().unwrap();
            (
                dynamic.position.round() as i64,
                dynamic.tilt.round() as i64,
                dynamic.current_operation,
            )
        };
        self.message_bus.send_message(
            &format!("{}/state", self.send_topic),
            Payload::Text(state.to_string()),
            false,
        );
        let pos_payload = if self.has_tilt {
            serde_json::json!({ "position": position, "tilt": tilt })
        } else {
            serde_json::json!({ "position": position })
        };
        self.message_bus.send_message(
            &format!("{}/pos", self.send_topic),
            Payload::Json(pos_payload),
            false,
        );
        self.event_bus.trigger_event(Event::Cover(CoverState {
            id: self.id.clone(),
            name: self.name.clone(),
            state,
            position,
            tilt: self.has_tilt.then_some(tilt),
            current_operation: operation,
            timestamp: util::timestamp(),
        }));
    }

    pub fn send_state_and_save(&self) {
        self.send_state();
        if self.restore_state {
            let (position, tilt) = {
                let dynamic = self.dynamic.lock().unwrap();
                (dynamic.position.round() as i64, dynamic.tilt.round() as i64)
            };
            (self.persist)(&self.id, position, self.has_tilt.then_some(tilt));
        }
    }

    /// Throttled publication for motion loops: at most once per second.
    fn maybe_send_state(&self) {
        let now = tokio::time::Instant::now();
        let mut last = self.last_publish.lock().unwrap();
        if now.duration_since(*last) >= Duration::from_secs(1) {
            *last = now;
            drop(last);
            self.send_state();
        }
    }

    fn reset_publish_throttle(&self) {
        // Backdate so the first motion tick publishes immediately.
        *self.last_publish.lock().unwrap() =
            tokio::time::Instant::now() - Duration::from_secs(2);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::config::OutputType;
    use crate::hardware::dry::DryPinState;
    use crate::hardware::DriverPin;
    use crate::net::local::LocalMessageBus;
    use crate::relay::RelayArgs;

    pub(crate) fn cover_relay(
        id: &str,
        pins: &DryPinState,
        bus: &LocalMessageBus,
        event_bus: &EventBus,
    ) -> Arc<Relay> {
        Relay::new(RelayArgs {
            id: id.to_string(),
            name: id.to_string(),
            output_type: OutputType::Cover,
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
}

/// Why a motion loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotionEnd {
    /// Target reached or travel saturated; the loop runs the epilogue.
    Finished,
    /// `stop()` intervened and owns relay shutdown and publication.
    Stopped,
}

#[async_trait]
pub trait Cover: Send + Sync {
    fn core(&self) -> &CoverCore;

    /// Start a motion. Implementations stop any motion in progress first.
    async fn run_cover(
        &self,
        operation: CoverOperation,
        target_position: Option<f64>,
        target_tilt: Option<f64>,
    );

    fn has_tilt(&self) -> bool {
        false
    }

    async fn set_tilt(&self, _tilt: f64) {
        warn!("Cover {} has no tilt axis.", self.core().id);
    }

    async fn tilt_open(&self) {
        self.set_tilt(100.0).await;
    }

    async fn tilt_close(&self) {
        self.set_tilt(0.0).await;
    }

    async fn open(&self) {
        if self.core().position() >= 100.0 {
            return;
        }
        info!("Opening cover {}.", self.core().id);
        self.run_cover(CoverOperation::Opening, None, None).await;
    }

    async fn close(&self) {
        if self.core().position() <= 0.0 {
            return;
        }
        info!("Closing cover {}.", self.core().id);
        self.run_cover(CoverOperation::Closing, None, None).await;
    }

    /// Stop any motion: de-energize both relays, cancel the loop. With
    /// `on_exit` the final state publish is skipped (process shutdown).
    async fn stop_with(&self, on_exit: bool) {
        let core = self.core();
        core.signal_stop();
        core.join_motion_task().await;
        core.open_relay.turn_off().await;
        core.close_relay.turn_off().await;
        core.set_operation(CoverOperation::Idle);
        if !on_exit {
            core.send_state();
        }
    }

    async fn stop(&self) {
        self.stop_with(false).await;
    }

    async fn toggle(&self) {
        debug!("Toggle cover {} from input.", self.core().id);
        if self.core().position() > 50.0 {
            self.close().await;
        } else {
            self.open().await;
        }
    }

    async fn toggle_open(&self) {
        if self.core().current_operation() != CoverOperation::Idle {
            self.stop().await;
        } else {
            self.open().await;
        }
    }

    async fn toggle_close(&self) {
        if self.core().current_operation() != CoverOperation::Idle {
            self.stop().await;
        } else {
            self.close().await;
        }
    }

    async fn set_cover_position(&self, position: f64) {
        let position = position.clamp(0.0, 100.0);
        let current = self.core().position();
        if (current - position).abs() < 1.0 {
            return;
        }
        let operation = if position > current {
            CoverOperation::Opening
        } else {
            CoverOperation::Closing
        };
        self.run_cover(operation, Some(position), None).await;
    }
}
