//! Input engine: GPIO edges in, classified clicks out.
//!
//! Two classifiers exist per the board configs: the event classifier turns
//! edges into single/double/long clicks with one-shot timers, the binary
//! classifier reports plain pressed/released. Both share the bounce filter.
//! Emission is serialized per pin so downstream actions observe clicks in
//! arrival order.

use crate::config::{ActionConfig, InputConfig};
use crate::hardware::gpio::Edge;
use crate::models::{ClickType, InputState};
use crate::runtime::{Event, EventBus};
use crate::util;
use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DOUBLE_CLICK_DURATION_MS: u64 = 220;
pub const LONG_PRESS_DURATION_MS: u64 = 400;

/// A classified click leaving the input engine.
#[derive(Debug, Clone)]
pub struct Click {
    pub click_type: ClickType,
    pub duration: Option<f64>,
}

pub type ClickEmit = Arc<dyn Fn(Click) + Send + Sync>;

/// Handler invoked (serialized per pin) for every click; the manager's
/// action dispatch lives behind this.
pub type PressHandler = Arc<
    dyn Fn(Arc<Input>, Click) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// Which classifier a pin uses. Switching between them requires a restart;
/// `inputs_reload` only refreshes actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKind {
    /// single/double/long click events.
    Event,
    /// pressed/released binary sensor.
    Binary,
}

// ---------------------------------------------------------------------------
// Event classifier

struct EventClassifierState {
    pressed: bool,
    last_press: Option<Instant>,
    press_time: Option<Instant>,
    /// True from the first press until the double-click window expires.
    double_possible: bool,
    timer_double: Option<JoinHandle<()>>,
    timer_long: Option<JoinHandle<()>>,
}

struct EventClassifierInner {
    pin: String,
    bounce: Duration,
    emit: ClickEmit,
    state: Mutex<EventClassifierState>,
}

/// The single/double/long state machine.
///
/// A press arms two one-shot timers: the 220 ms double-click window and the
/// 400 ms long-press threshold. A second press inside the window emits
/// `double`; the window expiring with the button released emits `single`;
/// the long timer firing while still pressed emits `long` with its duration.
#[derive(Clone)]
pub struct EventClassifier {
    inner: Arc<EventClassifierInner>,
}

impl EventClassifier {
    pub fn new(pin: &str, bounce: Duration, emit: ClickEmit) -> Self {
        EventClassifier {
            inner: Arc::new(EventClassifierInner {
                pin: pin.to_string(),
                bounce,
                emit,
                state: Mutex::new(EventClassifierState {
                    pressed: false,
                    last_press: None,
                    press_time: None,
                    double_possible: false,
                    timer_double: None,
                    timer_long: None,
                }),
            }),
        }
    }

    /// Record the boot-time level without emitting anything.
    pub fn set_initial(&self, level: bool) {
        self.inner.state.lock().unwrap().pressed = level;
    }

    pub fn on_edge(&self, level: bool) {
        let now = Instant::now();
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        if level {
            if let Some(last) = state.last_press {
                if now.duration_since(last) < inner.bounce {
                    debug!("Bounce on {} ignored.", inner.pin);
                    return;
                }
            }
            state.last_press = Some(now);
            state.pressed = true;
            if state.double_possible {
                // Second press within the window.
                cancel(&mut state.timer_double);
                cancel(&mut state.timer_long);
                state.double_possible = false;
                (inner.emit)(Click {
                    click_type: ClickType::Double,
                    duration: None,
                });
            } else {
                state.press_time = Some(now);
                state.double_possible = true;
                cancel(&mut state.timer_double);
                cancel(&mut state.timer_long);
                state.timer_double = Some(tokio::spawn(Self::double_window(inner.clone())));
                state.timer_long = Some(tokio::spawn(Self::long_window(inner.clone())));
            }
        } else {
            state.pressed = false;
            cancel(&mut state.timer_long);
        }
    }

    async fn double_window(inner: Arc<EventClassifierInner>) {
        tokio::time::sleep(Duration::from_millis(DOUBLE_CLICK_DURATION_MS)).await;
        let mut state = inner.state.lock().unwrap();
        if state.double_possible && !state.pressed {
            (inner.emit)(Click {
                click_type: ClickType::Single,
                duration: None,
            });
        }
        state.double_possible = false;
        state.timer_double = None;
    }

    async fn long_window(inner: Arc<EventClassifierInner>) {
        tokio::time::sleep(Duration::from_millis(LONG_PRESS_DURATION_MS)).await;
        let mut state = inner.state.lock().unwrap();
        if !state.pressed {
            state.timer_long = None;
            return;
        }
        state.double_possible = false;
        cancel(&mut state.timer_double);
        let duration = state
            .press_time
            .map(|t| Instant::now().duration_since(t).as_secs_f64());
        state.timer_long = None;
        (inner.emit)(Click {
            click_type: ClickType::Long,
            duration,
        });
    }
}

fn cancel(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Binary classifier

struct BinaryClassifierState {
    last_edge: Option<Instant>,
    level: bool,
}

/// The pressed/released classifier used by binary-sensor inputs.
#[derive(Clone)]
pub struct BinaryClassifier {
    bounce: Duration,
    emit: ClickEmit,
    initial_send: bool,
    state: Arc<Mutex<BinaryClassifierState>>,
}

impl BinaryClassifier {
    pub fn new(bounce: Duration, initial_send: bool, emit: ClickEmit) -> Self {
        BinaryClassifier {
            bounce,
            emit,
            initial_send,
            state: Arc::new(Mutex::new(BinaryClassifierState {
                last_edge: None,
                level: false,
            })),
        }
    }

    pub fn set_initial(&self, level: bool) {
        self.state.lock().unwrap().level = level;
        if self.initial_send {
            (self.emit)(Click {
                click_type: click_of_level(level),
                duration: None,
            });
        }
    }

    pub fn on_edge(&self, level: bool) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        if let Some(last) = state.last_edge {
            if now.duration_since(last) < self.bounce {
                return;
            }
        }
        state.last_edge = Some(now);
        state.level = level;
        (self.emit)(Click {
            click_type: click_of_level(level),
            duration: None,
        });
    }
}

fn click_of_level(level: bool) -> ClickType {
    if level {
        ClickType::Pressed
    } else {
        ClickType::Released
    }
}

// ---------------------------------------------------------------------------
// Input entity

enum Classifier {
    Event(EventClassifier),
    Binary(BinaryClassifier),
}

/// A configured input pin: classifier, action table and event publication.
pub struct Input {
    pub pin: String,
    pub name: String,
    pub boneio_input: String,
    pub kind: DetectionKind,
    pub clear_message: bool,
    pub show_in_ha: bool,
    pub device_class: Option<String>,
    actions: Mutex<HashMap<ClickType, Vec<ActionConfig>>>,
    last_state: Mutex<String>,
    last_timestamp: Mutex<f64>,
    event_bus: EventBus,
    classifier: Mutex<Option<Classifier>>,
    click_tx: mpsc::UnboundedSender<Click>,
}

impl Input {
    /// Build the entity and spawn its serialized click dispatcher.
    pub fn new(
        config: &InputConfig,
        kind: DetectionKind,
        event_bus: EventBus,
        handler: PressHandler,
    ) -> Arc<Input> {
        let (click_tx, click_rx) = mpsc::unbounded_channel();
        let input = Arc::new(Input {
            pin: config.pin.clone(),
            name: config.identifier(),
            boneio_input: config.boneio_input.clone().unwrap_or_default(),
            kind,
            clear_message: config.clear_message,
            show_in_ha: config.show_in_ha,
            device_class: config.device_class.clone(),
            actions: Mutex::new(config.actions.clone()),
            last_state: Mutex::new("Unknown".to_string()),
            last_timestamp: Mutex::new(0.0),
            event_bus,
            classifier: Mutex::new(None),
            click_tx,
        });
        let emit: ClickEmit = {
            let tx = input.click_tx.clone();
            Arc::new(move |click| {
                let _ = tx.send(click);
            })
        };
        let classifier = match kind {
            DetectionKind::Event => Classifier::Event(EventClassifier::new(
                &config.pin,
                config.bounce_time.as_duration(),
                emit,
            )),
            DetectionKind::Binary => Classifier::Binary(BinaryClassifier::new(
                config.bounce_time.as_duration(),
                config.initial_send,
                emit,
            )),
        };
        *input.classifier.lock().unwrap() = Some(classifier);
        tokio::spawn(Self::dispatch_clicks(input.clone(), click_rx, handler));
        input
    }

    /// The MQTT topic segment this input publishes under.
    pub fn input_type(&self) -> &'static str {
        match self.kind {
            DetectionKind::Event => "input",
            DetectionKind::Binary => "inputsensor",
        }
    }

    pub fn last_state(&self) -> String {
        self.last_state.lock().unwrap().clone()
    }

    pub fn actions_for(&self, click_type: ClickType) -> Vec<ActionConfig> {
        self.actions
            .lock()
            .unwrap()
            .get(&click_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the action table (the `inputs_reload` button). The detection
    /// kind cannot change at runtime.
    pub fn set_actions(&self, actions: HashMap<ClickType, Vec<ActionConfig>>, kind: DetectionKind) {
        if kind != self.kind {
            warn!(
                "Input {}: changing detection type requires a restart; keeping {:?}.",
                self.pin, self.kind
            );
        }
        *self.actions.lock().unwrap() = actions;
    }

    /// Pump raw edges from the GPIO monitor thread into the classifier.
    pub fn attach_edges(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Edge>) {
        let input = self.clone();
        tokio::spawn(async move {
            while let Some(edge) = rx.recv().await {
                let classifier = input.classifier.lock().unwrap();
                match classifier.as_ref() {
                    Some(Classifier::Event(c)) => {
                        if edge.initial {
                            c.set_initial(edge.level);
                        } else {
                            c.on_edge(edge.level);
                        }
                    }
                    Some(Classifier::Binary(c)) => {
                        if edge.initial {
                            c.set_initial(edge.level);
                        } else {
                            c.on_edge(edge.level);
                        }
                    }
                    None => {}
                }
            }
        });
    }

    async fn dispatch_clicks(
        input: Arc<Input>,
        mut rx: mpsc::UnboundedReceiver<Click>,
        handler: PressHandler,
    ) {
        while let Some(click) = rx.recv().await {
            let timestamp = util::timestamp();
            debug!(
                "Press callback: {} on pin {} - {}.",
                click.click_type, input.pin, input.name
            );
            *input.last_state.lock().unwrap() = click.click_type.to_string();
            *input.last_timestamp.lock().unwrap() = timestamp;
            handler(input.clone(), click.clone()).await;
            input.event_bus.trigger_event(Event::Input(InputState {
                name: input.name.clone(),
                pin: input.pin.clone(),
                state: click.click_type.to_string(),
                input_type: input.input_type(),
                timestamp,
                boneio_input: input.boneio_input.clone(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    fn collector() -> (ClickEmit, Arc<Mutex<Vec<(ClickType, Option<f64>, Duration)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_emit = seen.clone();
        let start = Instant::now();
        let emit: ClickEmit = Arc::new(move |click: Click| {
            seen_emit
                .lock()
                .unwrap()
                .push((click.click_type, click.duration, start.elapsed()));
        });
        (emit, seen)
    }

    async fn settle() {
        // Let spawned timer tasks observe the advanced clock.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_click_fires_when_window_expires() {
        let (emit, seen) = collector();
        let c = EventClassifier::new("P8_07", Duration::from_millis(50), emit);
        c.on_edge(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        c.on_edge(false);
        tokio::time::sleep(Duration::from_millis(400)).await;
        settle().await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (click, duration, at) = &seen[0];
        assert_eq!(*click, ClickType::Single);
        assert!(duration.is_none());
        assert!(
            *at >= Duration::from_millis(220) && *at < Duration::from_millis(260),
            "single emitted at {at:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn double_click_fires_on_second_press() {
        let (emit, seen) = collector();
        let c = EventClassifier::new("P8_07", Duration::from_millis(50), emit);
        c.on_edge(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.on_edge(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        c.on_edge(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.on_edge(false);
        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "{seen:?}");
        let (click, _, at) = &seen[0];
        assert_eq!(*click, ClickType::Double);
        assert!(*at >= Duration::from_millis(150) && *at < Duration::from_millis(170));
    }

    #[tokio::test(start_paused = true)]
    async fn long_press_reports_duration() {
        let (emit, seen) = collector();
        let c = EventClassifier::new("P8_07", Duration::from_millis(50), emit);
        c.on_edge(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        c.on_edge(false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        settle().await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "{seen:?}");
        let (click, duration, at) = &seen[0];
        assert_eq!(*click, ClickType::Long);
        let duration = duration.expect("long press carries duration");
        assert!((duration - 0.4).abs() < 0.05, "duration {duration}");
        assert!(*at >= Duration::from_millis(400) && *at < Duration::from_millis(440));
    }

    #[tokio::test(start_paused = true)]
    async fn press_never_emits_single_and_double() {
        // Double press, then a lone press: exactly one DOUBLE and one SINGLE.
        let (emit, seen) = collector();
        let c = EventClassifier::new("P8_07", Duration::from_millis(50), emit);
        c.on_edge(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        c.on_edge(false);
        tokio::time::sleep(Duration::from_millis(60)).await;
        c.on_edge(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        c.on_edge(false);
        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        c.on_edge(true);
        tokio::time::sleep(Duration::from_millis(80)).await;
        c.on_edge(false);
        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        let clicks: Vec<ClickType> = seen.lock().unwrap().iter().map(|(c, _, _)| *c).collect();
        assert_eq!(clicks, vec![ClickType::Double, ClickType::Single]);
    }

    #[tokio::test(start_paused = true)]
    async fn bounced_presses_are_discarded() {
        let (emit, seen) = collector();
        let c = EventClassifier::new("P8_07", Duration::from_millis(50), emit);
        c.on_edge(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        c.on_edge(false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Bounce pair inside the 50 ms window.
        c.on_edge(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        c.on_edge(false);
        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "{seen:?}");
        assert_eq!(seen[0].0, ClickType::Single);
    }

    #[tokio::test(start_paused = true)]
    async fn binary_classifier_reports_both_edges() {
        let (emit, seen) = collector();
        let c = BinaryClassifier::new(Duration::from_millis(25), true, emit);
        c.set_initial(false);
        c.on_edge(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        c.on_edge(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Inside bounce window, dropped.
        c.on_edge(true);
        settle().await;
        let clicks: Vec<ClickType> = seen.lock().unwrap().iter().map(|(c, _, _)| *c).collect();
        assert_eq!(
            clicks,
            vec![ClickType::Released, ClickType::Pressed, ClickType::Released]
        );
    }
}
