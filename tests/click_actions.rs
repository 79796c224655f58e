//! End-to-end dispatch: GPIO edges through the click classifier into the
//! action pipeline, relays and MQTT topics. Runs against the dry drivers
//! with a paused clock.

use boneio::config::AppConfig;
use boneio::hardware::gpio::Edge;
use boneio::manager::{CommandRouter, Manager};
use boneio::models::OnOff;
use boneio::net::local::LocalMessageBus;
use boneio::net::MessageBus;
use boneio::runtime::EventBus;
use boneio::state::StateManager;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const YAML: &str = r#"
output:
  - id: r1
    kind: mcp
    expander_id: mcp1
    pin: "0"
    output_type: light
  - id: r2
    kind: mcp
    expander_id: mcp1
    pin: "1"
    output_type: switch
cover:
  - id: salon
    platform: time_based
    open_relay: r1
    close_relay: r2
    open_time: 10s
    close_time: 10s
event:
  - pin: P8_07
    actions:
      single:
        - action: output
          pin: r2
          action_output: toggle
      double:
        - action: mqtt
          topic: external/topic
          action_mqtt_msg: double-clicked
"#;

async fn dry_manager() -> (Arc<Manager>, LocalMessageBus, EventBus) {
    let config: AppConfig = serde_yaml::from_str(YAML).unwrap();
    let bus = LocalMessageBus::new("boneio");
    let event_bus = EventBus::new();
    let dir = tempfile::tempdir().unwrap();
    let state = StateManager::load(&dir.path().join("state.json"));
    let router = CommandRouter::new();
    let manager = Manager::create(
        config,
        dir.path().join("config.yaml"),
        Arc::new(bus.clone()),
        event_bus.clone(),
        state,
        &router,
        true,
    )
    .await;
    (manager, bus, event_bus)
}

fn edge(pin: &str, level: bool) -> Edge {
    Edge {
        pin: pin.to_string(),
        level,
        initial: false,
    }
}

#[tokio::test(start_paused = true)]
async fn single_click_toggles_the_configured_relay() {
    let (manager, bus, event_bus) = dry_manager().await;
    let input = manager.input_by_pin("P8_07").expect("input configured");
    let (tx, rx) = mpsc::unbounded_channel();
    input.attach_edges(rx);

    let clicks = Arc::new(Mutex::new(Vec::new()));
    let clicks_cb = clicks.clone();
    bus.subscribe_and_listen(
        "boneio/input/P8_07".to_string(),
        Arc::new(move |_topic, payload| {
            let clicks = clicks_cb.clone();
            Box::pin(async move {
                clicks.lock().unwrap().push(payload);
            })
        }),
    )
    .await;

    tx.send(edge("P8_07", true)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(edge("P8_07", false)).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let r2 = manager.output_by_id("r2").unwrap();
    assert_eq!(r2.state(), OnOff::On);
    assert!(manager.dry_pins().level("mcp1:1"));
    let clicks = clicks.lock().unwrap();
    assert_eq!(clicks.len(), 1, "{clicks:?}");
    let payload: serde_json::Value = serde_json::from_str(&clicks[0]).unwrap();
    assert_eq!(payload["event_type"], "single");
    assert_eq!(input.last_state(), "single");
    event_bus.close();
}

#[tokio::test(start_paused = true)]
async fn double_click_publishes_the_mqtt_action() {
    let (manager, bus, event_bus) = dry_manager().await;
    let input = manager.input_by_pin("P8_07").unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    input.attach_edges(rx);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    bus.subscribe_and_listen(
        "external/topic".to_string(),
        Arc::new(move |_topic, payload| {
            let seen = seen_cb.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(payload);
            })
        }),
    )
    .await;

    tx.send(edge("P8_07", true)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    tx.send(edge("P8_07", false)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    tx.send(edge("P8_07", true)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    tx.send(edge("P8_07", false)).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(seen.lock().unwrap().as_slice(), ["double-clicked"]);
    // The relay action is bound to single only.
    assert_eq!(manager.output_by_id("r2").unwrap().state(), OnOff::Off);
    event_bus.close();
}

#[tokio::test(start_paused = true)]
async fn cover_stop_on_sigterm_releases_relays_silently() {
    let (manager, bus, event_bus) = dry_manager().await;
    let cover = manager.cover_by_id("salon").unwrap();
    cover.open().await;
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert!(manager.dry_pins().level("mcp1:0"));

    manager.shutdown().await;
    assert!(!manager.dry_pins().level("mcp1:0"));
    assert!(!manager.dry_pins().level("mcp1:1"));
    let _ = bus;
    event_bus.close();
}
