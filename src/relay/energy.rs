//! Virtual power/energy accumulation for non-metered loads.
//!
//! While the relay is ON the configured power (W) and/or volume flow (L/h)
//! integrate into Wh and L counters. The retained `<prefix>/energy/<id>`
//! payload is republished every 30 s while ON and immediately on every state
//! transition; on boot the counters restore from that retained message
//! through a one-shot subscription.

use crate::net::{MessageBus, Payload};
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct EnergyMessage {
    #[serde(default)]
    energy: Option<f64>,
    #[serde(default)]
    water: Option<f64>,
}

struct EnergyState {
    energy_wh: f64,
    water_l: f64,
    last_on: Option<Instant>,
    on: bool,
}

pub struct VirtualEnergySensor {
    relay_id: String,
    topic: String,
    power_w: Option<f64>,
    flow_l_per_h: Option<f64>,
    state: Mutex<EnergyState>,
    task: Mutex<Option<JoinHandle<()>>>,
    message_bus: Arc<dyn MessageBus>,
}

impl VirtualEnergySensor {
    pub fn new(
        relay_id: &str,
        topic_prefix: &str,
        power_w: Option<f64>,
        flow_l_per_h: Option<f64>,
        message_bus: Arc<dyn MessageBus>,
    ) -> Arc<Self> {
        Arc::new(VirtualEnergySensor {
            relay_id: relay_id.to_string(),
            topic: format!("{topic_prefix}/energy/{relay_id}"),
            power_w,
            flow_l_per_h,
            state: Mutex::new(EnergyState {
                energy_wh: 0.0,
                water_l: 0.0,
                last_on: None,
                on: false,
            }),
            task: Mutex::new(None),
            message_bus,
        })
    }

    pub fn power_w(&self) -> Option<f64> {
        self.power_w
    }

    pub fn flow_l_per_h(&self) -> Option<f64> {
        self.flow_l_per_h
    }

    pub fn energy_wh(&self) -> f64 {
        self.state.lock().unwrap().energy_wh
    }

    /// Restore counters from the retained energy topic. The subscription is
    /// one-shot: it unsubscribes after the first matching message so later
    /// self-published values are not reprocessed.
    pub async fn subscribe_restore(self: &Arc<Self>) {
        let sensor = self.clone();
        let topic = self.topic.clone();
        self.message_bus
            .clone()
            .subscribe_and_listen(
                topic,
                Arc::new(move |_topic, payload| {
                    let sensor = sensor.clone();
                    Box::pin(async move {
                        match serde_json::from_str::<EnergyMessage>(&payload) {
                            Ok(message) => {
                                let mut state = sensor.state.lock().unwrap();
                                if let Some(energy) = message.energy {
                                    state.energy_wh = energy;
                                    info!(
                                        "Restored energy state for {} from MQTT: {:.4} Wh",
                                        sensor.relay_id, energy
                                    );
                                }
                                if let Some(water) = message.water {
                                    state.water_l = water;
                                    info!(
                                        "Restored water state for {} from MQTT: {:.4} L",
                                        sensor.relay_id, water
                                    );
                                }
                            }
                            Err(err) => warn!(
                                "Failed to restore energy state for {}: {err}",
                                sensor.relay_id
                            ),
                        }
                        sensor
                            .message_bus
                            .unsubscribe_and_stop_listen(sensor.topic.clone())
                            .await;
                    })
                }),
            )
            .await;
    }

    /// Track a relay state transition.
    pub fn on_state(self: &Arc<Self>, on: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if on {
                if state.on {
                    return;
                }
                state.on = true;
                state.last_on = Some(Instant::now());
            } else {
                if !state.on {
                    return;
                }
                Self::accumulate(&mut state, self.power_w, self.flow_l_per_h);
                state.on = false;
                state.last_on = None;
            }
        }
        if on {
            let sensor = self.clone();
            let task = tokio::spawn(async move {
                loop {
                    {
                        let mut state = sensor.state.lock().unwrap();
                        if !state.on {
                            break;
                        }
                        Self::accumulate(&mut state, sensor.power_w, sensor.flow_l_per_h);
                    }
                    sensor.publish();
                    tokio::time::sleep(PUBLISH_INTERVAL).await;
                }
            });
            let mut slot = self.task.lock().unwrap();
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
            info!("Started periodic virtual sensors task for {}", self.relay_id);
        } else {
            if let Some(task) = self.task.lock().unwrap().take() {
                task.abort();
            }
            self.publish();
            info!("Stopped periodic virtual sensors task for {}", self.relay_id);
        }
    }

    fn accumulate(state: &mut EnergyState, power_w: Option<f64>, flow: Option<f64>) {
        let now = Instant::now();
        if let Some(last_on) = state.last_on {
            let elapsed = now.duration_since(last_on).as_secs_f64();
            if let Some(power) = power_w {
                state.energy_wh += power * elapsed / 3600.0;
            }
            if let Some(flow) = flow {
                state.water_l += flow * elapsed / 3600.0;
            }
            state.last_on = Some(now);
        }
    }

    fn publish(&self) {
        let (on, energy_wh, water_l) = {
            let state = self.state.lock().unwrap();
            (state.on, state.energy_wh, state.water_l)
        };
        let mut payload = serde_json::Map::new();
        if let Some(power) = self.power_w {
            payload.insert(
                "power".to_string(),
                serde_json::json!(if on { power } else { 0.0 }),
            );
            payload.insert(
                "energy".to_string(),
                serde_json::json!((energy_wh * 1000.0).round() / 1000.0),
            );
        }
        if let Some(flow) = self.flow_l_per_h {
            payload.insert(
                "volume_flow_rate".to_string(),
                serde_json::json!(if on { flow } else { 0.0 }),
            );
            payload.insert(
                "water".to_string(),
                serde_json::json!((water_l * 1000.0).round() / 1000.0),
            );
        }
        debug!("Sent virtual energy state for {}", self.relay_id);
        self.message_bus
            .send_message(&self.topic, Payload::Json(payload.into()), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::local::LocalMessageBus;

    #[tokio::test(start_paused = true)]
    async fn accumulates_and_restores(
    ) {
        let bus = LocalMessageBus::new("boneio");
        let bus_dyn: Arc<dyn MessageBus> = Arc::new(bus.clone());
        // Seed a retained energy value as if a previous run published it.
        bus.send_message(
            "boneio/energy/r1",
            Payload::Text("{\"energy\": 123.4}".to_string()),
            true,
        );
        let sensor =
            VirtualEnergySensor::new("r1", "boneio", Some(100.0), None, bus_dyn.clone());
        sensor.subscribe_restore().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!((sensor.energy_wh() - 123.4).abs() < 1e-9);

        sensor.on_state(true);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        sensor.on_state(false);
        // 100 W for one hour on top of the restored 123.4 Wh.
        assert!(
            (sensor.energy_wh() - 223.4).abs() < 1.0,
            "{}",
            sensor.energy_wh()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        let retained = bus.retained("boneio/energy/r1").unwrap();
        let value: serde_json::Value = serde_json::from_str(&retained).unwrap();
        assert!((value["energy"].as_f64().unwrap() - 223.4).abs() < 1.0);
        assert_eq!(value["power"].as_f64().unwrap(), 0.0);
    }
}
