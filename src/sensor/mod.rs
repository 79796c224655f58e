//! Local sensors: I2C temperature chips, 1-wire thermometers, the INA219
//! power monitor and the on-board ADC. Each is a periodic updater feeding
//! the filter pipeline, `<prefix>/sensor/<id>` and the event bus.

pub mod dallas;
pub mod ina219;
pub mod temp;

use crate::modbus::filter::{apply_filters, FilterOp};
use crate::models::{SensorState, SensorValue};
use crate::net::{MessageBus, Payload};
use crate::runtime::{Event, EventBus};
use crate::util;
use log::debug;
use std::sync::Arc;

/// Publication plumbing shared by every local sensor.
pub struct SensorReporter {
    pub id: String,
    pub name: String,
    pub unit_of_measurement: Option<String>,
    filters: Vec<FilterOp>,
    send_topic: String,
    message_bus: Arc<dyn MessageBus>,
    event_bus: EventBus,
}

impl SensorReporter {
    pub fn new(
        id: &str,
        name: &str,
        unit_of_measurement: Option<String>,
        filters: Vec<FilterOp>,
        topic_prefix: &str,
        message_bus: Arc<dyn MessageBus>,
        event_bus: EventBus,
    ) -> Self {
        let id = util::normalize_id(id);
        SensorReporter {
            send_topic: format!("{topic_prefix}/sensor/{id}"),
            id,
            name: name.to_string(),
            unit_of_measurement,
            filters,
            message_bus,
            event_bus,
        }
    }

    /// Filter and publish one reading; a filtered-out value publishes
    /// nothing this cycle.
    pub fn report(&self, raw: f64, timestamp: f64) {
        let Some(value) = apply_filters(raw, &self.filters) else {
            debug!("Sensor {} value {raw} filtered out.", self.id);
            return;
        };
        self.message_bus.send_message(
            &self.send_topic,
            Payload::Json(serde_json::json!(value)),
            false,
        );
        self.event_bus.trigger_event(Event::Sensor(SensorState {
            id: self.id.clone(),
            name: self.name.clone(),
            state: SensorValue::Numeric(value),
            unit: self.unit_of_measurement.clone(),
            timestamp,
        }));
    }
}

pub use crate::hardware::adc::AdcReader;

/// ADC voltage sensor on one of the P9 analog pins.
pub struct AdcSensor {
    reporter: SensorReporter,
    reader: Arc<AdcReader>,
    pin: String,
}

impl AdcSensor {
    pub fn new(reporter: SensorReporter, reader: Arc<AdcReader>, pin: &str) -> Self {
        debug!("Configured sensor pin {pin}");
        AdcSensor {
            reporter,
            reader,
            pin: pin.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl crate::runtime::scheduler::PeriodicUpdate for AdcSensor {
    fn update_id(&self) -> String {
        self.reporter.id.clone()
    }

    async fn refresh(&self, timestamp: f64) -> Option<std::time::Duration> {
        match self.reader.read_voltage(&self.pin) {
            Ok(volts) => self.reporter.report(volts, timestamp),
            Err(err) => log::error!("ADC read failed on {}: {err}", self.pin),
        }
        None
    }
}
