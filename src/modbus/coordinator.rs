//! Per-device Modbus coordinator: periodic bank reads, decoding, the filter
//! pipeline, derived entities, writable entities and HA discovery.

use crate::error::ModbusError;
use crate::modbus::descriptor::{
    decoded_name, AdditionalSensor, DeviceDescriptor, EntityType, RegisterDef,
};
use crate::modbus::filter::{apply_filters, FilterOp};
use crate::modbus::transport::{decode_value, ModbusTransport};
use crate::modbus::{formula, ReturnType, ValueType};
use crate::models::{SensorState, SensorValue};
use crate::net::{discovery, AutodiscoveryMessage, MessageBus, Payload};
use crate::runtime::scheduler::PeriodicUpdate;
use crate::runtime::{Event, EventBus};
use crate::util;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_UPDATE_INTERVAL: Duration = Duration::from_secs(600);
const DISCOVERY_REFRESH: Duration = Duration::from_secs(3600);

/// One decoded register entity.
pub struct ModbusEntity {
    pub name: String,
    pub decoded_name: String,
    pub base_address: u16,
    pub register_address: u16,
    pub value_type: Option<ValueType>,
    pub return_type: Option<ReturnType>,
    pub entity_type: EntityType,
    pub filters: Vec<FilterOp>,
    pub user_filters: Vec<FilterOp>,
    pub unit_of_measurement: Option<String>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub ha_filter: Option<String>,
    pub write_address: Option<u16>,
    pub write_filters: Vec<FilterOp>,
    pub x_mapping: Option<HashMap<String, String>>,
    pub payload_on: String,
    pub payload_off: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    value: Option<f64>,
    state: SensorValue,
    last_timestamp: f64,
}

/// Render a decoded numeric as a mapping key: `1.0` looks up `"1"`.
fn mapping_key(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

impl ModbusEntity {
    fn from_register(register: &RegisterDef, base_address: u16, user_filters: Vec<FilterOp>) -> Self {
        ModbusEntity {
            name: register.name.clone(),
            decoded_name: decoded_name(&register.name),
            base_address,
            register_address: register.address,
            value_type: register.value_type,
            return_type: register.return_type,
            entity_type: register.entity_type,
            filters: register.filters.clone(),
            user_filters,
            unit_of_measurement: register.unit_of_measurement.clone(),
            device_class: register.device_class.clone(),
            state_class: register.state_class.clone(),
            ha_filter: register.ha_filter.clone(),
            write_address: register.write_address,
            write_filters: register.write_filters.clone(),
            x_mapping: register.x_mapping.clone(),
            payload_on: register.payload_on.clone().unwrap_or_else(|| "ON".to_string()),
            payload_off: register
                .payload_off
                .clone()
                .unwrap_or_else(|| "OFF".to_string()),
            min: register.min,
            max: register.max,
            step: register.step,
            value: None,
            state: SensorValue::None,
            last_timestamp: 0.0,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn state(&self) -> SensorValue {
        self.state.clone()
    }

    /// Run the filter pipeline and derive the published state.
    pub fn set_value(&mut self, raw: Option<f64>, timestamp: f64) {
        let filtered = raw
            .and_then(|value| apply_filters(value, &self.filters))
            .and_then(|value| apply_filters(value, &self.user_filters));
        self.value = filtered;
        self.last_timestamp = timestamp;
        self.state = match (filtered, self.entity_type) {
            (None, _) => SensorValue::None,
            (Some(value), EntityType::TextSensor) => {
                let key = mapping_key(value);
                let text = self
                    .x_mapping
                    .as_ref()
                    .and_then(|mapping| mapping.get(&key).cloned())
                    .unwrap_or_else(|| "Unknown".to_string());
                SensorValue::Text(text)
            }
            (Some(value), EntityType::BinarySensor)
            | (Some(value), EntityType::WriteableBinarySensorDiscrete) => {
                if value != 0.0 {
                    SensorValue::Text(self.payload_on.clone())
                } else {
                    SensorValue::Text(self.payload_off.clone())
                }
            }
            (Some(value), _) => SensorValue::Numeric(value),
        };
    }

    /// Encode a user-supplied value for the write address.
    pub fn encode_value(&self, value: f64) -> u16 {
        match apply_filters(value, &self.write_filters) {
            Some(encoded) => encoded as u16,
            None => 0,
        }
    }
}

/// An entity computed from another entity's decoded value.
pub struct DerivedEntity {
    pub name: String,
    pub decoded_name: String,
    pub source_decoded: String,
    pub kind: DerivedKind,
    state: SensorValue,
}

pub enum DerivedKind {
    Numeric {
        formula: String,
        context: HashMap<String, f64>,
        unit_of_measurement: Option<String>,
        device_class: Option<String>,
        state_class: Option<String>,
    },
    Text {
        mapping: HashMap<String, String>,
    },
    Select {
        mapping: HashMap<String, String>,
    },
    Switch {
        mapping: HashMap<String, String>,
        payload_on: String,
        payload_off: String,
    },
}

impl DerivedEntity {
    pub fn state(&self) -> SensorValue {
        self.state.clone()
    }

    /// Recompute from the source's decoded value.
    pub fn evaluate(&mut self, source_value: f64) {
        self.state = match &self.kind {
            DerivedKind::Numeric { formula: expr, context, .. } => {
                let mut bindings = context.clone();
                bindings.insert("X".to_string(), source_value);
                match formula::evaluate(expr, &bindings) {
                    Ok(value) => SensorValue::Numeric(value),
                    Err(err) => {
                        error!("Formula error for {}: {err}", self.name);
                        SensorValue::None
                    }
                }
            }
            DerivedKind::Text { mapping }
            | DerivedKind::Select { mapping }
            | DerivedKind::Switch { mapping, .. } => SensorValue::Text(
                mapping
                    .get(&mapping_key(source_value))
                    .cloned()
                    .unwrap_or_else(|| "Unknown".to_string()),
            ),
        };
    }

    /// Reverse-map a user value to the raw register value.
    pub fn encode_value(&self, value: &str) -> u16 {
        match &self.kind {
            DerivedKind::Select { mapping } | DerivedKind::Switch { mapping, .. } => mapping
                .iter()
                .find(|(_, v)| v.as_str() == value)
                .and_then(|(k, _)| k.parse().ok())
                .unwrap_or(0),
            DerivedKind::Numeric { .. } | DerivedKind::Text { .. } => {
                value.parse::<f64>().map(|v| v as u16).unwrap_or(0)
            }
        }
    }
}

fn derived_from(additional: &AdditionalSensor, data: &HashMap<String, f64>) -> Option<DerivedEntity> {
    let kind = match additional {
        AdditionalSensor::Numeric {
            formula: expr,
            config_keys,
            unit_of_measurement,
            device_class,
            state_class,
            ..
        } => {
            if !config_keys.iter().all(|key| data.contains_key(key)) {
                warn!(
                    "Not all config keys {config_keys:?} for additional sensor {:?} are present in device config data.",
                    additional.name()
                );
                return None;
            }
            DerivedKind::Numeric {
                formula: expr.clone(),
                context: config_keys
                    .iter()
                    .map(|key| (key.clone(), data[key]))
                    .collect(),
                unit_of_measurement: unit_of_measurement.clone(),
                device_class: device_class.clone(),
                state_class: state_class.clone(),
            }
        }
        AdditionalSensor::Text { x_mapping, .. } => DerivedKind::Text {
            mapping: x_mapping.clone(),
        },
        AdditionalSensor::Select { x_mapping, .. } => DerivedKind::Select {
            mapping: x_mapping.clone(),
        },
        AdditionalSensor::Switch {
            x_mapping,
            payload_on,
            payload_off,
            ..
        } => DerivedKind::Switch {
            mapping: x_mapping.clone(),
            payload_on: payload_on.clone(),
            payload_off: payload_off.clone(),
        },
    };
    Some(DerivedEntity {
        name: additional.name().to_string(),
        decoded_name: decoded_name(additional.name()),
        source_decoded: decoded_name(additional.source()),
        kind,
        state: SensorValue::None,
    })
}

pub struct ModbusCoordinator {
    pub id: String,
    pub name: String,
    address: u8,
    update_interval: Duration,
    current_interval: Mutex<Duration>,
    send_topic: String,
    topic_prefix: String,
    ha_prefix: String,
    transport: Arc<ModbusTransport>,
    descriptor: DeviceDescriptor,
    entities: Mutex<Vec<HashMap<String, ModbusEntity>>>,
    derived: Mutex<Vec<DerivedEntity>>,
    discovery_sent: Mutex<Option<tokio::time::Instant>>,
    online: AtomicBool,
    message_bus: Arc<dyn MessageBus>,
    event_bus: EventBus,
}

pub struct CoordinatorArgs {
    pub id: String,
    pub name: String,
    pub address: u8,
    pub update_interval: Duration,
    pub descriptor: DeviceDescriptor,
    pub sensors_filters: HashMap<String, Vec<FilterOp>>,
    pub data: HashMap<String, f64>,
    pub topic_prefix: String,
    pub ha_prefix: String,
    pub transport: Arc<ModbusTransport>,
    pub message_bus: Arc<dyn MessageBus>,
    pub event_bus: EventBus,
}

impl ModbusCoordinator {
    pub fn new(args: CoordinatorArgs) -> Arc<ModbusCoordinator> {
        let id = util::normalize_id(&args.id);
        let mut entities = Vec::new();
        for base in &args.descriptor.registers_base {
            let mut bank = HashMap::new();
            for register in &base.registers {
                let user_filters = args
                    .sensors_filters
                    .get(&decoded_name(&register.name))
                    .cloned()
                    .unwrap_or_default();
                let entity = ModbusEntity::from_register(register, base.base, user_filters);
                bank.insert(entity.decoded_name.clone(), entity);
            }
            entities.push(bank);
        }
        let derived: Vec<DerivedEntity> = args
            .descriptor
            .additional_sensors
            .iter()
            .filter_map(|additional| derived_from(additional, &args.data))
            .collect();
        info!(
            "Available single sensors for {}: {}",
            args.name,
            entities
                .iter()
                .flat_map(|bank| bank.values())
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        if !derived.is_empty() {
            info!(
                "Available additional sensors for {}: {}",
                args.name,
                derived
                    .iter()
                    .map(|e| e.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        let coordinator = Arc::new(ModbusCoordinator {
            send_topic: format!("{}/sensor/{id}", args.topic_prefix),
            id,
            name: args.name,
            address: args.address,
            update_interval: args.update_interval,
            current_interval: Mutex::new(args.update_interval),
            topic_prefix: args.topic_prefix,
            ha_prefix: args.ha_prefix,
            transport: args.transport,
            descriptor: args.descriptor,
            entities: Mutex::new(entities),
            derived: Mutex::new(derived),
            discovery_sent: Mutex::new(None),
            online: AtomicBool::new(false),
            message_bus: args.message_bus,
            event_bus: args.event_bus.clone(),
        });
        // A fresh HA instance needs the catalogue again; force rediscovery
        // and an availability republish on its next successful read.
        let weak = Arc::downgrade(&coordinator);
        args.event_bus.add_haonline_listener(Arc::new(move || {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.online.store(false, Ordering::SeqCst);
            }
        }));
        coordinator
    }

    pub fn default_interval(&self) -> Duration {
        self.update_interval
    }

    fn availability_topic(&self) -> String {
        format!("{}/{}/state", self.topic_prefix, self.id)
    }

    fn mark_online(&self) {
        if !self.online.swap(true, Ordering::SeqCst) {
            info!("Sending online payload about device {}.", self.name);
            self.message_bus
                .send_message(&self.availability_topic(), Payload::Text("online".into()), true);
        }
    }

    fn mark_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.message_bus
            .send_message(&self.availability_topic(), Payload::Text("offline".into()), true);
        *self.discovery_sent.lock().unwrap() = None;
    }

    /// Probe the first register base; on success (re)send discovery for
    /// every entity, at most once per hour.
    async fn check_availability(&self) {
        let due = {
            let sent = self.discovery_sent.lock().unwrap();
            match *sent {
                None => true,
                Some(at) => at.elapsed() > DISCOVERY_REFRESH,
            }
        };
        if !due {
            return;
        }
        let Some(first_base) = self.descriptor.registers_base.first() else {
            return;
        };
        let Some(first_register) = first_base.registers.first() else {
            return;
        };
        let value_type = first_register.value_type.unwrap_or(ValueType::UWord);
        match self
            .transport
            .read_and_decode(
                self.address,
                first_register.address,
                value_type,
                first_base.register_type,
            )
            .await
        {
            Ok(_) => {
                self.send_discovery();
                *self.discovery_sent.lock().unwrap() = Some(tokio::time::Instant::now());
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Err(err) => {
                error!(
                    "Discovery for {} not sent. First register not available: {err}",
                    self.id
                );
            }
        }
    }

    fn discovery_ctx(&self) -> discovery::ModbusDeviceCtx<'_> {
        discovery::ModbusDeviceCtx {
            topic: &self.topic_prefix,
            device_id: &self.id,
            device_name: &self.name,
            model: &self.descriptor.model,
            web_url: None,
        }
    }

    fn discovery_topic(&self, ha_type: &str, entity_decoded: &str) -> String {
        format!(
            "{}/{ha_type}/{}{}/{}{}/config",
            self.ha_prefix,
            self.topic_prefix,
            self.id,
            self.id,
            entity_decoded.replace('_', "")
        )
    }

    fn send_discovery(&self) {
        let ctx = self.discovery_ctx();
        let entities = self.entities.lock().unwrap();
        for entity in entities.iter().flat_map(|bank| bank.values()) {
            let base = entity.base_address.to_string();
            let ha_type = entity.entity_type.ha_type();
            let payload = match entity.entity_type {
                EntityType::BinarySensor | EntityType::WriteableBinarySensorDiscrete => {
                    serde_json::to_value(discovery::modbus_binary_sensor_message(
                        &ctx,
                        &entity.name,
                        &entity.decoded_name,
                        &base,
                        &entity.payload_on,
                        &entity.payload_off,
                    ))
                }
                EntityType::WriteableSensor => {
                    serde_json::to_value(discovery::modbus_numeric_message(
                        &ctx,
                        &entity.name,
                        &entity.decoded_name,
                        &base,
                        entity.unit_of_measurement.as_deref(),
                        entity.min,
                        entity.max,
                        entity.step,
                    ))
                }
                _ => serde_json::to_value(discovery::modbus_sensor_message(
                    &ctx,
                    &entity.name,
                    &entity.decoded_name,
                    &base,
                    entity.unit_of_measurement.as_deref(),
                    entity.device_class.as_deref(),
                    entity.state_class.as_deref(),
                    entity.ha_filter.as_deref(),
                )),
            };
            if let Ok(payload) = payload {
                self.message_bus.add_autodiscovery_message(AutodiscoveryMessage {
                    ha_type: ha_type.to_string(),
                    topic: self.discovery_topic(ha_type, &entity.decoded_name),
                    payload,
                });
            }
        }
        let derived = self.derived.lock().unwrap();
        for entity in derived.iter() {
            let base = entities
                .iter()
                .flat_map(|bank| bank.values())
                .find(|e| e.decoded_name == entity.source_decoded)
                .map(|e| e.base_address.to_string())
                .unwrap_or_default();
            let (ha_type, payload) = match &entity.kind {
                DerivedKind::Numeric {
                    unit_of_measurement,
                    device_class,
                    state_class,
                    ..
                } => (
                    "sensor",
                    serde_json::to_value(discovery::modbus_sensor_message(
                        &ctx,
                        &entity.name,
                        &entity.decoded_name,
                        &base,
                        unit_of_measurement.as_deref(),
                        device_class.as_deref(),
                        state_class.as_deref(),
                        None,
                    )),
                ),
                DerivedKind::Text { .. } => (
                    "sensor",
                    serde_json::to_value(discovery::modbus_sensor_message(
                        &ctx,
                        &entity.name,
                        &entity.decoded_name,
                        &base,
                        None,
                        None,
                        None,
                        None,
                    )),
                ),
                DerivedKind::Select { mapping } => {
                    let mut options: Vec<String> = mapping.values().cloned().collect();
                    options.sort();
                    (
                        "select",
                        serde_json::to_value(discovery::modbus_select_message(
                            &ctx,
                            &entity.name,
                            &entity.decoded_name,
                            &base,
                            options,
                        )),
                    )
                }
                DerivedKind::Switch {
                    payload_on,
                    payload_off,
                    ..
                } => (
                    "switch",
                    serde_json::to_value(discovery::modbus_switch_message(
                        &ctx,
                        &entity.name,
                        &entity.decoded_name,
                        &base,
                        payload_on,
                        payload_off,
                    )),
                ),
            };
            if let Ok(payload) = payload {
                self.message_bus.add_autodiscovery_message(AutodiscoveryMessage {
                    ha_type: ha_type.to_string(),
                    topic: self.discovery_topic(ha_type, &entity.decoded_name),
                    payload,
                });
            }
        }
    }

    fn emit_entity_event(&self, entity: &ModbusEntity) {
        self.event_bus.trigger_event(Event::ModbusDevice(SensorState {
            id: format!("{}{}", self.id, entity.decoded_name),
            name: entity.name.clone(),
            state: entity.state(),
            unit: entity.unit_of_measurement.clone(),
            timestamp: entity.last_timestamp,
        }));
    }

    /// One refresh cycle; returns the next interval (grows on failure).
    async fn update_once(&self, timestamp: f64) -> Duration {
        self.check_availability().await;
        for (index, base) in self.descriptor.registers_base.iter().enumerate() {
            let registers = match self
                .transport
                .read_registers(self.address, base.base, base.length, base.register_type)
                .await
            {
                Ok(registers) => registers,
                Err(err) => {
                    let mut interval = self.current_interval.lock().unwrap();
                    if *interval < MAX_UPDATE_INTERVAL {
                        // Give a slow device a longer leash before declaring
                        // it gone.
                        *interval = Duration::from_secs_f64(interval.as_secs_f64() * 1.5)
                            .min(MAX_UPDATE_INTERVAL);
                    } else {
                        self.mark_offline();
                    }
                    warn!(
                        "Can't fetch data from modbus device {} ({err}). Will sleep for {} seconds",
                        self.id,
                        interval.as_secs()
                    );
                    return *interval;
                }
            };
            self.mark_online();
            *self.current_interval.lock().unwrap() = self.update_interval;

            let mut output = serde_json::Map::new();
            {
                let mut entities = self.entities.lock().unwrap();
                let mut derived = self.derived.lock().unwrap();
                let bank = &mut entities[index];
                for entity in bank.values_mut() {
                    let raw = decode_entity(entity, &registers, base.length);
                    entity.set_value(raw, timestamp);
                    if let Some(value) = entity.value() {
                        for derived_entity in derived
                            .iter_mut()
                            .filter(|d| d.source_decoded == entity.decoded_name)
                        {
                            derived_entity.evaluate(value);
                            output.insert(
                                derived_entity.decoded_name.clone(),
                                serde_json::to_value(derived_entity.state()).unwrap_or_default(),
                            );
                        }
                    }
                    match entity.state() {
                        SensorValue::None => {}
                        state => {
                            output.insert(
                                entity.decoded_name.clone(),
                                serde_json::to_value(state).unwrap_or_default(),
                            );
                        }
                    }
                }
                for entity in bank.values() {
                    self.emit_entity_event(entity);
                }
            }
            self.message_bus.send_message(
                &format!("{}/{}", self.send_topic, base.base),
                Payload::Json(output.into()),
                false,
            );
        }
        self.update_interval
    }

    /// Handle `<prefix>/cmd/modbus/<id>/set` with `{"device", "value"}`.
    pub async fn write_entity(
        &self,
        entity_name: &str,
        value: &serde_json::Value,
    ) -> Result<(), ModbusError> {
        debug!("Writing register {value:?} for {entity_name}");
        let timestamp = util::timestamp();
        let value_text = match value {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        };

        // Derived entities write through their source register.
        let derived_write = {
            let derived = self.derived.lock().unwrap();
            derived
                .iter()
                .find(|d| d.decoded_name == entity_name)
                .map(|d| (d.source_decoded.clone(), d.encode_value(&value_text)))
        };
        let (target_decoded, encoded) = match derived_write {
            Some((source, encoded)) => (source, encoded),
            None => {
                let entities = self.entities.lock().unwrap();
                let entity = entities
                    .iter()
                    .flat_map(|bank| bank.values())
                    .find(|e| e.decoded_name == entity_name)
                    .ok_or_else(|| ModbusError::Io("this sensor doesn't exist".to_string()))?;
                let numeric: f64 = value_text
                    .parse()
                    .map_err(|_| ModbusError::Io(format!("bad value {value_text:?}")))?;
                (entity.decoded_name.clone(), entity.encode_value(numeric))
            }
        };

        let (write_address, base_address) = {
            let entities = self.entities.lock().unwrap();
            let entity = entities
                .iter()
                .flat_map(|bank| bank.values())
                .find(|e| e.decoded_name == target_decoded)
                .ok_or_else(|| ModbusError::Io("source sensor doesn't exist".to_string()))?;
            match entity.write_address {
                Some(address) => (address, entity.base_address),
                None => {
                    error!("Sensor {} has no write address", entity.name);
                    return Ok(());
                }
            }
        };
        self.transport
            .write_register(self.address, write_address, encoded)
            .await?;

        let mut output = serde_json::Map::new();
        {
            let mut entities = self.entities.lock().unwrap();
            let mut derived = self.derived.lock().unwrap();
            let entity = entities
                .iter_mut()
                .flat_map(|bank| bank.values_mut())
                .find(|e| e.decoded_name == target_decoded)
                .expect("entity looked up above");
            entity.set_value(Some(encoded as f64), timestamp);
            if let Some(value) = entity.value() {
                for derived_entity in derived
                    .iter_mut()
                    .filter(|d| d.source_decoded == entity.decoded_name)
                {
                    derived_entity.evaluate(value);
                    output.insert(
                        derived_entity.decoded_name.clone(),
                        serde_json::to_value(derived_entity.state()).unwrap_or_default(),
                    );
                }
            }
            output.insert(
                entity.decoded_name.clone(),
                serde_json::to_value(entity.state()).unwrap_or_default(),
            );
            self.emit_entity_event(entity);
        }
        self.message_bus.send_message(
            &format!("{}/{base_address}", self.send_topic),
            Payload::Json(output.into()),
            false,
        );
        Ok(())
    }
}

fn decode_entity(entity: &ModbusEntity, registers: &[u16], length: u16) -> Option<f64> {
    if let Some(value_type) = entity.value_type {
        let start = entity.register_address.checked_sub(entity.base_address)? as usize;
        let count = value_type.register_count();
        let slice = registers.get(start..start + count)?;
        match decode_value(slice, value_type) {
            Ok(value) => Some(value),
            Err(err) => {
                error!(
                    "Decoding error for {} at address {}, base: {}, length: {length}, error {err}",
                    entity.name, entity.register_address, entity.base_address
                );
                None
            }
        }
    } else if let Some(return_type) = entity.return_type {
        return_type.convert(registers, entity.base_address, entity.register_address)
    } else {
        None
    }
}

#[async_trait]
impl PeriodicUpdate for ModbusCoordinator {
    fn update_id(&self) -> String {
        self.id.clone()
    }

    async fn refresh(&self, timestamp: f64) -> Option<Duration> {
        Some(self.update_once(timestamp).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::descriptor::RegisterDef;

    fn register(name: &str, address: u16, filters: Vec<FilterOp>) -> RegisterDef {
        RegisterDef {
            name: name.to_string(),
            address,
            value_type: Some(ValueType::UWord),
            return_type: None,
            filters,
            unit_of_measurement: None,
            state_class: None,
            device_class: None,
            entity_type: EntityType::Sensor,
            write_address: None,
            write_filters: Vec::new(),
            ha_filter: None,
            x_mapping: None,
            payload_on: None,
            payload_off: None,
            min: None,
            max: None,
            step: None,
        }
    }

    #[test]
    fn filter_pipeline_is_deterministic() {
        let def = register(
            "Voltage",
            100,
            vec![FilterOp::Multiply(0.1), FilterOp::Round(1)],
        );
        let mut entity = ModbusEntity::from_register(&def, 100, Vec::new());
        let raw = decode_entity(&entity, &[50], 1);
        entity.set_value(raw, 0.0);
        assert_eq!(entity.state(), SensorValue::Numeric(5.0));
        // Same input, same output.
        entity.set_value(decode_entity(&entity, &[50], 1), 1.0);
        assert_eq!(entity.state(), SensorValue::Numeric(5.0));
    }

    #[test]
    fn dropped_value_suppresses_state() {
        let def = register("Power", 100, vec![FilterOp::FilterOut(0.0)]);
        let mut entity = ModbusEntity::from_register(&def, 100, Vec::new());
        entity.set_value(Some(0.0), 0.0);
        assert_eq!(entity.state(), SensorValue::None);
    }

    #[test]
    fn user_filters_apply_after_register_filters() {
        let def = register("Energy", 100, vec![FilterOp::Multiply(0.1)]);
        let mut entity =
            ModbusEntity::from_register(&def, 100, vec![FilterOp::Offset(1.0)]);
        entity.set_value(Some(100.0), 0.0);
        assert_eq!(entity.state(), SensorValue::Numeric(11.0));
    }

    #[test]
    fn derived_select_maps_and_encodes() {
        let mapping: HashMap<String, String> = [("0", "Auto"), ("1", "Manual")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut derived = DerivedEntity {
            name: "Work Mode".to_string(),
            decoded_name: "workmode".to_string(),
            source_decoded: "workmoderaw".to_string(),
            kind: DerivedKind::Select { mapping },
            state: SensorValue::None,
        };
        derived.evaluate(1.0);
        assert_eq!(derived.state(), SensorValue::Text("Manual".to_string()));
        assert_eq!(derived.encode_value("Auto"), 0);
        assert_eq!(derived.encode_value("Manual"), 1);
        derived.evaluate(9.0);
        assert_eq!(derived.state(), SensorValue::Text("Unknown".to_string()));
    }

    #[test]
    fn derived_numeric_uses_formula_context() {
        let mut derived = DerivedEntity {
            name: "Load".to_string(),
            decoded_name: "load".to_string(),
            source_decoded: "power".to_string(),
            kind: DerivedKind::Numeric {
                formula: "X / nominal_power * 100".to_string(),
                context: [("nominal_power".to_string(), 2000.0)].into_iter().collect(),
                unit_of_measurement: Some("%".to_string()),
                device_class: None,
                state_class: None,
            },
            state: SensorValue::None,
        };
        derived.evaluate(500.0);
        assert_eq!(derived.state(), SensorValue::Numeric(25.0));
    }
}
