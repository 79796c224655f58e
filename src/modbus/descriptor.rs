//! Per-model Modbus device descriptors, loaded from
//! `modbus_devices/<model>.json`.

use crate::error::ConfigError;
use crate::modbus::filter::FilterOp;
use crate::modbus::{formula, RegisterType, ReturnType, ValueType};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    #[default]
    Sensor,
    TextSensor,
    BinarySensor,
    WriteableSensor,
    WriteableSensorDiscrete,
    WriteableBinarySensorDiscrete,
}

impl EntityType {
    pub fn is_writeable(self) -> bool {
        matches!(
            self,
            EntityType::WriteableSensor
                | EntityType::WriteableSensorDiscrete
                | EntityType::WriteableBinarySensorDiscrete
        )
    }

    /// HA discovery component for this entity.
    pub fn ha_type(self) -> &'static str {
        match self {
            EntityType::Sensor | EntityType::TextSensor | EntityType::WriteableSensorDiscrete => {
                "sensor"
            }
            EntityType::BinarySensor | EntityType::WriteableBinarySensorDiscrete => {
                "binary_sensor"
            }
            EntityType::WriteableSensor => "number",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterDef {
    pub name: String,
    pub address: u16,
    #[serde(default)]
    pub value_type: Option<ValueType>,
    #[serde(default)]
    pub return_type: Option<ReturnType>,
    #[serde(default)]
    pub filters: Vec<FilterOp>,
    #[serde(default)]
    pub unit_of_measurement: Option<String>,
    #[serde(default)]
    pub state_class: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(default)]
    pub entity_type: EntityType,
    #[serde(default)]
    pub write_address: Option<u16>,
    #[serde(default)]
    pub write_filters: Vec<FilterOp>,
    /// HA-side value template filter, e.g. `round(2)`.
    #[serde(default)]
    pub ha_filter: Option<String>,
    /// Raw-value to text mapping for text sensors.
    #[serde(default)]
    pub x_mapping: Option<HashMap<String, String>>,
    #[serde(default)]
    pub payload_on: Option<String>,
    #[serde(default)]
    pub payload_off: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub step: Option<f64>,
}

/// A contiguous read window; fetched with one bank read per cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterBase {
    pub base: u16,
    pub length: u16,
    pub register_type: RegisterType,
    #[serde(default)]
    pub registers: Vec<RegisterDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdditionalSensor {
    Numeric {
        name: String,
        source: String,
        formula: String,
        #[serde(default)]
        config_keys: Vec<String>,
        #[serde(default)]
        unit_of_measurement: Option<String>,
        #[serde(default)]
        device_class: Option<String>,
        #[serde(default)]
        state_class: Option<String>,
    },
    Text {
        name: String,
        source: String,
        x_mapping: HashMap<String, String>,
    },
    Select {
        name: String,
        source: String,
        x_mapping: HashMap<String, String>,
    },
    Switch {
        name: String,
        source: String,
        x_mapping: HashMap<String, String>,
        #[serde(default = "default_payload_on")]
        payload_on: String,
        #[serde(default = "default_payload_off")]
        payload_off: String,
    },
}

fn default_payload_on() -> String {
    "ON".to_string()
}

fn default_payload_off() -> String {
    "OFF".to_string()
}

impl AdditionalSensor {
    pub fn name(&self) -> &str {
        match self {
            AdditionalSensor::Numeric { name, .. }
            | AdditionalSensor::Text { name, .. }
            | AdditionalSensor::Select { name, .. }
            | AdditionalSensor::Switch { name, .. } => name,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            AdditionalSensor::Numeric { source, .. }
            | AdditionalSensor::Text { source, .. }
            | AdditionalSensor::Select { source, .. }
            | AdditionalSensor::Switch { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDescriptor {
    pub model: String,
    #[serde(default)]
    pub registers_base: Vec<RegisterBase>,
    #[serde(default)]
    pub additional_sensors: Vec<AdditionalSensor>,
}

impl DeviceDescriptor {
    pub fn load(dir: &Path, model: &str) -> Result<Self, ConfigError> {
        let path = dir.join(format!("{model}.json"));
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Descriptor {
            model: model.to_string(),
            message: format!("{}: {e}", path.display()),
        })?;
        let descriptor: DeviceDescriptor =
            serde_json::from_str(&text).map_err(|e| ConfigError::Descriptor {
                model: model.to_string(),
                message: e.to_string(),
            })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Load-time checks: formulas must parse, sources must exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for additional in &self.additional_sensors {
            if let AdditionalSensor::Numeric {
                formula: expr,
                config_keys,
                ..
            } = additional
            {
                formula::validate(expr, config_keys)?;
            }
            let source = additional.source();
            let found = self
                .registers_base
                .iter()
                .flat_map(|base| &base.registers)
                .any(|register| decoded_name(&register.name) == decoded_name(source));
            if !found {
                return Err(ConfigError::Descriptor {
                    model: self.model.clone(),
                    message: format!(
                        "source sensor {source:?} for additional sensor {:?} not found",
                        additional.name()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// The decoded payload key of an entity: name without spaces, lowercased.
pub fn decoded_name(name: &str) -> String {
    name.replace(' ', "").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "model": "sofar",
        "registers_base": [
            {
                "base": 1024,
                "length": 16,
                "register_type": "input",
                "registers": [
                    {
                        "name": "Power",
                        "address": 1026,
                        "value_type": "U_WORD",
                        "unit_of_measurement": "W",
                        "state_class": "measurement",
                        "device_class": "power",
                        "filters": [{"multiply": 10}]
                    },
                    {
                        "name": "Work Mode",
                        "address": 1028,
                        "value_type": "U_WORD",
                        "entity_type": "writeable_sensor_discrete",
                        "write_address": 1028
                    }
                ]
            }
        ],
        "additional_sensors": [
            {
                "kind": "select",
                "name": "Work Mode",
                "source": "Work Mode",
                "x_mapping": {"0": "Auto", "1": "Manual"}
            },
            {
                "kind": "numeric",
                "name": "Power Percent",
                "source": "Power",
                "formula": "X / nominal_power * 100",
                "config_keys": ["nominal_power"]
            }
        ]
    }"#;

    #[test]
    fn sample_descriptor_parses_and_validates() {
        let descriptor: DeviceDescriptor = serde_json::from_str(SAMPLE).unwrap();
        descriptor.validate().unwrap();
        assert_eq!(descriptor.registers_base[0].registers.len(), 2);
        let register = &descriptor.registers_base[0].registers[0];
        assert_eq!(register.value_type, Some(ValueType::UWord));
        assert_eq!(register.filters, vec![FilterOp::Multiply(10.0)]);
        assert!(descriptor.registers_base[0].registers[1]
            .entity_type
            .is_writeable());
    }

    #[test]
    fn missing_source_is_rejected() {
        let mut descriptor: DeviceDescriptor = serde_json::from_str(SAMPLE).unwrap();
        descriptor.additional_sensors.push(AdditionalSensor::Text {
            name: "Ghost".to_string(),
            source: "Nothing".to_string(),
            x_mapping: HashMap::new(),
        });
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn decoded_names_match_payload_keys() {
        assert_eq!(decoded_name("Work Mode"), "workmode");
        assert_eq!(decoded_name("PV1 Voltage"), "pv1voltage");
    }
}
