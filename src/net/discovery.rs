//! Home Assistant auto-discovery payloads.
//!
//! The payload shape is part of the external contract: optional fields are
//! omitted entirely (HA schema validation rejects nulls in several places),
//! which `skip_serializing_if` reproduces.

use crate::models::ClickType;
use crate::VERSION;
use enum_iterator::all;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HaAvailability {
    pub topic: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaDevice {
    pub identifiers: Vec<String>,
    pub manufacturer: String,
    pub model: String,
    pub name: String,
    pub sw_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_url: Option<String>,
}

impl HaDevice {
    fn new(identifiers: Vec<String>, model: &str, name: &str, web_url: Option<&str>) -> Self {
        HaDevice {
            identifiers,
            manufacturer: "boneIO".to_string(),
            model: model.to_string(),
            name: name.to_string(),
            sw_version: VERSION.to_string(),
            configuration_url: web_url.map(str::to_string),
        }
    }
}

/// Fields shared by every discovery message.
#[derive(Debug, Clone, Serialize)]
pub struct HaBase {
    pub availability: Vec<HaAvailability>,
    pub device: HaDevice,
    pub name: String,
    pub state_topic: String,
    pub unique_id: String,
    pub optimistic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
}

/// Inputs shared by the device-level builders below.
pub struct DeviceCtx<'a> {
    /// MQTT topic prefix, doubling as the HA device identifier.
    pub topic: &'a str,
    pub model: &'a str,
    /// Friendly device name; defaults to `boneIO <topic>`.
    pub device_name: Option<&'a str>,
    pub web_url: Option<&'a str>,
}

impl DeviceCtx<'_> {
    fn device(&self) -> HaDevice {
        let name = self
            .device_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("boneIO {}", self.topic));
        HaDevice::new(vec![self.topic.to_string()], self.model, &name, self.web_url)
    }

    fn availability(&self) -> Vec<HaAvailability> {
        vec![HaAvailability {
            topic: format!("{}/state", self.topic),
        }]
    }

    fn base(&self, name: &str, state_topic: String, unique_id: String) -> HaBase {
        HaBase {
            availability: self.availability(),
            device: self.device(),
            name: name.to_string(),
            state_topic,
            unique_id,
            optimistic: false,
            device_class: None,
            unit_of_measurement: None,
            state_class: None,
            state_value_template: None,
            entity_category: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HaLightMessage {
    #[serde(flatten)]
    pub base: HaBase,
    pub command_topic: String,
    pub payload_off: String,
    pub payload_on: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaLedMessage {
    #[serde(flatten)]
    pub base: HaBase,
    pub command_topic: String,
    pub brightness_state_topic: String,
    pub brightness_command_topic: String,
    pub brightness_scale: u32,
    pub payload_off: String,
    pub payload_on: String,
    pub brightness_value_template: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaSwitchMessage {
    #[serde(flatten)]
    pub base: HaBase,
    pub command_topic: String,
    pub payload_off: String,
    pub payload_on: String,
    pub value_template: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaValveMessage {
    #[serde(flatten)]
    pub base: HaBase,
    pub command_topic: String,
    pub payload_close: String,
    pub payload_open: String,
    pub state_open: String,
    pub state_closed: String,
    pub reports_position: bool,
    pub value_template: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaButtonMessage {
    #[serde(flatten)]
    pub base: HaBase,
    pub command_topic: String,
    pub payload_press: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaEventMessage {
    #[serde(flatten)]
    pub base: HaBase,
    pub icon: String,
    pub event_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaSensorMessage {
    #[serde(flatten)]
    pub base: HaBase,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaBinarySensorMessage {
    #[serde(flatten)]
    pub base: HaBase,
    pub payload_on: String,
    pub payload_off: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaCoverMessage {
    #[serde(flatten)]
    pub base: HaBase,
    pub command_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_position_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tilt_command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tilt_status_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tilt_status_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_stop_tilt: Option<String>,
    pub payload_open: String,
    pub payload_close: String,
    pub payload_stop: String,
    pub state_open: String,
    pub state_opening: String,
    pub state_closed: String,
    pub state_closing: String,
}

/// Modbus entity message; also covers select/number/switch variants through
/// the optional fields.
#[derive(Debug, Clone, Serialize)]
pub struct HaModbusMessage {
    #[serde(flatten)]
    pub base: HaBase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
}

// ---------------------------------------------------------------------------
// Board-level entities

pub fn ha_light_message(ctx: &DeviceCtx<'_>, id: &str, name: &str) -> HaLightMessage {
    let mut base = ctx.base(
        name,
        format!("{}/relay/{id}", ctx.topic),
        format!("{}relay{id}", ctx.topic),
    );
    base.state_value_template = Some("{{ value_json.state }}".to_string());
    HaLightMessage {
        base,
        command_topic: format!("{}/cmd/relay/{id}/set", ctx.topic),
        payload_off: "OFF".to_string(),
        payload_on: "ON".to_string(),
    }
}

pub fn ha_led_message(ctx: &DeviceCtx<'_>, id: &str, name: &str) -> HaLedMessage {
    let mut base = ctx.base(
        name,
        format!("{}/relay/{id}", ctx.topic),
        format!("{}relay{id}", ctx.topic),
    );
    base.state_value_template = Some("{{ value_json.state }}".to_string());
    HaLedMessage {
        base,
        command_topic: format!("{}/cmd/relay/{id}/set", ctx.topic),
        brightness_state_topic: format!("{}/relay/{id}", ctx.topic),
        brightness_command_topic: format!("{}/cmd/relay/{id}/set_brightness", ctx.topic),
        brightness_scale: 65535,
        payload_off: "OFF".to_string(),
        payload_on: "ON".to_string(),
        brightness_value_template: "{{ value_json.brightness }}".to_string(),
    }
}

pub fn ha_switch_message(
    ctx: &DeviceCtx<'_>,
    id: &str,
    name: &str,
    topic_type: &str,
) -> HaSwitchMessage {
    let base = ctx.base(
        name,
        format!("{}/{topic_type}/{id}", ctx.topic),
        format!("{}{topic_type}{id}", ctx.topic),
    );
    HaSwitchMessage {
        base,
        command_topic: format!("{}/cmd/{topic_type}/{id}/set", ctx.topic),
        payload_off: "OFF".to_string(),
        payload_on: "ON".to_string(),
        value_template: "{{ value_json.state }}".to_string(),
    }
}

pub fn ha_valve_message(ctx: &DeviceCtx<'_>, id: &str, name: &str) -> HaValveMessage {
    let base = ctx.base(
        name,
        format!("{}/relay/{id}", ctx.topic),
        format!("{}relay{id}", ctx.topic),
    );
    HaValveMessage {
        base,
        command_topic: format!("{}/cmd/relay/{id}/set", ctx.topic),
        payload_close: "OFF".to_string(),
        payload_open: "ON".to_string(),
        state_open: "ON".to_string(),
        state_closed: "OFF".to_string(),
        reports_position: false,
        value_template: "{{ value_json.state }}".to_string(),
    }
}

pub fn ha_button_message(
    ctx: &DeviceCtx<'_>,
    id: &str,
    name: &str,
    payload_press: &str,
) -> HaButtonMessage {
    let mut base = ctx.base(
        name,
        format!("{}/{id}", ctx.topic),
        format!("{}button{id}", ctx.topic),
    );
    base.entity_category = Some("config".to_string());
    HaButtonMessage {
        base,
        command_topic: format!("{}/cmd/button/{id}/set", ctx.topic),
        payload_press: payload_press.to_string(),
    }
}

pub fn ha_event_message(ctx: &DeviceCtx<'_>, id: &str, name: &str) -> HaEventMessage {
    let base = ctx.base(
        name,
        format!("{}/input/{id}", ctx.topic),
        format!("{}input{id}", ctx.topic),
    );
    HaEventMessage {
        base,
        icon: "mdi:gesture-double-tap".to_string(),
        event_types: all::<ClickType>()
            .filter(|c| c.is_event())
            .map(|c| c.to_string())
            .collect(),
    }
}

pub fn ha_binary_sensor_message(
    ctx: &DeviceCtx<'_>,
    id: &str,
    name: &str,
    device_class: Option<&str>,
) -> HaBinarySensorMessage {
    let mut base = ctx.base(
        name,
        format!("{}/inputsensor/{id}", ctx.topic),
        format!("{}inputsensor{id}", ctx.topic),
    );
    base.device_class = device_class.map(str::to_string);
    HaBinarySensorMessage {
        base,
        payload_on: "pressed".to_string(),
        payload_off: "released".to_string(),
    }
}

pub fn ha_sensor_message(
    ctx: &DeviceCtx<'_>,
    id: &str,
    name: &str,
    unit_of_measurement: Option<&str>,
    device_class: Option<&str>,
    state_class: Option<&str>,
    value_template: Option<&str>,
) -> HaSensorMessage {
    let mut base = ctx.base(
        name,
        format!("{}/sensor/{id}", ctx.topic),
        format!("{}sensor{id}", ctx.topic),
    );
    base.unit_of_measurement = unit_of_measurement.map(str::to_string);
    base.device_class = device_class.map(str::to_string);
    base.state_class = state_class.map(str::to_string);
    base.state_value_template = value_template.map(str::to_string);
    HaSensorMessage { base }
}

/// Power/energy sensors derived from a relay's virtual energy accumulator.
pub fn ha_virtual_energy_sensor_message(
    ctx: &DeviceCtx<'_>,
    relay_id: &str,
    name: &str,
    field: &str,
    unit_of_measurement: &str,
    device_class: &str,
    state_class: &str,
) -> HaSensorMessage {
    let mut base = ctx.base(
        name,
        format!("{}/energy/{relay_id}", ctx.topic),
        format!("{}energy{relay_id}{field}", ctx.topic),
    );
    base.unit_of_measurement = Some(unit_of_measurement.to_string());
    base.device_class = Some(device_class.to_string());
    base.state_class = Some(state_class.to_string());
    base.state_value_template = Some(format!("{{{{ value_json.{field} }}}}"));
    HaSensorMessage { base }
}

pub fn ha_cover_message(
    ctx: &DeviceCtx<'_>,
    id: &str,
    name: &str,
    device_class: &str,
    with_tilt: bool,
) -> HaCoverMessage {
    let mut base = ctx.base(
        name,
        format!("{}/cover/{id}/state", ctx.topic),
        format!("{}cover{id}", ctx.topic),
    );
    base.device_class = Some(device_class.to_string());
    let (tilt_command_topic, tilt_status_topic, tilt_status_template, payload_stop_tilt) =
        if with_tilt {
            (
                Some(format!("{}/cmd/cover/{id}/tilt", ctx.topic)),
                Some(format!("{}/cover/{id}/pos", ctx.topic)),
                Some("{{ value_json.tilt }}".to_string()),
                Some("stop".to_string()),
            )
        } else {
            (None, None, None, None)
        };
    HaCoverMessage {
        base,
        command_topic: format!("{}/cmd/cover/{id}/set", ctx.topic),
        set_position_topic: Some(format!("{}/cmd/cover/{id}/pos", ctx.topic)),
        position_topic: Some(format!("{}/cover/{id}/pos", ctx.topic)),
        position_template: Some("{{ value_json.position }}".to_string()),
        tilt_command_topic,
        tilt_status_topic,
        tilt_status_template,
        payload_stop_tilt,
        payload_open: "open".to_string(),
        payload_close: "close".to_string(),
        payload_stop: "stop".to_string(),
        state_open: "open".to_string(),
        state_opening: "opening".to_string(),
        state_closed: "closed".to_string(),
        state_closing: "closing".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Modbus device entities

/// Context for one Modbus device, which is its own HA device.
pub struct ModbusDeviceCtx<'a> {
    pub topic: &'a str,
    pub device_id: &'a str,
    pub device_name: &'a str,
    pub model: &'a str,
    pub web_url: Option<&'a str>,
}

impl ModbusDeviceCtx<'_> {
    fn base(&self, entity_name: &str, state_topic_base: &str) -> HaBase {
        HaBase {
            availability: vec![HaAvailability {
                topic: format!("{}/{}/state", self.topic, self.device_id),
            }],
            device: HaDevice::new(
                vec![self.device_id.to_string()],
                self.model,
                self.device_name,
                self.web_url,
            ),
            name: entity_name.to_string(),
            state_topic: format!(
                "{}/sensor/{}/{}",
                self.topic, self.device_id, state_topic_base
            ),
            unique_id: format!(
                "{}{}{}",
                self.topic,
                entity_name.replace('_', "").to_lowercase(),
                self.device_name.to_lowercase()
            ),
            optimistic: false,
            device_class: None,
            unit_of_measurement: None,
            state_class: None,
            state_value_template: None,
            entity_category: None,
        }
    }

    fn command_topic(&self) -> String {
        format!("{}/cmd/modbus/{}/set", self.topic, self.device_id.to_lowercase())
    }

    fn command_template(&self, decoded_name: &str) -> String {
        format!("{{\"device\": \"{decoded_name}\", \"value\": \"{{{{ value }}}}\"}}")
    }
}

#[allow(clippy::too_many_arguments)]
pub fn modbus_sensor_message(
    ctx: &ModbusDeviceCtx<'_>,
    entity_name: &str,
    decoded_name: &str,
    state_topic_base: &str,
    unit_of_measurement: Option<&str>,
    device_class: Option<&str>,
    state_class: Option<&str>,
    ha_filter: Option<&str>,
) -> HaModbusMessage {
    let mut base = ctx.base(entity_name, state_topic_base);
    base.unit_of_measurement = unit_of_measurement.map(str::to_string);
    base.device_class = device_class.map(str::to_string);
    base.state_class = state_class.map(str::to_string);
    let value_template = match ha_filter {
        Some(filter) => format!("{{{{ value_json.{decoded_name} | {filter} }}}}"),
        None => format!("{{{{ value_json.{decoded_name} }}}}"),
    };
    HaModbusMessage {
        base,
        value_template: Some(value_template),
        command_topic: None,
        command_template: None,
        min: None,
        max: None,
        step: None,
        options: None,
        payload_on: None,
        payload_off: None,
    }
}

pub fn modbus_binary_sensor_message(
    ctx: &ModbusDeviceCtx<'_>,
    entity_name: &str,
    decoded_name: &str,
    state_topic_base: &str,
    payload_on: &str,
    payload_off: &str,
) -> HaModbusMessage {
    let base = ctx.base(entity_name, state_topic_base);
    HaModbusMessage {
        base,
        value_template: Some(format!("{{{{ value_json.{decoded_name} }}}}")),
        command_topic: None,
        command_template: None,
        min: None,
        max: None,
        step: None,
        options: None,
        payload_on: Some(payload_on.to_string()),
        payload_off: Some(payload_off.to_string()),
    }
}

pub fn modbus_select_message(
    ctx: &ModbusDeviceCtx<'_>,
    entity_name: &str,
    decoded_name: &str,
    state_topic_base: &str,
    options: Vec<String>,
) -> HaModbusMessage {
    let base = ctx.base(entity_name, state_topic_base);
    HaModbusMessage {
        base,
        value_template: Some(format!("{{{{ value_json.{decoded_name} }}}}")),
        command_topic: Some(ctx.command_topic()),
        command_template: Some(ctx.command_template(decoded_name)),
        min: None,
        max: None,
        step: None,
        options: Some(options),
        payload_on: None,
        payload_off: None,
    }
}

pub fn modbus_switch_message(
    ctx: &ModbusDeviceCtx<'_>,
    entity_name: &str,
    decoded_name: &str,
    state_topic_base: &str,
    payload_on: &str,
    payload_off: &str,
) -> HaModbusMessage {
    let base = ctx.base(entity_name, state_topic_base);
    HaModbusMessage {
        base,
        value_template: Some(format!("{{{{ value_json.{decoded_name} }}}}")),
        command_topic: Some(ctx.command_topic()),
        command_template: Some(ctx.command_template(decoded_name)),
        min: None,
        max: None,
        step: None,
        options: None,
        payload_on: Some(payload_on.to_string()),
        payload_off: Some(payload_off.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn modbus_numeric_message(
    ctx: &ModbusDeviceCtx<'_>,
    entity_name: &str,
    decoded_name: &str,
    state_topic_base: &str,
    unit_of_measurement: Option<&str>,
    min: Option<f64>,
    max: Option<f64>,
    step: Option<f64>,
) -> HaModbusMessage {
    let mut base = ctx.base(entity_name, state_topic_base);
    base.unit_of_measurement = unit_of_measurement.map(str::to_string);
    HaModbusMessage {
        base,
        value_template: Some(format!("{{{{ value_json.{decoded_name} }}}}")),
        command_topic: Some(ctx.command_topic()),
        command_template: Some(ctx.command_template(decoded_name)),
        min,
        max,
        step,
        options: None,
        payload_on: None,
        payload_off: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>() -> DeviceCtx<'a> {
        DeviceCtx {
            topic: "boneio",
            model: "Boneio Black",
            device_name: Some("myboneio"),
            web_url: None,
        }
    }

    #[test]
    fn optional_fields_are_omitted() {
        let msg = ha_switch_message(&ctx(), "r1", "Relay 1", "relay");
        let value = serde_json::to_value(&msg).unwrap();
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("device_class"));
        assert!(!obj.contains_key("configuration_url"));
        assert_eq!(obj["state_topic"], "boneio/relay/r1");
        assert_eq!(obj["command_topic"], "boneio/cmd/relay/r1/set");
        assert_eq!(obj["unique_id"], "boneiorelayr1");
        assert_eq!(obj["device"]["manufacturer"], "boneIO");
    }

    #[test]
    fn event_message_lists_click_types() {
        let msg = ha_event_message(&ctx(), "P8_07", "Wejście");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value["event_types"],
            serde_json::json!(["single", "double", "long"])
        );
    }

    #[test]
    fn cover_with_tilt_exposes_tilt_topics() {
        let msg = ha_cover_message(&ctx(), "salon", "Salon", "shutter", true);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["tilt_command_topic"], "boneio/cmd/cover/salon/tilt");
        assert_eq!(value["tilt_status_template"], "{{ value_json.tilt }}");
        let no_tilt = ha_cover_message(&ctx(), "salon", "Salon", "shutter", false);
        let value = serde_json::to_value(&no_tilt).unwrap();
        assert!(value.as_object().unwrap().get("tilt_command_topic").is_none());
    }

    #[test]
    fn modbus_select_carries_command_template() {
        let mctx = ModbusDeviceCtx {
            topic: "boneio",
            device_id: "sofar1",
            device_name: "Sofar",
            model: "sofar",
            web_url: None,
        };
        let msg = modbus_select_message(
            &mctx,
            "Work Mode",
            "workmode",
            "1028",
            vec!["Auto".to_string(), "Manual".to_string()],
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["command_topic"], "boneio/cmd/modbus/sofar1/set");
        assert_eq!(
            value["command_template"],
            "{\"device\": \"workmode\", \"value\": \"{{ value }}\"}"
        );
        assert_eq!(value["availability"][0]["topic"], "boneio/sofar1/state");
    }
}
