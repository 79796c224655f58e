//! YAML configuration model.
//!
//! Structural validation only; cross-references (relay ids in covers,
//! interlock groups, action targets) are resolved by the manager at wiring
//! time so a broken reference degrades a single entity instead of the boot.

use crate::error::ConfigError;
use crate::models::ClickType;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Duration config field accepting `50`, `"50ms"`, `"3s"` or `"1m"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimePeriod(pub Duration);

impl TimePeriod {
    pub const fn from_millis(ms: u64) -> Self {
        TimePeriod(Duration::from_millis(ms))
    }

    pub const fn from_secs(secs: u64) -> Self {
        TimePeriod(Duration::from_secs(secs))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let text = text.trim();
        let err = || ConfigError::TimePeriod(text.to_string());
        if let Ok(ms) = text.parse::<u64>() {
            return Ok(TimePeriod::from_millis(ms));
        }
        let (value, unit) = text.split_at(text.find(|c: char| c.is_alphabetic()).ok_or_else(err)?);
        let value: f64 = value.trim().parse().map_err(|_| err())?;
        let millis = match unit {
            "ms" => value,
            "s" => value * 1000.0,
            "m" | "min" => value * 60_000.0,
            "h" => value * 3_600_000.0,
            _ => return Err(err()),
        };
        Ok(TimePeriod(Duration::from_millis(millis as u64)))
    }
}

impl<'de> Deserialize<'de> for TimePeriod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl<'de> de::Visitor<'de> for Visitor {
            type Value = TimePeriod;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration in milliseconds or a string like \"50ms\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<TimePeriod, E> {
                Ok(TimePeriod::from_millis(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<TimePeriod, E> {
                Ok(TimePeriod::from_millis(v.max(0) as u64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<TimePeriod, E> {
                TimePeriod::parse(v).map_err(E::custom)
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HaDiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ha_prefix")]
    pub topic_prefix: String,
}

impl Default for HaDiscoveryConfig {
    fn default() -> Self {
        HaDiscoveryConfig {
            enabled: true,
            topic_prefix: default_ha_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub ha_discovery: HaDiscoveryConfig,
}

/// UART selection for the Modbus bus. `uart` is either one of the BeagleBone
/// UART names (`uart1`..`uart5`) or a raw device path.
#[derive(Debug, Clone, Deserialize)]
pub struct UartConfig {
    pub uart: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    #[serde(default = "default_modbus_timeout")]
    pub timeout: TimePeriod,
}

impl UartConfig {
    pub fn device_path(&self) -> String {
        match self.uart.as_str() {
            "uart1" => "/dev/ttyS1".to_string(),
            "uart2" => "/dev/ttyS2".to_string(),
            "uart3" => "/dev/ttyS3".to_string(),
            "uart4" => "/dev/ttyS4".to_string(),
            "uart5" => "/dev/ttyS5".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpanderConfig {
    pub id: String,
    pub address: u8,
    #[serde(default)]
    pub init_sleep: Option<TimePeriod>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Gpio,
    Mcp,
    Pcf,
    Pca,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Switch,
    Light,
    Led,
    Valve,
    Cover,
    None,
}

impl OutputType {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputType::Switch => "switch",
            OutputType::Light => "light",
            OutputType::Led => "led",
            OutputType::Valve => "valve",
            OutputType::Cover => "cover",
            OutputType::None => "none",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub id: String,
    pub kind: OutputKind,
    /// Expander id for mcp/pcf/pca outputs; unused for raw GPIO.
    #[serde(default)]
    pub expander_id: Option<String>,
    /// Expander pin index, or GPIO line for `kind: gpio` (e.g. `P8_07`).
    pub pin: String,
    #[serde(default = "default_output_type")]
    pub output_type: OutputType,
    #[serde(default)]
    pub momentary_turn_on: Option<TimePeriod>,
    #[serde(default)]
    pub momentary_turn_off: Option<TimePeriod>,
    #[serde(default)]
    pub restore_state: bool,
    #[serde(default)]
    pub interlock_group: Vec<String>,
    #[serde(default)]
    pub virtual_power_usage: Option<f64>,
    #[serde(default)]
    pub virtual_volume_flow_rate: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputGroupConfig {
    pub id: String,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub all_on_behaviour: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverPlatform {
    Previous,
    TimeBased,
    Venetian,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoverConfig {
    pub id: String,
    #[serde(default = "default_cover_platform")]
    pub platform: CoverPlatform,
    pub open_relay: String,
    pub close_relay: String,
    pub open_time: TimePeriod,
    pub close_time: TimePeriod,
    /// Venetian only: time for a full tilt swing.
    #[serde(default)]
    pub tilt_duration: Option<TimePeriod>,
    /// Venetian only: mechanical dead time before anything moves.
    #[serde(default)]
    pub actuator_activation_duration: Option<TimePeriod>,
    #[serde(default = "default_cover_device_class")]
    pub device_class: String,
    #[serde(default = "default_true")]
    pub restore_state: bool,
    #[serde(default)]
    pub show_in_ha: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionConfig {
    Mqtt {
        topic: String,
        action_mqtt_msg: String,
    },
    Output {
        pin: String,
        action_output: OutputAction,
    },
    Cover {
        pin: String,
        action_cover: CoverAction,
    },
    OutputOverMqtt {
        boneio_id: String,
        pin: String,
        action_output: OutputAction,
    },
    CoverOverMqtt {
        boneio_id: String,
        pin: String,
        action_cover: CoverAction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAction {
    Toggle,
    On,
    Off,
}

impl fmt::Display for OutputAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputAction::Toggle => "toggle",
            OutputAction::On => "on",
            OutputAction::Off => "off",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverAction {
    Open,
    Close,
    Stop,
    Toggle,
    ToggleOpen,
    ToggleClose,
    TiltOpen,
    TiltClose,
}

impl fmt::Display for CoverAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CoverAction::Open => "open",
            CoverAction::Close => "close",
            CoverAction::Stop => "stop",
            CoverAction::Toggle => "toggle",
            CoverAction::ToggleOpen => "toggle_open",
            CoverAction::ToggleClose => "toggle_close",
            CoverAction::TiltOpen => "tilt_open",
            CoverAction::TiltClose => "tilt_close",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// GPIO header pin, e.g. `P8_07`.
    pub pin: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_gpio_mode")]
    pub gpio_mode: String,
    #[serde(default = "default_bounce_time")]
    pub bounce_time: TimePeriod,
    /// Publish an empty retained message 200 ms after a click (Z2M style).
    #[serde(default)]
    pub clear_message: bool,
    #[serde(default = "default_true")]
    pub show_in_ha: bool,
    /// Binary sensors only: publish the current level at boot.
    #[serde(default)]
    pub initial_send: bool,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(default)]
    pub boneio_input: Option<String>,
    #[serde(default)]
    pub actions: HashMap<ClickType, Vec<ActionConfig>>,
}

impl InputConfig {
    pub fn identifier(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.pin.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct I2cSensorConfig {
    pub id: String,
    pub address: u8,
    #[serde(default = "default_sensor_interval")]
    pub update_interval: TimePeriod,
    #[serde(default)]
    pub filters: Vec<crate::modbus::filter::FilterOp>,
    #[serde(default)]
    pub unit_of_measurement: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DallasSensorConfig {
    pub id: String,
    /// 1-wire device id, e.g. `28-00000a0b0c0d`.
    pub address: String,
    #[serde(default = "default_sensor_interval")]
    pub update_interval: TimePeriod,
    #[serde(default)]
    pub filters: Vec<crate::modbus::filter::FilterOp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ina219Config {
    pub id: String,
    #[serde(default = "default_ina219_address")]
    pub address: u8,
    #[serde(default = "default_sensor_interval")]
    pub update_interval: TimePeriod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdcConfig {
    /// ADC header pin, one of P9_33/35/36/37/38/39/40.
    pub pin: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_sensor_interval")]
    pub update_interval: TimePeriod,
    #[serde(default)]
    pub filters: Vec<crate::modbus::filter::FilterOp>,
}

impl AdcConfig {
    pub fn identifier(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.pin.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusDeviceConfig {
    pub id: String,
    /// Modbus unit (slave) address.
    pub address: u8,
    /// Device model; `modbus_devices/<model>.json` must exist.
    pub model: String,
    #[serde(default = "default_modbus_update_interval")]
    pub update_interval: TimePeriod,
    /// Extra user filters keyed by decoded entity name.
    #[serde(default)]
    pub sensors_filters: HashMap<String, Vec<crate::modbus::filter::FilterOp>>,
    /// Config symbols available to derived-entity formulas.
    #[serde(default)]
    pub data: HashMap<String, f64>,
}

impl ModbusDeviceConfig {
    pub fn identifier(&self) -> String {
        crate::util::normalize_id(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub modbus: Option<UartConfig>,
    #[serde(default)]
    pub mcp23017: Vec<ExpanderConfig>,
    #[serde(default)]
    pub pcf8575: Vec<ExpanderConfig>,
    #[serde(default)]
    pub pca9685: Vec<ExpanderConfig>,
    #[serde(default)]
    pub output: Vec<OutputConfig>,
    #[serde(default)]
    pub output_group: Vec<OutputGroupConfig>,
    #[serde(default)]
    pub cover: Vec<CoverConfig>,
    /// Inputs using the new single/double/long classifier.
    #[serde(default)]
    pub event: Vec<InputConfig>,
    /// Inputs in plain pressed/released mode.
    #[serde(default)]
    pub binary_sensor: Vec<InputConfig>,
    #[serde(default)]
    pub lm75: Vec<I2cSensorConfig>,
    #[serde(default)]
    pub mcp9808: Vec<I2cSensorConfig>,
    #[serde(default)]
    pub dallas: Vec<DallasSensorConfig>,
    #[serde(default)]
    pub ina219: Vec<Ina219Config>,
    #[serde(default)]
    pub adc: Vec<AdcConfig>,
    #[serde(default)]
    pub modbus_devices: Vec<ModbusDeviceConfig>,
    /// Directory with per-model Modbus descriptors.
    #[serde(default = "default_modbus_devices_dir")]
    pub modbus_devices_dir: PathBuf,
    /// I2C bus device used by expanders and sensors.
    #[serde(default = "default_i2c_device")]
    pub i2c_device: String,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn topic_prefix(&self) -> String {
        self.mqtt
            .as_ref()
            .map(|m| m.topic_prefix.clone())
            .unwrap_or_else(default_topic_prefix)
    }

    pub fn ha_discovery(&self) -> HaDiscoveryConfig {
        self.mqtt
            .as_ref()
            .map(|m| m.ha_discovery.clone())
            .unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

fn default_ha_prefix() -> String {
    "homeassistant".to_string()
}

fn default_topic_prefix() -> String {
    "boneio".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_baudrate() -> u32 {
    9600
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stopbits() -> u8 {
    1
}

fn default_bytesize() -> u8 {
    8
}

fn default_modbus_timeout() -> TimePeriod {
    TimePeriod::from_secs(3)
}

fn default_output_type() -> OutputType {
    OutputType::Switch
}

fn default_cover_platform() -> CoverPlatform {
    CoverPlatform::TimeBased
}

fn default_cover_device_class() -> String {
    "shutter".to_string()
}

fn default_gpio_mode() -> String {
    "gpio_pu".to_string()
}

fn default_bounce_time() -> TimePeriod {
    TimePeriod::from_millis(50)
}

fn default_sensor_interval() -> TimePeriod {
    TimePeriod::from_secs(60)
}

fn default_modbus_update_interval() -> TimePeriod {
    TimePeriod::from_secs(60)
}

fn default_ina219_address() -> u8 {
    0x40
}

fn default_modbus_devices_dir() -> PathBuf {
    PathBuf::from("modbus_devices")
}

fn default_i2c_device() -> String {
    "/dev/i2c-2".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_period_forms() {
        assert_eq!(TimePeriod::parse("50ms").unwrap(), TimePeriod::from_millis(50));
        assert_eq!(TimePeriod::parse("3s").unwrap(), TimePeriod::from_secs(3));
        assert_eq!(TimePeriod::parse("2m").unwrap(), TimePeriod::from_secs(120));
        assert!(TimePeriod::parse("abc").is_err());
    }

    #[test]
    fn minimal_config_parses() {
        let yaml = r#"
mqtt:
  host: localhost
  topic_prefix: boneio
output:
  - id: Relay 1
    kind: mcp
    expander_id: mcp1
    pin: "0"
    output_type: switch
    momentary_turn_on: 500ms
event:
  - pin: P8_07
    actions:
      single:
        - action: output
          pin: Relay 1
          action_output: toggle
cover:
  - id: Salon
    platform: venetian
    open_relay: Relay 1
    close_relay: Relay 2
    open_time: 30s
    close_time: 30s
    tilt_duration: 1500ms
    actuator_activation_duration: 100ms
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.output.len(), 1);
        assert_eq!(
            config.output[0].momentary_turn_on,
            Some(TimePeriod::from_millis(500))
        );
        let actions = &config.event[0].actions[&ClickType::Single];
        assert!(matches!(actions[0], ActionConfig::Output { .. }));
        assert_eq!(config.cover[0].platform, CoverPlatform::Venetian);
        assert_eq!(config.topic_prefix(), "boneio");
    }
}
