//! Entity state payloads carried by events and the WebSocket UI.

use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relay/switch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnOff {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl OnOff {
    pub fn is_on(self) -> bool {
        self == OnOff::On
    }

    pub fn from_bool(on: bool) -> Self {
        if on {
            OnOff::On
        } else {
            OnOff::Off
        }
    }
}

impl fmt::Display for OnOff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OnOff::On => "ON",
            OnOff::Off => "OFF",
        })
    }
}

/// Click types emitted by the input engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Sequence)]
#[serde(rename_all = "lowercase")]
pub enum ClickType {
    Single,
    Double,
    Long,
    Pressed,
    Released,
}

impl ClickType {
    /// Click types announced in HA `event` entity discovery.
    pub fn is_event(self) -> bool {
        matches!(self, ClickType::Single | ClickType::Double | ClickType::Long)
    }
}

impl fmt::Display for ClickType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClickType::Single => "single",
            ClickType::Double => "double",
            ClickType::Long => "long",
            ClickType::Pressed => "pressed",
            ClickType::Released => "released",
        })
    }
}

/// Cover motion state as published on `<prefix>/cover/<id>/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverStateKind {
    Open,
    Opening,
    Closed,
    Closing,
    Stop,
}

impl fmt::Display for CoverStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CoverStateKind::Open => "open",
            CoverStateKind::Opening => "opening",
            CoverStateKind::Closed => "closed",
            CoverStateKind::Closing => "closing",
            CoverStateKind::Stop => "stop",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverOperation {
    Idle,
    Opening,
    Closing,
}

/// State payload of an input entity.
#[derive(Debug, Clone, Serialize)]
pub struct InputState {
    pub name: String,
    pub pin: String,
    pub state: String,
    #[serde(rename = "type")]
    pub input_type: &'static str,
    pub timestamp: f64,
    pub boneio_input: String,
}

/// State payload of an output entity.
#[derive(Debug, Clone, Serialize)]
pub struct OutputState {
    pub id: String,
    pub name: String,
    pub state: OnOff,
    #[serde(rename = "type")]
    pub output_type: String,
    pub pin: String,
    pub timestamp: f64,
    pub expander_id: String,
}

/// State payload of a cover entity.
#[derive(Debug, Clone, Serialize)]
pub struct CoverState {
    pub id: String,
    pub name: String,
    pub state: CoverStateKind,
    pub position: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tilt: Option<i64>,
    pub current_operation: CoverOperation,
    pub timestamp: f64,
}

/// A scalar sensor reading; Modbus text/select entities carry strings.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Numeric(f64),
    Text(String),
    None,
}

impl Serialize for SensorValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SensorValue::Numeric(value) => serializer.serialize_f64(*value),
            SensorValue::Text(text) => serializer.serialize_str(text),
            SensorValue::None => serializer.serialize_none(),
        }
    }
}

impl SensorValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }
}

/// State payload of a sensor entity (local or Modbus).
#[derive(Debug, Clone, Serialize)]
pub struct SensorState {
    pub id: String,
    pub name: String,
    pub state: SensorValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub timestamp: f64,
}
