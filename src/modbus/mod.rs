//! Modbus-RTU: serial transport, device descriptors, the value/filter
//! pipeline and the per-device coordinator.

pub mod coordinator;
pub mod descriptor;
pub mod filter;
pub mod formula;
pub mod transport;

use serde::Deserialize;

/// Typed register decoding. `_R` variants use little word order for the
/// multi-word types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ValueType {
    #[serde(rename = "U_WORD")]
    UWord,
    #[serde(rename = "S_WORD")]
    SWord,
    #[serde(rename = "U_DWORD")]
    UDword,
    #[serde(rename = "S_DWORD")]
    SDword,
    #[serde(rename = "U_DWORD_R")]
    UDwordR,
    #[serde(rename = "S_DWORD_R")]
    SDwordR,
    #[serde(rename = "U_QWORD")]
    UQword,
    #[serde(rename = "S_QWORD")]
    SQword,
    #[serde(rename = "U_QWORD_R")]
    UQwordR,
    #[serde(rename = "FP32")]
    Fp32,
    #[serde(rename = "FP32_R")]
    Fp32R,
}

impl ValueType {
    /// How many 16-bit registers this type spans.
    pub fn register_count(self) -> usize {
        match self {
            ValueType::UWord | ValueType::SWord => 1,
            ValueType::UDword
            | ValueType::SDword
            | ValueType::UDwordR
            | ValueType::SDwordR
            | ValueType::Fp32
            | ValueType::Fp32R => 2,
            ValueType::UQword | ValueType::SQword | ValueType::UQwordR => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Input,
    Holding,
    Coil,
}

/// Legacy single-register converters kept for older device descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ReturnType {
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "floatsofar")]
    FloatSofar,
    #[serde(rename = "multiply0_1")]
    Multiply0_1,
    #[serde(rename = "multiply0_01")]
    Multiply0_01,
    #[serde(rename = "multiply0_001")]
    Multiply0_001,
    #[serde(rename = "multiply10")]
    Multiply10,
    #[serde(rename = "multiply100")]
    Multiply100,
    #[serde(rename = "multiply1000")]
    Multiply1000,
    #[serde(rename = "regular")]
    Regular,
}

impl ReturnType {
    /// Apply to a bank read; `base` is the bank start, `addr` the register.
    pub fn convert(self, registers: &[u16], base: u16, addr: u16) -> Option<f64> {
        let index = addr.checked_sub(base)? as usize;
        let low = *registers.get(index)? as f64;
        let round4 = |v: f64| (v * 10_000.0).round() / 10_000.0;
        Some(match self {
            ReturnType::Float32 => {
                let high = *registers.get(index + 1)?;
                let low = *registers.get(index)?;
                f32::from_le_bytes([
                    (high & 0xFF) as u8,
                    (high >> 8) as u8,
                    (low & 0xFF) as u8,
                    (low >> 8) as u8,
                ]) as f64
            }
            ReturnType::FloatSofar => {
                let high = *registers.get(index + 1)? as f64;
                high + low
            }
            ReturnType::Multiply0_1 => round4(low * 0.1),
            ReturnType::Multiply0_01 => round4(low * 0.01),
            ReturnType::Multiply0_001 => round4(low * 0.001),
            ReturnType::Multiply10 => round4(low * 10.0),
            ReturnType::Multiply100 => round4(low * 100.0),
            ReturnType::Multiply1000 => round4(low * 1000.0),
            ReturnType::Regular => low,
        })
    }
}
