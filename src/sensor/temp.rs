//! I2C temperature sensors: LM75 (driver crate) and MCP9808 (register-level
//! driver, 13-bit signed ambient register).

use crate::error::HardwareError;
use crate::hardware::expander::{I2cProxy, SharedI2c};
use crate::runtime::scheduler::PeriodicUpdate;
use crate::sensor::SensorReporter;
use async_trait::async_trait;
use embedded_hal::blocking::i2c::WriteRead;
use lm75::{ic, Address, Lm75};
use log::error;
use std::sync::Mutex;
use std::time::Duration;

fn lm75_address(address: u8) -> Address {
    // 0x48 base plus the A2..A0 straps.
    let bits = address.saturating_sub(0x48);
    Address::from((bits & 0b100 != 0, bits & 0b010 != 0, bits & 0b001 != 0))
}

pub struct Lm75Sensor {
    reporter: SensorReporter,
    dev: Mutex<Lm75<I2cProxy, ic::Lm75>>,
}

impl Lm75Sensor {
    pub fn new(
        reporter: SensorReporter,
        bus: &'static SharedI2c,
        address: u8,
    ) -> Result<Self, HardwareError> {
        let mut dev = Lm75::new(bus.acquire_i2c(), lm75_address(address));
        // Probe once so a missing chip degrades the entity at boot.
        dev.read_temperature()
            .map_err(|e| HardwareError::I2c(format!("LM75 0x{address:02x}: {e:?}")))?;
        Ok(Lm75Sensor {
            reporter,
            dev: Mutex::new(dev),
        })
    }
}

#[async_trait]
impl PeriodicUpdate for Lm75Sensor {
    fn update_id(&self) -> String {
        self.reporter.id.clone()
    }

    async fn refresh(&self, timestamp: f64) -> Option<Duration> {
        let reading = self.dev.lock().unwrap().read_temperature();
        match reading {
            Ok(temperature) => self.reporter.report(temperature as f64, timestamp),
            Err(err) => error!("LM75 {} read failed: {err:?}", self.reporter.id),
        }
        None
    }
}

const MCP9808_REG_AMBIENT: u8 = 0x05;

/// Minimal MCP9808 driver over the blocking I2C trait.
pub struct Mcp9808<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C, E> Mcp9808<I2C>
where
    I2C: WriteRead<Error = E>,
    E: std::fmt::Debug,
{
    pub fn new(i2c: I2C, address: u8) -> Self {
        Mcp9808 { i2c, address }
    }

    pub fn read_temperature(&mut self) -> Result<f32, HardwareError> {
        let mut buffer = [0u8; 2];
        self.i2c
            .write_read(self.address, &[MCP9808_REG_AMBIENT], &mut buffer)
            .map_err(|e| HardwareError::I2c(format!("MCP9808 0x{:02x}: {e:?}", self.address)))?;
        Ok(convert_mcp9808(buffer))
    }
}

/// Ambient register: 4 flag bits, sign bit, 12-bit magnitude in 1/16 °C.
fn convert_mcp9808(raw: [u8; 2]) -> f32 {
    let upper = raw[0] & 0x1F;
    let temperature = (((upper & 0x0F) as u16) << 8 | raw[1] as u16) as f32 / 16.0;
    if upper & 0x10 != 0 {
        temperature - 256.0
    } else {
        temperature
    }
}

pub struct Mcp9808Sensor {
    reporter: SensorReporter,
    dev: Mutex<Mcp9808<I2cProxy>>,
}

impl Mcp9808Sensor {
    pub fn new(
        reporter: SensorReporter,
        bus: &'static SharedI2c,
        address: u8,
    ) -> Result<Self, HardwareError> {
        let mut dev = Mcp9808::new(bus.acquire_i2c(), address);
        dev.read_temperature()?;
        Ok(Mcp9808Sensor {
            reporter,
            dev: Mutex::new(dev),
        })
    }
}

#[async_trait]
impl PeriodicUpdate for Mcp9808Sensor {
    fn update_id(&self) -> String {
        self.reporter.id.clone()
    }

    async fn refresh(&self, timestamp: f64) -> Option<Duration> {
        let reading = self.dev.lock().unwrap().read_temperature();
        match reading {
            Ok(temperature) => self.reporter.report(temperature as f64, timestamp),
            Err(err) => error!("MCP9808 {} read failed: {err}", self.reporter.id),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcp9808_conversion_handles_sign() {
        // +25.25 C: 0x0195 -> 405 / 16
        assert!((convert_mcp9808([0x01, 0x95]) - 25.3125).abs() < 1e-4);
        // -0.0625 C: sign bit set, magnitude 0xFFF
        assert!((convert_mcp9808([0x1F, 0xFF]) - -0.0625).abs() < 1e-4);
        // 0 C
        assert_eq!(convert_mcp9808([0x00, 0x00]), 0.0);
    }

    #[test]
    fn lm75_addresses_map_to_straps() {
        assert_eq!(lm75_address(0x48), Address::from((false, false, false)));
        assert_eq!(lm75_address(0x4D), Address::from((true, false, true)));
    }
}
