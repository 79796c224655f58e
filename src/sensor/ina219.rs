//! INA219 power monitor: bus voltage, shunt current and power as three
//! sensor entities off one chip. Register-level driver over blocking I2C.

use crate::error::HardwareError;
use crate::hardware::expander::{I2cProxy, SharedI2c};
use crate::runtime::scheduler::PeriodicUpdate;
use crate::sensor::SensorReporter;
use async_trait::async_trait;
use embedded_hal::blocking::i2c::WriteRead;
use log::error;
use std::sync::Mutex;
use std::time::Duration;

const REG_SHUNT_VOLTAGE: u8 = 0x01;
const REG_BUS_VOLTAGE: u8 = 0x02;
/// The boneIO board uses a 0.1 ohm shunt.
const SHUNT_OHMS: f64 = 0.1;
/// Shunt register LSB is 10 uV.
const SHUNT_LSB_V: f64 = 10e-6;
/// Bus voltage register LSB is 4 mV, data left-shifted by 3.
const BUS_LSB_V: f64 = 4e-3;

pub struct Ina219<I2C> {
    i2c: I2C,
    address: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct PowerReading {
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
}

impl<I2C, E> Ina219<I2C>
where
    I2C: WriteRead<Error = E>,
    E: std::fmt::Debug,
{
    pub fn new(i2c: I2C, address: u8) -> Self {
        Ina219 { i2c, address }
    }

    fn read_register(&mut self, register: u8) -> Result<u16, HardwareError> {
        let mut buffer = [0u8; 2];
        self.i2c
            .write_read(self.address, &[register], &mut buffer)
            .map_err(|e| HardwareError::I2c(format!("INA219 0x{:02x}: {e:?}", self.address)))?;
        Ok(u16::from_be_bytes(buffer))
    }

    pub fn read(&mut self) -> Result<PowerReading, HardwareError> {
        let shunt = self.read_register(REG_SHUNT_VOLTAGE)? as i16;
        let bus = self.read_register(REG_BUS_VOLTAGE)?;
        Ok(convert_ina219(shunt, bus))
    }
}

fn convert_ina219(shunt_raw: i16, bus_raw: u16) -> PowerReading {
    let voltage_v = f64::from(bus_raw >> 3) * BUS_LSB_V;
    let current_a = f64::from(shunt_raw) * SHUNT_LSB_V / SHUNT_OHMS;
    PowerReading {
        voltage_v,
        current_a,
        power_w: voltage_v * current_a,
    }
}

/// One physical chip exposed as three entities.
pub struct Ina219Sensor {
    id: String,
    voltage: SensorReporter,
    current: SensorReporter,
    power: SensorReporter,
    dev: Mutex<Ina219<I2cProxy>>,
}

impl Ina219Sensor {
    pub fn new(
        id: &str,
        voltage: SensorReporter,
        current: SensorReporter,
        power: SensorReporter,
        bus: &'static SharedI2c,
        address: u8,
    ) -> Result<Self, HardwareError> {
        let mut dev = Ina219::new(bus.acquire_i2c(), address);
        dev.read()?;
        Ok(Ina219Sensor {
            id: id.to_string(),
            voltage,
            current,
            power,
            dev: Mutex::new(dev),
        })
    }
}

#[async_trait]
impl PeriodicUpdate for Ina219Sensor {
    fn update_id(&self) -> String {
        self.id.clone()
    }

    async fn refresh(&self, timestamp: f64) -> Option<Duration> {
        let reading = self.dev.lock().unwrap().read();
        match reading {
            Ok(reading) => {
                self.voltage.report(reading.voltage_v, timestamp);
                self.current.report(reading.current_a, timestamp);
                self.power.report(reading.power_w, timestamp);
            }
            Err(err) => error!("INA219 {} read failed: {err}", self.id),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_scales_registers() {
        // 12 V on the bus register: 12 / 0.004 = 3000, shifted left 3.
        let reading = convert_ina219(1000, 3000 << 3);
        assert!((reading.voltage_v - 12.0).abs() < 1e-9);
        // 1000 * 10 uV / 0.1 ohm = 0.1 A.
        assert!((reading.current_a - 0.1).abs() < 1e-9);
        assert!((reading.power_w - 1.2).abs() < 1e-9);
        // Negative shunt current flows the other way.
        assert!(convert_ina219(-1000, 0).current_a < 0.0);
    }
}
