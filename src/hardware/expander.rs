//! I2C expander drivers: MCP23017, PCF8575 and PCA9685.
//!
//! All expanders share one kernel I2C bus handle through a std bus manager;
//! each expander hands out pin handles that serialize chip access through
//! the expander's own mutex.

use crate::error::HardwareError;
use crate::hardware::{OutputPin, PwmOutputPin};
use linux_embedded_hal::I2cdev;
use log::debug;
use mcp230xx::{Direction, Level, Mcp23017, Mcp230xx};
use pcf857x::Pcf8575;
use pwm_pca9685::{Channel, Pca9685};
use std::sync::{Arc, Mutex};

pub type SharedI2c = shared_bus::BusManagerStd<I2cdev>;
pub type I2cProxy = shared_bus::I2cProxy<'static, std::sync::Mutex<I2cdev>>;

/// Open the kernel I2C device and leak the bus manager so expander and
/// sensor drivers can hold `'static` proxies, the shared-bus std pattern.
pub fn open_shared_i2c(path: &str) -> Result<&'static SharedI2c, HardwareError> {
    let dev = I2cdev::new(path).map_err(|e| HardwareError::I2c(e.to_string()))?;
    Ok(Box::leak(Box::new(shared_bus::BusManagerStd::new(dev))))
}

fn i2c_err<E: std::fmt::Debug>(expander: &str) -> impl Fn(E) -> HardwareError + '_ {
    move |e| HardwareError::I2c(format!("{expander}: {e:?}"))
}

// ---------------------------------------------------------------------------
// MCP23017

pub struct Mcp23017Expander {
    pub id: String,
    dev: Arc<Mutex<Mcp230xx<I2cProxy, Mcp23017>>>,
}

fn mcp_pin(index: u8) -> Result<Mcp23017, HardwareError> {
    use Mcp23017::*;
    Ok(match index {
        0 => A0, 1 => A1, 2 => A2, 3 => A3, 4 => A4, 5 => A5, 6 => A6, 7 => A7,
        8 => B0, 9 => B1, 10 => B2, 11 => B3, 12 => B4, 13 => B5, 14 => B6, 15 => B7,
        _ => {
            return Err(HardwareError::I2c(format!(
                "MCP23017 has no pin {index}"
            )))
        }
    })
}

impl Mcp23017Expander {
    pub fn new(id: &str, bus: &'static SharedI2c, address: u8) -> Result<Self, HardwareError> {
        let dev = Mcp230xx::new(bus.acquire_i2c(), address).map_err(i2c_err(id))?;
        debug!("MCP23017 {id} initializing at 0x{address:02x}.");
        Ok(Mcp23017Expander {
            id: id.to_string(),
            dev: Arc::new(Mutex::new(dev)),
        })
    }

    pub fn output_pin(&self, index: u8) -> Result<McpOutputPin, HardwareError> {
        let pin = mcp_pin(index)?;
        self.dev
            .lock()
            .unwrap()
            .set_direction(pin, Direction::Output)
            .map_err(i2c_err(&self.id))?;
        Ok(McpOutputPin {
            expander_id: self.id.clone(),
            dev: self.dev.clone(),
            pin,
            level: false,
        })
    }
}

pub struct McpOutputPin {
    expander_id: String,
    dev: Arc<Mutex<Mcp230xx<I2cProxy, Mcp23017>>>,
    pin: Mcp23017,
    level: bool,
}

impl OutputPin for McpOutputPin {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        let level = if on { Level::High } else { Level::Low };
        self.dev
            .lock()
            .unwrap()
            .set_gpio(self.pin, level)
            .map_err(i2c_err(&self.expander_id))?;
        self.level = on;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.level
    }
}

// ---------------------------------------------------------------------------
// PCF8575

pub struct Pcf8575Expander {
    pub id: String,
    inner: Arc<Mutex<PcfInner>>,
}

struct PcfInner {
    dev: Pcf8575<I2cProxy>,
    /// Shadow of the 16-bit output latch; the chip has no readback for it.
    outputs: u16,
}

fn pcf_address(address: u8) -> pcf857x::SlaveAddr {
    // 0x20 is the fixed part; A2..A0 straps select the rest.
    let bits = address.saturating_sub(0x20);
    pcf857x::SlaveAddr::Alternative(bits & 0b100 != 0, bits & 0b010 != 0, bits & 0b001 != 0)
}

impl Pcf8575Expander {
    pub fn new(id: &str, bus: &'static SharedI2c, address: u8) -> Result<Self, HardwareError> {
        let mut dev = Pcf8575::new(bus.acquire_i2c(), pcf_address(address));
        // All lines low on boot so restored relays start from a known level.
        dev.set(0).map_err(i2c_err(id))?;
        debug!("PCF8575 {id} initializing at 0x{address:02x}.");
        Ok(Pcf8575Expander {
            id: id.to_string(),
            inner: Arc::new(Mutex::new(PcfInner { dev, outputs: 0 })),
        })
    }

    pub fn output_pin(&self, index: u8) -> Result<PcfOutputPin, HardwareError> {
        if index > 15 {
            return Err(HardwareError::I2c(format!("PCF8575 has no pin {index}")));
        }
        Ok(PcfOutputPin {
            expander_id: self.id.clone(),
            inner: self.inner.clone(),
            mask: 1 << index,
            level: false,
        })
    }
}

pub struct PcfOutputPin {
    expander_id: String,
    inner: Arc<Mutex<PcfInner>>,
    mask: u16,
    level: bool,
}

impl OutputPin for PcfOutputPin {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        let mut inner = self.inner.lock().unwrap();
        if on {
            inner.outputs |= self.mask;
        } else {
            inner.outputs &= !self.mask;
        }
        let outputs = inner.outputs;
        inner.dev.set(outputs).map_err(i2c_err(&self.expander_id))?;
        self.level = on;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.level
    }
}

// ---------------------------------------------------------------------------
// PCA9685

pub struct Pca9685Expander {
    pub id: String,
    dev: Arc<Mutex<Pca9685<I2cProxy>>>,
}

fn pca_channel(index: u8) -> Result<Channel, HardwareError> {
    use Channel::*;
    Ok(match index {
        0 => C0, 1 => C1, 2 => C2, 3 => C3, 4 => C4, 5 => C5, 6 => C6, 7 => C7,
        8 => C8, 9 => C9, 10 => C10, 11 => C11, 12 => C12, 13 => C13, 14 => C14,
        15 => C15,
        _ => {
            return Err(HardwareError::I2c(format!(
                "PCA9685 has no channel {index}"
            )))
        }
    })
}

impl Pca9685Expander {
    pub fn new(id: &str, bus: &'static SharedI2c, address: u8) -> Result<Self, HardwareError> {
        let mut dev = Pca9685::new(bus.acquire_i2c(), address).map_err(i2c_err(id))?;
        dev.enable().map_err(i2c_err(id))?;
        debug!("PCA9685 {id} initializing at 0x{address:02x}.");
        Ok(Pca9685Expander {
            id: id.to_string(),
            dev: Arc::new(Mutex::new(dev)),
        })
    }

    pub fn output_pin(&self, index: u8) -> Result<PcaOutputPin, HardwareError> {
        let channel = pca_channel(index)?;
        Ok(PcaOutputPin {
            expander_id: self.id.clone(),
            dev: self.dev.clone(),
            channel,
            level: false,
            duty: 0,
        })
    }
}

pub struct PcaOutputPin {
    expander_id: String,
    dev: Arc<Mutex<Pca9685<I2cProxy>>>,
    channel: Channel,
    level: bool,
    duty: u16,
}

impl OutputPin for PcaOutputPin {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        let duty = if on { u16::MAX } else { 0 };
        self.set_duty(duty)
    }

    fn is_active(&self) -> bool {
        self.level
    }
}

impl PwmOutputPin for PcaOutputPin {
    fn set_duty(&mut self, duty: u16) -> Result<(), HardwareError> {
        // 16-bit HA brightness onto the 12-bit PWM counters.
        let counts = duty >> 4;
        let mut dev = self.dev.lock().unwrap();
        if counts == 0 {
            dev.set_channel_full_off(self.channel)
                .map_err(i2c_err(&self.expander_id))?;
        } else {
            dev.set_channel_on(self.channel, 0)
                .map_err(i2c_err(&self.expander_id))?;
            dev.set_channel_off(self.channel, counts.min(0x0FFF))
                .map_err(i2c_err(&self.expander_id))?;
        }
        self.duty = duty;
        self.level = duty > 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcf_addresses_map_to_straps() {
        assert!(matches!(
            pcf_address(0x20),
            pcf857x::SlaveAddr::Alternative(false, false, false)
        ));
        assert!(matches!(
            pcf_address(0x25),
            pcf857x::SlaveAddr::Alternative(true, false, true)
        ));
    }

    #[test]
    fn pin_indices_are_bounded() {
        assert!(mcp_pin(15).is_ok());
        assert!(mcp_pin(16).is_err());
        assert!(pca_channel(16).is_err());
    }
}
