//! Hardware drivers: GPIO lines, I2C expanders and the on-board ADC.
//!
//! Engines talk to pins through the [`OutputPin`]/[`PwmOutputPin`] seams so
//! the whole control plane also runs against the dry-run fakes.

pub mod adc;
pub mod expander;
pub mod gpio;

use crate::error::HardwareError;

/// A single controllable output pin (relay driver).
pub trait OutputPin: Send {
    fn set(&mut self, on: bool) -> Result<(), HardwareError>;
    /// Last commanded level.
    fn is_active(&self) -> bool;
}

/// A PWM-capable output (PCA9685 channel). Duty is 16-bit to match the HA
/// brightness scale; the driver maps it onto the chip resolution.
pub trait PwmOutputPin: OutputPin {
    fn set_duty(&mut self, duty: u16) -> Result<(), HardwareError>;
}

/// Driver handle owned by a relay.
pub enum DriverPin {
    Switch(Box<dyn OutputPin>),
    Pwm(Box<dyn PwmOutputPin>),
}

impl DriverPin {
    pub fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        match self {
            DriverPin::Switch(pin) => pin.set(on),
            DriverPin::Pwm(pin) => pin.set(on),
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            DriverPin::Switch(pin) => pin.is_active(),
            DriverPin::Pwm(pin) => pin.is_active(),
        }
    }

    /// Set PWM duty; `None` when the pin has no PWM capability.
    pub fn set_duty(&mut self, duty: u16) -> Option<Result<(), HardwareError>> {
        match self {
            DriverPin::Switch(_) => None,
            DriverPin::Pwm(pin) => Some(pin.set_duty(duty)),
        }
    }

    pub fn is_pwm(&self) -> bool {
        matches!(self, DriverPin::Pwm(_))
    }
}

/// In-memory pin registry backing `--dry` runs and unit tests.
pub mod dry {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct DryPinState {
        levels: Arc<Mutex<HashMap<String, bool>>>,
        duties: Arc<Mutex<HashMap<String, u16>>>,
    }

    impl DryPinState {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn pin(&self, key: &str) -> DryPin {
            DryPin {
                state: self.clone(),
                key: key.to_string(),
                level: false,
            }
        }

        pub fn level(&self, key: &str) -> bool {
            self.levels.lock().unwrap().get(key).copied().unwrap_or(false)
        }

        pub fn duty(&self, key: &str) -> Option<u16> {
            self.duties.lock().unwrap().get(key).copied()
        }
    }

    pub struct DryPin {
        state: DryPinState,
        key: String,
        level: bool,
    }

    impl OutputPin for DryPin {
        fn set(&mut self, on: bool) -> Result<(), HardwareError> {
            self.level = on;
            self.state.levels.lock().unwrap().insert(self.key.clone(), on);
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.level
        }
    }

    impl PwmOutputPin for DryPin {
        fn set_duty(&mut self, duty: u16) -> Result<(), HardwareError> {
            self.state.duties.lock().unwrap().insert(self.key.clone(), duty);
            self.set(duty > 0)
        }
    }
}
