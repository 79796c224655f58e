//! On-board ADC (AM335x touchscreen controller in general-purpose mode).
//!
//! Channels are exposed by the iio subsystem as `in_voltageN_raw`; readings
//! are 12-bit against a 1.8 V reference.

use crate::error::HardwareError;
use std::path::PathBuf;

const ADC_MAX: f64 = 4095.0;
const VREF: f64 = 1.8;

/// Header pin to iio channel for the P9 analog pins.
pub fn adc_channel(pin: &str) -> Result<u8, HardwareError> {
    Ok(match pin.to_uppercase().as_str() {
        "P9_39" => 0,
        "P9_40" => 1,
        "P9_37" => 2,
        "P9_38" => 3,
        "P9_33" => 4,
        "P9_36" => 5,
        "P9_35" => 6,
        _ => {
            return Err(HardwareError::Adc(format!(
                "{pin} is not an ADC pin"
            )))
        }
    })
}

pub struct AdcReader {
    base_dir: PathBuf,
}

impl AdcReader {
    pub fn new() -> Self {
        AdcReader {
            base_dir: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
        }
    }

    /// Override the sysfs directory; used by tests.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        AdcReader { base_dir }
    }

    /// Read one pin and scale to volts.
    pub fn read_voltage(&self, pin: &str) -> Result<f64, HardwareError> {
        let channel = adc_channel(pin)?;
        let path = self.base_dir.join(format!("in_voltage{channel}_raw"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| HardwareError::Adc(format!("{}: {e}", path.display())))?;
        let raw: f64 = raw
            .trim()
            .parse()
            .map_err(|_| HardwareError::Adc(format!("bad reading {raw:?}")))?;
        Ok(raw / ADC_MAX * VREF)
    }
}

impl Default for AdcReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_scales() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in_voltage4_raw"), "2048\n").unwrap();
        let reader = AdcReader::with_base_dir(dir.path().to_path_buf());
        let volts = reader.read_voltage("P9_33").unwrap();
        assert!((volts - 2048.0 / 4095.0 * 1.8).abs() < 1e-9);
        assert!(reader.read_voltage("P9_40").is_err());
        assert!(adc_channel("P8_07").is_err());
    }
}
