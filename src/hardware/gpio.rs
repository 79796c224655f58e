//! GPIO access through the Linux character device.
//!
//! Inputs are requested active-low (boneIO inputs are pulled up, buttons
//! short to ground) with both edges; each input line gets a dedicated
//! monitor thread that forwards debounce-raw edges into the runtime over a
//! channel. Outputs are plain line handles.

use crate::error::HardwareError;
use crate::hardware::OutputPin;
use gpio_cdev::{Chip, EventRequestFlags, EventType, LineHandle, LineRequestFlags};
use log::{debug, warn};
use std::process::Command;
use tokio::sync::mpsc;

const CONSUMER: &str = "boneio";

/// A raw edge as seen on the line, after the request-level inversion:
/// `level == true` means the input is active (button pressed).
#[derive(Debug, Clone)]
pub struct Edge {
    pub pin: String,
    pub level: bool,
    /// Set on the synthetic edge carrying the initial line level.
    pub initial: bool,
}

/// Mux a header pin with `config-pin` (BeagleBone cape-universal overlays).
/// Failures are logged and ignored; on boards without cape-universal the
/// device tree already muxed the pin.
pub fn configure_pin(pin: &str, mode: &str) {
    // config-pin wants P8_07 spelled P8_07, but 3-digit forms like P8_7
    // need zero padding.
    let pin = if pin.len() == 4 {
        format!("{}0{}", &pin[0..3], &pin[3..])
    } else {
        pin.to_string()
    };
    debug!("Configuring pin {pin} for mode {mode}.");
    match Command::new("config-pin").arg(&pin).arg(mode).output() {
        Ok(out) if !out.status.success() => {
            debug!("config-pin {pin} {mode} exited with {}", out.status)
        }
        Ok(_) => {}
        Err(err) => debug!("config-pin unavailable: {err}"),
    }
}

/// Resolve a header pin name (`P8_07`) or raw `gpio<N>` name to the SoC GPIO
/// number; chip and line follow as `n / 32` and `n % 32`.
pub fn gpio_number(pin: &str) -> Result<u32, HardwareError> {
    if let Some(num) = pin.strip_prefix("gpio").and_then(|n| n.parse::<u32>().ok()) {
        return Ok(num);
    }
    let n = match pin.to_uppercase().as_str() {
        "P8_03" => 38, "P8_04" => 39, "P8_05" => 34, "P8_06" => 35,
        "P8_07" => 66, "P8_08" => 67, "P8_09" => 69, "P8_10" => 68,
        "P8_11" => 45, "P8_12" => 44, "P8_13" => 23, "P8_14" => 26,
        "P8_15" => 47, "P8_16" => 46, "P8_17" => 27, "P8_18" => 65,
        "P8_19" => 22, "P8_20" => 63, "P8_21" => 62, "P8_22" => 37,
        "P8_23" => 36, "P8_24" => 33, "P8_25" => 32, "P8_26" => 61,
        "P8_27" => 86, "P8_28" => 88, "P8_29" => 87, "P8_30" => 89,
        "P8_31" => 10, "P8_32" => 11, "P8_33" => 9, "P8_34" => 81,
        "P8_35" => 8, "P8_36" => 80, "P8_37" => 78, "P8_38" => 79,
        "P8_39" => 76, "P8_40" => 77, "P8_41" => 74, "P8_42" => 75,
        "P8_43" => 72, "P8_44" => 73, "P8_45" => 70, "P8_46" => 71,
        "P9_11" => 30, "P9_12" => 60, "P9_13" => 31, "P9_14" => 50,
        "P9_15" => 48, "P9_16" => 51, "P9_17" => 5, "P9_18" => 4,
        "P9_21" => 3, "P9_22" => 2, "P9_23" => 49, "P9_24" => 15,
        "P9_25" => 117, "P9_26" => 14, "P9_27" => 115, "P9_28" => 113,
        "P9_29" => 111, "P9_30" => 112, "P9_31" => 110, "P9_41" => 20,
        "P9_42" => 7,
        _ => {
            return Err(HardwareError::GpioInput {
                pin: pin.to_string(),
                message: "unknown header pin".to_string(),
            })
        }
    };
    Ok(n)
}

fn open_line(pin: &str) -> Result<gpio_cdev::Line, HardwareError> {
    let number = gpio_number(pin)?;
    let mut chip = Chip::new(format!("/dev/gpiochip{}", number / 32))
        .map_err(|e| HardwareError::Gpio(e.to_string()))?;
    chip.get_line(number % 32)
        .map_err(|e| HardwareError::Gpio(e.to_string()))
}

/// Request an output line, initially low.
pub fn request_output(pin: &str) -> Result<GpioOutput, HardwareError> {
    configure_pin(pin, "gpio");
    let handle = open_line(pin)?
        .request(LineRequestFlags::OUTPUT, 0, CONSUMER)
        .map_err(|e| HardwareError::Gpio(e.to_string()))?;
    Ok(GpioOutput {
        pin: pin.to_string(),
        handle,
        level: false,
    })
}

pub struct GpioOutput {
    pin: String,
    handle: LineHandle,
    level: bool,
}

impl OutputPin for GpioOutput {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        self.handle
            .set_value(on as u8)
            .map_err(|e| HardwareError::Gpio(format!("{}: {e}", self.pin)))?;
        self.level = on;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.level
    }
}

/// One-shot level read of an input line (active-low like the monitors).
pub fn read_input(pin: &str) -> Result<bool, HardwareError> {
    let handle = open_line(pin)?
        .request(
            LineRequestFlags::INPUT | LineRequestFlags::ACTIVE_LOW,
            0,
            CONSUMER,
        )
        .map_err(|e| HardwareError::GpioInput {
            pin: pin.to_string(),
            message: e.to_string(),
        })?;
    let value = handle.get_value().map_err(|e| HardwareError::GpioInput {
        pin: pin.to_string(),
        message: e.to_string(),
    })?;
    Ok(value != 0)
}

/// Configure an input line and spawn its edge monitor thread. The thread
/// reads the current level first (delivered as an `initial` edge), then
/// blocks on kernel edge events for the life of the process.
pub fn spawn_edge_monitor(
    pin: &str,
    gpio_mode: &str,
    tx: mpsc::UnboundedSender<Edge>,
) -> Result<(), HardwareError> {
    configure_pin(pin, gpio_mode);
    let line = open_line(pin)?;
    let flags = LineRequestFlags::INPUT | LineRequestFlags::ACTIVE_LOW;
    let events = line
        .events(flags, EventRequestFlags::BOTH_EDGES, CONSUMER)
        .map_err(|e| HardwareError::GpioInput {
            pin: pin.to_string(),
            message: e.to_string(),
        })?;
    let initial = events.get_value().map_err(|e| HardwareError::GpioInput {
        pin: pin.to_string(),
        message: e.to_string(),
    })? != 0;
    let pin_name = pin.to_string();
    std::thread::Builder::new()
        .name(format!("gpio-{pin_name}"))
        .spawn(move || {
            let _ = tx.send(Edge {
                pin: pin_name.clone(),
                level: initial,
                initial: true,
            });
            for event in events {
                match event {
                    Ok(event) => {
                        let level = event.event_type() == EventType::RisingEdge;
                        if tx
                            .send(Edge {
                                pin: pin_name.clone(),
                                level,
                                initial: false,
                            })
                            .is_err()
                        {
                            // Runtime is gone; stop monitoring.
                            return;
                        }
                    }
                    Err(err) => warn!("GPIO event error on {pin_name}: {err}"),
                }
            }
        })
        .map_err(|e| HardwareError::GpioInput {
            pin: pin.to_string(),
            message: e.to_string(),
        })?;
    debug!("Configured edge monitoring for input pin {pin}.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pins_resolve() {
        assert_eq!(gpio_number("P8_07").unwrap(), 66);
        assert_eq!(gpio_number("p9_12").unwrap(), 60);
        assert_eq!(gpio_number("gpio117").unwrap(), 117);
        assert!(gpio_number("P8_01").is_err());
    }
}
