//! Error taxonomy.
//!
//! Driver-level failures are recovered locally: the affected entity is
//! degraded or skipped and the process continues. Configuration errors are
//! fatal at startup. Signals run the sigterm chain to completion.

use thiserror::Error;

/// Errors raised while talking to local hardware (I2C, GPIO, sysfs).
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("I2C error: {0}")]
    I2c(String),
    #[error("GPIO input error on {pin}: {message}")]
    GpioInput { pin: String, message: String },
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error("1-wire error: {0}")]
    OneWire(String),
    #[error("ADC error: {0}")]
    Adc(String),
}

/// Errors raised by the Modbus transport.
#[derive(Debug, Error)]
pub enum ModbusError {
    #[error("modbus I/O error: {0}")]
    Io(String),
    #[error("modbus request timed out")]
    Timeout,
    #[error("modbus exception: {0}")]
    Protocol(String),
    #[error("modbus operation cancelled")]
    Cancelled,
    #[error("unsupported value type for {0} registers")]
    Decode(usize),
}

/// Fatal configuration problems, raised during startup only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid config: {0}")]
    Parse(String),
    #[error("unknown {kind} reference {id:?}")]
    UnknownReference { kind: &'static str, id: String },
    #[error("cover {id}: {message}")]
    Cover { id: String, message: String },
    #[error("invalid formula {formula:?}: {message}")]
    Formula { formula: String, message: String },
    #[error("modbus device descriptor {model:?}: {message}")]
    Descriptor { model: String, message: String },
    #[error("invalid time period {0:?}")]
    TimePeriod(String),
}

