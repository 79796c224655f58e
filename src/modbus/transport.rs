//! Serial Modbus-RTU transport.
//!
//! One serial port, one client context, one mutex: every read and write on
//! the bus serializes here, whether it comes from a coordinator refresh, an
//! MQTT write or a CLI helper.

use crate::config::UartConfig;
use crate::error::ModbusError;
use crate::modbus::{RegisterType, ValueType};
use log::debug;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_modbus::client::{rtu, Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};
use tokio_serial::SerialStream;

pub struct ModbusTransport {
    ctx: Mutex<Context>,
    timeout: Duration,
}

fn io_error(err: impl std::fmt::Display) -> ModbusError {
    ModbusError::Io(err.to_string())
}

impl ModbusTransport {
    pub fn open(config: &UartConfig) -> Result<Self, ModbusError> {
        let path = config.device_path();
        debug!(
            "Setting UART for modbus communication: {path} with baudrate {}, parity {}, stopbits {}, bytesize {}",
            config.baudrate, config.parity, config.stopbits, config.bytesize
        );
        let parity = match config.parity.as_str() {
            "E" | "e" => tokio_serial::Parity::Even,
            "O" | "o" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };
        let stop_bits = if config.stopbits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        };
        let data_bits = match config.bytesize {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let builder = tokio_serial::new(path, config.baudrate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits);
        let port = SerialStream::open(&builder).map_err(io_error)?;
        Ok(ModbusTransport {
            ctx: Mutex::new(rtu::attach(port)),
            timeout: config.timeout.as_duration(),
        })
    }

    /// Read a register bank. All kinds normalize to `u16` words.
    pub async fn read_registers(
        &self,
        unit: u8,
        address: u16,
        count: u16,
        kind: RegisterType,
    ) -> Result<Vec<u16>, ModbusError> {
        let mut ctx = self.ctx.lock().await;
        ctx.set_slave(Slave(unit));
        debug!("Reading {count} registers from {address} with method {kind:?} from device {unit}.");
        let read = async {
            match kind {
                RegisterType::Input => ctx.read_input_registers(address, count).await,
                RegisterType::Holding => ctx.read_holding_registers(address, count).await,
                RegisterType::Coil => ctx
                    .read_coils(address, count)
                    .await
                    .map(|bits| bits.into_iter().map(u16::from).collect()),
            }
        };
        match tokio::time::timeout(self.timeout, read).await {
            Err(_) => Err(ModbusError::Timeout),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::TimedOut => {
                Err(ModbusError::Timeout)
            }
            Ok(Err(err)) => Err(io_error(err)),
            Ok(Ok(registers)) => Ok(registers),
        }
    }

    /// Read and decode one typed value.
    pub async fn read_and_decode(
        &self,
        unit: u8,
        address: u16,
        value_type: ValueType,
        kind: RegisterType,
    ) -> Result<f64, ModbusError> {
        let registers = self
            .read_registers(unit, address, value_type.register_count() as u16, kind)
            .await?;
        decode_value(&registers, value_type)
    }

    pub async fn write_register(
        &self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        let mut ctx = self.ctx.lock().await;
        ctx.set_slave(Slave(unit));
        debug!("Writing register {address} with value {value} to device {unit}.");
        match tokio::time::timeout(self.timeout, ctx.write_single_register(address, value)).await {
            Err(_) => Err(ModbusError::Timeout),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::TimedOut => {
                Err(ModbusError::Timeout)
            }
            Ok(Err(err)) => Err(io_error(err)),
            Ok(Ok(())) => Ok(()),
        }
    }
}

/// Decode raw registers into a scalar according to the value type.
pub fn decode_value(registers: &[u16], value_type: ValueType) -> Result<f64, ModbusError> {
    let need = value_type.register_count();
    if registers.len() < need {
        return Err(ModbusError::Decode(registers.len()));
    }
    let dword = |words: [u16; 2]| ((words[0] as u32) << 16) | words[1] as u32;
    let qword = |words: [u16; 4]| {
        ((words[0] as u64) << 48)
            | ((words[1] as u64) << 32)
            | ((words[2] as u64) << 16)
            | words[3] as u64
    };
    let value = match value_type {
        ValueType::UWord => registers[0] as f64,
        ValueType::SWord => registers[0] as i16 as f64,
        ValueType::UDword => dword([registers[0], registers[1]]) as f64,
        ValueType::UDwordR => dword([registers[1], registers[0]]) as f64,
        ValueType::SDword => dword([registers[0], registers[1]]) as i32 as f64,
        ValueType::SDwordR => dword([registers[1], registers[0]]) as i32 as f64,
        ValueType::UQword => {
            qword([registers[0], registers[1], registers[2], registers[3]]) as f64
        }
        ValueType::UQwordR => {
            qword([registers[3], registers[2], registers[1], registers[0]]) as f64
        }
        ValueType::SQword => {
            qword([registers[0], registers[1], registers[2], registers[3]]) as i64 as f64
        }
        ValueType::Fp32 => f32::from_bits(dword([registers[0], registers[1]])) as f64,
        ValueType::Fp32R => f32::from_bits(dword([registers[1], registers[0]])) as f64,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::ReturnType;

    #[test]
    fn words_decode_with_sign() {
        assert_eq!(decode_value(&[50], ValueType::UWord).unwrap(), 50.0);
        assert_eq!(decode_value(&[0xFFFF], ValueType::SWord).unwrap(), -1.0);
    }

    #[test]
    fn dwords_decode_in_both_word_orders() {
        let regs = [0x0001, 0x0002];
        assert_eq!(decode_value(&regs, ValueType::UDword).unwrap(), 65538.0);
        assert_eq!(decode_value(&regs, ValueType::UDwordR).unwrap(), 131073.0);
        assert_eq!(
            decode_value(&[0xFFFF, 0xFFFE], ValueType::SDword).unwrap(),
            -2.0
        );
    }

    #[test]
    fn fp32_decodes_ieee() {
        // 42.5f32 = 0x422A0000
        let regs = [0x422A, 0x0000];
        assert!((decode_value(&regs, ValueType::Fp32).unwrap() - 42.5).abs() < 1e-6);
        let swapped = [0x0000, 0x422A];
        assert!((decode_value(&swapped, ValueType::Fp32R).unwrap() - 42.5).abs() < 1e-6);
    }

    #[test]
    fn qword_decodes() {
        let regs = [0, 0, 0, 7];
        assert_eq!(decode_value(&regs, ValueType::UQword).unwrap(), 7.0);
        assert_eq!(decode_value(&regs, ValueType::UQwordR).unwrap(), 7.0 * 281_474_976_710_656.0);
    }

    #[test]
    fn short_payload_is_an_error() {
        assert!(decode_value(&[1], ValueType::Fp32).is_err());
    }

    #[test]
    fn legacy_converters() {
        let bank = [0u16, 1234, 0];
        assert_eq!(
            ReturnType::Multiply0_1.convert(&bank, 100, 101).unwrap(),
            123.4
        );
        assert_eq!(ReturnType::Regular.convert(&bank, 100, 101).unwrap(), 1234.0);
        assert!(ReturnType::Regular.convert(&bank, 100, 99).is_none());
    }
}
