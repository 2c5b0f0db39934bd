//! Serial transportation.
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Error, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::Transport;

/// All Kitsrus boards talk at this rate; it is not negotiable.
const BAUD_RATE: u32 = 19200;
const SERIAL_TIMEOUT_MS: u64 = 1000;

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str) -> Result<SerialTransport> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, BAUD_RATE);
        let port = serialport::new(port, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        Ok(SerialTransport { serial_port: port })
    }

    pub fn open_nth(nth: usize) -> Result<SerialTransport> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name),
            None => Err(Error::msg("No serial ports found!")),
        }
    }

    pub fn open_any() -> Result<SerialTransport> {
        Self::open_nth(0)
    }
}

impl Transport for SerialTransport {
    fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.serial_port.write_all(&[byte])?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.serial_port.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn set_power_line(&mut self, level: bool) -> Result<()> {
        self.serial_port.write_data_terminal_ready(level)?;
        Ok(())
    }
}
