//! Abstract programmer transport interface.
use anyhow::Result;

pub use self::serial::SerialTransport;

mod serial;

/// The byte channel and control line under the protocol driver.
///
/// The driver owns exactly one transport for the lifetime of a programming
/// action; reads block until the transport's own timeout expires.
pub trait Transport {
    fn write_byte(&mut self, byte: u8) -> Result<()>;
    fn read_byte(&mut self) -> Result<u8>;
    /// Drive the power-control line (DTR on real hardware).
    fn set_power_line(&mut self, level: bool) -> Result<()>;
}
