// Byte transport to the ESC: the `Transport` contract and its serial implementation

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Read timeout; reads are only issued for bytes already buffered by the driver
pub const DEFAULT_TIMEOUT_MS: u64 = 10;

/// Error types for the ESC link
#[derive(Debug, thiserror::Error)]
pub enum EscError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EscError>;

/// Non-blocking byte pipe to the ESC
pub trait Transport {
    /// Everything received since the last call; empty if nothing is pending
    fn read_available(&mut self) -> Result<Vec<u8>>;

    /// Best-effort write, no flow control
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
}

/// ESC serial link (8N1)
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self> {
        debug!("Opening {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn read_available(&mut self) -> Result<Vec<u8>> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; pending];
        let n = self.port.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }
}
