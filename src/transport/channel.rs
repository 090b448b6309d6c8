//! Byte-level channel abstraction for the device link.
//!
//! The protocol logic is written against [`Channel`] so it can be driven by
//! an in-memory scripted channel in tests; [`SerialChannel`] is the real
//! implementation over a serial port.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

/// A half-duplex byte channel with a drainable input side.
pub trait Channel {
    /// Send bytes, completely.
    fn send_bytes(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read whatever input is pending, without blocking for more.
    ///
    /// Returns 0 when nothing is waiting.
    fn recv_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Throw away any pending input (stale partial responses).
    fn discard_input(&mut self) -> io::Result<()>;
}

fn to_io(err: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Exclusive handle over one serial port.
///
/// Dropping the channel closes the port; a read pending on the underlying
/// device at that point fails as a closed-channel I/O error.
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Open the port at the given baud rate.
    pub fn open(path: &str, baud: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(50))
            .open()?;
        log::debug!("opened serial port {path} at {baud} baud");
        Ok(SerialChannel { port })
    }
}

impl Channel for SerialChannel {
    fn send_bytes(&mut self, data: &[u8]) -> io::Result<usize> {
        self.port.write_all(data)?;
        Ok(data.len())
    }

    fn recv_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pending = self.port.bytes_to_read().map_err(to_io)? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let want = pending.min(buf.len());
        self.port.read(&mut buf[..want])
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(to_io)
    }
}
