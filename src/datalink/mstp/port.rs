//! Octet source/sink abstraction over the EIA-485 transceiver.

use std::io;

/// Full-duplex octet channel to the physical bus.
///
/// Implementations wrap the serial port (with the RS-485 direction control
/// handled below this interface). The state machine never blocks on I/O:
/// `read` must return `Ok(0)` when no octets are pending. `WouldBlock` and
/// `TimedOut` errors are treated the same as `Ok(0)` by the node.
pub trait OctetStream: Send {
    /// Non-blocking read of received octets into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one whole encoded frame.
    fn write_all(&mut self, octets: &[u8]) -> io::Result<()>;
}
