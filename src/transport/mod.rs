//! The transport layer: one implementation per physical interface, all
//! behind the [`Transport`] capability trait.
//!
//! A transport is constructed by [`connect`] from a parsed
//! [`ResourceDescriptor`] and owns its OS handle (socket, USB handle,
//! serial port, GPIB descriptor) exclusively; dropping the transport
//! releases the handle.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::Result;
use crate::resource::{ResourceDescriptor, Target};
use crate::{InstrumentError, Status};

pub mod gpib;
pub mod hislip;
pub mod raw_socket;
pub mod serial;
pub mod usbtmc;
pub mod vxi11;

/// Why a read stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTermination {
    /// The device ended the message (END/EOM indication or short reply).
    Complete,
    /// The device signalled the termination character / end-of-message
    /// marker for the transfer.
    TermChar,
    /// The caller's buffer filled before the message ended.
    MaxCount,
}

impl ReadTermination {
    /// The informational status code corresponding to this termination.
    #[must_use]
    pub const fn status(self) -> Status {
        match self {
            Self::Complete => Status::Success,
            Self::TermChar => Status::TermCharReceived,
            Self::MaxCount => Status::MaxCountReached,
        }
    }
}

/// The capability set every interface implementation provides.
///
/// Reads and writes are blocking; reads are bounded by the timeout passed
/// per call (sessions pass their `timeout_ms` attribute).
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Write `buf` to the device, returning the number of payload bytes
    /// accepted.
    ///
    /// # Errors
    /// Transport-specific I/O and protocol failures.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// # Errors
    /// [`InstrumentError::Timeout`] when no data arrives in time, plus
    /// transport-specific I/O and protocol failures.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, ReadTermination)>;

    /// Read the IEEE-488 status byte.
    ///
    /// # Errors
    /// Transport-specific I/O and protocol failures.
    fn read_stb(&mut self) -> Result<u16>;

    /// Send a device-clear, flushing the device's I/O buffers.
    ///
    /// # Errors
    /// Transport-specific I/O and protocol failures.
    fn clear(&mut self) -> Result<()>;
}

/// Select and open the transport for a parsed resource.
///
/// # Errors
/// Whatever the selected transport's handshake can produce: resolution and
/// connection failures, timeouts, and protocol errors.
pub fn connect(
    rsrc: &ResourceDescriptor,
    open_timeout: Duration,
) -> Result<Box<dyn Transport + Send>> {
    Ok(match &rsrc.target {
        Target::Tcpip { is_hislip: true, .. } => {
            Box::new(hislip::HislipTransport::open(rsrc, open_timeout)?)
        }
        Target::Tcpip {
            is_raw_socket: true,
            ..
        } => Box::new(raw_socket::RawSocketTransport::open(rsrc, open_timeout)?),
        Target::Tcpip { .. } => Box::new(vxi11::Vxi11Transport::open(rsrc, open_timeout)?),
        Target::Usb { .. } => Box::new(usbtmc::UsbtmcTransport::open(rsrc, open_timeout)?),
        Target::Asrl { .. } => Box::new(serial::SerialTransport::open(rsrc, open_timeout)?),
        Target::Gpib { .. } => Box::new(gpib::GpibTransport::open(rsrc, open_timeout)?),
    })
}

/// Resolve `host:port` and connect with a bounded timeout, preferring IPv4
/// (instruments overwhelmingly advertise IPv4). `TCP_NODELAY` is enabled on
/// the returned stream.
pub(crate) fn tcp_connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| InstrumentError::ResourceNotFound {
            details: format!("unable to resolve '{host}': {e}"),
        })?
        .collect();

    let addr = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .ok_or_else(|| InstrumentError::ResourceNotFound {
            details: format!("'{host}' resolved to no addresses"),
        })?;

    let stream = TcpStream::connect_timeout(addr, timeout)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Clamp a [`Duration`] into the millisecond range protocol headers carry.
pub(crate) fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// Parse the ASCII integer at the front of an `*STB?` reply. Shared by the
/// transports that emulate the status byte over SCPI (raw socket, serial).
pub(crate) fn parse_stb_reply(reply: &[u8]) -> Result<u16> {
    let text = std::str::from_utf8(reply).map_err(|_| InstrumentError::InvalidFormat {
        details: "non-ASCII *STB? reply".to_string(),
    })?;
    let digits: &str = text
        .trim_start()
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("");
    digits
        .parse::<u16>()
        .map_err(|_| InstrumentError::InvalidFormat {
            details: format!("unparsable *STB? reply: {text:?}"),
        })
}

#[cfg(test)]
mod unit {
    use super::{parse_stb_reply, timeout_ms, ReadTermination};
    use crate::Status;
    use std::time::Duration;

    #[test]
    fn termination_maps_to_informational_statuses() {
        assert_eq!(ReadTermination::Complete.status(), Status::Success);
        assert_eq!(ReadTermination::TermChar.status(), Status::TermCharReceived);
        assert_eq!(ReadTermination::MaxCount.status(), Status::MaxCountReached);
    }

    #[test]
    fn oversized_timeouts_saturate() {
        assert_eq!(timeout_ms(Duration::from_millis(2000)), 2000);
        assert_eq!(timeout_ms(Duration::from_secs(u64::MAX / 2)), u32::MAX);
    }

    #[test]
    fn stb_replies_parse_leading_digits() {
        assert_eq!(parse_stb_reply(b"16\n").unwrap(), 16);
        assert_eq!(parse_stb_reply(b"0").unwrap(), 0);
        assert_eq!(parse_stb_reply(b"68\r\n").unwrap(), 68);
    }

    #[test]
    fn garbage_stb_replies_are_invalid_format() {
        assert!(parse_stb_reply(b"ERR\n").is_err());
        assert!(parse_stb_reply(b"").is_err());
    }
}
