//! Raw SCPI-over-TCP transport (`::SOCKET` resources, conventionally port
//! 5025). A thin byte pipe: no framing, newline is the only end-of-message
//! signal.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::resource::{ResourceDescriptor, Target, RAW_SOCKET_PORT};
use crate::transport::{parse_stb_reply, tcp_connect, ReadTermination, Transport};
use crate::InstrumentError;

/// A connected raw socket.
pub struct RawSocketTransport {
    stream: TcpStream,
}

impl RawSocketTransport {
    /// Connect to `host:port` within `open_timeout`.
    ///
    /// # Errors
    /// Resolution failures, connection refusals, and connect timeouts.
    pub fn open(rsrc: &ResourceDescriptor, open_timeout: Duration) -> Result<Self> {
        let Target::Tcpip { host, port, .. } = &rsrc.target else {
            return Err(InstrumentError::InvalidSetup {
                details: "raw-socket transport requires a TCPIP resource".to_string(),
            });
        };

        let port = if *port == 0 { RAW_SOCKET_PORT } else { *port };
        debug!(host, port, "connecting raw socket");
        let stream = tcp_connect(host, port, open_timeout)?;
        Ok(Self { stream })
    }
}

impl Transport for RawSocketTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let sent = self.stream.write(buf)?;
        Ok(sent)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, ReadTermination)> {
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let received = match self.stream.read(buf) {
            Ok(0) => return Err(InstrumentError::ConnectionLost),
            Ok(n) => n,
            Err(e) => return Err(e.into()),
        };

        let termination = if buf[received - 1] == b'\n' {
            ReadTermination::TermChar
        } else {
            ReadTermination::Complete
        };
        Ok((received, termination))
    }

    /// Emulated with an SCPI `*STB?` query; raw sockets have no
    /// out-of-band status channel.
    fn read_stb(&mut self) -> Result<u16> {
        self.write(b"*STB?\n")?;

        let mut buf = [0u8; 64];
        let (received, _) = self.read(&mut buf, Duration::from_secs(5))?;
        parse_stb_reply(&buf[..received])
    }

    /// Emulated with an SCPI `*CLS`.
    fn clear(&mut self) -> Result<()> {
        self.write(b"*CLS\n")?;
        Ok(())
    }
}
