//! RS-232 serial (ASRL) transport.
//!
//! Ports open raw at 9600-8-N-1 with no flow control. Serial instruments
//! have no hardware status-byte facility, so `read_stb` and `clear` are
//! SCPI emulations (`*STB?` / `*CLS`) and assume an SCPI-speaking device.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::error::Result;
use crate::resource::{ResourceDescriptor, Target};
use crate::transport::{parse_stb_reply, ReadTermination, Transport};
use crate::InstrumentError;

const DEFAULT_BAUD: u32 = 9600;
const STB_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolve an `ASRL<n>` number to the platform device node.
fn platform_device_path(com_port: u32) -> String {
    #[cfg(windows)]
    {
        // COM ports above 9 need the device-namespace form.
        if com_port > 9 {
            format!(r"\\.\COM{com_port}")
        } else {
            format!("COM{com_port}")
        }
    }
    #[cfg(target_os = "macos")]
    {
        format!("/dev/tty.serial{}", com_port - 1)
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        format!("/dev/ttyS{}", com_port - 1)
    }
}

/// An open serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open the named port raw at 9600-8-N-1.
    ///
    /// # Errors
    /// [`InstrumentError::ResourceNotFound`] when the device node does not
    /// exist, plus serial stack errors while configuring it.
    pub fn open(rsrc: &ResourceDescriptor, open_timeout: Duration) -> Result<Self> {
        let Target::Asrl {
            com_port,
            device_path,
        } = &rsrc.target
        else {
            return Err(InstrumentError::InvalidSetup {
                details: "serial transport requires an ASRL resource".to_string(),
            });
        };

        let path = match device_path {
            Some(path) => path.clone(),
            None if *com_port == 0 => {
                return Err(InstrumentError::InvalidResourceName(rsrc.raw().to_string()));
            }
            None => platform_device_path(*com_port),
        };
        debug!(%path, "opening serial port");

        let port = serialport::new(&path, DEFAULT_BAUD)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(open_timeout.max(Duration::from_millis(1)))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => InstrumentError::ResourceNotFound {
                    details: format!("serial port '{path}' not found"),
                },
                serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                    InstrumentError::ResourceNotFound {
                        details: format!("serial port '{path}' not found"),
                    }
                }
                _ => e.into(),
            })?;

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let written = self.port.write(buf)?;
        Ok(written)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, ReadTermination)> {
        self.port
            .set_timeout(timeout.max(Duration::from_millis(1)))?;

        let received = match self.port.read(buf) {
            Ok(0) => return Err(InstrumentError::Timeout),
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

    /// Emulated serial poll: writes `*STB?` and parses the ASCII reply.
    /// Non-SCPI serial instruments cannot be status-polled.
    fn read_stb(&mut self) -> Result<u16> {
        self.write(b"*STB?\n")?;

        let mut buf = [0u8; 64];
        let (received, _) = self.read(&mut buf, STB_REPLY_TIMEOUT)?;
        parse_stb_reply(&buf[..received])
    }

    /// Emulated device clear: writes `*CLS`.
    fn clear(&mut self) -> Result<()> {
        self.write(b"*CLS\n")?;
        Ok(())
    }
}
