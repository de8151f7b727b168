//! VXI-11 core-channel transport (VXI-11 rev. 1.0, ONC-RPC program
//! `0x0607AF` v1), implemented directly over TCP.
//!
//! Open sequence: portmapper GETPORT on port 111 yields the core-service
//! port, then `create_link` on that port yields the device link. Reads and
//! writes are chunked to the link's advertised `max_recv_size`.

use std::io::Cursor;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::Result;
use crate::resource::{ResourceDescriptor, Target, PORTMAPPER_PORT};
use crate::transport::{timeout_ms, ReadTermination, Transport};
use crate::InstrumentError;

pub mod rpc;
pub mod xdr;

const CORE_PROGRAM: u32 = 0x0006_07AF;
const CORE_VERSION: u32 = 1;

const PROC_CREATE_LINK: u32 = 10;
const PROC_DEVICE_WRITE: u32 = 11;
const PROC_DEVICE_READ: u32 = 12;
const PROC_DEVICE_READSTB: u32 = 13;
const PROC_DEVICE_CLEAR: u32 = 15;
const PROC_DESTROY_LINK: u32 = 23;

/// Device_Flags: END indicator on the final write chunk.
const FLAG_END: u32 = 0x08;

/// device_read reply reason bits.
const REASON_REQCNT: u32 = 0x01;
const REASON_CHR: u32 = 0x02;
const REASON_END: u32 = 0x04;

/// The write vtable carries no timeout argument; use a fixed deadline.
const WRITE_IO_TIMEOUT_MS: u32 = 10_000;
/// io_timeout for single-shot procedures (readstb, clear).
const CONTROL_IO_TIMEOUT_MS: u32 = 5_000;

/// Extra slack added to the device io_timeout for the RPC round trip.
const RPC_SLACK: Duration = Duration::from_secs(2);

const DEFAULT_MAX_RECV_SIZE: u32 = 65_536;

/// A VXI-11 core-channel link to one LAN device.
pub struct Vxi11Transport {
    client: rpc::RpcClient,
    link_id: i32,
    max_recv_size: u32,
}

fn device_error(procedure: &str, error: i32) -> InstrumentError {
    InstrumentError::ProtocolError {
        details: format!("{procedure} returned device error {error}"),
    }
}

impl Vxi11Transport {
    /// Open a link to the descriptor's LAN device.
    ///
    /// The portmapper on port 111 is consulted for the core-service port
    /// unless the resource string carried a port override, which is then
    /// used as the core port directly.
    ///
    /// # Errors
    /// Resolution/connection failures, portmapper misses, timeouts, and a
    /// nonzero `create_link` device error.
    pub fn open(rsrc: &ResourceDescriptor, open_timeout: Duration) -> Result<Self> {
        let Target::Tcpip {
            host,
            port,
            device_name,
            ..
        } = &rsrc.target
        else {
            return Err(InstrumentError::InvalidSetup {
                details: "VXI-11 transport requires a TCPIP resource".to_string(),
            });
        };

        let core_port = if *port == PORTMAPPER_PORT || *port == 0 {
            rpc::get_port(host, PORTMAPPER_PORT, CORE_PROGRAM, CORE_VERSION, open_timeout)?
        } else {
            *port
        };
        debug!(%host, core_port, %device_name, "connecting VXI-11 core channel");

        let mut client =
            rpc::RpcClient::connect(host, core_port, CORE_PROGRAM, CORE_VERSION, open_timeout)?;

        let mut params = Vec::with_capacity(16 + device_name.len());
        xdr::put_i32(&mut params, 0); // client id
        xdr::put_i32(&mut params, 0); // lock_device = false
        xdr::put_u32(&mut params, 0); // lock_timeout
        xdr::put_string(&mut params, device_name);

        let result = client.call(PROC_CREATE_LINK, &params, open_timeout)?;
        let mut cursor = Cursor::new(result.as_slice());
        let error = xdr::get_i32(&mut cursor)?;
        let link_id = xdr::get_i32(&mut cursor)?;
        let _abort_port = xdr::get_u32(&mut cursor)?;
        let max_recv_size = xdr::get_u32(&mut cursor)?;

        if error != 0 {
            return Err(InstrumentError::ConnectionLost);
        }

        Ok(Self {
            client,
            link_id,
            max_recv_size: if max_recv_size == 0 {
                DEFAULT_MAX_RECV_SIZE
            } else {
                max_recv_size
            },
        })
    }
}

impl Transport for Vxi11Transport {
    /// `device_write`, chunked to `max_recv_size` with the END flag on the
    /// final chunk only.
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let deadline = Duration::from_millis(u64::from(WRITE_IO_TIMEOUT_MS)) + RPC_SLACK;
        let mut written = 0usize;

        while written < buf.len() {
            let chunk_len = (buf.len() - written).min(self.max_recv_size as usize);
            let chunk = &buf[written..written + chunk_len];
            let is_last = written + chunk_len >= buf.len();

            let mut params = Vec::with_capacity(20 + chunk_len + 4);
            xdr::put_i32(&mut params, self.link_id);
            xdr::put_u32(&mut params, WRITE_IO_TIMEOUT_MS);
            xdr::put_u32(&mut params, 0); // lock_timeout
            xdr::put_u32(&mut params, if is_last { FLAG_END } else { 0 });
            xdr::put_opaque(&mut params, chunk);

            let result = self.client.call(PROC_DEVICE_WRITE, &params, deadline)?;
            let mut cursor = Cursor::new(result.as_slice());
            let error = xdr::get_i32(&mut cursor)?;
            let size = xdr::get_u32(&mut cursor)? as usize;

            if error != 0 {
                return Err(device_error("device_write", error));
            }
            written += size;
            trace!(size, written, total = buf.len(), "device_write chunk");
            if size == 0 {
                // Zero-byte progress: stop instead of spinning on a
                // misbehaving device.
                break;
            }
        }

        Ok(written)
    }

    /// `device_read` in a loop, stopping on an END/CHR/REQCNT reason or on
    /// a short reply.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, ReadTermination)> {
        let io_timeout = timeout_ms(timeout);
        let deadline = timeout + RPC_SLACK;
        let mut total = 0usize;
        let mut termination = ReadTermination::Complete;

        while total < buf.len() {
            let request_size =
                u32::try_from(buf.len() - total).unwrap_or(u32::MAX).min(self.max_recv_size);

            let mut params = Vec::with_capacity(24);
            xdr::put_i32(&mut params, self.link_id);
            xdr::put_u32(&mut params, request_size);
            xdr::put_u32(&mut params, io_timeout);
            xdr::put_u32(&mut params, 0); // lock_timeout
            xdr::put_u32(&mut params, 0); // flags
            xdr::put_i32(&mut params, 0); // term_char (unused)

            let result = self.client.call(PROC_DEVICE_READ, &params, deadline)?;
            let mut cursor = Cursor::new(result.as_slice());
            let error = xdr::get_i32(&mut cursor)?;
            let reason = xdr::get_u32(&mut cursor)?;

            if error != 0 {
                return Err(device_error("device_read", error));
            }

            let data = xdr::get_opaque(&mut cursor)?;
            let copy_len = data.len().min(buf.len() - total);
            buf[total..total + copy_len].copy_from_slice(&data[..copy_len]);
            total += copy_len;
            trace!(reason, len = data.len(), total, "device_read chunk");

            if reason & (REASON_END | REASON_CHR) != 0 {
                termination = ReadTermination::TermChar;
                break;
            }
            if reason & REASON_REQCNT != 0 {
                termination = ReadTermination::MaxCount;
                break;
            }
            // A short reply without a reason means the device is done.
            if data.len() < request_size as usize {
                break;
            }
        }

        Ok((total, termination))
    }

    /// `device_readstb`: the serial-poll byte is the low 8 bits of the
    /// returned word.
    fn read_stb(&mut self) -> Result<u16> {
        let mut params = Vec::with_capacity(16);
        xdr::put_i32(&mut params, self.link_id);
        xdr::put_u32(&mut params, 0); // flags
        xdr::put_u32(&mut params, 0); // lock_timeout
        xdr::put_u32(&mut params, CONTROL_IO_TIMEOUT_MS);

        let deadline = Duration::from_millis(u64::from(CONTROL_IO_TIMEOUT_MS)) + RPC_SLACK;
        let result = self.client.call(PROC_DEVICE_READSTB, &params, deadline)?;
        let mut cursor = Cursor::new(result.as_slice());
        let error = xdr::get_i32(&mut cursor)?;
        let stb = xdr::get_u32(&mut cursor)?;

        if error != 0 {
            return Err(device_error("device_readstb", error));
        }
        Ok((stb & 0xFF) as u16)
    }

    /// `device_clear`: selected device clear.
    fn clear(&mut self) -> Result<()> {
        let mut params = Vec::with_capacity(16);
        xdr::put_i32(&mut params, self.link_id);
        xdr::put_u32(&mut params, 0); // flags
        xdr::put_u32(&mut params, 0); // lock_timeout
        xdr::put_u32(&mut params, CONTROL_IO_TIMEOUT_MS);

        let deadline = Duration::from_millis(u64::from(CONTROL_IO_TIMEOUT_MS)) + RPC_SLACK;
        let result = self.client.call(PROC_DEVICE_CLEAR, &params, deadline)?;
        let error = xdr::get_i32(&mut Cursor::new(result.as_slice()))?;

        if error != 0 {
            return Err(device_error("device_clear", error));
        }
        Ok(())
    }
}

impl Drop for Vxi11Transport {
    fn drop(&mut self) {
        // Best-effort destroy_link; the socket closes regardless.
        let mut params = Vec::with_capacity(4);
        xdr::put_i32(&mut params, self.link_id);
        let _ = self
            .client
            .call(PROC_DESTROY_LINK, &params, Duration::from_secs(2));
    }
}
