//! Minimal ONC-RPC (RFC 5531) client machinery: TCP record marking, the
//! 40-byte AUTH_NULL call header, reply validation, and the portmapper
//! GETPORT query. No external RPC library is involved.

use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::trace;

use super::xdr;
use crate::error::Result;
use crate::transport::tcp_connect;
use crate::InstrumentError;

const RPC_CALL: u32 = 0;
const RPC_REPLY: u32 = 1;
const RPC_VERSION: u32 = 2;
const MSG_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const AUTH_NULL: u32 = 0;

pub const PORTMAP_PROGRAM: u32 = 100_000;
pub const PORTMAP_VERSION: u32 = 2;
const PORTMAP_PROC_GETPORT: u32 = 3;
const IPPROTO_TCP: u32 = 6;

const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Sanity bound on a reassembled record; no VXI-11 reply comes close.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

fn protocol_error(details: impl Into<String>) -> InstrumentError {
    InstrumentError::ProtocolError {
        details: details.into(),
    }
}

/// Append the 40-byte ONC-RPC call header:
/// `{xid, CALL, rpcvers=2, prog, vers, proc, AUTH_NULL cred, AUTH_NULL verf}`.
pub fn put_call_header(buf: &mut Vec<u8>, xid: u32, program: u32, version: u32, procedure: u32) {
    xdr::put_u32(buf, xid);
    xdr::put_u32(buf, RPC_CALL);
    xdr::put_u32(buf, RPC_VERSION);
    xdr::put_u32(buf, program);
    xdr::put_u32(buf, version);
    xdr::put_u32(buf, procedure);
    // AUTH_NULL credential
    xdr::put_u32(buf, AUTH_NULL);
    xdr::put_u32(buf, 0);
    // AUTH_NULL verifier
    xdr::put_u32(buf, AUTH_NULL);
    xdr::put_u32(buf, 0);
}

/// Send `msg` as a single-fragment record: a 4-byte mark with bit 31 set
/// (last fragment) and bits 30..0 carrying the length, then the payload.
pub fn rm_send<W: Write>(writer: &mut W, msg: &[u8]) -> Result<()> {
    let len = u32::try_from(msg.len()).map_err(|_| InstrumentError::InvalidSetup {
        details: "RPC message exceeds the record-mark length field".to_string(),
    })?;
    writer.write_all(&(LAST_FRAGMENT | len).to_be_bytes())?;
    writer.write_all(msg)?;
    Ok(())
}

/// Reassemble one complete record, concatenating fragments until the
/// last-fragment bit is seen.
pub fn rm_recv_record<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut record = Vec::new();
    loop {
        let mut mark = [0u8; 4];
        reader.read_exact(&mut mark)?;
        let mark = u32::from_be_bytes(mark);
        let last = mark & LAST_FRAGMENT != 0;
        let frag_len = (mark & !LAST_FRAGMENT) as usize;

        if record.len() + frag_len > MAX_RECORD_LEN {
            return Err(protocol_error("RPC record exceeds sanity bound"));
        }

        let start = record.len();
        record.resize(start + frag_len, 0);
        reader.read_exact(&mut record[start..])?;

        if last {
            return Ok(record);
        }
    }
}

/// Receive one record from a socket with a bounded deadline.
fn rm_recv(stream: &mut TcpStream, timeout: Duration) -> Result<Vec<u8>> {
    stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
    rm_recv_record(stream)
}

/// Validate an RPC reply header and return the byte offset of the
/// procedure result data.
///
/// Expected layout: `xid, REPLY, MSG_ACCEPTED, verf{flavor,len,body},
/// ACCEPT_SUCCESS, <result>`. The verifier body is skipped with its 4-byte
/// padding.
pub fn parse_reply(reply: &[u8], expected_xid: u32) -> Result<usize> {
    let mut cursor = Cursor::new(reply);

    let xid = xdr::get_u32(&mut cursor)?;
    if xid != expected_xid {
        return Err(protocol_error(format!(
            "RPC reply xid {xid:#x} does not match call xid {expected_xid:#x}"
        )));
    }

    let msg_type = xdr::get_u32(&mut cursor)?;
    if msg_type != RPC_REPLY {
        return Err(protocol_error(format!(
            "unexpected RPC message type {msg_type}"
        )));
    }

    let reply_stat = xdr::get_u32(&mut cursor)?;
    if reply_stat != MSG_ACCEPTED {
        return Err(protocol_error("RPC call was rejected"));
    }

    let _verf_flavor = xdr::get_u32(&mut cursor)?;
    let verf_len = xdr::get_u32(&mut cursor)? as usize;
    xdr::skip_padded(&mut cursor, verf_len)?;

    let accept_stat = xdr::get_u32(&mut cursor)?;
    if accept_stat != ACCEPT_SUCCESS {
        return Err(protocol_error(format!(
            "RPC accept status {accept_stat} is not success"
        )));
    }

    Ok(usize::try_from(cursor.position()).unwrap_or(reply.len()))
}

/// A connected ONC-RPC client for one `(program, version)` pair.
pub struct RpcClient {
    stream: TcpStream,
    program: u32,
    version: u32,
    xid: u32,
}

impl RpcClient {
    /// Connect to `host:port` with a bounded open timeout.
    ///
    /// # Errors
    /// Resolution failures, connect timeouts, and socket errors.
    pub fn connect(
        host: &str,
        port: u16,
        program: u32,
        version: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let stream = tcp_connect(host, port, timeout)?;
        // Rolling transaction ID; the seed only needs to differ between
        // client incarnations, not be unpredictable.
        let xid = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(1, |d| d.subsec_nanos() | 1);
        Ok(Self {
            stream,
            program,
            version,
            xid,
        })
    }

    /// Issue one call and return the validated procedure result bytes.
    ///
    /// # Errors
    /// I/O failures, timeouts, and any RPC-level reply mismatch
    /// (classified as protocol errors).
    pub fn call(&mut self, procedure: u32, params: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let xid = self.xid;
        self.xid = self.xid.wrapping_add(1);

        let mut msg = Vec::with_capacity(40 + params.len());
        put_call_header(&mut msg, xid, self.program, self.version, procedure);
        msg.extend_from_slice(params);

        trace!(procedure, xid, len = msg.len(), "RPC call");
        rm_send(&mut self.stream, &msg)?;

        let reply = rm_recv(&mut self.stream, timeout)?;
        let offset = parse_reply(&reply, xid)?;
        Ok(reply[offset..].to_vec())
    }
}

/// Query the portmapper at `host:portmap_port` for the TCP port of
/// `(program, version)`. The connection is transient.
///
/// # Errors
/// [`InstrumentError::ResourceNotFound`] when the program is unregistered,
/// plus connection and protocol failures.
pub fn get_port(
    host: &str,
    portmap_port: u16,
    program: u32,
    version: u32,
    timeout: Duration,
) -> Result<u16> {
    let mut client = RpcClient::connect(host, portmap_port, PORTMAP_PROGRAM, PORTMAP_VERSION, timeout)?;

    let mut params = Vec::with_capacity(16);
    xdr::put_u32(&mut params, program);
    xdr::put_u32(&mut params, version);
    xdr::put_u32(&mut params, IPPROTO_TCP);
    xdr::put_u32(&mut params, 0);

    let result = client.call(PORTMAP_PROC_GETPORT, &params, timeout)?;
    let port = xdr::get_u32(&mut Cursor::new(result.as_slice()))?;
    trace!(program, port, "portmapper GETPORT");

    if port == 0 || port > u32::from(u16::MAX) {
        return Err(InstrumentError::ResourceNotFound {
            details: format!("portmapper has no TCP registration for program {program:#x}"),
        });
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(port as u16)
}
