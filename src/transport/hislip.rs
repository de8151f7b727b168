//! HiSLIP transport (IVI-6.1): a binary framed, dual-channel protocol over
//! TCP port 4880.
//!
//! Every message carries a 16-byte header — `'H' 'S'`, message type,
//! control code, a big-endian 32-bit message parameter, and a big-endian
//! 64-bit payload length — followed by the payload. The synchronous
//! channel carries data; the asynchronous channel carries status queries
//! and device clear.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use tracing::{debug, trace};

use crate::error::Result;
use crate::resource::{ResourceDescriptor, Target};
use crate::transport::{tcp_connect, ReadTermination, Transport};
use crate::InstrumentError;

/// Fixed size of every HiSLIP message header.
pub const HEADER_LEN: usize = 16;

const PROLOGUE: [u8; 2] = *b"HS";
const VERSION_MAJOR: u8 = 1;
const VERSION_MINOR: u8 = 0;
/// Unregistered client vendor ID.
const VENDOR_ID: u16 = 0;

/// Deadline for control exchanges (status query, device clear).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// `AsyncMaximumMessageSize` is not negotiated; writes fragment at this
/// size.
const DEFAULT_MAX_MESSAGE_SIZE: u64 = 65_536;

const DISCARD_CHUNK: usize = 4096;

/// HiSLIP message types (IVI-6.1 Table 3).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Initialize = 0,
    InitializeResponse = 1,
    FatalError = 2,
    Error = 3,
    AsyncLock = 4,
    AsyncLockResponse = 5,
    Data = 6,
    DataEnd = 7,
    DeviceClearComplete = 8,
    DeviceClearAcknowledge = 9,
    AsyncRemoteLocalControl = 10,
    AsyncRemoteLocalResponse = 11,
    Trigger = 12,
    Interrupted = 13,
    AsyncInterrupted = 14,
    AsyncMaximumMessageSize = 15,
    AsyncMaximumMessageSizeResponse = 16,
    AsyncInitialize = 17,
    AsyncInitializeResponse = 18,
    AsyncDeviceClear = 19,
    AsyncServiceRequest = 20,
    AsyncStatusQuery = 21,
    AsyncStatusResponse = 22,
    AsyncDeviceClearAcknowledge = 23,
    AsyncLockInfo = 24,
    AsyncLockInfoResponse = 25,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Ok(match value {
            0 => Self::Initialize,
            1 => Self::InitializeResponse,
            2 => Self::FatalError,
            3 => Self::Error,
            4 => Self::AsyncLock,
            5 => Self::AsyncLockResponse,
            6 => Self::Data,
            7 => Self::DataEnd,
            8 => Self::DeviceClearComplete,
            9 => Self::DeviceClearAcknowledge,
            10 => Self::AsyncRemoteLocalControl,
            11 => Self::AsyncRemoteLocalResponse,
            12 => Self::Trigger,
            13 => Self::Interrupted,
            14 => Self::AsyncInterrupted,
            15 => Self::AsyncMaximumMessageSize,
            16 => Self::AsyncMaximumMessageSizeResponse,
            17 => Self::AsyncInitialize,
            18 => Self::AsyncInitializeResponse,
            19 => Self::AsyncDeviceClear,
            20 => Self::AsyncServiceRequest,
            21 => Self::AsyncStatusQuery,
            22 => Self::AsyncStatusResponse,
            23 => Self::AsyncDeviceClearAcknowledge,
            24 => Self::AsyncLockInfo,
            25 => Self::AsyncLockInfoResponse,
            other => return Err(other),
        })
    }
}

/// One decoded message header. The type is kept raw so unknown types can
/// be skipped by discarding their payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: u8,
    pub control_code: u8,
    pub parameter: u32,
    pub payload_length: u64,
}

impl Header {
    /// Encode a header into its 16-byte wire form.
    #[must_use]
    pub fn encode(
        message_type: MessageType,
        control_code: u8,
        parameter: u32,
        payload_length: u64,
    ) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        let mut cursor = &mut raw[..];
        cursor.put_slice(&PROLOGUE);
        cursor.put_u8(message_type as u8);
        cursor.put_u8(control_code);
        cursor.put_u32(parameter);
        cursor.put_u64(payload_length);
        raw
    }

    /// Decode a 16-byte header, validating the `'H' 'S'` prologue.
    ///
    /// # Errors
    /// A prologue mismatch is a protocol error.
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        if raw[..2] != PROLOGUE {
            return Err(InstrumentError::ProtocolError {
                details: format!("bad HiSLIP prologue {:02X} {:02X}", raw[0], raw[1]),
            });
        }
        let mut cursor = &raw[4..];
        let parameter = cursor.read_u32::<BigEndian>().unwrap_or(0);
        let payload_length = cursor.read_u64::<BigEndian>().unwrap_or(0);
        Ok(Self {
            message_type: raw[2],
            control_code: raw[3],
            parameter,
            payload_length,
        })
    }

    /// The decoded message type, when the byte is a known value.
    #[must_use]
    pub fn typed(&self) -> Option<MessageType> {
        MessageType::try_from(self.message_type).ok()
    }
}

fn unexpected(context: &str, header: &Header) -> InstrumentError {
    InstrumentError::ProtocolError {
        details: format!(
            "unexpected HiSLIP message type {} during {context}",
            header.message_type
        ),
    }
}

fn send_message(
    stream: &mut TcpStream,
    message_type: MessageType,
    control_code: u8,
    parameter: u32,
    payload: &[u8],
) -> Result<()> {
    let header = Header::encode(message_type, control_code, parameter, payload.len() as u64);
    stream.write_all(&header)?;
    if !payload.is_empty() {
        stream.write_all(payload)?;
    }
    Ok(())
}

fn recv_header(stream: &mut TcpStream, timeout: Duration) -> Result<Header> {
    stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw)?;
    Header::decode(&raw)
}

fn discard_payload(stream: &mut TcpStream, mut len: u64, timeout: Duration) -> Result<()> {
    stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
    let mut scratch = [0u8; DISCARD_CHUNK];
    while len > 0 {
        let chunk = usize::try_from(len).unwrap_or(DISCARD_CHUNK).min(DISCARD_CHUNK);
        stream.read_exact(&mut scratch[..chunk])?;
        len -= chunk as u64;
    }
    Ok(())
}

/// A HiSLIP session: synchronous + asynchronous channels to one device.
pub struct HislipTransport {
    sync_stream: TcpStream,
    async_stream: TcpStream,
    session_id: u16,
    /// Client message ID: starts at 0, advances by 2 per message boundary,
    /// resets to 0 after a successful device clear.
    message_id: u32,
    max_message_size: u64,
}

impl HislipTransport {
    /// Connect both channels and perform the initialization handshake.
    ///
    /// # Errors
    /// Connection failures, timeouts, a `FatalError`/`Error` reply, or any
    /// unexpected response type. A failure after the sync channel is up
    /// closes every socket already opened.
    pub fn open(rsrc: &ResourceDescriptor, open_timeout: Duration) -> Result<Self> {
        let Target::Tcpip {
            host,
            port,
            device_name,
            ..
        } = &rsrc.target
        else {
            return Err(InstrumentError::InvalidSetup {
                details: "HiSLIP transport requires a TCPIP resource".to_string(),
            });
        };

        let sub_address = if device_name.is_empty() {
            "hislip0"
        } else {
            device_name.as_str()
        };
        debug!(%host, port = *port, sub_address, "connecting HiSLIP channels");

        // Synchronous channel + Initialize.
        let mut sync_stream = tcp_connect(host, *port, open_timeout)?;
        let parameter = (u32::from(VERSION_MAJOR) << 24)
            | (u32::from(VERSION_MINOR) << 16)
            | u32::from(VENDOR_ID);
        send_message(
            &mut sync_stream,
            MessageType::Initialize,
            0,
            parameter,
            sub_address.as_bytes(),
        )?;

        let response = recv_header(&mut sync_stream, open_timeout)?;
        match response.typed() {
            Some(MessageType::InitializeResponse) => {}
            Some(MessageType::FatalError | MessageType::Error) => {
                return Err(InstrumentError::ProtocolError {
                    details: format!(
                        "device rejected HiSLIP initialization (control code {})",
                        response.control_code
                    ),
                });
            }
            _ => return Err(unexpected("initialization", &response)),
        }
        // Session ID lives in the low 16 bits; the payload (server vendor
        // ID) is discarded.
        let session_id = (response.parameter & 0xFFFF) as u16;
        discard_payload(&mut sync_stream, response.payload_length, open_timeout)?;

        // Asynchronous channel + AsyncInitialize.
        let mut async_stream = tcp_connect(host, *port, open_timeout)?;
        send_message(
            &mut async_stream,
            MessageType::AsyncInitialize,
            0,
            u32::from(session_id),
            &[],
        )?;

        let response = recv_header(&mut async_stream, open_timeout)?;
        if response.typed() != Some(MessageType::AsyncInitializeResponse) {
            return Err(unexpected("async initialization", &response));
        }
        discard_payload(&mut async_stream, response.payload_length, open_timeout)?;

        debug!(session_id, "HiSLIP session established");
        Ok(Self {
            sync_stream,
            async_stream,
            session_id,
            message_id: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    /// The session ID assigned by the device.
    #[must_use]
    pub const fn session_id(&self) -> u16 {
        self.session_id
    }
}

impl Transport for HislipTransport {
    /// Send one message: `Data` fragments capped at `max_message_size`,
    /// then a final `DataEnd`. The message ID advances by 2 before the
    /// message and stays even.
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.message_id = self.message_id.wrapping_add(2);

        let mut remaining = buf;
        while !remaining.is_empty() {
            let chunk_len = usize::try_from(self.max_message_size)
                .unwrap_or(usize::MAX)
                .min(remaining.len());
            let (chunk, rest) = remaining.split_at(chunk_len);
            let message_type = if rest.is_empty() {
                MessageType::DataEnd
            } else {
                MessageType::Data
            };
            send_message(
                &mut self.sync_stream,
                message_type,
                0,
                self.message_id,
                chunk,
            )?;
            trace!(len = chunk.len(), message_id = self.message_id, "sent fragment");
            remaining = rest;
        }

        Ok(buf.len())
    }

    /// Receive `Data`/`DataEnd` fragments until end-of-message, skipping
    /// unrelated message types and truncating overflow.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, ReadTermination)> {
        let mut total = 0usize;
        let mut termination = ReadTermination::Complete;

        loop {
            let header = recv_header(&mut self.sync_stream, timeout)?;
            match header.typed() {
                Some(MessageType::FatalError | MessageType::Error) => {
                    discard_payload(&mut self.sync_stream, header.payload_length, timeout)?;
                    return Err(InstrumentError::ProtocolError {
                        details: format!(
                            "device reported HiSLIP error (control code {})",
                            header.control_code
                        ),
                    });
                }
                Some(MessageType::Data | MessageType::DataEnd) => {
                    let space = buf.len() - total;
                    let take = usize::try_from(header.payload_length)
                        .unwrap_or(usize::MAX)
                        .min(space);
                    self.sync_stream.read_exact(&mut buf[total..total + take])?;
                    total += take;

                    let overflow = header.payload_length - take as u64;
                    if overflow > 0 {
                        discard_payload(&mut self.sync_stream, overflow, timeout)?;
                        termination = ReadTermination::MaxCount;
                    }

                    if header.typed() == Some(MessageType::DataEnd) {
                        break;
                    }
                }
                // Trigger, Interrupted, service requests, unknown types:
                // not part of this exchange.
                _ => {
                    trace!(message_type = header.message_type, "skipping message");
                    discard_payload(&mut self.sync_stream, header.payload_length, timeout)?;
                }
            }
        }

        Ok((total, termination))
    }

    /// `AsyncStatusQuery` on the async channel; the response's control
    /// code *is* the status byte.
    fn read_stb(&mut self) -> Result<u16> {
        send_message(
            &mut self.async_stream,
            MessageType::AsyncStatusQuery,
            0,
            self.message_id,
            &[],
        )?;

        let response = recv_header(&mut self.async_stream, CONTROL_TIMEOUT)?;
        if response.typed() != Some(MessageType::AsyncStatusResponse) {
            return Err(unexpected("status query", &response));
        }
        if response.payload_length > 0 {
            discard_payload(&mut self.async_stream, response.payload_length, CONTROL_TIMEOUT)?;
        }
        Ok(u16::from(response.control_code))
    }

    /// The four-step device-clear dance; resets the message ID to 0.
    fn clear(&mut self) -> Result<()> {
        // Step 1: AsyncDeviceClear on the async channel.
        send_message(
            &mut self.async_stream,
            MessageType::AsyncDeviceClear,
            0,
            0,
            &[],
        )?;

        // Step 2: AsyncDeviceClearAcknowledge on the async channel.
        let ack = recv_header(&mut self.async_stream, CONTROL_TIMEOUT)?;
        discard_payload(&mut self.async_stream, ack.payload_length, CONTROL_TIMEOUT)?;
        if ack.typed() != Some(MessageType::AsyncDeviceClearAcknowledge) {
            return Err(unexpected("device clear", &ack));
        }

        // Step 3: DeviceClearComplete on the sync channel; its control
        // code carries the device's feature flags.
        let complete = recv_header(&mut self.sync_stream, CONTROL_TIMEOUT)?;
        discard_payload(&mut self.sync_stream, complete.payload_length, CONTROL_TIMEOUT)?;
        if complete.typed() != Some(MessageType::DeviceClearComplete) {
            return Err(unexpected("device clear", &complete));
        }

        // Step 4: DeviceClearAcknowledge on the sync channel, echoing the
        // feature flags.
        send_message(
            &mut self.sync_stream,
            MessageType::DeviceClearAcknowledge,
            complete.control_code,
            0,
            &[],
        )?;

        self.message_id = 0;
        debug!("device clear complete, message ID reset");
        Ok(())
    }
}

#[cfg(test)]
mod unit {
    use super::{Header, MessageType, HEADER_LEN};

    #[test]
    fn initialize_header_layout() {
        // Version 1.0, vendor 0, 7-byte sub-address payload.
        let raw = Header::encode(MessageType::Initialize, 0, 0x0100_0000, 7);
        let expected: [u8; HEADER_LEN] = [
            b'H', b'S', // prologue
            0x00, // message type: Initialize
            0x00, // control code
            0x01, 0x00, 0x00, 0x00, // parameter: ver 1.0, vendor 0
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, // payload length
        ];
        assert_eq!(raw, expected);
    }

    #[test]
    fn headers_round_trip() {
        let raw = Header::encode(MessageType::DataEnd, 0x42, 0xDEAD_BEEF, 0x1_0000_0001);
        let header = Header::decode(&raw).expect("valid header");
        assert_eq!(header.typed(), Some(MessageType::DataEnd));
        assert_eq!(header.control_code, 0x42);
        assert_eq!(header.parameter, 0xDEAD_BEEF);
        assert_eq!(header.payload_length, 0x1_0000_0001);
    }

    #[test]
    fn bad_prologue_is_a_protocol_error() {
        let mut raw = Header::encode(MessageType::Data, 0, 0, 0);
        raw[0] = b'X';
        assert!(Header::decode(&raw).is_err());
    }

    #[test]
    fn unknown_message_types_decode_untyped() {
        let mut raw = Header::encode(MessageType::Data, 0, 0, 0);
        raw[2] = 200;
        let header = Header::decode(&raw).expect("prologue is intact");
        assert_eq!(header.typed(), None);
        assert_eq!(header.message_type, 200);
    }
}
