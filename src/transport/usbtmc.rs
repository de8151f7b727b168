//! USBTMC / USB488 transport over `rusb`.
//!
//! Bulk-OUT carries commands (`DEV_DEP_MSG_OUT`), bulk-IN carries
//! responses (`REQUEST_DEV_DEP_MSG_IN` → `DEV_DEP_MSG_IN`); the status
//! byte and device clear ride on class-specific control transfers. Every
//! bulk message starts with a 12-byte little-endian header and the payload
//! is zero-padded to a 4-byte multiple.

use std::time::{Duration, Instant};

use bytes::BufMut;
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::resource::{ResourceDescriptor, Target};
use crate::transport::{ReadTermination, Transport};
use crate::InstrumentError;

/// USBTMC interface class / subclass.
const USBTMC_CLASS: u8 = 0xFE;
const USBTMC_SUBCLASS: u8 = 0x03;

/// Fixed size of the bulk message header.
pub const HEADER_LEN: usize = 12;

/// Bulk MsgID values.
const MSGID_DEV_DEP_MSG_OUT: u8 = 1;
const MSGID_REQUEST_DEV_DEP_MSG_IN: u8 = 2;
const MSGID_DEV_DEP_MSG_IN: u8 = 2;

/// bmTransferAttributes: end-of-message.
const ATTR_EOM: u8 = 0x01;

/// Class-specific control requests.
const REQ_INITIATE_CLEAR: u8 = 5;
const REQ_CHECK_CLEAR_STATUS: u8 = 6;
const REQ_GET_CAPABILITIES: u8 = 7;
/// USB488 READ_STATUS_BYTE.
const REQ_READ_STATUS_BYTE: u8 = 128;

/// USBTMC_status values in control-response byte 0.
const STATUS_SUCCESS: u8 = 0x01;
const STATUS_PENDING: u8 = 0x02;

const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);
const CLEAR_TIMEOUT: Duration = Duration::from_secs(5);
const CLEAR_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// USB488 sub-capabilities reported by GET_CAPABILITIES.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usb488Capabilities {
    /// The interface is a USB488 interface.
    pub usb488_interface: bool,
    /// REN_CONTROL / GO_TO_LOCAL supported.
    pub ren_control: bool,
    /// READ_STATUS_BYTE supported.
    pub read_status_byte: bool,
    /// TRIGGER supported.
    pub trigger: bool,
}

/// Advance a bTag: 1..=255, never 0 (reserved).
const fn advance_tag(tag: u8) -> u8 {
    if tag >= 255 {
        1
    } else {
        tag + 1
    }
}

/// Build a 12-byte bulk header:
/// `{MsgID, bTag, ~bTag, 0, TransferSize(LE), attributes, TermChar, 0, 0}`.
#[must_use]
pub fn encode_header(
    msg_id: u8,
    tag: u8,
    transfer_size: u32,
    attributes: u8,
    term_char: u8,
) -> [u8; HEADER_LEN] {
    let mut raw = [0u8; HEADER_LEN];
    let mut cursor = &mut raw[..];
    cursor.put_u8(msg_id);
    cursor.put_u8(tag);
    cursor.put_u8(!tag);
    cursor.put_u8(0);
    cursor.put_u32_le(transfer_size);
    cursor.put_u8(attributes);
    cursor.put_u8(term_char);
    raw
}

/// Build a complete `DEV_DEP_MSG_OUT` packet: header + payload + padding.
#[must_use]
pub fn encode_dev_dep_msg_out(tag: u8, data: &[u8]) -> Vec<u8> {
    let padded = (data.len() + 3) & !3;
    let mut packet = Vec::with_capacity(HEADER_LEN + padded);
    packet.extend_from_slice(&encode_header(
        MSGID_DEV_DEP_MSG_OUT,
        tag,
        u32::try_from(data.len()).unwrap_or(u32::MAX),
        ATTR_EOM,
        0,
    ));
    packet.extend_from_slice(data);
    packet.resize(HEADER_LEN + padded, 0);
    packet
}

fn protocol_error(details: impl Into<String>) -> InstrumentError {
    InstrumentError::ProtocolError {
        details: details.into(),
    }
}

pub(crate) struct TmcInterface {
    pub(crate) number: u8,
    bulk_out: u8,
    bulk_in: u8,
}

/// Locate a USBTMC interface (and its bulk endpoint pair) on `device`,
/// honoring an explicit interface number when the resource carried one.
pub(crate) fn find_tmc_interface(
    device: &Device<Context>,
    wanted: Option<u16>,
) -> Option<TmcInterface> {
    let descriptor = device.device_descriptor().ok()?;
    for config_index in 0..descriptor.num_configurations() {
        let config = device.config_descriptor(config_index).ok()?;
        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                if alt.class_code() != USBTMC_CLASS || alt.sub_class_code() != USBTMC_SUBCLASS {
                    continue;
                }
                if let Some(wanted) = wanted {
                    if u16::from(alt.interface_number()) != wanted {
                        continue;
                    }
                }
                let mut bulk_out = None;
                let mut bulk_in = None;
                for endpoint in alt.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        Direction::Out => bulk_out = Some(endpoint.address()),
                        Direction::In => bulk_in = Some(endpoint.address()),
                    }
                }
                if let (Some(bulk_out), Some(bulk_in)) = (bulk_out, bulk_in) {
                    return Some(TmcInterface {
                        number: alt.interface_number(),
                        bulk_out,
                        bulk_in,
                    });
                }
            }
        }
    }
    None
}

fn serial_matches(device: &Device<Context>, wanted: &str) -> bool {
    if wanted.is_empty() {
        return true;
    }
    let Ok(descriptor) = device.device_descriptor() else {
        return false;
    };
    let Ok(handle) = device.open() else {
        return false;
    };
    let Ok(languages) = handle.read_languages(Duration::from_millis(100)) else {
        return false;
    };
    let Some(language) = languages.first() else {
        return false;
    };
    handle
        .read_serial_number_string(*language, &descriptor, Duration::from_millis(100))
        .is_ok_and(|serial| serial == wanted)
}

/// A claimed USBTMC interface on one device.
pub struct UsbtmcTransport {
    handle: DeviceHandle<Context>,
    interface_number: u8,
    bulk_out: u8,
    bulk_in: u8,
    b_tag: u8,
    reattach_kernel_driver: bool,
    capabilities: Usb488Capabilities,
}

impl UsbtmcTransport {
    /// Find the device named by the descriptor, claim its USBTMC
    /// interface, and read its capabilities.
    ///
    /// # Errors
    /// [`InstrumentError::ResourceNotFound`] when no attached device
    /// matches VID/PID/serial/interface, plus USB stack errors while
    /// claiming.
    pub fn open(rsrc: &ResourceDescriptor, _open_timeout: Duration) -> Result<Self> {
        let Target::Usb {
            vendor_id,
            product_id,
            serial_number,
            interface_number,
        } = &rsrc.target
        else {
            return Err(InstrumentError::InvalidSetup {
                details: "USBTMC transport requires a USB resource".to_string(),
            });
        };

        let context = Context::new()?;
        let device = context
            .devices()?
            .iter()
            .find(|device| {
                device.device_descriptor().is_ok_and(|d| {
                    d.vendor_id() == *vendor_id && d.product_id() == *product_id
                }) && serial_matches(device, serial_number)
                    && find_tmc_interface(device, *interface_number).is_some()
            })
            .ok_or_else(|| InstrumentError::ResourceNotFound {
                details: format!(
                    "no USBTMC device matches {:04x}:{:04x} serial '{serial_number}'",
                    vendor_id, product_id
                ),
            })?;

        let interface = find_tmc_interface(&device, *interface_number)
            .expect("interface existence was just checked");
        let handle = device.open()?;

        let mut reattach_kernel_driver = false;
        if rusb::supports_detach_kernel_driver()
            && handle.kernel_driver_active(interface.number).unwrap_or(false)
        {
            handle.detach_kernel_driver(interface.number)?;
            reattach_kernel_driver = true;
        }
        handle.claim_interface(interface.number)?;
        debug!(
            interface = interface.number,
            bulk_out = interface.bulk_out,
            bulk_in = interface.bulk_in,
            "claimed USBTMC interface"
        );

        let mut transport = Self {
            handle,
            interface_number: interface.number,
            bulk_out: interface.bulk_out,
            bulk_in: interface.bulk_in,
            b_tag: 0,
            reattach_kernel_driver,
            capabilities: Usb488Capabilities::default(),
        };
        transport.read_capabilities();
        Ok(transport)
    }

    /// The USB488 capabilities advertised at open, when readable.
    #[must_use]
    pub const fn capabilities(&self) -> Usb488Capabilities {
        self.capabilities
    }

    fn next_tag(&mut self) -> u8 {
        self.b_tag = advance_tag(self.b_tag);
        self.b_tag
    }

    fn control_in_type() -> u8 {
        rusb::request_type(
            Direction::In,
            rusb::RequestType::Class,
            rusb::Recipient::Interface,
        )
    }

    fn control_out_type() -> u8 {
        rusb::request_type(
            Direction::Out,
            rusb::RequestType::Class,
            rusb::Recipient::Interface,
        )
    }

    /// GET_CAPABILITIES, best effort: failure leaves the defaults.
    fn read_capabilities(&mut self) {
        let mut buf = [0u8; 24];
        match self.handle.read_control(
            Self::control_in_type(),
            REQ_GET_CAPABILITIES,
            0,
            u16::from(self.interface_number),
            &mut buf,
            CONTROL_TIMEOUT,
        ) {
            Ok(n) if n >= 6 => {
                self.capabilities = Usb488Capabilities {
                    usb488_interface: buf[4] & 0x04 != 0,
                    ren_control: buf[4] & 0x02 != 0,
                    read_status_byte: buf[5] & 0x04 != 0,
                    trigger: buf[5] & 0x01 != 0,
                };
            }
            Ok(_) => {}
            Err(e) => warn!("GET_CAPABILITIES failed: {e}"),
        }
    }
}

impl Transport for UsbtmcTransport {
    /// One `DEV_DEP_MSG_OUT` bulk transfer with EOM set.
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let tag = self.next_tag();
        let packet = encode_dev_dep_msg_out(tag, buf);
        let transferred = self
            .handle
            .write_bulk(self.bulk_out, &packet, DEFAULT_BULK_TIMEOUT)?;
        if transferred < packet.len() {
            return Err(protocol_error(format!(
                "truncated bulk-out transfer: {transferred} of {} bytes",
                packet.len()
            )));
        }
        trace!(tag, len = buf.len(), "DEV_DEP_MSG_OUT");
        Ok(buf.len())
    }

    /// `REQUEST_DEV_DEP_MSG_IN` on bulk-OUT, then one bulk-IN transfer.
    /// The response header must echo the tag and its inverse.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, ReadTermination)> {
        let timeout = if timeout.is_zero() {
            DEFAULT_BULK_TIMEOUT
        } else {
            timeout
        };

        let tag = self.next_tag();
        let request = encode_header(
            MSGID_REQUEST_DEV_DEP_MSG_IN,
            tag,
            u32::try_from(buf.len()).unwrap_or(u32::MAX),
            0,
            0,
        );
        self.handle.write_bulk(self.bulk_out, &request, timeout)?;

        // Space for the response header, the requested payload, and the
        // device's alignment padding.
        let mut response = vec![0u8; HEADER_LEN + ((buf.len() + 3) & !3)];
        let received = self.handle.read_bulk(self.bulk_in, &mut response, timeout)?;
        if received < HEADER_LEN {
            return Err(protocol_error("bulk-in response shorter than its header"));
        }

        if response[0] != MSGID_DEV_DEP_MSG_IN || response[1] != tag || response[2] != !tag {
            return Err(protocol_error(format!(
                "bulk-in header mismatch: MsgID {} tag {}/{} (expected tag {tag}/{})",
                response[0],
                response[1],
                response[2],
                !tag
            )));
        }

        let transfer_size =
            u32::from_le_bytes([response[4], response[5], response[6], response[7]]) as usize;
        let eom = response[8] & ATTR_EOM != 0;

        let available = received - HEADER_LEN;
        let copy_len = available.min(buf.len()).min(transfer_size);
        buf[..copy_len].copy_from_slice(&response[HEADER_LEN..HEADER_LEN + copy_len]);
        trace!(tag, copy_len, eom, "DEV_DEP_MSG_IN");

        let termination = if eom {
            ReadTermination::TermChar
        } else {
            ReadTermination::Complete
        };
        Ok((copy_len, termination))
    }

    /// USB488 READ_STATUS_BYTE control transfer. The three-byte response
    /// is `{USBTMC_status, bTag, STB}`; two-byte replies put the STB in
    /// byte 1.
    fn read_stb(&mut self) -> Result<u16> {
        let tag = self.next_tag();
        let mut response = [0u8; 3];
        let received = self.handle.read_control(
            Self::control_in_type(),
            REQ_READ_STATUS_BYTE,
            u16::from(tag),
            u16::from(self.interface_number),
            &mut response,
            CONTROL_TIMEOUT,
        )?;

        if received == 0 || response[0] != STATUS_SUCCESS {
            return Err(protocol_error(format!(
                "READ_STATUS_BYTE returned USBTMC status {:#04x}",
                response[0]
            )));
        }
        match received {
            n if n >= 3 => Ok(u16::from(response[2])),
            2 => Ok(u16::from(response[1])),
            _ => Err(protocol_error("READ_STATUS_BYTE response too short")),
        }
    }

    /// INITIATE_CLEAR, then poll CHECK_CLEAR_STATUS until the device
    /// leaves PENDING, draining bulk-IN when asked to.
    fn clear(&mut self) -> Result<()> {
        self.handle.write_control(
            Self::control_out_type(),
            REQ_INITIATE_CLEAR,
            0,
            u16::from(self.interface_number),
            &[],
            CONTROL_TIMEOUT,
        )?;

        let started = Instant::now();
        loop {
            if started.elapsed() >= CLEAR_TIMEOUT {
                return Err(InstrumentError::Timeout);
            }

            let mut response = [0u8; 2];
            let received = self.handle.read_control(
                Self::control_in_type(),
                REQ_CHECK_CLEAR_STATUS,
                0,
                u16::from(self.interface_number),
                &mut response,
                CONTROL_TIMEOUT,
            )?;
            if received == 0 {
                return Err(protocol_error("empty CHECK_CLEAR_STATUS response"));
            }

            match response[0] {
                STATUS_SUCCESS => break,
                STATUS_PENDING => {
                    // bmClear bit 0: a bulk-in read is required to make
                    // progress.
                    if received >= 2 && response[1] & 0x01 != 0 {
                        let mut discard = [0u8; 512];
                        let _ = self.handle.read_bulk(
                            self.bulk_in,
                            &mut discard,
                            Duration::from_millis(500),
                        );
                    }
                    std::thread::sleep(CLEAR_POLL_INTERVAL);
                }
                other => {
                    return Err(protocol_error(format!(
                        "CHECK_CLEAR_STATUS returned USBTMC status {other:#04x}"
                    )));
                }
            }
        }

        // Final bulk-IN flush of anything left in the device queue.
        let mut flush = [0u8; 512];
        let _ = self
            .handle
            .read_bulk(self.bulk_in, &mut flush, Duration::from_millis(200));
        Ok(())
    }
}

impl Drop for UsbtmcTransport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface_number);
        if self.reattach_kernel_driver {
            let _ = self.handle.attach_kernel_driver(self.interface_number);
        }
    }
}
