//! Parsing of VISA resource strings into structured descriptors.
//!
//! Four address families are recognized:
//!
//! ```text
//! TCPIP[board]::host[::port|device|hislipN][::INSTR|::SOCKET]
//! USB[board]::vid::pid::serial[::intf]::INSTR
//! ASRL<n>::INSTR          (or ASRL/dev/path::INSTR from discovery)
//! GPIB[board]::primary[::secondary]::INSTR
//! ```
//!
//! The parser performs no I/O; it only classifies the string and fills in
//! protocol defaults (VXI-11 portmapper 111, HiSLIP 4880).

use std::fmt::Display;
use std::str::FromStr;

use crate::InstrumentError;

/// VISA default port for the ONC-RPC portmapper (VXI-11 discovery).
pub const PORTMAPPER_PORT: u16 = 111;
/// VISA default port for HiSLIP.
pub const HISLIP_PORT: u16 = 4880;
/// Conventional port for raw SCPI-over-TCP sockets.
pub const RAW_SOCKET_PORT: u16 = 5025;

/// The physical interface family of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum InterfaceType {
    /// IEEE-488 instrument bus.
    Gpib,
    /// RS-232 serial.
    Asrl,
    /// LAN (VXI-11, HiSLIP, or raw socket).
    Tcpip,
    /// USB Test & Measurement Class.
    Usb,
}

impl InterfaceType {
    /// The VISA numeric interface-type code, for attribute reporting.
    #[must_use]
    pub const fn number(self) -> u16 {
        match self {
            Self::Gpib => 1,
            Self::Asrl => 4,
            Self::Tcpip => 6,
            Self::Usb => 7,
        }
    }
}

impl Display for InterfaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Gpib => "GPIB",
            Self::Asrl => "ASRL",
            Self::Tcpip => "TCPIP",
            Self::Usb => "USB",
        };
        write!(f, "{s}")
    }
}

/// The interface-specific half of a parsed resource string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Target {
    /// A LAN instrument: VXI-11, HiSLIP, or raw SCPI socket.
    Tcpip {
        /// Hostname or IPv4 literal.
        host: String,
        /// Connection port. For VXI-11 this is the portmapper port (111)
        /// unless the resource string carried an override.
        port: u16,
        /// LAN device name (`inst0`, `hislip0`, ...).
        device_name: String,
        /// `true` for `::SOCKET` resources.
        is_raw_socket: bool,
        /// `true` for `hislip<N>` sub-addresses.
        is_hislip: bool,
    },
    /// A USBTMC instrument.
    Usb {
        /// USB idVendor.
        vendor_id: u16,
        /// USB idProduct.
        product_id: u16,
        /// Serial-number string; may be empty, in which case the first
        /// VID/PID match wins.
        serial_number: String,
        /// Explicit USBTMC interface number, when the string carried one.
        interface_number: Option<u16>,
    },
    /// A serial instrument.
    Asrl {
        /// The `ASRL<n>` port number (1-based); 0 when a device path was
        /// given instead.
        com_port: u32,
        /// POSIX device path from `ASRL/dev/...` resources.
        device_path: Option<String>,
    },
    /// A GPIB instrument behind a host controller library.
    Gpib {
        /// Primary address, 0..=30.
        primary_address: u8,
        /// Secondary address, 0..=30, when present.
        secondary_address: Option<u8>,
    },
}

/// A parsed, immutable resource descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ResourceDescriptor {
    raw: String,
    board: u16,
    /// Interface-specific addressing.
    pub target: Target,
}

impl ResourceDescriptor {
    /// The original resource string, verbatim.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The optional board number (`TCPIP2::...` -> 2), defaulting to 0.
    #[must_use]
    pub const fn board_number(&self) -> u16 {
        self.board
    }

    /// The interface family of this resource.
    #[must_use]
    pub const fn interface_type(&self) -> InterfaceType {
        match self.target {
            Target::Tcpip { .. } => InterfaceType::Tcpip,
            Target::Usb { .. } => InterfaceType::Usb,
            Target::Asrl { .. } => InterfaceType::Asrl,
            Target::Gpib { .. } => InterfaceType::Gpib,
        }
    }
}

impl Display for ResourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

pub(crate) fn starts_with_ci(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn eq_ci(s: &str, other: &str) -> bool {
    s.eq_ignore_ascii_case(other)
}

/// Split leading decimal digits off a prefix remainder, e.g. the `2` of
/// `TCPIP2`. Returns (board, rest-consumed-ok).
fn parse_board(rest: &str) -> Result<u16, InstrumentError> {
    if rest.is_empty() {
        return Ok(0);
    }
    rest.parse::<u16>()
        .map_err(|_| InstrumentError::InvalidResourceName(rest.to_string()))
}

/// If a string starts with `0x`, parse it as hex. Otherwise decimal.
fn u16_from_str(s: &str) -> Option<u16> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u16>().ok()
    }
}

fn invalid(s: &str) -> InstrumentError {
    InstrumentError::InvalidResourceName(s.to_string())
}

fn parse_tcpip(raw: &str, fields: &[&str]) -> Result<ResourceDescriptor, InstrumentError> {
    let board = parse_board(&fields[0][5..])?;
    let Some(host) = fields.get(1).filter(|h| !h.is_empty()) else {
        return Err(invalid(raw));
    };

    let vxi11 = |port: u16, device_name: &str| ResourceDescriptor {
        raw: raw.to_string(),
        board,
        target: Target::Tcpip {
            host: (*host).to_string(),
            port,
            device_name: device_name.to_string(),
            is_raw_socket: false,
            is_hislip: false,
        },
    };

    // TCPIP::host or TCPIP::host::INSTR — VXI-11 on the default LAN device
    let Some(second) = fields.get(2) else {
        return Ok(vxi11(PORTMAPPER_PORT, "inst0"));
    };
    if eq_ci(second, "INSTR") {
        return Ok(vxi11(PORTMAPPER_PORT, "inst0"));
    }

    // TCPIP::host::hislipN[,port][::INSTR]
    if starts_with_ci(second, "hislip") {
        let (device_name, port) = match second.split_once(',') {
            Some((dev, port)) => (
                dev.to_string(),
                port.parse::<u16>().map_err(|_| invalid(raw))?,
            ),
            None => ((*second).to_string(), HISLIP_PORT),
        };
        return Ok(ResourceDescriptor {
            raw: raw.to_string(),
            board,
            target: Target::Tcpip {
                host: (*host).to_string(),
                port,
                device_name,
                is_raw_socket: false,
                is_hislip: true,
            },
        });
    }

    let third = fields.get(3);
    if let Ok(port) = second.parse::<u16>() {
        // Numeric middle field: a socket port or a VXI-11 port override.
        return match third {
            Some(t) if eq_ci(t, "SOCKET") => Ok(ResourceDescriptor {
                raw: raw.to_string(),
                board,
                target: Target::Tcpip {
                    host: (*host).to_string(),
                    port,
                    device_name: String::new(),
                    is_raw_socket: true,
                    is_hislip: false,
                },
            }),
            Some(t) if eq_ci(t, "INSTR") => Ok(vxi11(port, "inst0")),
            None => Ok(vxi11(port, "inst0")),
            Some(_) => Err(invalid(raw)),
        };
    }

    // Anything else is a VXI-11 LAN device name such as `inst0` or `gpib0,3`.
    match third {
        None => Ok(vxi11(PORTMAPPER_PORT, second)),
        Some(t) if eq_ci(t, "INSTR") => Ok(vxi11(PORTMAPPER_PORT, second)),
        Some(_) => Err(invalid(raw)),
    }
}

fn parse_usb(raw: &str, fields: &[&str]) -> Result<ResourceDescriptor, InstrumentError> {
    let board = parse_board(&fields[0][3..])?;
    if fields.len() < 4 {
        return Err(invalid(raw));
    }

    let vendor_id = u16_from_str(fields[1]).ok_or_else(|| invalid(raw))?;
    let product_id = u16_from_str(fields[2]).ok_or_else(|| invalid(raw))?;
    let serial_number = fields[3].to_string();

    let interface_number = match fields.get(4) {
        Some(f) if eq_ci(f, "INSTR") => None,
        Some(f) => Some(u16_from_str(f).ok_or_else(|| invalid(raw))?),
        None => None,
    };
    // A fifth field, when present after an interface number, must be INSTR.
    if let Some(f) = fields.get(5) {
        if !eq_ci(f, "INSTR") {
            return Err(invalid(raw));
        }
    }

    Ok(ResourceDescriptor {
        raw: raw.to_string(),
        board,
        target: Target::Usb {
            vendor_id,
            product_id,
            serial_number,
            interface_number,
        },
    })
}

fn parse_asrl(raw: &str, fields: &[&str]) -> Result<ResourceDescriptor, InstrumentError> {
    let rest = &fields[0][4..];
    let target = if rest.starts_with('/') {
        Target::Asrl {
            com_port: 0,
            device_path: Some(rest.to_string()),
        }
    } else {
        let com_port = rest.parse::<u32>().map_err(|_| invalid(raw))?;
        Target::Asrl {
            com_port,
            device_path: None,
        }
    };
    if let Some(f) = fields.get(1) {
        if !eq_ci(f, "INSTR") {
            return Err(invalid(raw));
        }
    }
    Ok(ResourceDescriptor {
        raw: raw.to_string(),
        board: 0,
        target,
    })
}

fn parse_gpib(raw: &str, fields: &[&str]) -> Result<ResourceDescriptor, InstrumentError> {
    let board = parse_board(&fields[0][4..])?;
    let Some(primary) = fields.get(1) else {
        return Err(invalid(raw));
    };
    let primary_address = primary.parse::<u8>().map_err(|_| invalid(raw))?;
    if primary_address > 30 {
        return Err(invalid(raw));
    }

    let secondary_address = match fields.get(2) {
        Some(f) if eq_ci(f, "INSTR") => None,
        Some(f) => {
            let sad = f.parse::<u8>().map_err(|_| invalid(raw))?;
            if sad > 30 {
                return Err(invalid(raw));
            }
            Some(sad)
        }
        None => None,
    };

    Ok(ResourceDescriptor {
        raw: raw.to_string(),
        board,
        target: Target::Gpib {
            primary_address,
            secondary_address,
        },
    })
}

impl FromStr for ResourceDescriptor {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let fields: Vec<&str> = trimmed.split("::").collect();
        if fields.is_empty() || fields[0].is_empty() {
            return Err(invalid(s));
        }

        if starts_with_ci(fields[0], "TCPIP") {
            parse_tcpip(trimmed, &fields)
        } else if starts_with_ci(fields[0], "USB") {
            parse_usb(trimmed, &fields)
        } else if starts_with_ci(fields[0], "ASRL") {
            parse_asrl(trimmed, &fields)
        } else if starts_with_ci(fields[0], "GPIB") {
            parse_gpib(trimmed, &fields)
        } else {
            Err(invalid(s))
        }
    }
}

#[cfg(test)]
mod unit {
    use super::{InterfaceType, ResourceDescriptor, Target};
    use crate::InstrumentError;

    fn multitest_parse(cases: &[(&str, Target)]) {
        for (input, expected) in cases {
            match input.parse::<ResourceDescriptor>() {
                Ok(actual) => {
                    assert_eq!(actual.raw(), *input, "raw string not preserved");
                    assert_eq!(
                        &actual.target, expected,
                        "'{input}' did not parse to the expected target"
                    );
                }
                Err(e) => panic!("'{input}' could not be parsed: {e}"),
            }
        }
    }

    #[test]
    fn raw_socket_resources() {
        multitest_parse(&[(
            "TCPIP::192.168.1.50::5025::SOCKET",
            Target::Tcpip {
                host: "192.168.1.50".to_string(),
                port: 5025,
                device_name: String::new(),
                is_raw_socket: true,
                is_hislip: false,
            },
        )]);
    }

    #[test]
    fn hislip_resources() {
        multitest_parse(&[
            (
                "TCPIP::192.168.1.50::hislip0",
                Target::Tcpip {
                    host: "192.168.1.50".to_string(),
                    port: 4880,
                    device_name: "hislip0".to_string(),
                    is_raw_socket: false,
                    is_hislip: true,
                },
            ),
            (
                "TCPIP0::10.1.1.9::hislip0,5025::INSTR",
                Target::Tcpip {
                    host: "10.1.1.9".to_string(),
                    port: 5025,
                    device_name: "hislip0".to_string(),
                    is_raw_socket: false,
                    is_hislip: true,
                },
            ),
        ]);
    }

    #[test]
    fn vxi11_resources() {
        multitest_parse(&[
            (
                "TCPIP::192.168.1.50::INSTR",
                Target::Tcpip {
                    host: "192.168.1.50".to_string(),
                    port: 111,
                    device_name: "inst0".to_string(),
                    is_raw_socket: false,
                    is_hislip: false,
                },
            ),
            (
                "TCPIP::myoscilloscope.local",
                Target::Tcpip {
                    host: "myoscilloscope.local".to_string(),
                    port: 111,
                    device_name: "inst0".to_string(),
                    is_raw_socket: false,
                    is_hislip: false,
                },
            ),
            (
                "TCPIP::10.0.0.2::gpib0,3::INSTR",
                Target::Tcpip {
                    host: "10.0.0.2".to_string(),
                    port: 111,
                    device_name: "gpib0,3".to_string(),
                    is_raw_socket: false,
                    is_hislip: false,
                },
            ),
            (
                "TCPIP::10.0.0.2::617::INSTR",
                Target::Tcpip {
                    host: "10.0.0.2".to_string(),
                    port: 617,
                    device_name: "inst0".to_string(),
                    is_raw_socket: false,
                    is_hislip: false,
                },
            ),
        ]);
    }

    #[test]
    fn usb_resources() {
        multitest_parse(&[
            (
                "USB::0x1234::0x5678::MY_SERIAL::INSTR",
                Target::Usb {
                    vendor_id: 0x1234,
                    product_id: 0x5678,
                    serial_number: "MY_SERIAL".to_string(),
                    interface_number: None,
                },
            ),
            (
                "USB0::0x05E6::0x2461::01234567::0::INSTR",
                Target::Usb {
                    vendor_id: 0x05E6,
                    product_id: 0x2461,
                    serial_number: "01234567".to_string(),
                    interface_number: Some(0),
                },
            ),
            (
                "USB0::1689::261::X::INSTR",
                Target::Usb {
                    vendor_id: 1689,
                    product_id: 261,
                    serial_number: "X".to_string(),
                    interface_number: None,
                },
            ),
        ]);
    }

    #[test]
    fn asrl_resources() {
        multitest_parse(&[
            (
                "ASRL1::INSTR",
                Target::Asrl {
                    com_port: 1,
                    device_path: None,
                },
            ),
            (
                "ASRL/dev/ttyUSB0::INSTR",
                Target::Asrl {
                    com_port: 0,
                    device_path: Some("/dev/ttyUSB0".to_string()),
                },
            ),
        ]);
    }

    #[test]
    fn gpib_resources() {
        multitest_parse(&[
            (
                "GPIB::1::2::INSTR",
                Target::Gpib {
                    primary_address: 1,
                    secondary_address: Some(2),
                },
            ),
            (
                "GPIB0::22::INSTR",
                Target::Gpib {
                    primary_address: 22,
                    secondary_address: None,
                },
            ),
        ]);
    }

    #[test]
    fn prefixes_are_case_insensitive() {
        let r = "tcpip::10.0.0.1::INSTR"
            .parse::<ResourceDescriptor>()
            .expect("lowercase prefix should parse");
        assert_eq!(r.interface_type(), InterfaceType::Tcpip);

        let r = "gpib0::5::instr"
            .parse::<ResourceDescriptor>()
            .expect("lowercase suffix should parse");
        assert_eq!(r.interface_type(), InterfaceType::Gpib);
    }

    #[test]
    fn board_numbers_parse() {
        let r = "TCPIP2::10.0.0.1::INSTR"
            .parse::<ResourceDescriptor>()
            .expect("board number should parse");
        assert_eq!(r.board_number(), 2);
    }

    #[test]
    fn invalid_resources_are_rejected() {
        for bad in [
            "FOOBAR::x",
            "",
            "TCPIP::",
            "GPIB::99::INSTR",
            "GPIB::1::99::INSTR",
            "USB::zzz::0x1::s::INSTR",
            "ASRL::INSTR",
        ] {
            let e = bad.parse::<ResourceDescriptor>().unwrap_err();
            assert!(
                matches!(e, InstrumentError::InvalidResourceName(_)),
                "'{bad}' should be InvalidResourceName, got {e:?}"
            );
        }
    }

    #[test]
    fn display_round_trips_the_raw_string() {
        let s = "TCPIP0::192.168.1.50::hislip0::INSTR";
        let r = s.parse::<ResourceDescriptor>().expect("should parse");
        assert_eq!(r.to_string(), s);
    }
}
