//! A native, session-oriented instrument-I/O library in the VISA model.
//! Applications name a device with an ASCII resource string such as
//! `TCPIP0::192.168.1.50::hislip0::INSTR`, open a session on it, and
//! exchange byte-oriented messages (typically SCPI) with the device.
//!
//! The wire protocols are implemented from the ground up: VXI-11 over
//! ONC-RPC/TCP (no RPC library), HiSLIP's dual-channel framing, USBTMC /
//! USB488 bulk and control transfers, raw SCPI sockets, and RS-232.
//! GPIB delegates to the host's NI-488.2 / linux-gpib library when one is
//! present. Discovery unions mDNS DNS-SD, USB enumeration, and a
//! serial-port scan behind a VISA find expression.
//!
//! ```no_run
//! use std::time::Duration;
//! use visa_native::{AccessMode, ResourceManager};
//!
//! # fn main() -> Result<(), visa_native::InstrumentError> {
//! let mut rm = ResourceManager::new();
//! let vi = rm.open(
//!     "TCPIP0::192.168.1.50::inst0::INSTR",
//!     AccessMode::NoLock,
//!     Duration::from_secs(5),
//! )?;
//! rm.write(vi, b"*IDN?\n")?;
//! let mut buf = [0u8; 256];
//! let (count, _) = rm.read(vi, &mut buf)?;
//! println!("{}", String::from_utf8_lossy(&buf[..count]));
//! rm.close(vi)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod resource;
pub mod session;
pub mod status;
pub mod transport;

mod discovery;

pub use error::InstrumentError;
pub use resource::{InterfaceType, ResourceDescriptor, Target};
pub use session::{
    AccessMode, Attribute, AttributeValue, FindListHandle, ObjectHandle, ResourceManager,
    SessionHandle,
};
pub use status::{status_description, Status};
pub use transport::{ReadTermination, Transport};
