//! VISA-style 32-bit status codes.
//!
//! The numeric space is tagged: codes with bit 31 set are errors, codes in
//! the `0x3FFF_xxxx` range are informational successes, and zero is plain
//! success. Callers classify by tag, not by numeric equality.

use phf::phf_map;

use crate::InstrumentError;

/// A 32-bit VISA status code.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Status {
    /// Operation completed successfully.
    Success = 0x0000_0000,
    /// Read terminated because the termination character was received.
    TermCharReceived = 0x3FFF_0005,
    /// Read terminated because the requested byte count was reached.
    MaxCountReached = 0x3FFF_0006,
    /// Unknown system error.
    SystemError = 0xBFFF_0000,
    /// Invalid session or object reference.
    InvalidObject = 0xBFFF_000E,
    /// Resource is locked by another session.
    ResourceLocked = 0xBFFF_000F,
    /// Invalid expression for a resource search.
    InvalidExpression = 0xBFFF_0010,
    /// Resource not found.
    ResourceNotFound = 0xBFFF_0011,
    /// Invalid resource name.
    InvalidResourceName = 0xBFFF_0012,
    /// Timeout expired.
    Timeout = 0xBFFF_0015,
    /// Attribute not supported.
    UnsupportedAttribute = 0xBFFF_001D,
    /// Inconsistent operation setup.
    InvalidSetup = 0xBFFF_003A,
    /// Insufficient resources (handle arenas exhausted).
    AllocationFailure = 0xBFFF_003C,
    /// I/O or protocol error.
    IoError = 0xBFFF_003E,
    /// Invalid format.
    InvalidFormat = 0xBFFF_003F,
    /// Operation not supported.
    UnsupportedOperation = 0xBFFF_0067,
    /// Connection lost.
    ConnectionLost = 0xBFFF_006D,
}

static DESCRIPTIONS: phf::Map<u32, &'static str> = phf_map! {
    0x0000_0000u32 => "Operation completed successfully.",
    0x3FFF_0005u32 => "Read terminated by termination character.",
    0x3FFF_0006u32 => "Read terminated by max count.",
    0xBFFF_0000u32 => "Unknown system error.",
    0xBFFF_000Eu32 => "Invalid session or object reference.",
    0xBFFF_000Fu32 => "Resource is locked.",
    0xBFFF_0010u32 => "Invalid expression for resource search.",
    0xBFFF_0011u32 => "Resource not found.",
    0xBFFF_0012u32 => "Invalid resource name.",
    0xBFFF_0015u32 => "Timeout expired.",
    0xBFFF_001Du32 => "Attribute not supported.",
    0xBFFF_003Au32 => "Invalid setup.",
    0xBFFF_003Cu32 => "Insufficient resources.",
    0xBFFF_003Eu32 => "I/O error.",
    0xBFFF_003Fu32 => "Invalid format.",
    0xBFFF_0067u32 => "Operation not supported.",
    0xBFFF_006Du32 => "Connection lost.",
};

impl Status {
    /// The raw 32-bit code.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// `true` when bit 31 is set.
    #[must_use]
    pub const fn is_error(self) -> bool {
        (self as u32) & 0x8000_0000 != 0
    }

    /// `true` for informational successes (nonzero, bit 31 clear).
    #[must_use]
    pub const fn is_informational(self) -> bool {
        !self.is_error() && (self as u32) != 0
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", status_description(self.raw()))
    }
}

impl From<&InstrumentError> for Status {
    fn from(err: &InstrumentError) -> Self {
        match err {
            InstrumentError::InvalidResourceName(_) => Self::InvalidResourceName,
            InstrumentError::InvalidObject => Self::InvalidObject,
            InstrumentError::ResourceNotFound { .. } => Self::ResourceNotFound,
            InstrumentError::ConnectionLost => Self::ConnectionLost,
            InstrumentError::Timeout => Self::Timeout,
            InstrumentError::ProtocolError { .. }
            | InstrumentError::IoError { .. }
            | InstrumentError::UsbError { .. }
            | InstrumentError::SerialError { .. } => Self::IoError,
            InstrumentError::AllocationFailure => Self::AllocationFailure,
            InstrumentError::UnsupportedAttribute => Self::UnsupportedAttribute,
            InstrumentError::UnsupportedOperation => Self::UnsupportedOperation,
            InstrumentError::InvalidSetup { .. } => Self::InvalidSetup,
            InstrumentError::InvalidFormat { .. } | InstrumentError::ParseIntError { .. } => {
                Self::InvalidFormat
            }
        }
    }
}

/// A short human-readable description for a raw status code. Unknown codes
/// render with their hexadecimal value.
#[must_use]
pub fn status_description(code: u32) -> String {
    DESCRIPTIONS.get(&code).map_or_else(
        || format!("Unknown status code: 0x{code:08X}"),
        |d| (*d).to_string(),
    )
}
