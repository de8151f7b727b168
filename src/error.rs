//! All the errors that this crate can emit are defined in the
//! [`error::InstrumentError`] enum.

use std::num::ParseIntError;

use thiserror::Error;

/// Define errors that originate from this crate
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum InstrumentError {
    /// The given string could not be parsed as a VISA resource name.
    #[error("invalid resource name: {0}")]
    InvalidResourceName(String),

    /// A session or find-list handle did not refer to a live object.
    #[error("invalid session or object reference")]
    InvalidObject,

    /// The named resource could not be located (unresolvable host,
    /// unreachable portmapper, absent USB device, missing serial port).
    #[error("resource not found: {details}")]
    ResourceNotFound {
        /// What was being looked for and why it failed.
        details: String,
    },

    /// The peer closed the connection, or the transport is no longer usable.
    #[error("connection lost")]
    ConnectionLost,

    /// An operation did not complete within its deadline.
    #[error("timeout expired")]
    Timeout,

    /// The remote end violated the wire protocol (bad prologue, mismatched
    /// transaction ID or tag, unexpected message type, malformed reply).
    /// The session stays open but may be desynchronized; callers should
    /// issue a device clear before resuming.
    #[error("protocol error: {details}")]
    ProtocolError {
        /// A description of the violation.
        details: String,
    },

    /// An OS-level I/O failure that is not a timeout or a lost connection.
    #[error("IO error: {source}")]
    IoError {
        /// The underlying [`std::io::Error`].
        source: std::io::Error,
    },

    /// The session or find-list arena is full.
    #[error("insufficient resources to allocate a new handle")]
    AllocationFailure,

    /// The attribute identifier is not supported by this implementation,
    /// or the attribute is read-only.
    #[error("attribute not supported")]
    UnsupportedAttribute,

    /// The operation is not supported on this transport (e.g. GPIB without
    /// a loadable GPIB library).
    #[error("operation not supported")]
    UnsupportedOperation,

    /// The requested operation was given inconsistent or out-of-range
    /// parameters.
    #[error("invalid setup: {details}")]
    InvalidSetup {
        /// Which parameter was inconsistent.
        details: String,
    },

    /// A reply could not be interpreted in the expected format (e.g. a
    /// non-numeric `*STB?` response).
    #[error("invalid format: {details}")]
    InvalidFormat {
        /// What failed to parse.
        details: String,
    },

    /// An error from the USB stack.
    #[error("USB error: {source}")]
    UsbError {
        /// The underlying [`rusb::Error`].
        source: rusb::Error,
    },

    /// An error from the serial-port stack.
    #[error("serial port error: {source}")]
    SerialError {
        /// The underlying [`serialport::Error`].
        #[from]
        source: serialport::Error,
    },

    #[error("{source}")]
    ParseIntError {
        #[from]
        source: ParseIntError,
    },
}

impl From<std::io::Error> for InstrumentError {
    fn from(source: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match source.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::Timeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::ConnectionLost,
            _ => Self::IoError { source },
        }
    }
}

impl From<rusb::Error> for InstrumentError {
    fn from(source: rusb::Error) -> Self {
        match source {
            rusb::Error::Timeout => Self::Timeout,
            rusb::Error::NoDevice => Self::ConnectionLost,
            _ => Self::UsbError { source },
        }
    }
}

pub(crate) type Result<T> = std::result::Result<T, InstrumentError>;

#[cfg(test)]
mod unit {
    use super::InstrumentError;

    #[test]
    fn io_timeouts_classify_as_timeout() {
        let e: InstrumentError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline").into();
        assert!(matches!(e, InstrumentError::Timeout));

        let e: InstrumentError =
            std::io::Error::new(std::io::ErrorKind::WouldBlock, "no data").into();
        assert!(matches!(e, InstrumentError::Timeout));
    }

    #[test]
    fn peer_close_classifies_as_connection_lost() {
        let e: InstrumentError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "rst").into();
        assert!(matches!(e, InstrumentError::ConnectionLost));
    }
}
