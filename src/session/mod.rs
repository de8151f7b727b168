//! The session layer: handle allocation, per-session attribute state, and
//! dispatch to the owned transport.
//!
//! [`ResourceManager`] is the entry point (the "default resource manager"
//! of the VISA model). It owns two fixed-capacity arenas — 256 instrument
//! sessions and 32 find lists — fed from one shared monotone handle
//! counter.
//!
//! # Concurrency
//!
//! Every mutating operation takes `&mut self`, so the compiler enforces
//! the single-writer rule; a manager shared across threads must be
//! wrapped in a lock (`Mutex<ResourceManager>`). The type is `Send`.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::discovery;
use crate::error::Result;
use crate::resource::{InterfaceType, ResourceDescriptor};
use crate::transport::{self, ReadTermination, Transport};
use crate::InstrumentError;

mod arena;
mod attribute;

pub use attribute::{Attribute, AttributeValue};

use arena::Arena;

/// Capacity of the session arena.
pub const MAX_SESSIONS: usize = 256;
/// Capacity of the find-list arena.
pub const MAX_FIND_LISTS: usize = 32;

/// Reported for [`Attribute::ManufacturerName`].
pub const MANUFACTURER_NAME: &str = "visa-native";
/// Reported for [`Attribute::ImplementationVersion`] (1.0.0).
pub const IMPLEMENTATION_VERSION: u32 = 0x0001_0000;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Requested access mode for `open`. Lock semantics are not implemented;
/// the parameter exists for API fidelity and future use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessMode {
    #[default]
    NoLock,
    ExclusiveLock,
    SharedLock,
}

/// Handle to an open instrument session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u32);

/// Handle to a discovery result list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FindListHandle(u32);

/// Either kind of handle, for `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(u32);

impl SessionHandle {
    /// The raw handle integer.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl FindListHandle {
    /// The raw handle integer.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<SessionHandle> for ObjectHandle {
    fn from(handle: SessionHandle) -> Self {
        Self(handle.0)
    }
}

impl From<FindListHandle> for ObjectHandle {
    fn from(handle: FindListHandle) -> Self {
        Self(handle.0)
    }
}

struct Session {
    resource: ResourceDescriptor,
    transport: Box<dyn Transport + Send>,
    timeout: Duration,
    term_char: u8,
    term_char_enabled: bool,
    send_end_enabled: bool,
}

struct FindList {
    descriptors: Vec<String>,
    cursor: usize,
}

/// The resource manager: opens sessions, runs discovery, and dispatches
/// handle-directed operations.
pub struct ResourceManager {
    sessions: Arena<Session>,
    find_lists: Arena<FindList>,
    next_handle: u32,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    /// Create a resource manager with empty arenas.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Arena::new(MAX_SESSIONS),
            find_lists: Arena::new(MAX_FIND_LISTS),
            next_handle: 1,
        }
    }

    /// Parse `resource`, select and open its transport, and allocate a
    /// session with default attributes. An `open_timeout` of zero means
    /// the 5-second default.
    ///
    /// # Errors
    /// Parse failures, transport handshake failures, and arena
    /// exhaustion.
    #[instrument(skip(self))]
    pub fn open(
        &mut self,
        resource: &str,
        access_mode: AccessMode,
        open_timeout: Duration,
    ) -> Result<SessionHandle> {
        // Lock semantics are not implemented; the mode is accepted for
        // API fidelity.
        let _ = access_mode;

        let descriptor: ResourceDescriptor = resource.parse()?;
        let open_timeout = if open_timeout.is_zero() {
            DEFAULT_OPEN_TIMEOUT
        } else {
            open_timeout
        };

        let transport = transport::connect(&descriptor, open_timeout)?;
        let session = Session {
            resource: descriptor,
            transport,
            timeout: DEFAULT_TIMEOUT,
            term_char: b'\n',
            term_char_enabled: false,
            send_end_enabled: true,
        };
        let handle = self.sessions.insert(&mut self.next_handle, session)?;
        debug!(handle, resource, "session opened");
        Ok(SessionHandle(handle))
    }

    /// Close a session or find list, releasing the underlying transport
    /// or descriptor list.
    ///
    /// # Errors
    /// [`InstrumentError::InvalidObject`] when the handle is stale or
    /// unknown.
    pub fn close(&mut self, handle: impl Into<ObjectHandle>) -> Result<()> {
        let ObjectHandle(raw) = handle.into();
        if self.sessions.remove(raw).is_some() {
            debug!(handle = raw, "session closed");
            return Ok(());
        }
        if self.find_lists.remove(raw).is_some() {
            return Ok(());
        }
        Err(InstrumentError::InvalidObject)
    }

    fn session(&self, handle: SessionHandle) -> Result<&Session> {
        self.sessions
            .get(handle.0)
            .ok_or(InstrumentError::InvalidObject)
    }

    fn session_mut(&mut self, handle: SessionHandle) -> Result<&mut Session> {
        self.sessions
            .get_mut(handle.0)
            .ok_or(InstrumentError::InvalidObject)
    }

    /// Write `buf` to the session's device.
    ///
    /// # Errors
    /// [`InstrumentError::InvalidObject`] for stale handles, plus
    /// transport failures.
    pub fn write(&mut self, session: SessionHandle, buf: &[u8]) -> Result<usize> {
        self.session_mut(session)?.transport.write(buf)
    }

    /// Read into `buf`, bounded by the session's timeout attribute.
    ///
    /// # Errors
    /// [`InstrumentError::InvalidObject`] for stale handles, plus
    /// transport failures.
    pub fn read(
        &mut self,
        session: SessionHandle,
        buf: &mut [u8],
    ) -> Result<(usize, ReadTermination)> {
        let session = self.session_mut(session)?;
        let timeout = session.timeout;
        session.transport.read(buf, timeout)
    }

    /// Read the device's status byte.
    ///
    /// # Errors
    /// [`InstrumentError::InvalidObject`] for stale handles, plus
    /// transport failures.
    pub fn read_status_byte(&mut self, session: SessionHandle) -> Result<u16> {
        self.session_mut(session)?.transport.read_stb()
    }

    /// Send a device clear.
    ///
    /// # Errors
    /// [`InstrumentError::InvalidObject`] for stale handles, plus
    /// transport failures.
    pub fn clear(&mut self, session: SessionHandle) -> Result<()> {
        self.session_mut(session)?.transport.clear()
    }

    /// Read one attribute.
    ///
    /// # Errors
    /// [`InstrumentError::InvalidObject`] for stale handles.
    pub fn get_attribute(
        &self,
        session: SessionHandle,
        attribute: Attribute,
    ) -> Result<AttributeValue> {
        let session = self.session(session)?;
        Ok(match attribute {
            Attribute::TimeoutValue => {
                AttributeValue::U32(transport::timeout_ms(session.timeout))
            }
            Attribute::TermChar => AttributeValue::U8(session.term_char),
            Attribute::TermCharEnabled => AttributeValue::Bool(session.term_char_enabled),
            Attribute::SendEndEnabled => AttributeValue::Bool(session.send_end_enabled),
            Attribute::ResourceName => {
                AttributeValue::String(session.resource.raw().to_string())
            }
            Attribute::InterfaceType => {
                AttributeValue::U16(session.resource.interface_type().number())
            }
            Attribute::InterfaceNumber => AttributeValue::U16(session.resource.board_number()),
            Attribute::ManufacturerName => {
                AttributeValue::String(MANUFACTURER_NAME.to_string())
            }
            Attribute::ImplementationVersion => AttributeValue::U32(IMPLEMENTATION_VERSION),
        })
    }

    /// Write one of the four writable attributes.
    ///
    /// # Errors
    /// [`InstrumentError::UnsupportedAttribute`] for read-only
    /// attributes; [`InstrumentError::InvalidSetup`] for a value of the
    /// wrong type.
    pub fn set_attribute(
        &mut self,
        session: SessionHandle,
        attribute: Attribute,
        value: AttributeValue,
    ) -> Result<()> {
        let session = self.session_mut(session)?;
        match (attribute, value) {
            (Attribute::TimeoutValue, AttributeValue::U32(ms)) => {
                session.timeout = Duration::from_millis(u64::from(ms));
            }
            (Attribute::TermChar, AttributeValue::U8(c)) => session.term_char = c,
            (Attribute::TermCharEnabled, AttributeValue::Bool(enabled)) => {
                session.term_char_enabled = enabled;
            }
            (Attribute::SendEndEnabled, AttributeValue::Bool(enabled)) => {
                session.send_end_enabled = enabled;
            }
            (
                Attribute::TimeoutValue
                | Attribute::TermChar
                | Attribute::TermCharEnabled
                | Attribute::SendEndEnabled,
                _,
            ) => {
                return Err(InstrumentError::InvalidSetup {
                    details: "attribute value has the wrong type".to_string(),
                });
            }
            _ => return Err(InstrumentError::UnsupportedAttribute),
        }
        Ok(())
    }

    /// Run discovery for a find expression and allocate a find list over
    /// the results. Returns the handle, the match count, and the first
    /// descriptor (the cursor advances past it, as with `find_next`).
    ///
    /// # Errors
    /// [`InstrumentError::ResourceNotFound`] when nothing matched, and
    /// arena exhaustion.
    #[instrument(skip(self))]
    pub fn find_resources(
        &mut self,
        expression: &str,
    ) -> Result<(FindListHandle, u32, String)> {
        let descriptors = discovery::discover(expression);
        if descriptors.is_empty() {
            return Err(InstrumentError::ResourceNotFound {
                details: format!("no resources match '{expression}'"),
            });
        }

        let count = u32::try_from(descriptors.len()).unwrap_or(u32::MAX);
        let first = descriptors[0].clone();
        let list = FindList {
            descriptors,
            cursor: 1,
        };
        let handle = self.find_lists.insert(&mut self.next_handle, list)?;
        Ok((FindListHandle(handle), count, first))
    }

    /// Return the next descriptor from a find list.
    ///
    /// # Errors
    /// [`InstrumentError::InvalidObject`] for stale handles;
    /// [`InstrumentError::ResourceNotFound`] past the end of the list.
    pub fn find_next(&mut self, list: FindListHandle) -> Result<String> {
        let list = self
            .find_lists
            .get_mut(list.0)
            .ok_or(InstrumentError::InvalidObject)?;
        let Some(descriptor) = list.descriptors.get(list.cursor) else {
            return Err(InstrumentError::ResourceNotFound {
                details: "find list exhausted".to_string(),
            });
        };
        list.cursor += 1;
        Ok(descriptor.clone())
    }

    /// Parse a resource string without opening it, returning its
    /// interface type and board number.
    ///
    /// # Errors
    /// [`InstrumentError::InvalidResourceName`] for malformed strings.
    pub fn parse_resource(&self, resource: &str) -> Result<(InterfaceType, u16)> {
        let descriptor: ResourceDescriptor = resource.parse()?;
        Ok((descriptor.interface_type(), descriptor.board_number()))
    }

    /// Install a session over an externally built transport. Test
    /// scaffolding for attribute and dispatch coverage.
    #[cfg(test)]
    pub(crate) fn insert_session_for_test(
        &mut self,
        transport: Box<dyn Transport + Send>,
    ) -> SessionHandle {
        let session = Session {
            resource: "TCPIP0::127.0.0.1::INSTR"
                .parse()
                .expect("static test resource parses"),
            transport,
            timeout: DEFAULT_TIMEOUT,
            term_char: b'\n',
            term_char_enabled: false,
            send_end_enabled: true,
        };
        let handle = self
            .sessions
            .insert(&mut self.next_handle, session)
            .expect("test arena has room");
        SessionHandle(handle)
    }

    /// Install a canned find list. Test scaffolding.
    #[cfg(test)]
    pub(crate) fn insert_find_list_for_test(
        &mut self,
        descriptors: Vec<String>,
    ) -> FindListHandle {
        let handle = self
            .find_lists
            .insert(
                &mut self.next_handle,
                FindList {
                    descriptors,
                    cursor: 0,
                },
            )
            .expect("test arena has room");
        FindListHandle(handle)
    }
}
