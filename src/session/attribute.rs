//! Session attribute identifiers and their typed values.

/// The attribute set a session exposes through `get_attribute` /
/// `set_attribute`. The first four are writable; the rest are read-only
/// reflections of the resource descriptor and the implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// I/O timeout in milliseconds (default 2000).
    TimeoutValue,
    /// Termination character (default `\n`).
    TermChar,
    /// Whether reads honor the termination character (default false).
    TermCharEnabled,
    /// Whether writes assert END/EOM on the last byte (default true).
    SendEndEnabled,
    /// The resource string the session was opened with.
    ResourceName,
    /// VISA numeric interface type.
    InterfaceType,
    /// Board number from the resource string.
    InterfaceNumber,
    /// Implementation manufacturer name.
    ManufacturerName,
    /// Implementation version, `0x00MMmmpp`.
    ImplementationVersion,
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    U8(u8),
    U16(u16),
    U32(u32),
    Bool(bool),
    String(String),
}
