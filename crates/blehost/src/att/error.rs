//! ATT error codes and bearer errors.

use thiserror::Error;

/// ATT protocol error codes. [Vol 3, Part F, 3.4.1.1]
pub mod code {
    pub const INVALID_HANDLE: u8 = 0x01;
    pub const READ_NOT_PERMITTED: u8 = 0x02;
    pub const WRITE_NOT_PERMITTED: u8 = 0x03;
    pub const INVALID_PDU: u8 = 0x04;
    pub const INSUFFICIENT_AUTHENTICATION: u8 = 0x05;
    pub const REQUEST_NOT_SUPPORTED: u8 = 0x06;
    pub const INVALID_OFFSET: u8 = 0x07;
    pub const INSUFFICIENT_AUTHORIZATION: u8 = 0x08;
    pub const PREPARE_QUEUE_FULL: u8 = 0x09;
    pub const ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
    pub const ATTRIBUTE_NOT_LONG: u8 = 0x0B;
    pub const INSUFFICIENT_ENCRYPTION_KEY_SIZE: u8 = 0x0C;
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: u8 = 0x0D;
    pub const UNLIKELY_ERROR: u8 = 0x0E;
    pub const INSUFFICIENT_ENCRYPTION: u8 = 0x0F;
    pub const UNSUPPORTED_GROUP_TYPE: u8 = 0x10;
    pub const INSUFFICIENT_RESOURCES: u8 = 0x11;
}

/// Errors surfaced by the ATT bearer and server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttError {
    /// Input violates a protocol range (bad handle range, oversized value).
    #[error("invalid argument")]
    InvalidArgument,

    /// The peer returned an ATT Error Response; the raw code is preserved
    /// for upper layers.
    #[error("ATT error response 0x{0:02x}")]
    Protocol(u8),

    /// The response does not match the shape the sent request requires.
    #[error("invalid response")]
    InvalidResponse,

    /// No response arrived within the sequential-protocol timeout.
    #[error("ATT request timeout")]
    SeqProtoTimeout,

    /// Discovery terminator: the peer has no more attributes in the range.
    /// Not a failure.
    #[error("attribute not found")]
    AttrNotFound,

    /// The connection went away while the operation was pending.
    #[error("disconnected")]
    Disconnected,
}

impl AttError {
    /// Maps a peer error code, folding the discovery terminator out of the
    /// opaque-protocol case.
    pub fn from_code(code: u8) -> Self {
        if code == code::ATTRIBUTE_NOT_FOUND {
            AttError::AttrNotFound
        } else {
            AttError::Protocol(code)
        }
    }
}

pub type AttResult<T> = Result<T, AttError>;
