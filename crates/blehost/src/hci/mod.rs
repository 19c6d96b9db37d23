//! Host Controller Interface: transports, packet codecs, and the
//! command/event core.

pub mod constants;
mod core;
pub mod packet;
pub mod transport;

#[cfg(test)]
mod tests;

use std::io;

use thiserror::Error;

pub use self::core::{AdvHandler, AdvParams, Conn, Hci};
pub use packet::{
    AclData, CommandComplete, CommandStatus, DisconnectionComplete, EncryptionChange, HciCommand,
    HciEvent, LeAdvertisingReport, LeConnectionComplete, LeLongTermKeyRequest,
};
pub use transport::{H4Stream, HciSocket, Transport};

/// Errors surfaced by the HCI layer.
#[derive(Debug, Error)]
pub enum HciError {
    #[error("failed to open HCI socket: {0}")]
    Socket(io::Error),

    #[error("failed to bind HCI socket: {0}")]
    Bind(io::Error),

    /// The transport failed; every connection is torn down.
    #[error("transport failure: {0}")]
    Transport(io::Error),

    #[error("command 0x{opcode:04x} timed out")]
    CommandTimeout { opcode: u16 },

    #[error("command 0x{opcode:04x} failed with status 0x{status:02x}")]
    CommandFailed { opcode: u16, status: u8 },

    #[error("connection attempt timed out")]
    DialTimeout,

    #[error("HCI closed")]
    Closed,

    #[error("connection closed")]
    Disconnected,

    #[error("invalid packet: {0}")]
    InvalidPacket(String),
}
