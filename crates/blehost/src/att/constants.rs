//! ATT protocol constants.

/// Default ATT_MTU before negotiation.
pub const DEFAULT_MTU: usize = 23;

/// Maximum ATT_MTU: 512 bytes of value plus the 3-byte ATT header.
pub const MAX_MTU: usize = 512 + 3;

// Opcodes. Requests are even, responses/commands/notifications odd.
pub const ERROR_RSP: u8 = 0x01;
pub const EXCHANGE_MTU_REQ: u8 = 0x02;
pub const EXCHANGE_MTU_RSP: u8 = 0x03;
pub const FIND_INFORMATION_REQ: u8 = 0x04;
pub const FIND_INFORMATION_RSP: u8 = 0x05;
pub const FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
pub const FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
pub const READ_BY_TYPE_REQ: u8 = 0x08;
pub const READ_BY_TYPE_RSP: u8 = 0x09;
pub const READ_REQ: u8 = 0x0A;
pub const READ_RSP: u8 = 0x0B;
pub const READ_BLOB_REQ: u8 = 0x0C;
pub const READ_BLOB_RSP: u8 = 0x0D;
pub const READ_MULTIPLE_REQ: u8 = 0x0E;
pub const READ_MULTIPLE_RSP: u8 = 0x0F;
pub const READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
pub const READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
pub const WRITE_REQ: u8 = 0x12;
pub const WRITE_RSP: u8 = 0x13;
pub const WRITE_CMD: u8 = 0x52;
pub const SIGNED_WRITE_CMD: u8 = 0xD2;
pub const PREPARE_WRITE_REQ: u8 = 0x16;
pub const PREPARE_WRITE_RSP: u8 = 0x17;
pub const EXECUTE_WRITE_REQ: u8 = 0x18;
pub const EXECUTE_WRITE_RSP: u8 = 0x19;
pub const HANDLE_VALUE_NTF: u8 = 0x1B;
pub const HANDLE_VALUE_IND: u8 = 0x1D;
pub const HANDLE_VALUE_CNF: u8 = 0x1E;

// Find Information response formats.
pub const FIND_INFORMATION_FORMAT_16BIT: u8 = 0x01;
pub const FIND_INFORMATION_FORMAT_128BIT: u8 = 0x02;

// Execute Write flags.
pub const EXECUTE_WRITE_CANCEL: u8 = 0x00;
pub const EXECUTE_WRITE_COMMIT: u8 = 0x01;

/// Prepared-write queue depth per client.
pub const PREPARE_WRITE_QUEUE_DEPTH: usize = 16;

/// The response opcode paired with a request opcode, if any.
pub fn rsp_of(req: u8) -> Option<u8> {
    match req {
        EXCHANGE_MTU_REQ => Some(EXCHANGE_MTU_RSP),
        FIND_INFORMATION_REQ => Some(FIND_INFORMATION_RSP),
        FIND_BY_TYPE_VALUE_REQ => Some(FIND_BY_TYPE_VALUE_RSP),
        READ_BY_TYPE_REQ => Some(READ_BY_TYPE_RSP),
        READ_REQ => Some(READ_RSP),
        READ_BLOB_REQ => Some(READ_BLOB_RSP),
        READ_MULTIPLE_REQ => Some(READ_MULTIPLE_RSP),
        READ_BY_GROUP_TYPE_REQ => Some(READ_BY_GROUP_TYPE_RSP),
        WRITE_REQ => Some(WRITE_RSP),
        PREPARE_WRITE_REQ => Some(PREPARE_WRITE_RSP),
        EXECUTE_WRITE_REQ => Some(EXECUTE_WRITE_RSP),
        HANDLE_VALUE_IND => Some(HANDLE_VALUE_CNF),
        _ => None,
    }
}

/// Whether an opcode names a server-bound request (even opcodes, bit 0
/// clear).
pub fn is_request(opcode: u8) -> bool {
    opcode & 0x01 == 0x00
}
