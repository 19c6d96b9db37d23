//! SMP protocol constants. [Vol 3, Part H]

// Command codes.
pub const PAIRING_REQUEST: u8 = 0x01;
pub const PAIRING_RESPONSE: u8 = 0x02;
pub const PAIRING_CONFIRM: u8 = 0x03;
pub const PAIRING_RANDOM: u8 = 0x04;
pub const PAIRING_FAILED: u8 = 0x05;
pub const ENCRYPTION_INFORMATION: u8 = 0x06;
pub const CENTRAL_IDENTIFICATION: u8 = 0x07;
pub const IDENTITY_INFORMATION: u8 = 0x08;
pub const IDENTITY_ADDRESS_INFORMATION: u8 = 0x09;
pub const SIGNING_INFORMATION: u8 = 0x0A;
pub const SECURITY_REQUEST: u8 = 0x0B;
pub const PAIRING_PUBLIC_KEY: u8 = 0x0C;
pub const PAIRING_DHKEY_CHECK: u8 = 0x0D;
pub const KEYPRESS_NOTIFICATION: u8 = 0x0E;

// Pairing Failed reason codes.
pub const REASON_PASSKEY_ENTRY_FAILED: u8 = 0x01;
pub const REASON_OOB_NOT_AVAILABLE: u8 = 0x02;
pub const REASON_AUTHENTICATION_REQUIREMENTS: u8 = 0x03;
pub const REASON_CONFIRM_VALUE_FAILED: u8 = 0x04;
pub const REASON_PAIRING_NOT_SUPPORTED: u8 = 0x05;
pub const REASON_ENCRYPTION_KEY_SIZE: u8 = 0x06;
pub const REASON_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REASON_UNSPECIFIED: u8 = 0x08;
pub const REASON_REPEATED_ATTEMPTS: u8 = 0x09;
pub const REASON_INVALID_PARAMETERS: u8 = 0x0A;
pub const REASON_DHKEY_CHECK_FAILED: u8 = 0x0B;
pub const REASON_NUMERIC_COMPARISON_FAILED: u8 = 0x0C;

// IO capabilities.
pub const IO_CAP_DISPLAY_ONLY: u8 = 0x00;
pub const IO_CAP_DISPLAY_YES_NO: u8 = 0x01;
pub const IO_CAP_KEYBOARD_ONLY: u8 = 0x02;
pub const IO_CAP_NO_INPUT_NO_OUTPUT: u8 = 0x03;
pub const IO_CAP_KEYBOARD_DISPLAY: u8 = 0x04;

// OOB data flag.
pub const OOB_NOT_PRESENT: u8 = 0x00;
pub const OOB_PRESENT: u8 = 0x01;

// AuthReq bits.
pub const AUTH_REQ_BONDING: u8 = 0x01;
pub const AUTH_REQ_MITM: u8 = 0x04;
pub const AUTH_REQ_SC: u8 = 0x08;
pub const AUTH_REQ_KEYPRESS: u8 = 0x10;

// Key distribution bits.
pub const KEY_DIST_ENC_KEY: u8 = 0x01;
pub const KEY_DIST_ID_KEY: u8 = 0x02;
pub const KEY_DIST_SIGN_KEY: u8 = 0x04;

// Encryption key size bounds.
pub const MIN_ENCRYPTION_KEY_SIZE: u8 = 7;
pub const MAX_ENCRYPTION_KEY_SIZE: u8 = 16;

/// Rounds of confirm/random exchange in LE Secure Connections passkey
/// entry, one per passkey bit.
pub const PASSKEY_ROUNDS: u8 = 20;
