//! SMP types: IO capabilities, authentication requirements, pairing
//! features, and the error surface of the pairing engine.

use std::fmt;

use thiserror::Error;

use super::constants::*;

/// Errors surfaced by the Security Manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SmpError {
    /// The pairing failed with an SMP reason code, either reported by the
    /// peer or raised by a local check.
    #[error("pairing failed: {}", reason_name(*.0))]
    PairingFailed(u8),

    #[error("pairing already in progress")]
    AlreadyInProgress,

    #[error("pairing operation timed out")]
    Timeout,

    #[error("no bond found for peer")]
    NoBond,

    #[error("invalid SMP PDU")]
    InvalidPdu,

    #[error("connection closed")]
    Disconnected,

    #[error("I/O failure: {0}")]
    Io(String),
}

pub type SmpResult<T> = Result<T, SmpError>;

fn reason_name(code: u8) -> &'static str {
    match code {
        REASON_PASSKEY_ENTRY_FAILED => "passkey entry failed",
        REASON_OOB_NOT_AVAILABLE => "OOB not available",
        REASON_AUTHENTICATION_REQUIREMENTS => "authentication requirements",
        REASON_CONFIRM_VALUE_FAILED => "confirm value failed",
        REASON_PAIRING_NOT_SUPPORTED => "pairing not supported",
        REASON_ENCRYPTION_KEY_SIZE => "encryption key size",
        REASON_COMMAND_NOT_SUPPORTED => "command not supported",
        REASON_UNSPECIFIED => "unspecified reason",
        REASON_REPEATED_ATTEMPTS => "repeated attempts",
        REASON_INVALID_PARAMETERS => "invalid parameters",
        REASON_DHKEY_CHECK_FAILED => "DHKey check failed",
        REASON_NUMERIC_COMPARISON_FAILED => "numeric comparison failed",
        _ => "unknown reason",
    }
}

/// IO capability advertised during pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

impl IoCapability {
    pub fn to_u8(self) -> u8 {
        match self {
            IoCapability::DisplayOnly => IO_CAP_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => IO_CAP_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => IO_CAP_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => IO_CAP_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => IO_CAP_KEYBOARD_DISPLAY,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            IO_CAP_DISPLAY_ONLY => Some(IoCapability::DisplayOnly),
            IO_CAP_DISPLAY_YES_NO => Some(IoCapability::DisplayYesNo),
            IO_CAP_KEYBOARD_ONLY => Some(IoCapability::KeyboardOnly),
            IO_CAP_NO_INPUT_NO_OUTPUT => Some(IoCapability::NoInputNoOutput),
            IO_CAP_KEYBOARD_DISPLAY => Some(IoCapability::KeyboardDisplay),
        _ => None,
        }
    }

    fn has_input(self) -> bool {
        matches!(
            self,
            IoCapability::DisplayYesNo | IoCapability::KeyboardOnly | IoCapability::KeyboardDisplay
        )
    }

    fn has_output(self) -> bool {
        matches!(
            self,
            IoCapability::DisplayOnly | IoCapability::DisplayYesNo | IoCapability::KeyboardDisplay
        )
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoCapability::DisplayOnly => "DisplayOnly",
            IoCapability::DisplayYesNo => "DisplayYesNo",
            IoCapability::KeyboardOnly => "KeyboardOnly",
            IoCapability::NoInputNoOutput => "NoInputNoOutput",
            IoCapability::KeyboardDisplay => "KeyboardDisplay",
        };
        f.write_str(name)
    }
}

/// Authentication requirement flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthReq {
    pub bonding: bool,
    pub mitm: bool,
    pub secure_connections: bool,
    pub keypress: bool,
}

impl AuthReq {
    pub fn to_u8(self) -> u8 {
        let mut v = 0;
        if self.bonding {
            v |= AUTH_REQ_BONDING;
        }
        if self.mitm {
            v |= AUTH_REQ_MITM;
        }
        if self.secure_connections {
            v |= AUTH_REQ_SC;
        }
        if self.keypress {
            v |= AUTH_REQ_KEYPRESS;
        }
        v
    }

    pub fn from_u8(value: u8) -> Self {
        Self {
            bonding: value & AUTH_REQ_BONDING != 0,
            mitm: value & AUTH_REQ_MITM != 0,
            secure_connections: value & AUTH_REQ_SC != 0,
            keypress: value & AUTH_REQ_KEYPRESS != 0,
        }
    }
}

impl Default for AuthReq {
    fn default() -> Self {
        Self {
            bonding: true,
            mitm: false,
            secure_connections: true,
            keypress: false,
        }
    }
}

/// Local pairing configuration carried in Pairing Request/Response.
#[derive(Debug, Clone, Copy)]
pub struct SmpConfig {
    pub io_capability: IoCapability,
    pub oob_present: bool,
    pub auth_req: AuthReq,
    pub max_key_size: u8,
    pub initiator_key_dist: u8,
    pub responder_key_dist: u8,
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoInputNoOutput,
            oob_present: false,
            auth_req: AuthReq::default(),
            max_key_size: MAX_ENCRYPTION_KEY_SIZE,
            initiator_key_dist: KEY_DIST_ENC_KEY | KEY_DIST_ID_KEY,
            responder_key_dist: KEY_DIST_ENC_KEY | KEY_DIST_ID_KEY,
        }
    }
}

/// Authentication data the application supplies to `pair`.
#[derive(Debug, Clone, Default)]
pub struct AuthData {
    /// The passkey to use for passkey entry, when the local side is the
    /// input device.
    pub passkey: Option<u32>,
    /// Out-of-band random value received over the OOB channel.
    pub oob_data: Option<[u8; 16]>,
}

/// The association model selected by the IO capability matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMethod {
    JustWorks,
    NumericComparison,
    PasskeyEntry,
    OutOfBand,
}

/// Selects the association model. [Vol 3, Part H, 2.3.5.1]
pub fn association_model(
    initiator: IoCapability,
    responder: IoCapability,
    initiator_oob: bool,
    responder_oob: bool,
    mitm: bool,
    secure_connections: bool,
) -> PairingMethod {
    if initiator_oob || responder_oob {
        return PairingMethod::OutOfBand;
    }
    if !mitm {
        return PairingMethod::JustWorks;
    }
    if initiator == IoCapability::NoInputNoOutput || responder == IoCapability::NoInputNoOutput {
        return PairingMethod::JustWorks;
    }
    if secure_connections
        && initiator.has_input()
        && initiator.has_output()
        && responder.has_input()
        && responder.has_output()
        && initiator != IoCapability::KeyboardOnly
        && responder != IoCapability::KeyboardOnly
    {
        return PairingMethod::NumericComparison;
    }
    if initiator == IoCapability::DisplayOnly && responder == IoCapability::DisplayOnly {
        return PairingMethod::JustWorks;
    }
    PairingMethod::PasskeyEntry
}

/// A decision request handed to the application during pairing.
#[derive(Debug, Clone)]
pub enum PairingDecision {
    /// Display this value and confirm the peer shows the same one.
    NumericComparison(u32),
    /// Display this passkey for the peer to type.
    DisplayPasskey(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_io_means_just_works() {
        let m = association_model(
            IoCapability::NoInputNoOutput,
            IoCapability::NoInputNoOutput,
            false,
            false,
            true,
            true,
        );
        assert_eq!(m, PairingMethod::JustWorks);
    }

    #[test]
    fn no_mitm_means_just_works() {
        let m = association_model(
            IoCapability::KeyboardDisplay,
            IoCapability::KeyboardDisplay,
            false,
            false,
            false,
            true,
        );
        assert_eq!(m, PairingMethod::JustWorks);
    }

    #[test]
    fn displays_with_sc_compare_numerically() {
        let m = association_model(
            IoCapability::DisplayYesNo,
            IoCapability::KeyboardDisplay,
            false,
            false,
            true,
            true,
        );
        assert_eq!(m, PairingMethod::NumericComparison);
    }

    #[test]
    fn keyboard_peer_enters_passkey() {
        let m = association_model(
            IoCapability::DisplayOnly,
            IoCapability::KeyboardOnly,
            false,
            false,
            true,
            true,
        );
        assert_eq!(m, PairingMethod::PasskeyEntry);
    }

    #[test]
    fn oob_wins() {
        let m = association_model(
            IoCapability::NoInputNoOutput,
            IoCapability::NoInputNoOutput,
            true,
            false,
            false,
            true,
        );
        assert_eq!(m, PairingMethod::OutOfBand);
    }

    #[test]
    fn auth_req_round_trips() {
        let a = AuthReq {
            bonding: true,
            mitm: true,
            secure_connections: true,
            keypress: false,
        };
        assert_eq!(AuthReq::from_u8(a.to_u8()), a);
        assert_eq!(a.to_u8(), 0x0D);
    }
}
