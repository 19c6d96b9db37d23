//! Crate-level error types.
//!
//! Each protocol layer defines its own error enum; this module ties them
//! together into the error surface the orchestrator and applications see.

use thiserror::Error;

use crate::att::AttError;
use crate::hci::HciError;
use crate::smp::SmpError;

/// Errors surfaced by the host stack.
#[derive(Debug, Error)]
pub enum Error {
    #[error("HCI error: {0}")]
    Hci(#[from] HciError),

    #[error("ATT error: {0}")]
    Att(#[from] AttError),

    #[error("SMP error: {0}")]
    Smp(#[from] SmpError),

    #[error("advertising payload error: {0}")]
    Adv(#[from] crate::adv::AdvError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not connected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, Error>;
