//! Security Manager Protocol: LE pairing, key derivation, and bonding.

pub mod constants;
pub mod crypto;
pub mod keys;
pub mod manager;
pub mod types;

#[cfg(test)]
mod tests;

pub use keys::{BondInfo, BondStore, MemoryBondStore};
pub use manager::{CustomPairing, PairingState, SecurityManager};
pub use types::{AuthData, AuthReq, IoCapability, PairingDecision, SmpConfig, SmpError};
