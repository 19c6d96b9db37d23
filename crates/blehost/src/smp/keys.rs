//! Bond records and the bond store.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::gap::{AddrType, BdAddr};

use super::types::SmpResult;

/// Keys persisted for a bonded peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondInfo {
    /// Peer identity address, wire byte order.
    pub identity_addr: BdAddr,
    pub identity_addr_type: AddrType,
    /// Long Term Key, wire (little-endian) byte order as the controller
    /// consumes it.
    pub ltk: [u8; 16],
    /// Encrypted diversifier; zero for Secure Connections bonds.
    pub ediv: u16,
    /// Encryption random; zero for Secure Connections bonds.
    pub rand: [u8; 8],
    /// Peer Identity Resolving Key, when distributed.
    pub irk: Option<[u8; 16]>,
    /// Peer Connection Signature Resolving Key, when distributed.
    pub csrk: Option<[u8; 16]>,
    /// Whether the bond came out of Secure Connections pairing.
    pub secure_connections: bool,
    /// Whether the pairing was MITM protected.
    pub authenticated: bool,
}

impl BondInfo {
    /// Bond-store key: hex of the specification-order identity address.
    pub fn store_key(&self) -> String {
        hex::encode(self.identity_addr.swapped())
    }
}

/// Persistent storage for bonds, keyed by hex-encoded peer identity
/// address. Implementations must be safe to call from multiple connection
/// threads.
pub trait BondStore: Send + Sync {
    fn find(&self, key: &str) -> SmpResult<Option<BondInfo>>;
    fn save(&self, key: &str, bond: &BondInfo) -> SmpResult<()>;
    fn delete(&self, key: &str) -> SmpResult<()>;
}

/// A process-local bond store.
#[derive(Default)]
pub struct MemoryBondStore {
    bonds: RwLock<HashMap<String, BondInfo>>,
}

impl MemoryBondStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bonds.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BondStore for MemoryBondStore {
    fn find(&self, key: &str) -> SmpResult<Option<BondInfo>> {
        Ok(self.bonds.read().unwrap().get(key).cloned())
    }

    fn save(&self, key: &str, bond: &BondInfo) -> SmpResult<()> {
        self.bonds
            .write()
            .unwrap()
            .insert(key.to_string(), bond.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> SmpResult<()> {
        self.bonds.write().unwrap().remove(key);
        Ok(())
    }
}
