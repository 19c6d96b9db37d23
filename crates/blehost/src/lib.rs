//! blehost - a user-space Bluetooth Low Energy host stack.
//!
//! Implements the layered protocols between a kernel (or H4) HCI transport
//! and the application: L2CAP fixed-channel multiplexing, the Attribute
//! Protocol client/server bearer, the Generic Attribute Profile (database,
//! discovery, subscriptions), the Security Manager (LE Secure Connections
//! and legacy pairing with bonding), and advertising/scanning control.
//! Central and peripheral roles run concurrently over a single controller.

pub mod adv;
pub mod att;
pub mod device;
pub mod error;
pub mod gap;
pub mod gatt;
pub mod hci;
pub mod l2cap;
pub mod smp;
pub mod uuid;

pub use adv::Advertisement;
pub use device::{Device, DeviceOptions, Peer, TransportConfig};
pub use error::{Error, Result};
pub use gap::{AddrType, BdAddr, Role};
pub use gatt::{GattClient, GattServer, LocalCharacteristic, LocalService, Profile};
pub use hci::{Conn, Hci};
pub use smp::{AuthData, AuthReq, IoCapability};
pub use uuid::Uuid;
