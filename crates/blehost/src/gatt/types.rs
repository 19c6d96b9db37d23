//! GATT profile types.
//!
//! These model the hierarchy a client discovers on a remote server:
//! services containing characteristics containing descriptors.

use crate::uuid::{Uuid, CLIENT_CHARACTERISTIC_CONFIG_UUID};

/// Characteristic property bits from the declaration attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Properties(pub u8);

impl Properties {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
    pub const AUTHENTICATED_SIGNED_WRITES: u8 = 0x40;
    pub const EXTENDED_PROPERTIES: u8 = 0x80;

    pub fn can_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn can_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn can_write_without_response(&self) -> bool {
        self.0 & Self::WRITE_WITHOUT_RESPONSE != 0
    }

    pub fn can_notify(&self) -> bool {
        self.0 & Self::NOTIFY != 0
    }

    pub fn can_indicate(&self) -> bool {
        self.0 & Self::INDICATE != 0
    }
}

/// A discovered service.
#[derive(Debug, Clone)]
pub struct Service {
    pub uuid: Uuid,
    pub handle: u16,
    pub end_handle: u16,
    pub characteristics: Vec<Characteristic>,
}

/// A discovered characteristic.
#[derive(Debug, Clone)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: Properties,
    /// Declaration attribute handle.
    pub handle: u16,
    /// Value attribute handle (declaration handle + 1).
    pub value_handle: u16,
    /// Last handle belonging to this characteristic.
    pub end_handle: u16,
    pub descriptors: Vec<Descriptor>,
    /// The Client Characteristic Configuration descriptor, if discovered.
    pub cccd: Option<Descriptor>,
}

/// A discovered descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub handle: u16,
}

impl Descriptor {
    pub fn is_cccd(&self) -> bool {
        self.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID
    }
}

/// The discovered hierarchy of a remote server.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub services: Vec<Service>,
}

impl Profile {
    /// Finds the first discovered characteristic with the given UUID.
    pub fn find_characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == uuid)
    }

    /// Finds the first discovered service with the given UUID.
    pub fn find_service(&self, uuid: Uuid) -> Option<&Service> {
        self.services.iter().find(|s| s.uuid == uuid)
    }
}
