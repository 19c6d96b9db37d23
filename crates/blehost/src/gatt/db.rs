//! The GATT server attribute database.
//!
//! Attributes live in a flat table ordered by handle. Handles are assigned
//! contiguously from the current high-water mark as services are added.
//! Mutations take the writer half of the lock; request serving takes the
//! reader half, so database changes never interleave with request handling.

use std::sync::{Arc, RwLock};

use log::debug;

use crate::att::error::{code, AttError, AttResult};
use crate::gatt::types::Properties;
use crate::uuid::{
    Uuid, APPEARANCE_UUID, CHARACTERISTIC_UUID, CLIENT_CHARACTERISTIC_CONFIG_UUID,
    DEVICE_NAME_UUID, GAP_UUID, GATT_UUID, PRIMARY_SERVICE_UUID, SECONDARY_SERVICE_UUID,
    SERVICE_CHANGED_UUID,
};

/// Lowest assignable attribute handle.
pub const HANDLE_MIN: u16 = 0x0001;
/// Highest attribute handle.
pub const HANDLE_MAX: u16 = 0xFFFF;

/// Access permissions for one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub readable: bool,
    pub writable: bool,
    /// Access requires an encrypted link.
    pub encryption_required: bool,
    /// Access requires an authenticated (MITM-protected) link.
    pub authentication_required: bool,
}

impl Permissions {
    pub fn read_only() -> Self {
        Self {
            readable: true,
            writable: false,
            encryption_required: false,
            authentication_required: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            readable: true,
            writable: true,
            encryption_required: false,
            authentication_required: false,
        }
    }

    pub fn encrypted(mut self) -> Self {
        self.encryption_required = true;
        self
    }

    pub fn authenticated(mut self) -> Self {
        self.encryption_required = true;
        self.authentication_required = true;
        self
    }
}

/// Security properties of the link a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkSecurity {
    Plain,
    Encrypted,
    EncryptedAuthenticated,
}

pub type ReadHandler = Arc<dyn Fn(u16) -> AttResult<Vec<u8>> + Send + Sync>;
pub type WriteHandler = Arc<dyn Fn(u16, &[u8]) -> AttResult<()> + Send + Sync>;

/// One attribute in the table.
#[derive(Clone)]
pub struct Attribute {
    pub handle: u16,
    pub attr_type: Uuid,
    pub value: Vec<u8>,
    pub permissions: Permissions,
    pub read_handler: Option<ReadHandler>,
    pub write_handler: Option<WriteHandler>,
}

impl Attribute {
    fn fixed(handle: u16, attr_type: Uuid, value: Vec<u8>, permissions: Permissions) -> Self {
        Self {
            handle,
            attr_type,
            value,
            permissions,
            read_handler: None,
            write_handler: None,
        }
    }

    pub fn is_cccd(&self) -> bool {
        self.attr_type == CLIENT_CHARACTERISTIC_CONFIG_UUID
    }

    /// Checks read access and produces the value.
    pub fn read(&self, security: LinkSecurity) -> AttResult<Vec<u8>> {
        self.check_access(self.permissions.readable, code::READ_NOT_PERMITTED, security)?;
        match &self.read_handler {
            Some(handler) => handler(self.handle),
            None => Ok(self.value.clone()),
        }
    }

    fn check_access(&self, allowed: bool, denial: u8, security: LinkSecurity) -> AttResult<()> {
        if !allowed {
            return Err(AttError::Protocol(denial));
        }
        if self.permissions.authentication_required
            && security < LinkSecurity::EncryptedAuthenticated
        {
            return Err(AttError::Protocol(code::INSUFFICIENT_AUTHENTICATION));
        }
        if self.permissions.encryption_required && security < LinkSecurity::Encrypted {
            return Err(AttError::Protocol(code::INSUFFICIENT_ENCRYPTION));
        }
        Ok(())
    }

    pub fn check_writable(&self, security: LinkSecurity) -> AttResult<()> {
        self.check_access(self.permissions.writable, code::WRITE_NOT_PERMITTED, security)
    }
}

/// Application-side definition of a descriptor to be registered.
#[derive(Clone)]
pub struct LocalDescriptor {
    pub uuid: Uuid,
    pub value: Vec<u8>,
    pub permissions: Permissions,
}

/// Application-side definition of a characteristic to be registered.
#[derive(Clone)]
pub struct LocalCharacteristic {
    pub uuid: Uuid,
    pub properties: Properties,
    pub value: Vec<u8>,
    pub permissions: Permissions,
    pub descriptors: Vec<LocalDescriptor>,
    pub read_handler: Option<ReadHandler>,
    pub write_handler: Option<WriteHandler>,
}

impl LocalCharacteristic {
    pub fn new(uuid: Uuid, properties: u8, value: Vec<u8>) -> Self {
        Self {
            uuid,
            properties: Properties(properties),
            value,
            permissions: Permissions::read_write(),
            descriptors: Vec::new(),
            read_handler: None,
            write_handler: None,
        }
    }
}

/// Application-side definition of a service to be registered.
#[derive(Clone)]
pub struct LocalService {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<LocalCharacteristic>,
}

impl LocalService {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }
}

/// Handle range a registered service occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRange {
    pub uuid: Uuid,
    pub start: u16,
    pub end: u16,
}

struct DbInner {
    attrs: Vec<Attribute>,
    services: Vec<ServiceRange>,
    /// value handle -> CCCD handle, for notification fan-out.
    cccds: Vec<(u16, u16)>,
    next_handle: u16,
}

/// The attribute database.
pub struct AttributeDb {
    inner: RwLock<DbInner>,
}

impl AttributeDb {
    /// Creates a database holding the mandatory GAP (0x1800) and GATT
    /// (0x1801) services.
    pub fn new(device_name: &str) -> Self {
        let db = Self {
            inner: RwLock::new(DbInner {
                attrs: Vec::new(),
                services: Vec::new(),
                cccds: Vec::new(),
                next_handle: HANDLE_MIN,
            }),
        };
        db.add_mandatory_services(device_name);
        db
    }

    fn add_mandatory_services(&self, device_name: &str) {
        let mut gap = LocalService::new(GAP_UUID);
        gap.characteristics.push(LocalCharacteristic::new(
            DEVICE_NAME_UUID,
            Properties::READ,
            device_name.as_bytes().to_vec(),
        ));
        gap.characteristics.push(LocalCharacteristic::new(
            APPEARANCE_UUID,
            Properties::READ,
            vec![0x00, 0x00],
        ));

        let mut gatt = LocalService::new(GATT_UUID);
        gatt.characteristics.push(LocalCharacteristic::new(
            SERVICE_CHANGED_UUID,
            Properties::INDICATE,
            vec![],
        ));

        // Infallible on an empty table: handles start at HANDLE_MIN.
        let _ = self.add_service(&gap);
        let _ = self.add_service(&gatt);
    }

    /// Registers a service, assigning handles from the current high-water
    /// mark. Characteristics with notify or indicate properties get a CCCD
    /// descriptor appended automatically unless one was supplied.
    pub fn add_service(&self, svc: &LocalService) -> AttResult<ServiceRange> {
        let mut inner = self.inner.write().unwrap();

        let needed = Self::attr_count(svc);
        let start = inner.next_handle;
        if start as usize + needed - 1 > HANDLE_MAX as usize {
            return Err(AttError::InvalidArgument);
        }

        let mut handle = start;
        let decl_type = if svc.primary {
            PRIMARY_SERVICE_UUID
        } else {
            SECONDARY_SERVICE_UUID
        };
        inner.attrs.push(Attribute::fixed(
            handle,
            decl_type,
            svc.uuid.to_wire(),
            Permissions::read_only(),
        ));

        for ch in &svc.characteristics {
            let decl_handle = handle + 1;
            let value_handle = decl_handle + 1;

            let mut decl_value = Vec::with_capacity(3 + ch.uuid.wire_len());
            decl_value.push(ch.properties.0);
            decl_value.extend_from_slice(&value_handle.to_le_bytes());
            decl_value.extend_from_slice(&ch.uuid.to_wire());
            inner.attrs.push(Attribute::fixed(
                decl_handle,
                CHARACTERISTIC_UUID,
                decl_value,
                Permissions::read_only(),
            ));

            inner.attrs.push(Attribute {
                handle: value_handle,
                attr_type: ch.uuid,
                value: ch.value.clone(),
                permissions: ch.permissions,
                read_handler: ch.read_handler.clone(),
                write_handler: ch.write_handler.clone(),
            });
            handle = value_handle;

            let needs_cccd = (ch.properties.can_notify() || ch.properties.can_indicate())
                && !ch
                    .descriptors
                    .iter()
                    .any(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID);
            if needs_cccd {
                handle += 1;
                inner.attrs.push(Attribute::fixed(
                    handle,
                    CLIENT_CHARACTERISTIC_CONFIG_UUID,
                    vec![0x00, 0x00],
                    Permissions::read_write(),
                ));
                inner.cccds.push((value_handle, handle));
            }
            for desc in &ch.descriptors {
                handle += 1;
                inner.attrs.push(Attribute::fixed(
                    handle,
                    desc.uuid,
                    desc.value.clone(),
                    desc.permissions,
                ));
                if desc.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID {
                    inner.cccds.push((value_handle, handle));
                }
            }
        }

        let range = ServiceRange {
            uuid: svc.uuid,
            start,
            end: handle,
        };
        inner.services.push(range);
        inner.next_handle = handle + 1;
        debug!(
            "registered service {:?} at 0x{:04x}..0x{:04x}",
            svc.uuid, range.start, range.end
        );
        Ok(range)
    }

    fn attr_count(svc: &LocalService) -> usize {
        let mut n = 1;
        for ch in &svc.characteristics {
            n += 2 + ch.descriptors.len();
            if (ch.properties.can_notify() || ch.properties.can_indicate())
                && !ch
                    .descriptors
                    .iter()
                    .any(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID)
            {
                n += 1;
            }
        }
        n
    }

    /// Clears the table back to just the mandatory GAP and GATT services.
    pub fn remove_all_services(&self, device_name: &str) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.attrs.clear();
            inner.services.clear();
            inner.cccds.clear();
            inner.next_handle = HANDLE_MIN;
        }
        self.add_mandatory_services(device_name);
    }

    /// Registered service ranges, in handle order.
    pub fn services(&self) -> Vec<ServiceRange> {
        self.inner.read().unwrap().services.clone()
    }

    /// The CCCD handle guarding notifications for a value handle.
    pub fn cccd_for_value(&self, value_handle: u16) -> Option<u16> {
        self.inner
            .read()
            .unwrap()
            .cccds
            .iter()
            .find(|(vh, _)| *vh == value_handle)
            .map(|(_, ch)| *ch)
    }

    /// Looks up one attribute by handle.
    pub fn attribute(&self, handle: u16) -> Option<Attribute> {
        let inner = self.inner.read().unwrap();
        inner
            .attrs
            .iter()
            .find(|a| a.handle == handle)
            .cloned()
    }

    /// Runs `f` over the attributes within `[start, end]`, in handle order,
    /// under the read lock.
    pub fn with_range<R>(&self, start: u16, end: u16, f: impl FnOnce(&[Attribute]) -> R) -> R {
        let inner = self.inner.read().unwrap();
        let lo = inner.attrs.partition_point(|a| a.handle < start);
        let hi = inner.attrs.partition_point(|a| a.handle <= end);
        f(&inner.attrs[lo..hi])
    }

    /// Group ranges for Read By Group Type: service declarations of
    /// `group_type` within `[start, end]`, each with its end handle and
    /// declaration value.
    pub fn groups(&self, start: u16, end: u16, group_type: &Uuid) -> Vec<(u16, u16, Vec<u8>)> {
        let inner = self.inner.read().unwrap();
        inner
            .services
            .iter()
            .filter(|range| range.start >= start && range.start <= end)
            .filter_map(|range| {
                let decl = inner.attrs.iter().find(|a| a.handle == range.start)?;
                if decl.attr_type != *group_type {
                    return None;
                }
                Some((range.start, range.end, decl.value.clone()))
            })
            .collect()
    }

    /// Writes a value attribute, honoring any registered write handler.
    /// Permission checks happen in the ATT server before calling this.
    pub fn write_value(&self, handle: u16, value: &[u8]) -> AttResult<()> {
        // Take the handler out under the read lock so a long-running
        // handler doesn't hold the table.
        let handler = {
            let inner = self.inner.read().unwrap();
            let attr = inner
                .attrs
                .iter()
                .find(|a| a.handle == handle)
                .ok_or(AttError::Protocol(code::INVALID_HANDLE))?;
            attr.write_handler.clone()
        };
        if let Some(handler) = handler {
            return handler(handle, value);
        }
        let mut inner = self.inner.write().unwrap();
        let attr = inner
            .attrs
            .iter_mut()
            .find(|a| a.handle == handle)
            .ok_or(AttError::Protocol(code::INVALID_HANDLE))?;
        attr.value = value.to_vec();
        Ok(())
    }
}
