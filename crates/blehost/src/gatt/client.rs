//! The GATT discovery client.
//!
//! Walks a remote server's hierarchy over the ATT bearer and manages value
//! subscriptions: CCCD writes, per-subscription handlers, and monotonically
//! increasing delivery sequence ids.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::att::error::{AttError, AttResult};
use crate::att::{AttChannel, Bearer, Notification, NotificationHandler, Server};
use crate::gatt::types::{Characteristic, Descriptor, Profile, Properties, Service};
use crate::uuid::{CHARACTERISTIC_UUID, PRIMARY_SERVICE_UUID, Uuid};

use byteorder::{ByteOrder, LittleEndian};

const CCC_NOTIFY: u16 = 0x0001;
const CCC_INDICATE: u16 = 0x0002;

/// The maximum attribute value length. [Vol 3, Part F, 3.2.9]
const MAX_ATTR_VALUE_LEN: usize = 512;

/// Handler for subscribed values: `(sequence id, value)`.
pub type SubscriptionHandler = Arc<dyn Fn(u64, &[u8]) + Send + Sync>;

struct Sub {
    cccd_handle: u16,
    ccc: u16,
    notify_handler: Option<SubscriptionHandler>,
    indicate_handler: Option<SubscriptionHandler>,
    /// Next delivery id; survives re-subscription while the slot lives.
    id: u64,
}

/// A GATT client over one connection.
pub struct GattClient {
    bearer: Arc<Bearer>,
    profile: Mutex<Option<Profile>>,
    subs: Arc<Mutex<HashMap<u16, Sub>>>,
}

impl GattClient {
    /// Builds the client and starts its bearer. Passing a `server` also
    /// serves the local database over the same bearer, so the peer can run
    /// discovery against us.
    pub fn new(chan: Arc<dyn AttChannel>, server: Option<Arc<Server>>) -> Self {
        let subs: Arc<Mutex<HashMap<u16, Sub>>> = Arc::new(Mutex::new(HashMap::new()));
        let handler_subs = Arc::clone(&subs);
        let handler: NotificationHandler =
            Arc::new(move |notification| dispatch(&handler_subs, notification));
        let bearer = Bearer::spawn(chan, Some(handler), server);
        Self {
            bearer,
            profile: Mutex::new(None),
            subs,
        }
    }

    /// The underlying bearer.
    pub fn bearer(&self) -> &Arc<Bearer> {
        &self.bearer
    }

    /// The most recently discovered profile.
    pub fn profile(&self) -> Option<Profile> {
        self.profile.lock().unwrap().clone()
    }

    /// Negotiates the ATT_MTU. [Vol 3, Part G, 4.3.1]
    pub fn exchange_mtu(&self, mtu: usize) -> AttResult<usize> {
        self.bearer.exchange_mtu(mtu)
    }

    /// Discovers the whole hierarchy: services, characteristics, and
    /// descriptors.
    pub fn discover_profile(&self, force: bool) -> AttResult<Profile> {
        if !force {
            if let Some(profile) = self.profile() {
                return Ok(profile);
            }
        }
        let mut services = self.discover_services(None)?;
        for service in &mut services {
            self.discover_characteristics(service)?;
            for index in 0..service.characteristics.len() {
                let mut ch = service.characteristics[index].clone();
                self.discover_descriptors(&mut ch)?;
                service.characteristics[index] = ch;
            }
        }
        let profile = Profile { services };
        *self.profile.lock().unwrap() = Some(profile.clone());
        Ok(profile)
    }

    /// Finds primary services. [Vol 3, Part G, 4.4.1]
    pub fn discover_services(&self, filter: Option<&[Uuid]>) -> AttResult<Vec<Service>> {
        let mut services = Vec::new();
        let mut start = 0x0001u16;
        'discovery: loop {
            let list = match self
                .bearer
                .read_by_group_type(start, 0xFFFF, &PRIMARY_SERVICE_UUID)
            {
                Ok(list) => list,
                Err(AttError::AttrNotFound) => break,
                Err(err) => return Err(err),
            };
            let mut last_end = start;
            for item in list.items() {
                let handle = LittleEndian::read_u16(&item[0..2]);
                let end_handle = LittleEndian::read_u16(&item[2..4]);
                let Some(uuid) = Uuid::from_slice_le(&item[4..]) else {
                    return Err(AttError::InvalidResponse);
                };
                if filter.map_or(true, |f| f.contains(&uuid)) {
                    services.push(Service {
                        uuid,
                        handle,
                        end_handle,
                        characteristics: Vec::new(),
                    });
                }
                if end_handle == 0xFFFF {
                    break 'discovery;
                }
                if let Some(f) = filter {
                    if services.len() == f.len() {
                        break 'discovery;
                    }
                }
                last_end = end_handle;
            }
            if last_end == 0xFFFF || last_end < start {
                break;
            }
            start = last_end + 1;
        }
        Ok(services)
    }

    /// Finds the characteristics within a service, fixing up each one's
    /// end handle from its successor. [Vol 3, Part G, 4.6.1]
    pub fn discover_characteristics<'a>(
        &self,
        service: &'a mut Service,
    ) -> AttResult<&'a [Characteristic]> {
        let mut start = service.handle;
        while start <= service.end_handle {
            let list = match self
                .bearer
                .read_by_type(start, service.end_handle, &CHARACTERISTIC_UUID)
            {
                Ok(list) => list,
                Err(AttError::AttrNotFound) => break,
                Err(err) => return Err(err),
            };
            let mut advanced = false;
            for item in list.items() {
                if item.len() < 5 {
                    return Err(AttError::InvalidResponse);
                }
                let handle = LittleEndian::read_u16(&item[0..2]);
                let properties = Properties(item[2]);
                let value_handle = LittleEndian::read_u16(&item[3..5]);
                let Some(uuid) = Uuid::from_slice_le(&item[5..]) else {
                    return Err(AttError::InvalidResponse);
                };
                if let Some(last) = service.characteristics.last_mut() {
                    last.end_handle = handle.saturating_sub(1);
                }
                service.characteristics.push(Characteristic {
                    uuid,
                    properties,
                    handle,
                    value_handle,
                    end_handle: service.end_handle,
                    descriptors: Vec::new(),
                    cccd: None,
                });
                if value_handle < start {
                    return Err(AttError::InvalidResponse);
                }
                start = value_handle.saturating_add(1);
                advanced = true;
            }
            if !advanced || start == 0 {
                break;
            }
        }
        Ok(&service.characteristics)
    }

    /// Finds the descriptors of a characteristic, marking its CCCD.
    /// [Vol 3, Part G, 4.7.1]
    pub fn discover_descriptors<'a>(
        &self,
        ch: &'a mut Characteristic,
    ) -> AttResult<&'a [Descriptor]> {
        let mut start = ch.value_handle.saturating_add(1);
        while start != 0 && start <= ch.end_handle {
            let rsp = match self.bearer.find_information(start, ch.end_handle) {
                Ok(rsp) => rsp,
                Err(AttError::AttrNotFound) => break,
                Err(err) => return Err(err),
            };
            let mut advanced = false;
            for (handle, uuid) in rsp.pairs() {
                let descriptor = Descriptor { uuid, handle };
                if descriptor.is_cccd() {
                    ch.cccd = Some(descriptor);
                }
                ch.descriptors.push(descriptor);
                if handle < start {
                    return Err(AttError::InvalidResponse);
                }
                start = handle.saturating_add(1);
                advanced = true;
            }
            if !advanced {
                break;
            }
        }
        Ok(&ch.descriptors)
    }

    /// Reads a characteristic value. [Vol 3, Part G, 4.8.1]
    pub fn read_characteristic(&self, ch: &Characteristic) -> AttResult<Vec<u8>> {
        self.bearer.read(ch.value_handle)
    }

    /// Reads a value longer than the MTU with Read + Read Blob.
    /// [Vol 3, Part G, 4.8.3]
    pub fn read_long_characteristic(&self, ch: &Characteristic) -> AttResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(MAX_ATTR_VALUE_LEN);
        let mut chunk = self.bearer.read(ch.value_handle)?;
        buffer.extend_from_slice(&chunk);
        while chunk.len() >= self.bearer.tx_mtu() - 1 && buffer.len() < MAX_ATTR_VALUE_LEN {
            chunk = self.bearer.read_blob(ch.value_handle, buffer.len() as u16)?;
            if chunk.is_empty() {
                break;
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }

    /// Writes a characteristic value. [Vol 3, Part G, 4.9.3]
    pub fn write_characteristic(
        &self,
        ch: &Characteristic,
        value: &[u8],
        no_rsp: bool,
    ) -> AttResult<()> {
        if no_rsp {
            self.bearer.write_command(ch.value_handle, value)
        } else {
            self.bearer.write(ch.value_handle, value)
        }
    }

    /// Reads a descriptor value. [Vol 3, Part G, 4.12.1]
    pub fn read_descriptor(&self, descriptor: &Descriptor) -> AttResult<Vec<u8>> {
        self.bearer.read(descriptor.handle)
    }

    /// Writes a descriptor value. [Vol 3, Part G, 4.12.3]
    pub fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> AttResult<()> {
        self.bearer.write(descriptor.handle, value)
    }

    /// Subscribes to notifications (or indications) of a characteristic
    /// value. Subscribing again with the same mode is a no-op.
    /// [Vol 3, Part G, 4.10 & 4.11]
    pub fn subscribe(
        &self,
        ch: &Characteristic,
        indication: bool,
        handler: SubscriptionHandler,
    ) -> AttResult<()> {
        let cccd = ch.cccd.ok_or(AttError::InvalidArgument)?;
        let flag = if indication { CCC_INDICATE } else { CCC_NOTIFY };
        self.set_handlers(cccd.handle, ch.value_handle, flag, Some(handler))
    }

    /// Drops a subscription; writes zero once both bits are clear.
    pub fn unsubscribe(&self, ch: &Characteristic, indication: bool) -> AttResult<()> {
        let cccd = ch.cccd.ok_or(AttError::InvalidArgument)?;
        let flag = if indication { CCC_INDICATE } else { CCC_NOTIFY };
        self.set_handlers(cccd.handle, ch.value_handle, flag, None)
    }

    fn set_handlers(
        &self,
        cccd_handle: u16,
        value_handle: u16,
        flag: u16,
        handler: Option<SubscriptionHandler>,
    ) -> AttResult<()> {
        let ccc = {
            let mut subs = self.subs.lock().unwrap();
            let sub = subs.entry(value_handle).or_insert(Sub {
                cccd_handle,
                ccc: 0,
                notify_handler: None,
                indicate_handler: None,
                id: 0,
            });
            match (&handler, sub.ccc & flag != 0) {
                // Already in the requested state.
                (None, false) | (Some(_), true) => return Ok(()),
                (None, true) => sub.ccc &= !flag,
                (Some(_), false) => sub.ccc |= flag,
            }
            if flag == CCC_NOTIFY {
                sub.notify_handler = handler;
            } else {
                sub.indicate_handler = handler;
            }
            sub.ccc
        };

        let result = self.bearer.write(cccd_handle, &ccc.to_le_bytes());
        if result.is_err() {
            self.subs.lock().unwrap().remove(&value_handle);
        }
        result
    }

    /// Clears every subscription, writing zero to each CCCD.
    pub fn clear_subscriptions(&self) -> AttResult<()> {
        let entries: Vec<(u16, u16)> = {
            let subs = self.subs.lock().unwrap();
            subs.iter()
                .map(|(vh, sub)| (*vh, sub.cccd_handle))
                .collect()
        };
        for (value_handle, cccd_handle) in entries {
            self.bearer.write(cccd_handle, &[0x00, 0x00])?;
            self.subs.lock().unwrap().remove(&value_handle);
        }
        Ok(())
    }
}

/// Routes an inbound notification to its subscription slot.
fn dispatch(subs: &Mutex<HashMap<u16, Sub>>, notification: Notification) {
    let mut subs = subs.lock().unwrap();
    let Some(sub) = subs.get_mut(&notification.handle) else {
        warn!(
            "unregistered {} for handle 0x{:04x}",
            if notification.indication {
                "indication"
            } else {
                "notification"
            },
            notification.handle
        );
        return;
    };
    let handler = if notification.indication {
        sub.indicate_handler.as_ref().or(sub.notify_handler.as_ref())
    } else {
        sub.notify_handler.as_ref()
    };
    match handler {
        Some(handler) => handler(sub.id, &notification.value),
        None => debug!(
            "no handler for handle 0x{:04x}, dropping id {}",
            notification.handle, sub.id
        ),
    }
    sub.id += 1;
}
