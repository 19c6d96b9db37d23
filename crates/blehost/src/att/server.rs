//! ATT server request handlers.
//!
//! One [`Server`] exists per connection, sharing the GATT attribute
//! database and intercepting CCCD access so subscription state stays
//! per-connection. The bearer's request worker calls
//! [`Server::handle_request`] with each inbound request PDU and writes the
//! returned response back on the bearer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use super::bearer::AttChannel;
use super::constants::*;
use super::error::{code, AttError, AttResult};
use super::types::ErrorResponse;
use crate::gatt::db::{Attribute, AttributeDb};
use crate::uuid::{PRIMARY_SERVICE_UUID, SECONDARY_SERVICE_UUID, Uuid};

/// Only the notify and indicate bits of a CCCD are defined; the rest are
/// reserved and ignored on write.
const CCCD_VALID_BITS: u16 = 0x0003;

/// Per-connection ATT server.
pub struct Server {
    db: Arc<AttributeDb>,
    chan: Arc<dyn AttChannel>,
    prepared: Mutex<Vec<(u16, u16, Vec<u8>)>>,
}

impl Server {
    pub fn new(db: Arc<AttributeDb>, chan: Arc<dyn AttChannel>) -> Self {
        Self {
            db,
            chan,
            prepared: Mutex::new(Vec::new()),
        }
    }

    /// Handles one request PDU, producing the response to send back, or
    /// `None` for commands.
    pub fn handle_request(&self, request: &[u8]) -> Option<Vec<u8>> {
        let opcode = *request.first()?;
        let result = match opcode {
            EXCHANGE_MTU_REQ => self.on_exchange_mtu(request),
            FIND_INFORMATION_REQ => self.on_find_information(request),
            READ_BY_TYPE_REQ => self.on_read_by_type(request),
            READ_BY_GROUP_TYPE_REQ => self.on_read_by_group_type(request),
            READ_REQ => self.on_read(request),
            READ_BLOB_REQ => self.on_read_blob(request),
            READ_MULTIPLE_REQ => self.on_read_multiple(request),
            WRITE_REQ => self.on_write(request),
            WRITE_CMD => {
                self.on_write_command(request);
                return None;
            }
            SIGNED_WRITE_CMD => {
                // Signature verification needs the peer CSRK; without a
                // bond carrying one the write is dropped.
                debug!("ignoring signed write");
                return None;
            }
            PREPARE_WRITE_REQ => self.on_prepare_write(request),
            EXECUTE_WRITE_REQ => self.on_execute_write(request),
            other => {
                warn!("unsupported request 0x{other:02x}");
                Err((AttError::Protocol(code::REQUEST_NOT_SUPPORTED), 0))
            }
        };

        match result {
            Ok(response) => Some(response),
            Err((err, handle)) => {
                let error_code = match err {
                    AttError::Protocol(c) => c,
                    AttError::AttrNotFound => code::ATTRIBUTE_NOT_FOUND,
                    AttError::InvalidArgument => code::INVALID_PDU,
                    _ => code::UNLIKELY_ERROR,
                };
                Some(ErrorResponse::new(opcode, handle, error_code).serialize())
            }
        }
    }

    fn mtu(&self) -> usize {
        self.chan.tx_mtu()
    }

    /// Reads an attribute's value, redirecting CCCDs to this connection's
    /// subscription state.
    fn attr_value(&self, attr: &Attribute) -> AttResult<Vec<u8>> {
        if attr.is_cccd() {
            return Ok(self.chan.cccd_value(attr.handle).to_le_bytes().to_vec());
        }
        attr.read(self.chan.link_security())
    }

    // ---- handlers ----

    fn on_exchange_mtu(&self, request: &[u8]) -> HandlerResult {
        if request.len() != 3 {
            return Err((AttError::Protocol(code::INVALID_PDU), 0));
        }
        let client_rx = LittleEndian::read_u16(&request[1..3]) as usize;
        let server_rx = self.chan.rx_mtu();
        let agreed = client_rx.min(server_rx).max(DEFAULT_MTU);
        self.chan.set_tx_mtu(agreed);
        debug!("MTU exchange: client {client_rx}, server {server_rx} -> {agreed}");

        let mut response = vec![EXCHANGE_MTU_RSP, 0, 0];
        LittleEndian::write_u16(&mut response[1..3], server_rx as u16);
        Ok(response)
    }

    fn on_find_information(&self, request: &[u8]) -> HandlerResult {
        if request.len() != 5 {
            return Err((AttError::Protocol(code::INVALID_PDU), 0));
        }
        let start = LittleEndian::read_u16(&request[1..3]);
        let end = LittleEndian::read_u16(&request[3..5]);
        if start == 0 || start > end {
            return Err((AttError::Protocol(code::INVALID_HANDLE), start));
        }

        let mtu = self.mtu();
        let response = self.db.with_range(start, end, |attrs| {
            let mut response = vec![FIND_INFORMATION_RSP, 0];
            // A response carries a single format; emit the first
            // contiguous run of equally-sized UUIDs.
            let mut format = 0u8;
            for attr in attrs {
                let wire = attr.attr_type.to_wire();
                let this_format = if wire.len() == 2 {
                    FIND_INFORMATION_FORMAT_16BIT
                } else {
                    FIND_INFORMATION_FORMAT_128BIT
                };
                if format == 0 {
                    format = this_format;
                } else if format != this_format {
                    break;
                }
                if response.len() + 2 + wire.len() > mtu {
                    break;
                }
                response.extend_from_slice(&attr.handle.to_le_bytes());
                response.extend_from_slice(&wire);
            }
            if format == 0 {
                return None;
            }
            response[1] = format;
            Some(response)
        });
        response.ok_or((AttError::AttrNotFound, start))
    }

    fn on_read_by_type(&self, request: &[u8]) -> HandlerResult {
        let (start, end, attr_type) = parse_typed_range(request)?;

        let mtu = self.mtu();
        let mut denied: Option<(AttError, u16)> = None;
        let response = self.db.with_range(start, end, |attrs| {
            let mut response = vec![READ_BY_TYPE_RSP, 0];
            let mut item_len = 0usize;
            for attr in attrs.iter().filter(|a| a.attr_type == attr_type) {
                let value = match self.attr_value(attr) {
                    Ok(value) => value,
                    Err(err) => {
                        if denied.is_none() {
                            denied = Some((err, attr.handle));
                        }
                        break;
                    }
                };
                // Every entry shares the first entry's length, bounded by
                // the MTU.
                if item_len == 0 {
                    item_len = (2 + value.len()).min(mtu - 2).min(255);
                }
                let value_len = item_len - 2;
                if response.len() + item_len > mtu || value.len() < value_len {
                    break;
                }
                response.extend_from_slice(&attr.handle.to_le_bytes());
                response.extend_from_slice(&value[..value_len]);
            }
            if item_len == 0 {
                return None;
            }
            response[1] = item_len as u8;
            Some(response)
        });

        match response {
            Some(response) => Ok(response),
            None => match denied {
                Some((err, handle)) => Err((err, handle)),
                None => Err((AttError::AttrNotFound, start)),
            },
        }
    }

    fn on_read_by_group_type(&self, request: &[u8]) -> HandlerResult {
        let (start, end, group_type) = parse_typed_range(request)?;
        if group_type != PRIMARY_SERVICE_UUID && group_type != SECONDARY_SERVICE_UUID {
            return Err((AttError::Protocol(code::UNSUPPORTED_GROUP_TYPE), start));
        }

        let groups = self.db.groups(start, end, &group_type);
        if groups.is_empty() {
            return Err((AttError::AttrNotFound, start));
        }

        // Entries in one response share a single value width.
        let mtu = self.mtu();
        let first_len = groups[0].2.len();
        let item_len = 4 + first_len;
        let mut response = vec![READ_BY_GROUP_TYPE_RSP, item_len as u8];
        for (handle, end_handle, value) in groups {
            if value.len() != first_len || response.len() + item_len > mtu {
                break;
            }
            response.extend_from_slice(&handle.to_le_bytes());
            response.extend_from_slice(&end_handle.to_le_bytes());
            response.extend_from_slice(&value);
        }
        Ok(response)
    }

    fn on_read(&self, request: &[u8]) -> HandlerResult {
        if request.len() != 3 {
            return Err((AttError::Protocol(code::INVALID_PDU), 0));
        }
        let handle = LittleEndian::read_u16(&request[1..3]);
        let value = self.read_handle(handle)?;

        let max = self.mtu() - 1;
        let mut response = vec![READ_RSP];
        response.extend_from_slice(&value[..value.len().min(max)]);
        Ok(response)
    }

    fn on_read_blob(&self, request: &[u8]) -> HandlerResult {
        if request.len() != 5 {
            return Err((AttError::Protocol(code::INVALID_PDU), 0));
        }
        let handle = LittleEndian::read_u16(&request[1..3]);
        let offset = LittleEndian::read_u16(&request[3..5]) as usize;
        let value = self.read_handle(handle)?;
        if offset > value.len() {
            return Err((AttError::Protocol(code::INVALID_OFFSET), handle));
        }

        let max = self.mtu() - 1;
        let rest = &value[offset..];
        let mut response = vec![READ_BLOB_RSP];
        response.extend_from_slice(&rest[..rest.len().min(max)]);
        Ok(response)
    }

    fn on_read_multiple(&self, request: &[u8]) -> HandlerResult {
        if request.len() < 5 || (request.len() - 1) % 2 != 0 {
            return Err((AttError::Protocol(code::INVALID_PDU), 0));
        }
        let mut response = vec![READ_MULTIPLE_RSP];
        for chunk in request[1..].chunks_exact(2) {
            let handle = LittleEndian::read_u16(chunk);
            let value = self.read_handle(handle)?;
            response.extend_from_slice(&value);
        }
        response.truncate(self.mtu());
        Ok(response)
    }

    fn read_handle(&self, handle: u16) -> Result<Vec<u8>, (AttError, u16)> {
        let attr = self
            .db
            .attribute(handle)
            .ok_or((AttError::Protocol(code::INVALID_HANDLE), handle))?;
        self.attr_value(&attr).map_err(|err| (err, handle))
    }

    fn on_write(&self, request: &[u8]) -> HandlerResult {
        if request.len() < 3 {
            return Err((AttError::Protocol(code::INVALID_PDU), 0));
        }
        let handle = LittleEndian::read_u16(&request[1..3]);
        self.write_handle(handle, &request[3..])
            .map_err(|err| (err, handle))?;
        Ok(vec![WRITE_RSP])
    }

    fn on_write_command(&self, request: &[u8]) {
        if request.len() < 3 {
            return;
        }
        let handle = LittleEndian::read_u16(&request[1..3]);
        if let Err(err) = self.write_handle(handle, &request[3..]) {
            debug!("write command to 0x{handle:04x} refused: {err}");
        }
    }

    fn write_handle(&self, handle: u16, value: &[u8]) -> AttResult<()> {
        let attr = self
            .db
            .attribute(handle)
            .ok_or(AttError::Protocol(code::INVALID_HANDLE))?;
        if attr.is_cccd() {
            if value.len() != 2 {
                return Err(AttError::Protocol(code::INVALID_ATTRIBUTE_VALUE_LENGTH));
            }
            let bits = LittleEndian::read_u16(value) & CCCD_VALID_BITS;
            self.chan.set_cccd_value(handle, bits);
            return Ok(());
        }
        attr.check_writable(self.chan.link_security())?;
        self.db.write_value(handle, value)
    }

    fn on_prepare_write(&self, request: &[u8]) -> HandlerResult {
        if request.len() < 5 {
            return Err((AttError::Protocol(code::INVALID_PDU), 0));
        }
        let handle = LittleEndian::read_u16(&request[1..3]);
        let offset = LittleEndian::read_u16(&request[3..5]);
        let value = request[5..].to_vec();

        let attr = self
            .db
            .attribute(handle)
            .ok_or((AttError::Protocol(code::INVALID_HANDLE), handle))?;
        attr.check_writable(self.chan.link_security())
            .map_err(|err| (err, handle))?;

        {
            let mut prepared = self.prepared.lock().unwrap();
            if prepared.len() >= PREPARE_WRITE_QUEUE_DEPTH {
                return Err((AttError::Protocol(code::PREPARE_QUEUE_FULL), handle));
            }
            prepared.push((handle, offset, value.clone()));
        }

        let mut response = Vec::with_capacity(5 + value.len());
        response.push(PREPARE_WRITE_RSP);
        response.extend_from_slice(&request[1..]);
        Ok(response)
    }

    fn on_execute_write(&self, request: &[u8]) -> HandlerResult {
        if request.len() != 2 {
            return Err((AttError::Protocol(code::INVALID_PDU), 0));
        }
        let queued = std::mem::take(&mut *self.prepared.lock().unwrap());
        if request[1] != EXECUTE_WRITE_COMMIT {
            return Ok(vec![EXECUTE_WRITE_RSP]);
        }

        // Stitch the queued parts per handle, in offset order, requiring a
        // gapless value.
        let mut by_handle: HashMap<u16, Vec<(u16, Vec<u8>)>> = HashMap::new();
        for (handle, offset, value) in queued {
            by_handle.entry(handle).or_default().push((offset, value));
        }
        for (handle, mut parts) in by_handle {
            parts.sort_by_key(|(offset, _)| *offset);
            let mut combined = Vec::new();
            for (offset, part) in parts {
                if offset as usize != combined.len() {
                    return Err((AttError::Protocol(code::INVALID_OFFSET), handle));
                }
                combined.extend_from_slice(&part);
            }
            self.write_handle(handle, &combined)
                .map_err(|err| (err, handle))?;
        }
        Ok(vec![EXECUTE_WRITE_RSP])
    }
}

type HandlerResult = Result<Vec<u8>, (AttError, u16)>;

fn parse_typed_range(request: &[u8]) -> Result<(u16, u16, Uuid), (AttError, u16)> {
    if request.len() != 7 && request.len() != 21 {
        return Err((AttError::Protocol(code::INVALID_PDU), 0));
    }
    let start = LittleEndian::read_u16(&request[1..3]);
    let end = LittleEndian::read_u16(&request[3..5]);
    if start == 0 || start > end {
        return Err((AttError::Protocol(code::INVALID_HANDLE), start));
    }
    let uuid = Uuid::from_slice_le(&request[5..])
        .ok_or((AttError::Protocol(code::INVALID_PDU), start))?;
    Ok((start, end, uuid))
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttServer").finish_non_exhaustive()
    }
}
