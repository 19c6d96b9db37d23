//! Advertising payloads: AD-structure packing and a validating parser.
//!
//! An advertising PDU is a sequence of `{len, type, value[len-1]}` records
//! in at most 31 bytes. The parser rejects the whole PDU when any record is
//! malformed: a zero length byte, a record overflowing the PDU, a UUID-list
//! payload that is not a positive multiple of its element width, or a
//! non-array record shorter than its type's minimum.

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::gap::{AddrType, BdAddr};
use crate::uuid::Uuid;

/// Maximum advertising (and scan response) payload length.
pub const MAX_ADV_LEN: usize = 31;

/// AD types. [Core Specification Supplement, Part A]
pub mod ad {
    pub const FLAGS: u8 = 0x01;
    pub const UUID16_INCOMPLETE: u8 = 0x02;
    pub const UUID16_COMPLETE: u8 = 0x03;
    pub const UUID32_INCOMPLETE: u8 = 0x04;
    pub const UUID32_COMPLETE: u8 = 0x05;
    pub const UUID128_INCOMPLETE: u8 = 0x06;
    pub const UUID128_COMPLETE: u8 = 0x07;
    pub const NAME_SHORTENED: u8 = 0x08;
    pub const NAME_COMPLETE: u8 = 0x09;
    pub const TX_POWER: u8 = 0x0A;
    pub const SOLICITED_UUID16: u8 = 0x14;
    pub const SOLICITED_UUID128: u8 = 0x15;
    pub const SERVICE_DATA16: u8 = 0x16;
    pub const APPEARANCE: u8 = 0x19;
    pub const SOLICITED_UUID32: u8 = 0x1F;
    pub const MANUFACTURER_DATA: u8 = 0xFF;

    pub const FLAG_GENERAL_DISCOVERABLE: u8 = 0x02;
    pub const FLAG_NO_BREDR: u8 = 0x04;
}

/// Errors from packing or parsing advertising data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdvError {
    #[error("advertising payload exceeds {MAX_ADV_LEN} bytes")]
    PayloadTooLong,

    #[error("AD record at offset {0} has a bad length")]
    BadRecordLength(usize),

    #[error("AD record type 0x{0:02x} payload violates its layout")]
    BadRecordPayload(u8),
}

/// Per-type layout constraints: minimum payload length, and element width
/// for list types (zero for non-array records).
fn field_spec(ad_type: u8) -> Option<(usize, usize)> {
    match ad_type {
        ad::FLAGS => Some((1, 0)),
        ad::UUID16_INCOMPLETE | ad::UUID16_COMPLETE | ad::SOLICITED_UUID16 => Some((2, 2)),
        ad::UUID32_INCOMPLETE | ad::UUID32_COMPLETE | ad::SOLICITED_UUID32 => Some((4, 4)),
        ad::UUID128_INCOMPLETE | ad::UUID128_COMPLETE | ad::SOLICITED_UUID128 => Some((16, 16)),
        ad::NAME_SHORTENED | ad::NAME_COMPLETE => Some((1, 0)),
        ad::TX_POWER => Some((1, 0)),
        ad::SERVICE_DATA16 => Some((2, 0)),
        ad::APPEARANCE => Some((2, 0)),
        ad::MANUFACTURER_DATA => Some((2, 0)),
        _ => None,
    }
}

/// Splits a PDU into validated `(type, payload)` records.
pub fn decode_records(data: &[u8]) -> Result<Vec<(u8, &[u8])>, AdvError> {
    let mut records = Vec::new();
    let mut off = 0;
    while off < data.len() {
        let len = data[off] as usize;
        if len == 0 || off + 1 + len > data.len() {
            return Err(AdvError::BadRecordLength(off));
        }
        let ad_type = data[off + 1];
        let payload = &data[off + 2..off + 1 + len];
        if let Some((min_len, element_len)) = field_spec(ad_type) {
            if payload.len() < min_len {
                return Err(AdvError::BadRecordPayload(ad_type));
            }
            if element_len != 0 && (payload.is_empty() || payload.len() % element_len != 0) {
                return Err(AdvError::BadRecordPayload(ad_type));
            }
        }
        records.push((ad_type, payload));
        off += 1 + len;
    }
    Ok(records)
}

/// A payload under construction.
#[derive(Debug, Clone, Default)]
pub struct AdvPayload {
    buf: Vec<u8>,
}

impl AdvPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one AD record, enforcing the 31-byte ceiling.
    pub fn append(&mut self, ad_type: u8, payload: &[u8]) -> Result<&mut Self, AdvError> {
        if self.buf.len() + 2 + payload.len() > MAX_ADV_LEN {
            return Err(AdvError::PayloadTooLong);
        }
        self.buf.push(payload.len() as u8 + 1);
        self.buf.push(ad_type);
        self.buf.extend_from_slice(payload);
        Ok(self)
    }

    /// Whether another record of `len` payload bytes still fits.
    pub fn fits(&self, len: usize) -> bool {
        self.buf.len() + 2 + len <= MAX_ADV_LEN
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Packs a device name and service UUIDs. UUIDs are preferred into the
/// primary payload; the name spills to the scan response when it no longer
/// fits, shortened if necessary.
pub fn pack_name_and_uuids(
    name: &str,
    uuids: &[Uuid],
) -> Result<(Vec<u8>, Vec<u8>), AdvError> {
    let mut primary = AdvPayload::new();
    primary.append(
        ad::FLAGS,
        &[ad::FLAG_GENERAL_DISCOVERABLE | ad::FLAG_NO_BREDR],
    )?;

    let mut u16s = Vec::new();
    let mut u128s = Vec::new();
    for uuid in uuids {
        match uuid.as_u16() {
            Some(short) => u16s.extend_from_slice(&short.to_le_bytes()),
            None => u128s.extend_from_slice(uuid.as_le_bytes()),
        }
    }
    if !u16s.is_empty() {
        primary.append(ad::UUID16_COMPLETE, &u16s)?;
    }
    if !u128s.is_empty() {
        primary.append(ad::UUID128_COMPLETE, &u128s)?;
    }

    let mut scan_rsp = AdvPayload::new();
    let name_bytes = name.as_bytes();
    if primary.fits(name_bytes.len()) {
        primary.append(ad::NAME_COMPLETE, name_bytes)?;
    } else if name_bytes.len() + 2 <= MAX_ADV_LEN {
        scan_rsp.append(ad::NAME_COMPLETE, name_bytes)?;
    } else {
        scan_rsp.append(ad::NAME_SHORTENED, &name_bytes[..MAX_ADV_LEN - 2])?;
    }

    Ok((primary.into_bytes(), scan_rsp.into_bytes()))
}

/// Packs a manufacturer-data payload.
pub fn pack_mfg_data(company: u16, data: &[u8]) -> Result<Vec<u8>, AdvError> {
    let mut payload = AdvPayload::new();
    payload.append(
        ad::FLAGS,
        &[ad::FLAG_GENERAL_DISCOVERABLE | ad::FLAG_NO_BREDR],
    )?;
    let mut body = Vec::with_capacity(2 + data.len());
    body.extend_from_slice(&company.to_le_bytes());
    body.extend_from_slice(data);
    payload.append(ad::MANUFACTURER_DATA, &body)?;
    Ok(payload.into_bytes())
}

/// Packs service data for a 16-bit service UUID.
pub fn pack_service_data16(id: u16, data: &[u8]) -> Result<Vec<u8>, AdvError> {
    let mut payload = AdvPayload::new();
    payload.append(
        ad::FLAGS,
        &[ad::FLAG_GENERAL_DISCOVERABLE | ad::FLAG_NO_BREDR],
    )?;
    let mut body = Vec::with_capacity(2 + data.len());
    body.extend_from_slice(&id.to_le_bytes());
    body.extend_from_slice(data);
    payload.append(ad::SERVICE_DATA16, &body)?;
    Ok(payload.into_bytes())
}

/// Packs an iBeacon frame: Apple manufacturer data with the fixed
/// `{0x02, 0x15, uuid, major, minor, power}` layout.
pub fn pack_ibeacon(uuid: &Uuid, major: u16, minor: u16, power: i8) -> Result<Vec<u8>, AdvError> {
    let mut body = Vec::with_capacity(25);
    body.extend_from_slice(&0x004Cu16.to_le_bytes());
    body.push(0x02);
    body.push(0x15);
    let mut be = *uuid.as_le_bytes();
    be.reverse();
    body.extend_from_slice(&be);
    body.extend_from_slice(&major.to_be_bytes());
    body.extend_from_slice(&minor.to_be_bytes());
    body.push(power as u8);
    pack_ibeacon_data(&body)
}

/// Packs pre-assembled iBeacon manufacturer data.
pub fn pack_ibeacon_data(body: &[u8]) -> Result<Vec<u8>, AdvError> {
    let mut payload = AdvPayload::new();
    payload.append(ad::FLAGS, &[ad::FLAG_NO_BREDR])?;
    payload.append(ad::MANUFACTURER_DATA, body)?;
    Ok(payload.into_bytes())
}

/// A decoded advertisement as delivered to the scan handler.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub addr: BdAddr,
    pub addr_type: AddrType,
    pub event_type: u8,
    pub rssi: i8,
    /// Raw primary advertising data.
    pub data: Vec<u8>,
    /// Raw scan response data, when one was combined in.
    pub scan_rsp: Vec<u8>,
    pub flags: Option<u8>,
    pub tx_power: Option<i8>,
    pub local_name: Option<String>,
    /// Complete and incomplete service UUID lists, all widths.
    pub services: Vec<Uuid>,
    pub solicited: Vec<Uuid>,
    pub service_data: Vec<(Uuid, Vec<u8>)>,
    pub manufacturer_data: Option<Vec<u8>>,
}

impl Advertisement {
    /// Decodes one advertising report payload. Fails when any AD record is
    /// malformed.
    pub fn decode(
        addr: BdAddr,
        addr_type: AddrType,
        event_type: u8,
        rssi: i8,
        data: &[u8],
    ) -> Result<Self, AdvError> {
        let mut advertisement = Self {
            addr,
            addr_type,
            event_type,
            rssi,
            data: data.to_vec(),
            scan_rsp: Vec::new(),
            flags: None,
            tx_power: None,
            local_name: None,
            services: Vec::new(),
            solicited: Vec::new(),
            service_data: Vec::new(),
            manufacturer_data: None,
        };
        advertisement.absorb(data)?;
        Ok(advertisement)
    }

    /// Folds a scan response payload into an existing advertisement.
    pub fn absorb_scan_rsp(&mut self, data: &[u8]) -> Result<(), AdvError> {
        self.scan_rsp = data.to_vec();
        self.absorb(data)
    }

    fn absorb(&mut self, data: &[u8]) -> Result<(), AdvError> {
        for (ad_type, payload) in decode_records(data)? {
            match ad_type {
                ad::FLAGS => self.flags = Some(payload[0]),
                ad::TX_POWER => self.tx_power = Some(payload[0] as i8),
                ad::NAME_COMPLETE | ad::NAME_SHORTENED => {
                    self.local_name = Some(String::from_utf8_lossy(payload).into_owned());
                }
                ad::UUID16_INCOMPLETE | ad::UUID16_COMPLETE => {
                    self.push_uuids(payload, 2, false);
                }
                ad::UUID32_INCOMPLETE | ad::UUID32_COMPLETE => {
                    self.push_uuids(payload, 4, false);
                }
                ad::UUID128_INCOMPLETE | ad::UUID128_COMPLETE => {
                    self.push_uuids(payload, 16, false);
                }
                ad::SOLICITED_UUID16 => self.push_uuids(payload, 2, true),
                ad::SOLICITED_UUID32 => self.push_uuids(payload, 4, true),
                ad::SOLICITED_UUID128 => self.push_uuids(payload, 16, true),
                ad::SERVICE_DATA16 => {
                    let uuid = Uuid::from_u16(u16::from_le_bytes([payload[0], payload[1]]));
                    self.service_data.push((uuid, payload[2..].to_vec()));
                }
                ad::MANUFACTURER_DATA => self.manufacturer_data = Some(payload.to_vec()),
                other => {
                    // Unknown types carry on unparsed; the raw PDU is kept.
                    debug!("ignoring AD type 0x{other:02x}");
                }
            }
        }
        Ok(())
    }

    fn push_uuids(&mut self, payload: &[u8], width: usize, solicited: bool) {
        for chunk in payload.chunks_exact(width) {
            if let Some(uuid) = Uuid::from_slice_le(chunk) {
                if solicited {
                    self.solicited.push(uuid);
                } else {
                    self.services.push(uuid);
                }
            }
        }
    }

    /// Whether the advertisement is connectable (ADV_IND or ADV_DIRECT_IND).
    pub fn connectable(&self) -> bool {
        self.event_type == 0x00 || self.event_type == 0x01
    }

    /// A keyed view of the decoded fields, handy for logging.
    pub fn to_map(&self) -> HashMap<&'static str, String> {
        let mut map = HashMap::new();
        map.insert("mac", self.addr.to_string());
        map.insert("rssi", self.rssi.to_string());
        if let Some(name) = &self.local_name {
            map.insert("name", name.clone());
        }
        if let Some(flags) = self.flags {
            map.insert("flags", format!("0x{flags:02x}"));
        }
        if let Some(power) = self.tx_power {
            map.insert("txPower", power.to_string());
        }
        if !self.services.is_empty() {
            let list: Vec<String> = self.services.iter().map(|u| u.to_string()).collect();
            map.insert("services", list.join(","));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ad_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![payload.len() as u8 + 1, ad_type];
        out.extend_from_slice(payload);
        out
    }

    fn decode(data: &[u8]) -> Result<Advertisement, AdvError> {
        Advertisement::decode(BdAddr::default(), AddrType::Public, 0x00, -40, data)
    }

    #[test]
    fn array_types_accept_whole_multiples() {
        for (ad_type, width) in [
            (ad::UUID16_COMPLETE, 2usize),
            (ad::UUID16_INCOMPLETE, 2),
            (ad::UUID32_COMPLETE, 4),
            (ad::UUID128_COMPLETE, 16),
            (ad::SOLICITED_UUID16, 2),
            (ad::SOLICITED_UUID128, 16),
        ] {
            let mut payload = Vec::new();
            for i in 0..width * 3 {
                payload.push(i as u8);
            }
            let adv = decode(&record(ad_type, &payload)).unwrap();
            let uuids = if matches!(
                ad_type,
                ad::SOLICITED_UUID16 | ad::SOLICITED_UUID32 | ad::SOLICITED_UUID128
            ) {
                &adv.solicited
            } else {
                &adv.services
            };
            assert_eq!(uuids.len(), 3, "type 0x{ad_type:02x}");
        }
    }

    #[test]
    fn array_types_reject_ragged_payloads() {
        for (ad_type, width) in [
            (ad::UUID16_COMPLETE, 2usize),
            (ad::UUID32_COMPLETE, 4),
            (ad::UUID128_COMPLETE, 16),
        ] {
            // One stray byte appended.
            let mut payload = vec![0u8; width * 2];
            payload.push(0xBB);
            assert!(decode(&record(ad_type, &payload)).is_err());
            // Shorter than one element.
            let payload = vec![0u8; width - 1];
            assert!(decode(&record(ad_type, &payload)).is_err());
        }
    }

    #[test]
    fn zero_length_record_rejected() {
        assert!(decode(&[0x00, ad::FLAGS]).is_err());
    }

    #[test]
    fn overflowing_length_rejected() {
        // Claims 30 payload bytes; only 2 present.
        assert!(decode(&[31, ad::UUID16_COMPLETE, 0x0F, 0x18]).is_err());
        assert!(decode(&[255, ad::MANUFACTURER_DATA, 0x4C, 0x00]).is_err());
    }

    #[test]
    fn non_array_minimum_lengths() {
        assert!(decode(&record(ad::MANUFACTURER_DATA, &[0x4C])).is_err());
        assert!(decode(&record(ad::SERVICE_DATA16, &[0x0F])).is_err());
        assert!(decode(&record(ad::TX_POWER, &[])).is_err());
    }

    #[test]
    fn combined_pdu_decodes_every_field() {
        let mut data = Vec::new();
        data.extend_from_slice(&record(ad::FLAGS, &[0x06]));
        data.extend_from_slice(&record(ad::UUID16_COMPLETE, &[0x0F, 0x18, 0x0A, 0x18]));
        data.extend_from_slice(&record(ad::NAME_COMPLETE, b"thermo"));
        data.extend_from_slice(&record(ad::TX_POWER, &[0xF4]));
        let adv = decode(&data).unwrap();
        assert_eq!(adv.flags, Some(0x06));
        assert_eq!(adv.services.len(), 2);
        assert_eq!(adv.local_name.as_deref(), Some("thermo"));
        assert_eq!(adv.tx_power, Some(-12));
    }

    #[test]
    fn packer_round_trips_through_parser() {
        let (primary, scan_rsp) = pack_name_and_uuids(
            "sensor",
            &[Uuid::from_u16(0x180F), Uuid::from_u16(0x1809)],
        )
        .unwrap();
        assert!(primary.len() <= MAX_ADV_LEN);
        let adv = decode(&primary).unwrap();
        assert_eq!(adv.services.len(), 2);
        assert_eq!(adv.local_name.as_deref(), Some("sensor"));
        assert!(scan_rsp.is_empty());
    }

    #[test]
    fn long_name_spills_to_scan_response() {
        let name = "a-device-name-that-cannot-fit-after-uuids";
        let uuids: Vec<Uuid> = (0..8u16).map(|i| Uuid::from_u16(0x1800 + i)).collect();
        let (primary, scan_rsp) = pack_name_and_uuids(name, &uuids).unwrap();
        assert!(primary.len() <= MAX_ADV_LEN);
        assert!(!scan_rsp.is_empty());
        let mut adv = decode(&primary).unwrap();
        assert!(adv.local_name.is_none());
        adv.absorb_scan_rsp(&scan_rsp).unwrap();
        assert!(adv.local_name.is_some());
    }

    #[test]
    fn ibeacon_layout() {
        let uuid = Uuid::from_u16(0x1234);
        let pdu = pack_ibeacon(&uuid, 7, 9, -59).unwrap();
        let adv = decode(&pdu).unwrap();
        let mfg = adv.manufacturer_data.unwrap();
        assert_eq!(&mfg[..2], &[0x4C, 0x00]);
        assert_eq!(mfg[2], 0x02);
        assert_eq!(mfg[3], 0x15);
        assert_eq!(mfg.len(), 25);
        assert_eq!(&mfg[20..22], &[0x00, 0x07]);
        assert_eq!(&mfg[22..24], &[0x00, 0x09]);
    }

    #[test]
    fn oversized_payload_rejected_by_packer() {
        let mut payload = AdvPayload::new();
        assert!(payload.append(ad::MANUFACTURER_DATA, &[0u8; 30]).is_err());
    }
}
