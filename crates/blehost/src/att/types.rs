//! ATT PDU codecs.
//!
//! Request PDUs are built directly into the bearer's transmit buffer;
//! responses are parsed out of received frames. Every `parse` validates the
//! opcode and the fixed part of the layout and fails with
//! [`AttError::InvalidResponse`] on any mismatch.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::error::{AttError, AttResult};
use crate::uuid::Uuid;

/// Error Response. [Vol 3, Part F, 3.4.1.1]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub request_opcode: u8,
    pub handle: u16,
    pub code: u8,
}

impl ErrorResponse {
    pub fn new(request_opcode: u8, handle: u16, code: u8) -> Self {
        Self {
            request_opcode,
            handle,
            code,
        }
    }

    /// An Error Response is exactly 5 bytes; anything else is malformed.
    pub fn parse(data: &[u8]) -> AttResult<Self> {
        if data.len() != 5 || data[0] != ERROR_RSP {
            return Err(AttError::InvalidResponse);
        }
        Ok(Self {
            request_opcode: data[1],
            handle: LittleEndian::read_u16(&data[2..4]),
            code: data[4],
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.push(ERROR_RSP);
        out.push(self.request_opcode);
        out.extend_from_slice(&self.handle.to_le_bytes());
        out.push(self.code);
        out
    }
}

/// Writes an Exchange MTU Request into `buf`, returning the PDU length.
pub fn build_exchange_mtu_req(buf: &mut [u8], client_rx_mtu: u16) -> usize {
    buf[0] = EXCHANGE_MTU_REQ;
    LittleEndian::write_u16(&mut buf[1..3], client_rx_mtu);
    3
}

pub fn build_exchange_mtu_rsp(server_rx_mtu: u16) -> Vec<u8> {
    let mut out = vec![EXCHANGE_MTU_RSP, 0, 0];
    LittleEndian::write_u16(&mut out[1..3], server_rx_mtu);
    out
}

pub fn parse_exchange_mtu_rsp(data: &[u8]) -> AttResult<u16> {
    if data.len() != 3 || data[0] != EXCHANGE_MTU_RSP {
        return Err(AttError::InvalidResponse);
    }
    Ok(LittleEndian::read_u16(&data[1..3]))
}

pub fn build_find_information_req(buf: &mut [u8], start: u16, end: u16) -> usize {
    buf[0] = FIND_INFORMATION_REQ;
    LittleEndian::write_u16(&mut buf[1..3], start);
    LittleEndian::write_u16(&mut buf[3..5], end);
    5
}

/// Find Information Response: format byte plus packed handle/UUID pairs.
#[derive(Debug, Clone)]
pub struct FindInformationRsp {
    pub format: u8,
    /// Raw information data; pair width is 4 (16-bit) or 18 (128-bit).
    pub data: Vec<u8>,
}

impl FindInformationRsp {
    pub fn parse(data: &[u8]) -> AttResult<Self> {
        if data.len() < 6 || data[0] != FIND_INFORMATION_RSP {
            return Err(AttError::InvalidResponse);
        }
        let format = data[1];
        let body = &data[2..];
        let pair = match format {
            FIND_INFORMATION_FORMAT_16BIT => 4,
            FIND_INFORMATION_FORMAT_128BIT => 18,
            _ => return Err(AttError::InvalidResponse),
        };
        if body.is_empty() || body.len() % pair != 0 {
            return Err(AttError::InvalidResponse);
        }
        Ok(Self {
            format,
            data: body.to_vec(),
        })
    }

    /// Iterates the `(handle, uuid)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (u16, Uuid)> + '_ {
        let width = if self.format == FIND_INFORMATION_FORMAT_16BIT {
            4
        } else {
            18
        };
        self.data.chunks_exact(width).filter_map(move |chunk| {
            let handle = LittleEndian::read_u16(&chunk[..2]);
            Uuid::from_slice_le(&chunk[2..]).map(|uuid| (handle, uuid))
        })
    }
}

pub fn build_read_by_type_req(buf: &mut [u8], start: u16, end: u16, uuid: &Uuid) -> usize {
    buf[0] = READ_BY_TYPE_REQ;
    LittleEndian::write_u16(&mut buf[1..3], start);
    LittleEndian::write_u16(&mut buf[3..5], end);
    let wire = uuid.to_wire();
    buf[5..5 + wire.len()].copy_from_slice(&wire);
    5 + wire.len()
}

/// Read By Type / Read By Group Type response body: a uniform-length
/// attribute data list.
#[derive(Debug, Clone)]
pub struct AttributeDataList {
    pub item_len: usize,
    pub data: Vec<u8>,
}

impl AttributeDataList {
    fn parse(data: &[u8], opcode: u8, min_item: usize) -> AttResult<Self> {
        if data.len() < 4 || data[0] != opcode {
            return Err(AttError::InvalidResponse);
        }
        let item_len = data[1] as usize;
        let body = &data[2..];
        if item_len < min_item || body.is_empty() || body.len() % item_len != 0 {
            return Err(AttError::InvalidResponse);
        }
        Ok(Self {
            item_len,
            data: body.to_vec(),
        })
    }

    pub fn items(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.data.chunks_exact(self.item_len)
    }
}

pub fn parse_read_by_type_rsp(data: &[u8]) -> AttResult<AttributeDataList> {
    AttributeDataList::parse(data, READ_BY_TYPE_RSP, 3)
}

pub fn build_read_by_group_type_req(buf: &mut [u8], start: u16, end: u16, uuid: &Uuid) -> usize {
    buf[0] = READ_BY_GROUP_TYPE_REQ;
    LittleEndian::write_u16(&mut buf[1..3], start);
    LittleEndian::write_u16(&mut buf[3..5], end);
    let wire = uuid.to_wire();
    buf[5..5 + wire.len()].copy_from_slice(&wire);
    5 + wire.len()
}

pub fn parse_read_by_group_type_rsp(data: &[u8]) -> AttResult<AttributeDataList> {
    AttributeDataList::parse(data, READ_BY_GROUP_TYPE_RSP, 5)
}

pub fn build_read_req(buf: &mut [u8], handle: u16) -> usize {
    buf[0] = READ_REQ;
    LittleEndian::write_u16(&mut buf[1..3], handle);
    3
}

pub fn parse_read_rsp(data: &[u8]) -> AttResult<Vec<u8>> {
    if data.is_empty() || data[0] != READ_RSP {
        return Err(AttError::InvalidResponse);
    }
    Ok(data[1..].to_vec())
}

pub fn build_read_blob_req(buf: &mut [u8], handle: u16, offset: u16) -> usize {
    buf[0] = READ_BLOB_REQ;
    LittleEndian::write_u16(&mut buf[1..3], handle);
    LittleEndian::write_u16(&mut buf[3..5], offset);
    5
}

pub fn parse_read_blob_rsp(data: &[u8]) -> AttResult<Vec<u8>> {
    if data.is_empty() || data[0] != READ_BLOB_RSP {
        return Err(AttError::InvalidResponse);
    }
    Ok(data[1..].to_vec())
}

pub fn build_read_multiple_req(buf: &mut [u8], handles: &[u16]) -> usize {
    buf[0] = READ_MULTIPLE_REQ;
    for (i, handle) in handles.iter().enumerate() {
        LittleEndian::write_u16(&mut buf[1 + i * 2..3 + i * 2], *handle);
    }
    1 + handles.len() * 2
}

pub fn parse_read_multiple_rsp(data: &[u8]) -> AttResult<Vec<u8>> {
    if data.is_empty() || data[0] != READ_MULTIPLE_RSP {
        return Err(AttError::InvalidResponse);
    }
    Ok(data[1..].to_vec())
}

pub fn build_write_req(buf: &mut [u8], handle: u16, value: &[u8]) -> usize {
    buf[0] = WRITE_REQ;
    LittleEndian::write_u16(&mut buf[1..3], handle);
    buf[3..3 + value.len()].copy_from_slice(value);
    3 + value.len()
}

pub fn parse_write_rsp(data: &[u8]) -> AttResult<()> {
    if data.len() != 1 || data[0] != WRITE_RSP {
        return Err(AttError::InvalidResponse);
    }
    Ok(())
}

pub fn build_write_cmd(buf: &mut [u8], handle: u16, value: &[u8]) -> usize {
    buf[0] = WRITE_CMD;
    LittleEndian::write_u16(&mut buf[1..3], handle);
    buf[3..3 + value.len()].copy_from_slice(value);
    3 + value.len()
}

pub fn build_prepare_write_req(buf: &mut [u8], handle: u16, offset: u16, value: &[u8]) -> usize {
    buf[0] = PREPARE_WRITE_REQ;
    LittleEndian::write_u16(&mut buf[1..3], handle);
    LittleEndian::write_u16(&mut buf[3..5], offset);
    buf[5..5 + value.len()].copy_from_slice(value);
    5 + value.len()
}

/// Prepare Write Response mirrors the request so the client can verify the
/// server received the part intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareWriteRsp {
    pub handle: u16,
    pub offset: u16,
    pub value: Vec<u8>,
}

impl PrepareWriteRsp {
    pub fn parse(data: &[u8]) -> AttResult<Self> {
        if data.len() < 5 || data[0] != PREPARE_WRITE_RSP {
            return Err(AttError::InvalidResponse);
        }
        Ok(Self {
            handle: LittleEndian::read_u16(&data[1..3]),
            offset: LittleEndian::read_u16(&data[3..5]),
            value: data[5..].to_vec(),
        })
    }
}

pub fn build_execute_write_req(buf: &mut [u8], flags: u8) -> usize {
    buf[0] = EXECUTE_WRITE_REQ;
    buf[1] = flags;
    2
}

pub fn parse_execute_write_rsp(data: &[u8]) -> AttResult<()> {
    if data.len() != 1 || data[0] != EXECUTE_WRITE_RSP {
        return Err(AttError::InvalidResponse);
    }
    Ok(())
}

/// Handle Value Notification / Indication payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValue {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl HandleValue {
    pub fn parse(data: &[u8]) -> AttResult<Self> {
        if data.len() < 3 || (data[0] != HANDLE_VALUE_NTF && data[0] != HANDLE_VALUE_IND) {
            return Err(AttError::InvalidResponse);
        }
        Ok(Self {
            handle: LittleEndian::read_u16(&data[1..3]),
            value: data[3..].to_vec(),
        })
    }

    pub fn serialize(&self, opcode: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.value.len());
        out.push(opcode);
        out.extend_from_slice(&self.handle.to_le_bytes());
        out.extend_from_slice(&self.value);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_is_exactly_five_bytes() {
        let rsp = ErrorResponse::new(READ_REQ, 0x0005, 0x0A);
        let bytes = rsp.serialize();
        assert_eq!(bytes, vec![0x01, 0x0A, 0x05, 0x00, 0x0A]);
        assert_eq!(ErrorResponse::parse(&bytes).unwrap(), rsp);
        assert!(ErrorResponse::parse(&[0x01, 0x0A, 0x05, 0x00]).is_err());
        assert!(ErrorResponse::parse(&[0x01, 0x0A, 0x05, 0x00, 0x0A, 0xFF]).is_err());
    }

    #[test]
    fn find_information_pairs() {
        // Format 1, two 16-bit pairs.
        let rsp = FindInformationRsp::parse(&[
            0x05, 0x01, 0x13, 0x00, 0x02, 0x29, 0x14, 0x00, 0x01, 0x29,
        ])
        .unwrap();
        let pairs: Vec<_> = rsp.pairs().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, 0x0013);
        assert_eq!(pairs[0].1.as_u16(), Some(0x2902));

        // Data length not a multiple of the pair width.
        assert!(FindInformationRsp::parse(&[0x05, 0x01, 0x13, 0x00, 0x02, 0x29, 0x14]).is_err());
        // Unknown format.
        assert!(FindInformationRsp::parse(&[0x05, 0x03, 1, 2, 3, 4]).is_err());
    }

    #[test]
    fn attribute_data_list_rejects_ragged_body() {
        // item_len 6, body of 7 bytes.
        assert!(parse_read_by_group_type_rsp(&[0x11, 6, 1, 2, 3, 4, 5, 6, 7]).is_err());
        let list = parse_read_by_group_type_rsp(&[0x11, 6, 1, 0, 3, 0, 0x0F, 0x18]).unwrap();
        assert_eq!(list.items().count(), 1);
    }

    #[test]
    fn write_request_layout() {
        let mut buf = [0u8; 32];
        let n = build_write_req(&mut buf, 0x0013, &[0x01, 0x00]);
        assert_eq!(&buf[..n], &[0x12, 0x13, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn handle_value_round_trip() {
        let hv = HandleValue {
            handle: 0x0012,
            value: vec![0xAA, 0xBB],
        };
        let bytes = hv.serialize(HANDLE_VALUE_NTF);
        assert_eq!(bytes, vec![0x1B, 0x12, 0x00, 0xAA, 0xBB]);
        assert_eq!(HandleValue::parse(&bytes).unwrap(), hv);
    }
}
