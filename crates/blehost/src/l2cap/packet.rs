//! L2CAP basic frame codec.

use byteorder::{ByteOrder, LittleEndian};

/// Attribute Protocol fixed channel.
pub const CID_ATT: u16 = 0x0004;
/// Security Manager Protocol fixed channel.
pub const CID_SMP: u16 = 0x0006;

/// Length of the basic L2CAP header: 2-byte payload length + 2-byte CID.
pub const HEADER_LEN: usize = 4;

/// An L2CAP basic information frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicFrame {
    pub cid: u16,
    pub payload: Vec<u8>,
}

impl BasicFrame {
    pub fn new(cid: u16, payload: Vec<u8>) -> Self {
        Self { cid, payload }
    }

    /// Parses a complete frame. Returns `None` when the buffer is shorter
    /// than the header or the length field disagrees with the payload.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let len = LittleEndian::read_u16(&data[0..2]) as usize;
        let cid = LittleEndian::read_u16(&data[2..4]);
        if data.len() != HEADER_LEN + len {
            return None;
        }
        Some(Self {
            cid,
            payload: data[HEADER_LEN..].to_vec(),
        })
    }

    /// Expected total frame length for a buffer that starts with a header,
    /// used by ACL reassembly to decide when a frame is complete.
    pub fn expected_len(header: &[u8]) -> Option<usize> {
        if header.len() < 2 {
            return None;
        }
        Some(HEADER_LEN + LittleEndian::read_u16(&header[0..2]) as usize)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.cid.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = BasicFrame::new(CID_ATT, vec![0x02, 0x17, 0x00]);
        let bytes = frame.serialize();
        assert_eq!(bytes[..4], [0x03, 0x00, 0x04, 0x00]);
        assert_eq!(BasicFrame::parse(&bytes), Some(frame));
    }

    #[test]
    fn rejects_short_or_mismatched() {
        assert!(BasicFrame::parse(&[0x01, 0x00, 0x04]).is_none());
        // Length field says 2, only 1 payload byte present.
        assert!(BasicFrame::parse(&[0x02, 0x00, 0x04, 0x00, 0xAA]).is_none());
    }

    #[test]
    fn expected_len_reads_length_field() {
        assert_eq!(BasicFrame::expected_len(&[0x05, 0x00, 0x04, 0x00]), Some(9));
        assert_eq!(BasicFrame::expected_len(&[0x05]), None);
    }
}
