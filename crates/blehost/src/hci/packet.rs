//! HCI packet structures and parsing.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use crate::gap::BdAddr;

/// HCI commands issued by the host core.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum HciCommand {
    // Controller & Baseband / Informational (OGF 0x03 / 0x04)
    Reset,
    SetEventMask {
        mask: u64,
    },
    ReadBdAddr,

    // Link Control (OGF 0x01)
    Disconnect {
        handle: u16,
        reason: u8,
    },

    // LE (OGF 0x08)
    LeSetEventMask {
        mask: u64,
    },
    LeReadBufferSize,
    LeSetAdvertisingParameters {
        interval_min: u16,
        interval_max: u16,
        adv_type: u8,
        own_addr_type: u8,
        peer_addr_type: u8,
        peer_addr: BdAddr,
        channel_map: u8,
        filter_policy: u8,
    },
    LeSetAdvertisingData {
        data: Vec<u8>,
    },
    LeSetScanResponseData {
        data: Vec<u8>,
    },
    LeSetAdvertisingEnable {
        enable: bool,
    },
    LeSetScanParameters {
        scan_type: u8,
        interval: u16,
        window: u16,
        own_addr_type: u8,
        filter_policy: u8,
    },
    LeSetScanEnable {
        enable: bool,
        filter_duplicates: bool,
    },
    LeCreateConnection {
        peer_addr: BdAddr,
        peer_addr_type: u8,
    },
    LeCreateConnectionCancel,
    LeStartEncryption {
        handle: u16,
        rand: [u8; 8],
        ediv: u16,
        ltk: [u8; 16],
    },
    LeLtkRequestReply {
        handle: u16,
        ltk: [u8; 16],
    },
    LeLtkRequestNegativeReply {
        handle: u16,
    },
}

impl HciCommand {
    /// The (OGF, OCF) pair for this command.
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::Reset => (OGF_HOST_CTL, OCF_RESET),
            Self::SetEventMask { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK),
            Self::ReadBdAddr => (OGF_INFO_PARAM, OCF_READ_BD_ADDR),
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::LeSetEventMask { .. } => (OGF_LE, OCF_LE_SET_EVENT_MASK),
            Self::LeReadBufferSize => (OGF_LE, OCF_LE_READ_BUFFER_SIZE),
            Self::LeSetAdvertisingParameters { .. } => (OGF_LE, OCF_LE_SET_ADVERTISING_PARAMETERS),
            Self::LeSetAdvertisingData { .. } => (OGF_LE, OCF_LE_SET_ADVERTISING_DATA),
            Self::LeSetScanResponseData { .. } => (OGF_LE, OCF_LE_SET_SCAN_RESPONSE_DATA),
            Self::LeSetAdvertisingEnable { .. } => (OGF_LE, OCF_LE_SET_ADVERTISING_ENABLE),
            Self::LeSetScanParameters { .. } => (OGF_LE, OCF_LE_SET_SCAN_PARAMETERS),
            Self::LeSetScanEnable { .. } => (OGF_LE, OCF_LE_SET_SCAN_ENABLE),
            Self::LeCreateConnection { .. } => (OGF_LE, OCF_LE_CREATE_CONNECTION),
            Self::LeCreateConnectionCancel => (OGF_LE, OCF_LE_CREATE_CONNECTION_CANCEL),
            Self::LeStartEncryption { .. } => (OGF_LE, OCF_LE_START_ENCRYPTION),
            Self::LeLtkRequestReply { .. } => (OGF_LE, OCF_LE_LTK_REQUEST_REPLY),
            Self::LeLtkRequestNegativeReply { .. } => (OGF_LE, OCF_LE_LTK_REQUEST_NEGATIVE_REPLY),
        }
    }

    /// The full 16-bit opcode.
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Serializes the command parameters.
    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::Reset | Self::ReadBdAddr | Self::LeReadBufferSize | Self::LeCreateConnectionCancel => {
                vec![]
            }

            Self::SetEventMask { mask } | Self::LeSetEventMask { mask } => {
                mask.to_le_bytes().to_vec()
            }

            Self::Disconnect { handle, reason } => {
                let mut p = Vec::with_capacity(3);
                p.extend_from_slice(&handle.to_le_bytes());
                p.push(*reason);
                p
            }

            Self::LeSetAdvertisingParameters {
                interval_min,
                interval_max,
                adv_type,
                own_addr_type,
                peer_addr_type,
                peer_addr,
                channel_map,
                filter_policy,
            } => {
                let mut p = Vec::with_capacity(15);
                p.extend_from_slice(&interval_min.to_le_bytes());
                p.extend_from_slice(&interval_max.to_le_bytes());
                p.push(*adv_type);
                p.push(*own_addr_type);
                p.push(*peer_addr_type);
                p.extend_from_slice(peer_addr.as_slice());
                p.push(*channel_map);
                p.push(*filter_policy);
                p
            }

            Self::LeSetAdvertisingData { data } | Self::LeSetScanResponseData { data } => {
                // Fixed 32-byte field: significant length followed by the
                // payload, zero padded.
                let mut p = vec![0u8; 32];
                let n = data.len().min(31);
                p[0] = n as u8;
                p[1..1 + n].copy_from_slice(&data[..n]);
                p
            }

            Self::LeSetAdvertisingEnable { enable } => vec![*enable as u8],

            Self::LeSetScanParameters {
                scan_type,
                interval,
                window,
                own_addr_type,
                filter_policy,
            } => {
                let mut p = Vec::with_capacity(7);
                p.push(*scan_type);
                p.extend_from_slice(&interval.to_le_bytes());
                p.extend_from_slice(&window.to_le_bytes());
                p.push(*own_addr_type);
                p.push(*filter_policy);
                p
            }

            Self::LeSetScanEnable {
                enable,
                filter_duplicates,
            } => vec![*enable as u8, *filter_duplicates as u8],

            Self::LeCreateConnection {
                peer_addr,
                peer_addr_type,
            } => {
                let mut p = Vec::with_capacity(25);
                p.extend_from_slice(&0x0060u16.to_le_bytes()); // scan interval
                p.extend_from_slice(&0x0030u16.to_le_bytes()); // scan window
                p.push(0x00); // no filter policy, use peer address
                p.push(*peer_addr_type);
                p.extend_from_slice(peer_addr.as_slice());
                p.push(0x00); // own address type: public
                p.extend_from_slice(&0x0018u16.to_le_bytes()); // conn interval min
                p.extend_from_slice(&0x0028u16.to_le_bytes()); // conn interval max
                p.extend_from_slice(&0x0000u16.to_le_bytes()); // latency
                p.extend_from_slice(&0x002Au16.to_le_bytes()); // supervision timeout
                p.extend_from_slice(&0x0000u16.to_le_bytes()); // min CE length
                p.extend_from_slice(&0x0000u16.to_le_bytes()); // max CE length
                p
            }

            Self::LeStartEncryption {
                handle,
                rand,
                ediv,
                ltk,
            } => {
                let mut p = Vec::with_capacity(28);
                p.extend_from_slice(&handle.to_le_bytes());
                p.extend_from_slice(rand);
                p.extend_from_slice(&ediv.to_le_bytes());
                p.extend_from_slice(ltk);
                p
            }

            Self::LeLtkRequestReply { handle, ltk } => {
                let mut p = Vec::with_capacity(18);
                p.extend_from_slice(&handle.to_le_bytes());
                p.extend_from_slice(ltk);
                p
            }

            Self::LeLtkRequestNegativeReply { handle } => handle.to_le_bytes().to_vec(),
        }
    }

    /// Serializes the command into a full HCI packet including the packet
    /// indicator byte.
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();
        let mut packet = Vec::with_capacity(4 + params.len());
        packet.push(HCI_COMMAND_PKT);
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// An HCI event packet (without the packet indicator).
#[derive(Debug, Clone)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        let len = data[1] as usize;
        if data.len() < 2 + len {
            return None;
        }
        Some(Self {
            event_code: data[0],
            parameters: data[2..2 + len].to_vec(),
        })
    }
}

/// An ACL data packet (without the packet indicator).
#[derive(Debug, Clone)]
pub struct AclData {
    pub handle: u16,
    /// Packet boundary flag: 0b10 = first (auto-flushable), 0b01 = continuation.
    pub pb_flag: u8,
    pub data: Vec<u8>,
}

pub const ACL_PB_FIRST: u8 = 0b10;
pub const ACL_PB_CONTINUATION: u8 = 0b01;

impl AclData {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let word = LittleEndian::read_u16(&data[0..2]);
        let len = LittleEndian::read_u16(&data[2..4]) as usize;
        if data.len() < 4 + len {
            return None;
        }
        Some(Self {
            handle: word & 0x0FFF,
            pb_flag: ((word >> 12) & 0b11) as u8,
            data: data[4..4 + len].to_vec(),
        })
    }

    /// Serializes to a full packet including the indicator byte.
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5 + self.data.len());
        packet.push(HCI_ACL_PKT);
        let word = (self.handle & 0x0FFF) | ((self.pb_flag as u16) << 12);
        packet.extend_from_slice(&word.to_le_bytes());
        packet.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        packet.extend_from_slice(&self.data);
        packet
    }
}

/// Command Complete event parameters.
#[derive(Debug, Clone)]
pub struct CommandComplete {
    pub num_packets: u8,
    pub opcode: u16,
    /// Status byte followed by any return parameters.
    pub return_params: Vec<u8>,
}

impl CommandComplete {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_COMMAND_COMPLETE || event.parameters.len() < 3 {
            return None;
        }
        Some(Self {
            num_packets: event.parameters[0],
            opcode: LittleEndian::read_u16(&event.parameters[1..3]),
            return_params: event.parameters[3..].to_vec(),
        })
    }
}

/// Command Status event parameters.
#[derive(Debug, Clone)]
pub struct CommandStatus {
    pub status: u8,
    pub num_packets: u8,
    pub opcode: u16,
}

impl CommandStatus {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_COMMAND_STATUS || event.parameters.len() < 4 {
            return None;
        }
        Some(Self {
            status: event.parameters[0],
            num_packets: event.parameters[1],
            opcode: LittleEndian::read_u16(&event.parameters[2..4]),
        })
    }
}

/// Disconnection Complete event parameters.
#[derive(Debug, Clone)]
pub struct DisconnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub reason: u8,
}

impl DisconnectionComplete {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_DISCONNECTION_COMPLETE || event.parameters.len() < 4 {
            return None;
        }
        Some(Self {
            status: event.parameters[0],
            handle: LittleEndian::read_u16(&event.parameters[1..3]),
            reason: event.parameters[3],
        })
    }
}

/// Encryption Change event parameters.
#[derive(Debug, Clone)]
pub struct EncryptionChange {
    pub status: u8,
    pub handle: u16,
    pub enabled: bool,
}

impl EncryptionChange {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_ENCRYPTION_CHANGE || event.parameters.len() < 4 {
            return None;
        }
        Some(Self {
            status: event.parameters[0],
            handle: LittleEndian::read_u16(&event.parameters[1..3]),
            enabled: event.parameters[3] != 0,
        })
    }
}

/// LE Connection Complete subevent parameters.
#[derive(Debug, Clone)]
pub struct LeConnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub role: u8,
    pub peer_addr_type: u8,
    pub peer_addr: BdAddr,
    pub conn_interval: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
}

impl LeConnectionComplete {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        let p = &event.parameters;
        if event.event_code != EVT_LE_META || p.len() < 19 || p[0] != EVT_LE_CONNECTION_COMPLETE {
            return None;
        }
        Some(Self {
            status: p[1],
            handle: LittleEndian::read_u16(&p[2..4]),
            role: p[4],
            peer_addr_type: p[5],
            peer_addr: BdAddr::from_slice(&p[6..12])?,
            conn_interval: LittleEndian::read_u16(&p[12..14]),
            conn_latency: LittleEndian::read_u16(&p[14..16]),
            supervision_timeout: LittleEndian::read_u16(&p[16..18]),
        })
    }
}

/// A single report from an LE Advertising Report subevent.
#[derive(Debug, Clone)]
pub struct LeAdvertisingReport {
    pub event_type: u8,
    pub addr_type: u8,
    pub addr: BdAddr,
    pub data: Vec<u8>,
    pub rssi: i8,
}

impl LeAdvertisingReport {
    /// Parses every report carried by an LE Advertising Report subevent.
    pub fn parse_all(event: &HciEvent) -> Option<Vec<Self>> {
        let p = &event.parameters;
        if event.event_code != EVT_LE_META || p.len() < 2 || p[0] != EVT_LE_ADVERTISING_REPORT {
            return None;
        }
        let num = p[1] as usize;
        let mut reports = Vec::with_capacity(num);
        let mut off = 2;
        for _ in 0..num {
            if p.len() < off + 9 {
                return None;
            }
            let event_type = p[off];
            let addr_type = p[off + 1];
            let addr = BdAddr::from_slice(&p[off + 2..off + 8])?;
            let data_len = p[off + 8] as usize;
            if p.len() < off + 9 + data_len + 1 {
                return None;
            }
            let data = p[off + 9..off + 9 + data_len].to_vec();
            let rssi = p[off + 9 + data_len] as i8;
            reports.push(Self {
                event_type,
                addr_type,
                addr,
                data,
                rssi,
            });
            off += 9 + data_len + 1;
        }
        Some(reports)
    }
}

/// LE Long Term Key Request subevent parameters.
#[derive(Debug, Clone)]
pub struct LeLongTermKeyRequest {
    pub handle: u16,
    pub rand: [u8; 8],
    pub ediv: u16,
}

impl LeLongTermKeyRequest {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        let p = &event.parameters;
        if event.event_code != EVT_LE_META || p.len() < 13 || p[0] != EVT_LE_LONG_TERM_KEY_REQUEST {
            return None;
        }
        let mut rand = [0u8; 8];
        rand.copy_from_slice(&p[3..11]);
        Some(Self {
            handle: LittleEndian::read_u16(&p[1..3]),
            rand,
            ediv: LittleEndian::read_u16(&p[11..13]),
        })
    }
}
