//! The ATT bearer: one per connection, multiplexing the client role, the
//! server role, and asynchronous notifications over the fixed channel.
//!
//! The sequential request discipline (at most one outstanding request) is
//! enforced by a single transmit buffer circulating through a 1-capacity
//! channel: whoever holds the buffer owns the bearer. Releasing it
//! re-allocates the buffer when MTU negotiation changed the transmit size.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use super::constants::*;
use super::error::{code, AttError, AttResult};
use super::server::Server;
use super::types::*;
use crate::gatt::db::LinkSecurity;
use crate::smp::crypto::sign_att_write;
use crate::uuid::Uuid;

/// Deadline for one request/response exchange.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Inbound server-bound request queue depth.
const REQUEST_QUEUE_DEPTH: usize = 10;

/// Notification dispatch queue depth.
const NOTIFICATION_QUEUE_DEPTH: usize = 16;

/// The connection surface the bearer runs on: a framed ATT payload stream
/// plus the per-connection state the server handlers need.
pub trait AttChannel: Send + Sync {
    /// Blocks until the next inbound ATT payload; fails once disconnected.
    fn read(&self) -> AttResult<Vec<u8>>;

    /// Writes one ATT payload.
    fn write(&self, payload: &[u8]) -> AttResult<()>;

    /// The ATT_MTU the local side accepts.
    fn rx_mtu(&self) -> usize;
    fn set_rx_mtu(&self, mtu: usize);

    /// The ATT_MTU the peer accepts; bounds outbound PDUs.
    fn tx_mtu(&self) -> usize;
    fn set_tx_mtu(&self, mtu: usize);

    /// Per-connection CCCD bits for an attribute handle.
    fn cccd_value(&self, handle: u16) -> u16;
    fn set_cccd_value(&self, handle: u16, value: u16);

    /// Security properties of the link, for permission checks.
    fn link_security(&self) -> LinkSecurity;
}

/// A notification or indication delivered by the peer.
#[derive(Debug, Clone)]
pub struct Notification {
    pub indication: bool,
    pub handle: u16,
    pub value: Vec<u8>,
}

/// Handler invoked for each inbound notification, in wire order.
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// The ATT bearer.
pub struct Bearer {
    chan: Arc<dyn AttChannel>,
    buf_tx: SyncSender<Vec<u8>>,
    buf_rx: Mutex<Receiver<Vec<u8>>>,
    rsp_rx: Mutex<Receiver<AttResult<Vec<u8>>>>,
}

impl Bearer {
    /// Starts the bearer: the receive loop, the notification dispatcher,
    /// and (when a server is attached) the request-servicing worker.
    pub fn spawn(
        chan: Arc<dyn AttChannel>,
        handler: Option<NotificationHandler>,
        server: Option<Arc<Server>>,
    ) -> Arc<Self> {
        let (buf_tx, buf_rx) = mpsc::sync_channel(1);
        buf_tx
            .send(vec![0u8; chan.tx_mtu()])
            .expect("fresh buffer channel");
        let (rsp_tx, rsp_rx) = mpsc::sync_channel::<AttResult<Vec<u8>>>(1);
        let (ntf_tx, ntf_rx) = mpsc::sync_channel::<Notification>(NOTIFICATION_QUEUE_DEPTH);
        let (req_tx, req_rx) = mpsc::sync_channel::<Vec<u8>>(REQUEST_QUEUE_DEPTH);

        let bearer = Arc::new(Self {
            chan: Arc::clone(&chan),
            buf_tx,
            buf_rx: Mutex::new(buf_rx),
            rsp_rx: Mutex::new(rsp_rx),
        });

        // Notification dispatcher: bounded, in wire order.
        thread::Builder::new()
            .name("att-ntf".into())
            .spawn(move || {
                while let Ok(notification) = ntf_rx.recv() {
                    if let Some(handler) = &handler {
                        handler(notification);
                    }
                }
            })
            .expect("spawn notification dispatcher");

        // Request-servicing worker: drains the bounded inbound queue and
        // answers through the shared transmit buffer.
        if let Some(server) = server {
            let worker_bearer = Arc::clone(&bearer);
            thread::Builder::new()
                .name("att-srv".into())
                .spawn(move || {
                    while let Ok(request) = req_rx.recv() {
                        if let Some(response) = server.handle_request(&request) {
                            if let Err(err) = worker_bearer.send_raw(&response) {
                                error!("failed to send ATT response: {err}");
                                return;
                            }
                        }
                    }
                })
                .expect("spawn att server worker");
        }

        // Receive loop: classifies inbound frames by opcode.
        let rx_chan = Arc::clone(&chan);
        thread::Builder::new()
            .name("att-rx".into())
            .spawn(move || loop {
                let frame = match rx_chan.read() {
                    Ok(frame) => frame,
                    Err(_) => {
                        let _ = rsp_tx.try_send(Err(AttError::Disconnected));
                        debug!("att receive loop exiting: disconnected");
                        return;
                    }
                };
                if frame.is_empty() {
                    continue;
                }
                let opcode = frame[0];

                if opcode == HANDLE_VALUE_NTF || opcode == HANDLE_VALUE_IND {
                    let indication = opcode == HANDLE_VALUE_IND;
                    match HandleValue::parse(&frame) {
                        Ok(hv) => {
                            let notification = Notification {
                                indication,
                                handle: hv.handle,
                                value: hv.value,
                            };
                            if ntf_tx.try_send(notification).is_err() {
                                warn!("notification queue full, dropping");
                            }
                        }
                        Err(err) => warn!("malformed notification: {err}"),
                    }
                    // Always confirm an indication, even with no handler
                    // registered, before touching any further frame.
                    if indication {
                        let _ = rx_chan.write(&[HANDLE_VALUE_CNF]);
                    }
                    continue;
                }

                if opcode == HANDLE_VALUE_CNF {
                    // Confirmation for an indication we sent; wakes the
                    // pending indicate call.
                    let _ = rsp_tx.try_send(Ok(frame));
                    continue;
                }

                if is_request(opcode) {
                    if req_tx.try_send(frame).is_err() {
                        warn!("server request queue full, dropping 0x{opcode:02x}");
                    }
                    continue;
                }

                if rsp_tx.try_send(Ok(frame)).is_err() {
                    debug!("response 0x{opcode:02x} with no pending request");
                }
            })
            .expect("spawn att receive loop");

        bearer
    }

    // ---- transmit buffer token ----

    /// Acquires the shared transmit buffer, re-sizing it when the
    /// negotiated MTU changed since it was last released.
    fn acquire(&self) -> AttResult<Vec<u8>> {
        let buf = {
            let rx = self.buf_rx.lock().unwrap();
            rx.recv().map_err(|_| AttError::Disconnected)?
        };
        let mtu = self.chan.tx_mtu();
        if buf.len() != mtu {
            return Ok(vec![0u8; mtu]);
        }
        Ok(buf)
    }

    fn release(&self, mut buf: Vec<u8>) {
        let mtu = self.chan.tx_mtu();
        if buf.len() != mtu {
            buf = vec![0u8; mtu];
        }
        let _ = self.buf_tx.send(buf);
    }

    /// Sends a server response under the transmit token.
    fn send_raw(&self, pdu: &[u8]) -> AttResult<()> {
        let buf = self.acquire()?;
        let result = self.chan.write(pdu);
        self.release(buf);
        result
    }

    /// Sends a request and waits for its paired response. Frames that are
    /// neither the expected response nor an Error Response are answered
    /// with `RequestNotSupported` while the wait continues.
    fn request(
        &self,
        expected_rsp: u8,
        build: impl FnOnce(&mut [u8]) -> usize,
    ) -> AttResult<Vec<u8>> {
        let mut buf = self.acquire()?;
        let n = build(&mut buf);
        let req_opcode = buf[0];

        let result = (|| {
            let rsp = self.rsp_rx.lock().unwrap();
            // Drop anything stale from a timed-out exchange.
            while rsp.try_recv().is_ok() {}

            self.chan.write(&buf[..n])?;

            let deadline = Instant::now() + REQUEST_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(AttError::SeqProtoTimeout);
                }
                match rsp.recv_timeout(remaining) {
                    Ok(Ok(frame)) => {
                        let opcode = frame.first().copied().unwrap_or(0);
                        if opcode == ERROR_RSP || opcode == expected_rsp {
                            return Ok(frame);
                        }
                        // A peer interleaving spurious requests; refuse it
                        // and keep waiting for our response.
                        debug!("unexpected 0x{opcode:02x} while waiting for 0x{expected_rsp:02x}");
                        let refusal =
                            ErrorResponse::new(opcode, 0x0000, code::REQUEST_NOT_SUPPORTED);
                        let _ = self.chan.write(&refusal.serialize());
                    }
                    Ok(Err(err)) => return Err(err),
                    Err(RecvTimeoutError::Timeout) => return Err(AttError::SeqProtoTimeout),
                    Err(RecvTimeoutError::Disconnected) => return Err(AttError::Disconnected),
                }
            }
        })();
        self.release(buf);

        let frame = result?;
        if frame[0] == ERROR_RSP {
            let rsp = ErrorResponse::parse(&frame)?;
            if rsp.request_opcode != req_opcode {
                return Err(AttError::InvalidResponse);
            }
            return Err(AttError::from_code(rsp.code));
        }
        Ok(frame)
    }

    /// Sends a command (no response expected) under the transmit token.
    fn command(&self, build: impl FnOnce(&mut [u8]) -> usize) -> AttResult<()> {
        let mut buf = self.acquire()?;
        let n = build(&mut buf);
        let result = self.chan.write(&buf[..n]);
        self.release(buf);
        result
    }

    // ---- client operations ----

    /// Negotiates the ATT_MTU. Both sides settle on
    /// `min(client_rx, server_rx)`. [Vol 3, Part F, 3.4.2]
    pub fn exchange_mtu(&self, client_rx_mtu: usize) -> AttResult<usize> {
        if !(DEFAULT_MTU..=MAX_MTU).contains(&client_rx_mtu) {
            return Err(AttError::InvalidArgument);
        }
        self.chan.set_rx_mtu(client_rx_mtu);
        let frame = self.request(EXCHANGE_MTU_RSP, |buf| {
            build_exchange_mtu_req(buf, client_rx_mtu as u16)
        })?;
        let server_rx_mtu = parse_exchange_mtu_rsp(&frame)? as usize;
        let mtu = client_rx_mtu.min(server_rx_mtu).max(DEFAULT_MTU);
        self.chan.set_tx_mtu(mtu);
        Ok(mtu)
    }

    /// Maps handles to their attribute types. [Vol 3, Part F, 3.4.3.1]
    pub fn find_information(&self, start: u16, end: u16) -> AttResult<FindInformationRsp> {
        if start == 0 || start > end {
            return Err(AttError::InvalidArgument);
        }
        let frame = self.request(FIND_INFORMATION_RSP, |buf| {
            build_find_information_req(buf, start, end)
        })?;
        FindInformationRsp::parse(&frame)
    }

    /// Reads attributes of a known type in a handle range.
    /// [Vol 3, Part F, 3.4.4.1]
    pub fn read_by_type(&self, start: u16, end: u16, uuid: &Uuid) -> AttResult<AttributeDataList> {
        if start == 0 || start > end {
            return Err(AttError::InvalidArgument);
        }
        let frame = self.request(READ_BY_TYPE_RSP, |buf| {
            build_read_by_type_req(buf, start, end, uuid)
        })?;
        parse_read_by_type_rsp(&frame)
    }

    /// Reads grouping attributes of a known type. [Vol 3, Part F, 3.4.4.9]
    pub fn read_by_group_type(
        &self,
        start: u16,
        end: u16,
        uuid: &Uuid,
    ) -> AttResult<AttributeDataList> {
        if start == 0 || start > end {
            return Err(AttError::InvalidArgument);
        }
        let frame = self.request(READ_BY_GROUP_TYPE_RSP, |buf| {
            build_read_by_group_type_req(buf, start, end, uuid)
        })?;
        parse_read_by_group_type_rsp(&frame)
    }

    /// Reads one attribute value. [Vol 3, Part F, 3.4.4.3]
    pub fn read(&self, handle: u16) -> AttResult<Vec<u8>> {
        let frame = self.request(READ_RSP, |buf| build_read_req(buf, handle))?;
        parse_read_rsp(&frame)
    }

    /// Reads part of an attribute value at an offset.
    /// [Vol 3, Part F, 3.4.4.5]
    pub fn read_blob(&self, handle: u16, offset: u16) -> AttResult<Vec<u8>> {
        let frame = self.request(READ_BLOB_RSP, |buf| build_read_blob_req(buf, handle, offset))?;
        parse_read_blob_rsp(&frame)
    }

    /// Reads two or more attribute values in one exchange.
    /// [Vol 3, Part F, 3.4.4.7]
    pub fn read_multiple(&self, handles: &[u16]) -> AttResult<Vec<u8>> {
        if handles.len() < 2 || 1 + handles.len() * 2 > self.chan.tx_mtu() {
            return Err(AttError::InvalidArgument);
        }
        let frame = self.request(READ_MULTIPLE_RSP, |buf| {
            build_read_multiple_req(buf, handles)
        })?;
        parse_read_multiple_rsp(&frame)
    }

    /// Writes an attribute value and waits for acknowledgement.
    /// [Vol 3, Part F, 3.4.5.1]
    pub fn write(&self, handle: u16, value: &[u8]) -> AttResult<()> {
        if value.len() > self.chan.tx_mtu() - 3 {
            return Err(AttError::InvalidArgument);
        }
        let frame = self.request(WRITE_RSP, |buf| build_write_req(buf, handle, value))?;
        parse_write_rsp(&frame)
    }

    /// Writes without acknowledgement. [Vol 3, Part F, 3.4.5.3]
    pub fn write_command(&self, handle: u16, value: &[u8]) -> AttResult<()> {
        if value.len() > self.chan.tx_mtu() - 3 {
            return Err(AttError::InvalidArgument);
        }
        self.command(|buf| build_write_cmd(buf, handle, value))
    }

    /// Signed write into a control-point attribute.
    /// [Vol 3, Part F, 3.4.5.4]
    pub fn signed_write(
        &self,
        handle: u16,
        value: &[u8],
        csrk: &[u8; 16],
        sign_counter: u32,
    ) -> AttResult<()> {
        if value.len() > self.chan.tx_mtu() - 15 {
            return Err(AttError::InvalidArgument);
        }
        self.command(|buf| {
            // Sign over opcode, handle, and value.
            let body_len = build_write_cmd(buf, handle, value);
            buf[0] = SIGNED_WRITE_CMD;
            let signature = sign_att_write(csrk, &buf[..body_len], sign_counter);
            buf[body_len..body_len + 12].copy_from_slice(&signature);
            body_len + 12
        })
    }

    /// Queues part of a long write. [Vol 3, Part F, 3.4.6.1]
    pub fn prepare_write(
        &self,
        handle: u16,
        offset: u16,
        value: &[u8],
    ) -> AttResult<PrepareWriteRsp> {
        if value.len() > self.chan.tx_mtu() - 5 {
            return Err(AttError::InvalidArgument);
        }
        let frame = self.request(PREPARE_WRITE_RSP, |buf| {
            build_prepare_write_req(buf, handle, offset, value)
        })?;
        let rsp = PrepareWriteRsp::parse(&frame)?;
        if rsp.handle != handle || rsp.offset != offset || rsp.value != value {
            return Err(AttError::InvalidResponse);
        }
        Ok(rsp)
    }

    /// Commits or cancels queued writes. [Vol 3, Part F, 3.4.6.3]
    pub fn execute_write(&self, flags: u8) -> AttResult<()> {
        let frame = self.request(EXECUTE_WRITE_RSP, |buf| build_execute_write_req(buf, flags))?;
        parse_execute_write_rsp(&frame)
    }

    // ---- server-initiated operations ----

    /// Sends a Handle Value Notification.
    pub fn notify(&self, handle: u16, value: &[u8]) -> AttResult<()> {
        let max = self.chan.tx_mtu() - 3;
        let value = &value[..value.len().min(max)];
        self.command(|buf| {
            buf[0] = HANDLE_VALUE_NTF;
            buf[1..3].copy_from_slice(&handle.to_le_bytes());
            buf[3..3 + value.len()].copy_from_slice(value);
            3 + value.len()
        })
    }

    /// Sends a Handle Value Indication and blocks for the confirmation.
    pub fn indicate(&self, handle: u16, value: &[u8]) -> AttResult<()> {
        let max = self.chan.tx_mtu() - 3;
        let value = &value[..value.len().min(max)];
        self.request(HANDLE_VALUE_CNF, |buf| {
            buf[0] = HANDLE_VALUE_IND;
            buf[1..3].copy_from_slice(&handle.to_le_bytes());
            buf[3..3 + value.len()].copy_from_slice(value);
            3 + value.len()
        })
        .map(|_| ())
    }

    /// The negotiated transmit MTU.
    pub fn tx_mtu(&self) -> usize {
        self.chan.tx_mtu()
    }
}
