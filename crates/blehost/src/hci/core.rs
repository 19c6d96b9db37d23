//! The HCI command/event core.
//!
//! One read loop drains the transport and demultiplexes: command
//! completion events release the single command credit and wake the
//! pending caller; LE meta events drive connection setup, scanning, and
//! encryption; ACL data is reassembled into L2CAP frames and routed to the
//! owning connection's fixed-channel queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::adv::Advertisement;
use crate::att::constants::DEFAULT_MTU;
use crate::gap::{AddrType, BdAddr, Role};
use crate::gatt::db::LinkSecurity;
use crate::l2cap::{BasicFrame, CID_ATT, CID_SMP};
use crate::smp::{AuthData, BondStore, CustomPairing, SecurityManager, SmpConfig, SmpError};

use super::constants::*;
use super::packet::*;
use super::transport::Transport;
use super::HciError;

/// Response deadline for a single HCI command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Default ACL fragment size when the controller does not report one.
const DEFAULT_ACL_MTU: usize = 27;

/// Default pairing deadline.
const PAIR_TIMEOUT: Duration = Duration::from_secs(60);

/// Handler invoked for each decoded advertisement.
pub type AdvHandler = Arc<dyn Fn(Advertisement) + Send + Sync>;

/// Advertising timing and type parameters.
#[derive(Debug, Clone, Copy)]
pub struct AdvParams {
    /// Minimum interval, 0.625 ms units.
    pub interval_min: u16,
    /// Maximum interval, 0.625 ms units.
    pub interval_max: u16,
    pub connectable: bool,
}

impl Default for AdvParams {
    fn default() -> Self {
        Self {
            interval_min: 0x00A0,
            interval_max: 0x00F0,
            connectable: true,
        }
    }
}

enum CmdOutcome {
    Complete { status: u8, params: Vec<u8> },
    Status { status: u8 },
}

struct CmdWaiter {
    opcode: u16,
    tx: SyncSender<CmdOutcome>,
}

struct ConnInner {
    handle: u16,
    role: Role,
    peer_addr: BdAddr,
    peer_addr_type: AddrType,
    local_addr: BdAddr,
    hci: std::sync::Weak<HciInner>,
    rx_mtu: AtomicUsize,
    tx_mtu: AtomicUsize,
    disconnected: AtomicBool,
    /// ATT fixed-channel payloads, fed by the demux.
    att_rx: Mutex<Receiver<Vec<u8>>>,
    att_tx: Mutex<Option<Sender<Vec<u8>>>>,
    smp_tx: Mutex<Option<Sender<Vec<u8>>>>,
    /// ACL reassembly buffer.
    recomb: Mutex<Vec<u8>>,
    /// Per-connection CCCD values, handle -> bits.
    cccds: Mutex<HashMap<u16, u16>>,
    security: Mutex<LinkSecurity>,
    smp: Mutex<SecurityManager>,
}

/// An LE connection. Cheap to clone; the last clone dropping does not
/// disconnect (use [`Conn::close`]).
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    pub fn handle(&self) -> u16 {
        self.inner.handle
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn peer_addr(&self) -> BdAddr {
        self.inner.peer_addr
    }

    pub fn peer_addr_type(&self) -> AddrType {
        self.inner.peer_addr_type
    }

    pub fn local_addr(&self) -> BdAddr {
        self.inner.local_addr
    }

    /// The ATT_MTU the local side can receive.
    pub fn rx_mtu(&self) -> usize {
        self.inner.rx_mtu.load(Ordering::Relaxed)
    }

    pub fn set_rx_mtu(&self, mtu: usize) {
        self.inner.rx_mtu.store(mtu, Ordering::Relaxed);
    }

    /// The ATT_MTU the peer can receive; bounds every outbound PDU.
    pub fn tx_mtu(&self) -> usize {
        self.inner.tx_mtu.load(Ordering::Relaxed)
    }

    pub fn set_tx_mtu(&self, mtu: usize) {
        self.inner.tx_mtu.store(mtu, Ordering::Relaxed);
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    /// Blocks until the next inbound ATT payload, or `Disconnected`.
    pub fn read_att(&self) -> Result<Vec<u8>, HciError> {
        let rx = self.inner.att_rx.lock().unwrap();
        rx.recv().map_err(|_| HciError::Disconnected)
    }

    /// Writes one ATT payload on the fixed channel.
    pub fn write_att(&self, payload: &[u8]) -> Result<(), HciError> {
        if self.is_disconnected() {
            return Err(HciError::Disconnected);
        }
        let hci = self.inner.hci.upgrade().ok_or(HciError::Closed)?;
        hci.write_acl(self.inner.handle, CID_ATT, payload)
    }

    /// The CCCD bits this connection has written for `handle`.
    pub fn cccd_value(&self, handle: u16) -> u16 {
        *self.inner.cccds.lock().unwrap().get(&handle).unwrap_or(&0)
    }

    pub fn set_cccd_value(&self, handle: u16, value: u16) {
        self.inner.cccds.lock().unwrap().insert(handle, value);
    }

    /// Security properties of the link, for attribute permission checks.
    pub fn link_security(&self) -> LinkSecurity {
        *self.inner.security.lock().unwrap()
    }

    /// Initiates pairing and blocks for the result. A zero timeout selects
    /// the 60 s default.
    pub fn pair(&self, auth_data: AuthData, timeout: Duration) -> Result<(), SmpError> {
        let timeout = if timeout.is_zero() {
            PAIR_TIMEOUT
        } else {
            timeout
        };
        let result_rx = {
            let mut smp = self.inner.smp.lock().unwrap();
            smp.pair(auth_data)?
        };
        match result_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => {
                let mut smp = self.inner.smp.lock().unwrap();
                smp.abort(SmpError::Timeout);
                Err(SmpError::Timeout)
            }
        }
    }

    /// Starts link-layer encryption from a stored bond.
    pub fn start_encryption(&self) -> Result<(), SmpError> {
        self.inner.smp.lock().unwrap().start_encryption()
    }

    /// Installs the application's channel for interactive pairing
    /// decisions.
    pub fn prepare_custom_pairing(&self, custom: CustomPairing) {
        self.inner.smp.lock().unwrap().prepare_custom_pairing(custom);
    }

    /// The LTK derived by a completed pairing, spec byte order.
    pub fn derived_ltk(&self) -> Option<[u8; 16]> {
        self.inner.smp.lock().unwrap().derived_key()
    }

    /// Requests disconnection from the controller.
    pub fn close(&self) -> Result<(), HciError> {
        if self.is_disconnected() {
            return Ok(());
        }
        let hci = self.inner.hci.upgrade().ok_or(HciError::Closed)?;
        hci.send_command(&HciCommand::Disconnect {
            handle: self.inner.handle,
            reason: 0x13, // remote user terminated
        })?;
        Ok(())
    }
}

impl crate::att::AttChannel for Conn {
    fn read(&self) -> crate::att::AttResult<Vec<u8>> {
        self.read_att().map_err(|_| crate::att::AttError::Disconnected)
    }

    fn write(&self, payload: &[u8]) -> crate::att::AttResult<()> {
        self.write_att(payload)
            .map_err(|_| crate::att::AttError::Disconnected)
    }

    fn rx_mtu(&self) -> usize {
        Conn::rx_mtu(self)
    }

    fn set_rx_mtu(&self, mtu: usize) {
        Conn::set_rx_mtu(self, mtu)
    }

    fn tx_mtu(&self) -> usize {
        Conn::tx_mtu(self)
    }

    fn set_tx_mtu(&self, mtu: usize) {
        Conn::set_tx_mtu(self, mtu)
    }

    fn cccd_value(&self, handle: u16) -> u16 {
        Conn::cccd_value(self, handle)
    }

    fn set_cccd_value(&self, handle: u16, value: u16) {
        Conn::set_cccd_value(self, handle, value)
    }

    fn link_security(&self) -> LinkSecurity {
        Conn::link_security(self)
    }
}

struct HciInner {
    transport: Box<dyn Transport>,
    /// Serializes command issue; one outstanding command at a time.
    cmd_lock: Mutex<()>,
    /// Controller command credit, capacity 1.
    credit_tx: SyncSender<()>,
    credit_rx: Mutex<Receiver<()>>,
    waiter: Mutex<Option<CmdWaiter>>,
    conns: Mutex<HashMap<u16, Arc<ConnInner>>>,
    accept_tx: Mutex<Option<SyncSender<Conn>>>,
    accept_rx: Mutex<Receiver<Conn>>,
    dial_waiter: Mutex<Option<SyncSender<Result<Conn, HciError>>>>,
    adv_handler: RwLock<Option<AdvHandler>>,
    local_addr: Mutex<BdAddr>,
    acl_mtu: AtomicUsize,
    att_mtu: AtomicUsize,
    closed: AtomicBool,
    smp_config: SmpConfig,
    bond_store: Arc<dyn BondStore>,
}

/// The HCI host core.
pub struct Hci {
    inner: Arc<HciInner>,
}

impl Hci {
    /// Builds the core over a transport and starts the read loop.
    pub fn new(
        transport: Box<dyn Transport>,
        smp_config: SmpConfig,
        bond_store: Arc<dyn BondStore>,
    ) -> Self {
        let (credit_tx, credit_rx) = mpsc::sync_channel(1);
        credit_tx.send(()).expect("fresh credit channel");
        let (accept_tx, accept_rx) = mpsc::sync_channel(8);

        let inner = Arc::new(HciInner {
            transport,
            cmd_lock: Mutex::new(()),
            credit_tx,
            credit_rx: Mutex::new(credit_rx),
            waiter: Mutex::new(None),
            conns: Mutex::new(HashMap::new()),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: Mutex::new(accept_rx),
            dial_waiter: Mutex::new(None),
            adv_handler: RwLock::new(None),
            local_addr: Mutex::new(BdAddr::default()),
            acl_mtu: AtomicUsize::new(DEFAULT_ACL_MTU),
            att_mtu: AtomicUsize::new(DEFAULT_MTU),
            closed: AtomicBool::new(false),
            smp_config,
            bond_store,
        });

        let loop_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("hci-rx".into())
            .spawn(move || read_loop(loop_inner))
            .expect("spawn hci read loop");

        Self { inner }
    }

    /// Resets the controller and loads its identity and buffer sizes.
    pub fn init(&self) -> Result<(), HciError> {
        self.send_command(&HciCommand::Reset)?;
        self.send_command(&HciCommand::SetEventMask {
            mask: 0x3FFF_FFFF_FFFF_FFFF,
        })?;
        self.send_command(&HciCommand::LeSetEventMask { mask: 0x1F })?;

        let params = self.send_command(&HciCommand::ReadBdAddr)?;
        if let Some(addr) = BdAddr::from_slice(&params) {
            *self.inner.local_addr.lock().unwrap() = addr;
            info!("controller address {addr}");
        }

        let params = self.send_command(&HciCommand::LeReadBufferSize)?;
        if params.len() >= 2 {
            let len = u16::from_le_bytes([params[0], params[1]]) as usize;
            if len > 0 {
                self.inner.acl_mtu.store(len, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// The local controller address.
    pub fn addr(&self) -> BdAddr {
        *self.inner.local_addr.lock().unwrap()
    }

    /// The ATT_MTU connections start from.
    pub fn att_mtu(&self) -> usize {
        self.inner.att_mtu.load(Ordering::Relaxed)
    }

    pub fn set_att_mtu(&self, mtu: usize) {
        self.inner.att_mtu.store(mtu, Ordering::Relaxed);
    }

    /// Issues one command and blocks for its completion event. Returns the
    /// return parameters after the status byte.
    pub fn send_command(&self, cmd: &HciCommand) -> Result<Vec<u8>, HciError> {
        self.inner.send_command(cmd)
    }

    /// Installs the advertisement handler used while scanning.
    pub fn set_adv_handler(&self, handler: AdvHandler) {
        *self.inner.adv_handler.write().unwrap() = Some(handler);
    }

    /// Starts passive-free (active) scanning. With `allow_dup` unset the
    /// controller suppresses duplicate reports.
    pub fn start_scan(&self, allow_dup: bool) -> Result<(), HciError> {
        self.send_command(&HciCommand::LeSetScanParameters {
            scan_type: 0x01,
            interval: 0x0060,
            window: 0x0030,
            own_addr_type: 0x00,
            filter_policy: 0x00,
        })?;
        self.send_command(&HciCommand::LeSetScanEnable {
            enable: true,
            filter_duplicates: !allow_dup,
        })?;
        Ok(())
    }

    pub fn stop_scan(&self) -> Result<(), HciError> {
        self.send_command(&HciCommand::LeSetScanEnable {
            enable: false,
            filter_duplicates: false,
        })?;
        Ok(())
    }

    /// Programs advertising data and enables advertising.
    pub fn start_advertising(
        &self,
        ad: &[u8],
        scan_rsp: &[u8],
        params: AdvParams,
    ) -> Result<(), HciError> {
        if ad.len() > 31 || scan_rsp.len() > 31 {
            return Err(HciError::InvalidPacket("advertising payload > 31".into()));
        }
        self.send_command(&HciCommand::LeSetAdvertisingParameters {
            interval_min: params.interval_min,
            interval_max: params.interval_max,
            adv_type: if params.connectable { 0x00 } else { 0x03 },
            own_addr_type: 0x00,
            peer_addr_type: 0x00,
            peer_addr: BdAddr::default(),
            channel_map: 0x07,
            filter_policy: 0x00,
        })?;
        self.send_command(&HciCommand::LeSetAdvertisingData { data: ad.to_vec() })?;
        self.send_command(&HciCommand::LeSetScanResponseData {
            data: scan_rsp.to_vec(),
        })?;
        self.send_command(&HciCommand::LeSetAdvertisingEnable { enable: true })?;
        Ok(())
    }

    pub fn stop_advertising(&self) -> Result<(), HciError> {
        self.send_command(&HciCommand::LeSetAdvertisingEnable { enable: false })?;
        Ok(())
    }

    /// Connects to a peer. The timeout aborts the pending create-connection
    /// command via LE Create Connection Cancel.
    pub fn dial(
        &self,
        addr: BdAddr,
        addr_type: AddrType,
        timeout: Duration,
    ) -> Result<Conn, HciError> {
        let (tx, rx) = mpsc::sync_channel(1);
        *self.inner.dial_waiter.lock().unwrap() = Some(tx);

        self.send_command(&HciCommand::LeCreateConnection {
            peer_addr: addr,
            peer_addr_type: addr_type.into(),
        })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => {
                self.inner.dial_waiter.lock().unwrap().take();
                let _ = self.send_command(&HciCommand::LeCreateConnectionCancel);
                // The cancel may race an established connection; hand it
                // back if it arrived.
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(HciError::DialTimeout),
                }
            }
        }
    }

    /// Blocks for the next inbound (peripheral-role) connection. Returns
    /// `Closed` when the transport is gone.
    pub fn accept(&self) -> Result<Conn, HciError> {
        let rx = self.inner.accept_rx.lock().unwrap();
        rx.recv().map_err(|_| HciError::Closed)
    }

    /// Closes the transport, tearing down every connection.
    pub fn close(&self) {
        self.inner.fatal(None);
    }
}

impl HciInner {
    fn send_command(&self, cmd: &HciCommand) -> Result<Vec<u8>, HciError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HciError::Closed);
        }
        let opcode = cmd.opcode();
        eprintln!("DEBUG: send_command enter opcode={opcode:x}");
        let _guard = self.cmd_lock.lock().unwrap();
        eprintln!("DEBUG: got cmd_lock");

        // Take the controller credit.
        {
            let credit = self.credit_rx.lock().unwrap();
            eprintln!("DEBUG: got credit_rx lock, waiting for credit");
            credit
                .recv_timeout(COMMAND_TIMEOUT)
                .map_err(|_| HciError::CommandTimeout { opcode })?;
            eprintln!("DEBUG: got credit");
        }

        let (tx, rx) = mpsc::sync_channel(1);
        *self.waiter.lock().unwrap() = Some(CmdWaiter { opcode, tx });

        if let Err(err) = self.transport.write_packet(&cmd.to_packet()) {
            self.waiter.lock().unwrap().take();
            let _ = self.credit_tx.try_send(());
            return Err(HciError::Transport(err));
        }

        eprintln!("DEBUG: wrote packet, waiting for response");
        match rx.recv_timeout(COMMAND_TIMEOUT) {
            Ok(CmdOutcome::Complete { status, params }) => {
                if status != 0 {
                    return Err(HciError::CommandFailed { opcode, status });
                }
                Ok(params)
            }
            Ok(CmdOutcome::Status { status }) => {
                if status != 0 {
                    return Err(HciError::CommandFailed { opcode, status });
                }
                Ok(Vec::new())
            }
            Err(_) => {
                self.waiter.lock().unwrap().take();
                // Keep the HCI usable after a lost completion.
                let _ = self.credit_tx.try_send(());
                if self.closed.load(Ordering::SeqCst) {
                    Err(HciError::Closed)
                } else {
                    Err(HciError::CommandTimeout { opcode })
                }
            }
        }
    }

    fn write_acl(&self, handle: u16, cid: u16, payload: &[u8]) -> Result<(), HciError> {
        let frame = BasicFrame::new(cid, payload.to_vec()).serialize();
        let mtu = self.acl_mtu.load(Ordering::Relaxed);
        let mut first = true;
        let mut off = 0;
        while off < frame.len() || first {
            let end = (off + mtu).min(frame.len());
            let acl = AclData {
                handle,
                pb_flag: if first { ACL_PB_FIRST } else { ACL_PB_CONTINUATION },
                data: frame[off..end].to_vec(),
            };
            self.transport
                .write_packet(&acl.to_packet())
                .map_err(HciError::Transport)?;
            first = false;
            off = end;
        }
        Ok(())
    }

    fn conn(&self, handle: u16) -> Option<Arc<ConnInner>> {
        self.conns.lock().unwrap().get(&handle).cloned()
    }

    /// Tears everything down after an unrecoverable transport error.
    fn fatal(&self, err: Option<std::io::Error>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(err) = err {
            error!("transport failed, closing: {err}");
        }
        self.transport.close();
        self.accept_tx.lock().unwrap().take();
        self.waiter.lock().unwrap().take();
        self.dial_waiter.lock().unwrap().take();
        let handles: Vec<u16> = self.conns.lock().unwrap().keys().copied().collect();
        for handle in handles {
            self.teardown_conn(handle, 0x08);
        }
    }

    fn teardown_conn(&self, handle: u16, reason: u8) {
        let Some(conn) = self.conns.lock().unwrap().remove(&handle) else {
            return;
        };
        debug!("connection 0x{handle:04x} closed, reason 0x{reason:02x}");
        conn.disconnected.store(true, Ordering::SeqCst);
        // Dropping the senders wakes the ATT and SMP loops with a closed
        // channel, which they translate to Disconnected.
        conn.att_tx.lock().unwrap().take();
        conn.smp_tx.lock().unwrap().take();
        conn.smp.lock().unwrap().abort(SmpError::Disconnected);
    }
}

fn read_loop(inner: Arc<HciInner>) {
    loop {
        let packet = match inner.transport.read_packet() {
            Ok(packet) => packet,
            Err(err) => {
                inner.fatal(Some(err));
                return;
            }
        };
        eprintln!("DEBUG: read_loop got packet {packet:?}");
        if packet.is_empty() {
            continue;
        }
        match packet[0] {
            HCI_EVENT_PKT => match HciEvent::parse(&packet[1..]) {
                Some(event) => {
                    eprintln!("DEBUG: parsed event code={:x}", event.event_code);
                    handle_event(&inner, event)
                }
                None => warn!("malformed event packet"),
            },
            HCI_ACL_PKT => match AclData::parse(&packet[1..]) {
                Some(acl) => handle_acl(&inner, acl),
                None => warn!("malformed ACL packet"),
            },
            other => debug!("ignoring packet type 0x{other:02x}"),
        }
    }
}

fn handle_event(inner: &Arc<HciInner>, event: HciEvent) {
    match event.event_code {
        EVT_COMMAND_COMPLETE => {
            if let Some(complete) = CommandComplete::parse(&event) {
                if complete.num_packets > 0 {
                    let _ = inner.credit_tx.try_send(());
                }
                deliver_cmd(inner, complete.opcode, || CmdOutcome::Complete {
                    status: complete.return_params.first().copied().unwrap_or(0),
                    params: complete.return_params.get(1..).unwrap_or(&[]).to_vec(),
                });
            }
        }
        EVT_COMMAND_STATUS => {
            if let Some(status) = CommandStatus::parse(&event) {
                if status.num_packets > 0 {
                    let _ = inner.credit_tx.try_send(());
                }
                deliver_cmd(inner, status.opcode, || CmdOutcome::Status {
                    status: status.status,
                });
            }
        }
        EVT_DISCONNECTION_COMPLETE => {
            if let Some(disc) = DisconnectionComplete::parse(&event) {
                inner.teardown_conn(disc.handle, disc.reason);
            }
        }
        EVT_ENCRYPTION_CHANGE => {
            if let Some(change) = EncryptionChange::parse(&event) {
                if let Some(conn) = inner.conn(change.handle) {
                    let enabled = change.status == 0 && change.enabled;
                    if enabled {
                        let authenticated = conn.smp.lock().unwrap().authenticated();
                        *conn.security.lock().unwrap() = if authenticated {
                            LinkSecurity::EncryptedAuthenticated
                        } else {
                            LinkSecurity::Encrypted
                        };
                    }
                    conn.smp.lock().unwrap().on_encryption_changed(enabled);
                }
            }
        }
        EVT_NUMBER_OF_COMPLETED_PACKETS => {}
        EVT_LE_META => handle_le_meta(inner, &event),
        other => debug!("unhandled event 0x{other:02x}"),
    }
}

fn deliver_cmd(inner: &HciInner, opcode: u16, outcome: impl FnOnce() -> CmdOutcome) {
    let mut waiter = inner.waiter.lock().unwrap();
    eprintln!("DEBUG: deliver_cmd opcode={opcode:x} waiter_present={} waiter_opcode={:?}", waiter.is_some(), waiter.as_ref().map(|w| w.opcode));
    match waiter.as_ref() {
        Some(w) if w.opcode == opcode => {
            let w = waiter.take().expect("waiter present");
            let res = w.tx.try_send(outcome());
            eprintln!("DEBUG: deliver_cmd try_send result={res:?}");
        }
        _ => debug!("completion for 0x{opcode:04x} with no waiter"),
    }
}

fn handle_le_meta(inner: &Arc<HciInner>, event: &HciEvent) {
    let Some(&subevent) = event.parameters.first() else {
        return;
    };
    match subevent {
        EVT_LE_CONNECTION_COMPLETE => {
            let Some(complete) = LeConnectionComplete::parse(event) else {
                warn!("malformed LE connection complete");
                return;
            };
            handle_connection_complete(inner, complete);
        }
        EVT_LE_ADVERTISING_REPORT => {
            let Some(reports) = LeAdvertisingReport::parse_all(event) else {
                warn!("malformed advertising report");
                return;
            };
            let handler = inner.adv_handler.read().unwrap().clone();
            let Some(handler) = handler else { return };
            for report in reports {
                match Advertisement::decode(
                    report.addr,
                    AddrType::from(report.addr_type),
                    report.event_type,
                    report.rssi,
                    &report.data,
                ) {
                    Ok(adv) => handler(adv),
                    Err(err) => debug!("dropping advertisement from {}: {err}", report.addr),
                }
            }
        }
        EVT_LE_LONG_TERM_KEY_REQUEST => {
            let Some(request) = LeLongTermKeyRequest::parse(event) else {
                return;
            };
            let Some(conn) = inner.conn(request.handle) else {
                return;
            };
            // Replying needs send_command, which must not run on the read
            // loop; it would deadlock waiting for its own completion.
            let inner = Arc::clone(inner);
            thread::spawn(move || {
                let key = conn
                    .smp
                    .lock()
                    .unwrap()
                    .encryption_key(request.ediv, &request.rand);
                let result = match key {
                    Some(ltk) => inner.send_command(&HciCommand::LeLtkRequestReply {
                        handle: request.handle,
                        ltk,
                    }),
                    None => inner.send_command(&HciCommand::LeLtkRequestNegativeReply {
                        handle: request.handle,
                    }),
                };
                if let Err(err) = result {
                    warn!("LTK request reply failed: {err}");
                }
            });
        }
        EVT_LE_CONNECTION_UPDATE_COMPLETE => {}
        other => debug!("unhandled LE subevent 0x{other:02x}"),
    }
}

fn handle_connection_complete(inner: &Arc<HciInner>, complete: LeConnectionComplete) {
    if complete.status != 0 {
        debug!("connection failed, status 0x{:02x}", complete.status);
        if let Some(tx) = inner.dial_waiter.lock().unwrap().take() {
            let _ = tx.try_send(Err(HciError::CommandFailed {
                opcode: opcode(OGF_LE, OCF_LE_CREATE_CONNECTION),
                status: complete.status,
            }));
        }
        return;
    }

    let role = if complete.role == 0x00 {
        Role::Central
    } else {
        Role::Peripheral
    };
    let conn = make_conn(inner, &complete, role);
    info!(
        "connected to {} (handle 0x{:04x}, {:?})",
        complete.peer_addr, complete.handle, role
    );

    match role {
        Role::Central => {
            if let Some(tx) = inner.dial_waiter.lock().unwrap().take() {
                let _ = tx.try_send(Ok(conn));
            }
        }
        Role::Peripheral => {
            let accept_tx = inner.accept_tx.lock().unwrap();
            if let Some(tx) = accept_tx.as_ref() {
                if tx.try_send(conn).is_err() {
                    warn!("accept queue full, dropping inbound connection");
                }
            }
        }
    }
}

fn make_conn(inner: &Arc<HciInner>, complete: &LeConnectionComplete, role: Role) -> Conn {
    let (att_tx, att_rx) = mpsc::channel();
    let (smp_tx, smp_rx) = mpsc::channel::<Vec<u8>>();

    let local_addr = *inner.local_addr.lock().unwrap();
    let peer_addr_type = AddrType::from(complete.peer_addr_type);
    let mut manager = SecurityManager::new(
        inner.smp_config,
        Arc::clone(&inner.bond_store),
        role,
        local_addr,
        AddrType::Public,
        complete.peer_addr,
        peer_addr_type,
    );

    let handle = complete.handle;
    let write_ref = Arc::downgrade(inner);
    manager.set_write_pdu(Box::new(move |pdu| {
        let hci = write_ref.upgrade().ok_or(SmpError::Disconnected)?;
        hci.write_acl(handle, CID_SMP, pdu)
            .map_err(|err| SmpError::Io(err.to_string()))
    }));
    let encrypt_ref = Arc::downgrade(inner);
    manager.set_encrypt(Box::new(move |bond| {
        let hci = encrypt_ref.upgrade().ok_or(SmpError::Disconnected)?;
        hci.send_command(&HciCommand::LeStartEncryption {
            handle,
            rand: bond.rand,
            ediv: bond.ediv,
            ltk: bond.ltk,
        })
        .map(|_| ())
        .map_err(|err| SmpError::Io(err.to_string()))
    }));

    let att_mtu = inner.att_mtu.load(Ordering::Relaxed);
    let conn_inner = Arc::new(ConnInner {
        handle,
        role,
        peer_addr: complete.peer_addr,
        peer_addr_type,
        local_addr,
        hci: Arc::downgrade(inner),
        rx_mtu: AtomicUsize::new(att_mtu),
        tx_mtu: AtomicUsize::new(DEFAULT_MTU),
        disconnected: AtomicBool::new(false),
        att_rx: Mutex::new(att_rx),
        att_tx: Mutex::new(Some(att_tx)),
        smp_tx: Mutex::new(Some(smp_tx)),
        recomb: Mutex::new(Vec::new()),
        cccds: Mutex::new(HashMap::new()),
        security: Mutex::new(LinkSecurity::Plain),
        smp: Mutex::new(manager),
    });

    inner
        .conns
        .lock()
        .unwrap()
        .insert(handle, Arc::clone(&conn_inner));

    // One SMP worker per connection drains the fixed channel so a blocked
    // user decision never stalls the HCI read loop.
    let smp_conn = Arc::clone(&conn_inner);
    thread::Builder::new()
        .name(format!("smp-{handle:04x}"))
        .spawn(move || {
            while let Ok(frame) = smp_rx.recv() {
                let result = smp_conn.smp.lock().unwrap().handle(&frame);
                if let Err(err) = result {
                    warn!("pairing failed: {err}");
                }
            }
        })
        .expect("spawn smp worker");

    Conn { inner: conn_inner }
}

fn handle_acl(inner: &Arc<HciInner>, acl: AclData) {
    let Some(conn) = inner.conn(acl.handle) else {
        debug!("ACL data for unknown handle 0x{:04x}", acl.handle);
        return;
    };

    let mut recomb = conn.recomb.lock().unwrap();
    if acl.pb_flag == ACL_PB_CONTINUATION {
        recomb.extend_from_slice(&acl.data);
    } else {
        if !recomb.is_empty() {
            warn!("dropping incomplete L2CAP reassembly");
        }
        *recomb = acl.data;
    }

    let Some(expected) = BasicFrame::expected_len(&recomb) else {
        return;
    };
    if recomb.len() < expected {
        return;
    }
    let frame_bytes: Vec<u8> = recomb.drain(..expected).collect();
    if !recomb.is_empty() {
        warn!("trailing bytes after L2CAP frame, dropping");
        recomb.clear();
    }
    drop(recomb);

    let Some(frame) = BasicFrame::parse(&frame_bytes) else {
        warn!("malformed L2CAP frame");
        return;
    };
    match frame.cid {
        CID_ATT => {
            let att_tx = conn.att_tx.lock().unwrap();
            if let Some(tx) = att_tx.as_ref() {
                let _ = tx.send(frame.payload);
            }
        }
        CID_SMP => {
            let smp_tx = conn.smp_tx.lock().unwrap();
            if let Some(tx) = smp_tx.as_ref() {
                let _ = tx.send(frame.payload);
            }
        }
        other => warn!("dropping frame for unsupported CID 0x{other:04x}"),
    }
}
