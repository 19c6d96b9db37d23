//! The Security Manager pairing engine.
//!
//! One [`SecurityManager`] exists per connection. The connection's SMP
//! worker feeds it inbound PDUs through [`SecurityManager::handle`]; the
//! engine writes outbound PDUs and requests link-layer encryption through
//! injected functions, so it stays independent of the HCI plumbing.
//!
//! ```text
//! Init -> WaitPairingResponse -> WaitPublicKey -> WaitConfirm
//!      -> WaitRandom -> WaitDhKeyCheck -> Finished
//!                                      \-> Error
//! ```
//!
//! Legacy pairing reuses the same states; `WaitPublicKey` is skipped and
//! `WaitDhKeyCheck` collapses into an immediate encryption start with the
//! STK.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::gap::{AddrType, BdAddr, Role};

use super::constants::*;
use super::crypto::{self, KeyPair};
use super::keys::{BondInfo, BondStore};
use super::types::{
    association_model, AuthData, AuthReq, IoCapability, PairingDecision, PairingMethod, SmpConfig,
    SmpError, SmpResult,
};

/// How long to wait for the application's answer at a user-decision point.
const CUSTOM_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairing progress states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Init,
    WaitPairingResponse,
    WaitPublicKey,
    WaitConfirm,
    WaitRandom,
    WaitDhKeyCheck,
    Finished,
    Error,
}

/// The application's channel pair for interactive pairing decisions. The
/// engine sends a [`PairingDecision`] and, for numeric comparison, blocks
/// on the boolean reply.
pub struct CustomPairing {
    pub decisions: std::sync::mpsc::Sender<PairingDecision>,
    pub replies: Mutex<Receiver<bool>>,
}

type WritePdu = Box<dyn Fn(&[u8]) -> SmpResult<()> + Send + Sync>;
type Encrypt = Box<dyn Fn(&BondInfo) -> SmpResult<()> + Send + Sync>;

/// Per-attempt pairing context. Addresses and 128-bit values are kept in
/// specification byte order throughout; wire conversion happens at the PDU
/// boundary.
struct PairingContext {
    method: PairingMethod,
    legacy: bool,
    /// Raw 7-byte Pairing Request / Response PDUs, wire order.
    preq: [u8; 7],
    pres: [u8; 7],
    remote_auth: AuthReq,
    local_keys: Option<KeyPair>,
    /// Peer public key coordinates.
    remote_pk: Option<([u8; 32], [u8; 32])>,
    dh_key: Option<[u8; 32]>,
    local_rand: [u8; 16],
    remote_rand: [u8; 16],
    local_confirm: [u8; 16],
    remote_confirm: [u8; 16],
    mac_key: Option<[u8; 16]>,
    ltk: Option<[u8; 16]>,
    /// Legacy temporary key.
    tk: [u8; 16],
    passkey: u32,
    round: u8,
}

impl PairingContext {
    fn new(preq: [u8; 7], pres: [u8; 7]) -> Self {
        Self {
            method: PairingMethod::JustWorks,
            legacy: false,
            preq,
            pres,
            remote_auth: AuthReq::from_u8(0),
            local_keys: None,
            remote_pk: None,
            dh_key: None,
            local_rand: [0; 16],
            remote_rand: [0; 16],
            local_confirm: [0; 16],
            remote_confirm: [0; 16],
            mac_key: None,
            ltk: None,
            tk: [0; 16],
            passkey: 0,
            round: 0,
        }
    }

    /// The f4 `z` argument for the current passkey round.
    fn passkey_z(&self) -> u8 {
        0x80 | ((self.passkey >> self.round) & 0x01) as u8
    }

    /// The 128-bit `r` value f6 consumes for the selected model.
    fn r_value(&self, oob: Option<[u8; 16]>) -> [u8; 16] {
        match self.method {
            PairingMethod::PasskeyEntry => {
                let mut r = [0u8; 16];
                r[12..].copy_from_slice(&self.passkey.to_be_bytes());
                r
            }
            PairingMethod::OutOfBand => oob.unwrap_or([0u8; 16]),
            _ => [0u8; 16],
        }
    }
}

/// The per-connection pairing state machine.
pub struct SecurityManager {
    config: SmpConfig,
    role: Role,
    state: PairingState,
    /// Addresses pre-swapped into specification byte order for the crypto
    /// functions.
    local_addr: [u8; 6],
    local_addr_type: u8,
    remote_addr: [u8; 6],
    remote_addr_type: u8,
    auth_data: AuthData,
    write_pdu: Option<WritePdu>,
    encrypt: Option<Encrypt>,
    bond_store: Arc<dyn BondStore>,
    result_tx: Option<SyncSender<SmpResult<()>>>,
    custom: Option<CustomPairing>,
    ctx: Option<Box<PairingContext>>,
    /// Key handed to the controller on an LE Long Term Key Request: the
    /// STK or LTK of the pairing in progress.
    enc_key: Option<[u8; 16]>,
    /// Bond assembled during this pairing.
    bond: Option<BondInfo>,
}

impl SecurityManager {
    pub fn new(
        config: SmpConfig,
        bond_store: Arc<dyn BondStore>,
        role: Role,
        local_addr: BdAddr,
        local_addr_type: AddrType,
        remote_addr: BdAddr,
        remote_addr_type: AddrType,
    ) -> Self {
        Self {
            config,
            role,
            state: PairingState::Init,
            local_addr: local_addr.swapped(),
            local_addr_type: local_addr_type.into(),
            remote_addr: remote_addr.swapped(),
            remote_addr_type: remote_addr_type.into(),
            auth_data: AuthData::default(),
            write_pdu: None,
            encrypt: None,
            bond_store,
            result_tx: None,
            custom: None,
            ctx: None,
            enc_key: None,
            bond: None,
        }
    }

    pub fn set_write_pdu(&mut self, f: WritePdu) {
        self.write_pdu = Some(f);
    }

    pub fn set_encrypt(&mut self, f: Encrypt) {
        self.encrypt = Some(f);
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    /// The LTK derived by the pairing in progress, spec byte order.
    /// Available once the state machine reaches `Finished`.
    pub fn derived_key(&self) -> Option<[u8; 16]> {
        self.enc_key
    }

    /// Installs the application's decision channel for numeric comparison
    /// and passkey display.
    pub fn prepare_custom_pairing(&mut self, custom: CustomPairing) {
        self.custom = Some(custom);
    }

    /// Initiates pairing. Valid only in `Init`. Returns the channel the
    /// final result arrives on; the caller owns the timeout.
    ///
    /// On a central this sends a Pairing Request; on a peripheral it sends
    /// a Security Request and waits for the central to initiate.
    pub fn pair(&mut self, auth_data: AuthData) -> SmpResult<Receiver<SmpResult<()>>> {
        if self.state != PairingState::Init {
            return Err(SmpError::AlreadyInProgress);
        }
        self.auth_data = auth_data;

        let (tx, rx) = sync_channel(1);
        self.result_tx = Some(tx);

        if self.role == Role::Peripheral {
            self.send(&[SECURITY_REQUEST, self.config.auth_req.to_u8()])?;
            return Ok(rx);
        }

        let preq = self.request_pdu(PAIRING_REQUEST);
        self.send(&preq)?;
        self.ctx = Some(Box::new(PairingContext::new(preq, [0; 7])));
        self.state = PairingState::WaitPairingResponse;
        Ok(rx)
    }

    /// Aborts the pairing in progress, e.g. on a caller-side timeout.
    pub fn abort(&mut self, err: SmpError) {
        if matches!(self.state, PairingState::Finished | PairingState::Init) {
            return;
        }
        let _ = self.send(&[PAIRING_FAILED, REASON_UNSPECIFIED]);
        self.state = PairingState::Error;
        self.signal(Err(err));
    }

    /// The key to hand the controller on an LE Long Term Key Request,
    /// wire byte order.
    pub fn encryption_key(&self, ediv: u16, rand: &[u8; 8]) -> Option<[u8; 16]> {
        if let Some(key) = self.enc_key {
            let mut ltk = key;
            ltk.reverse();
            return Some(ltk);
        }
        let bond = self
            .bond_store
            .find(&hex::encode(self.remote_addr))
            .ok()
            .flatten()?;
        if bond.ediv != ediv || bond.rand != *rand {
            return None;
        }
        // Bonds keep the LTK in wire order already.
        Some(bond.ltk)
    }

    /// Whether the pairing that produced the current key was MITM
    /// protected.
    pub fn authenticated(&self) -> bool {
        self.bond.as_ref().map(|b| b.authenticated).unwrap_or(false)
    }

    /// Starts link-layer encryption from a stored bond (central role).
    pub fn start_encryption(&self) -> SmpResult<()> {
        let bond = self
            .bond_store
            .find(&hex::encode(self.remote_addr))?
            .ok_or(SmpError::NoBond)?;
        self.run_encrypt(&bond)
    }

    /// Removes the bond for this peer.
    pub fn delete_bond(&self) -> SmpResult<()> {
        self.bond_store.delete(&hex::encode(self.remote_addr))
    }

    /// Called when the controller reports an encryption change.
    pub fn on_encryption_changed(&mut self, enabled: bool) {
        if !enabled {
            return;
        }
        debug!("link encrypted, pairing state {:?}", self.state);
        let legacy_bonding = self
            .ctx
            .as_deref()
            .map(|ctx| ctx.legacy && self.bonding_agreed(ctx))
            .unwrap_or(false);
        if legacy_bonding && self.state == PairingState::Finished && self.role == Role::Peripheral {
            if let Err(err) = self.distribute_legacy_keys() {
                warn!("legacy key distribution failed: {err}");
            }
        }
    }

    /// Dispatches one inbound SMP PDU.
    pub fn handle(&mut self, payload: &[u8]) -> SmpResult<()> {
        if payload.is_empty() {
            return Err(SmpError::InvalidPdu);
        }
        let code = payload[0];
        let data = &payload[1..];
        let result = match code {
            PAIRING_REQUEST => self.on_pairing_request(data),
            PAIRING_RESPONSE => self.on_pairing_response(data),
            PAIRING_CONFIRM => self.with_ctx(data, 16, Self::on_confirm),
            PAIRING_RANDOM => self.with_ctx(data, 16, Self::on_random),
            PAIRING_PUBLIC_KEY => self.with_ctx(data, 64, Self::on_public_key),
            PAIRING_DHKEY_CHECK => self.with_ctx(data, 16, Self::on_dhkey_check),
            PAIRING_FAILED => {
                let reason = data.first().copied().unwrap_or(REASON_UNSPECIFIED);
                self.state = PairingState::Error;
                self.signal(Err(SmpError::PairingFailed(reason)));
                Ok(())
            }
            ENCRYPTION_INFORMATION => self.on_encryption_information(data),
            CENTRAL_IDENTIFICATION => self.on_central_identification(data),
            IDENTITY_INFORMATION => self.on_identity_information(data),
            IDENTITY_ADDRESS_INFORMATION => self.on_identity_address(data),
            SIGNING_INFORMATION => self.on_signing_information(data),
            SECURITY_REQUEST => self.on_security_request(data),
            KEYPRESS_NOTIFICATION => Ok(()),
            other => {
                warn!("unhandled SMP code 0x{other:02x}");
                self.send(&[PAIRING_FAILED, REASON_PAIRING_NOT_SUPPORTED])
            }
        };

        if let Err(err) = &result {
            self.state = PairingState::Error;
            self.signal(Err(err.clone()));
        } else if self.state == PairingState::Finished {
            self.signal(Ok(()));
        }
        result
    }

    /// Takes the context out of `self` for the duration of a handler so
    /// the handler can borrow both freely, enforcing the expected payload
    /// length on the way in.
    fn with_ctx(
        &mut self,
        data: &[u8],
        expected_len: usize,
        f: fn(&mut Self, &mut PairingContext, &[u8]) -> SmpResult<()>,
    ) -> SmpResult<()> {
        if data.len() != expected_len {
            return Err(self.fail(REASON_INVALID_PARAMETERS));
        }
        let mut ctx = match self.ctx.take() {
            Some(ctx) => ctx,
            None => return Err(self.fail(REASON_UNSPECIFIED)),
        };
        let result = f(self, &mut ctx, data);
        self.ctx = Some(ctx);
        result
    }

    // ---- outbound plumbing ----

    fn send(&self, pdu: &[u8]) -> SmpResult<()> {
        match &self.write_pdu {
            Some(write) => write(pdu),
            None => Err(SmpError::Io("no SMP transport attached".into())),
        }
    }

    fn run_encrypt(&self, bond: &BondInfo) -> SmpResult<()> {
        match &self.encrypt {
            Some(encrypt) => encrypt(bond),
            None => Err(SmpError::Io("no encryption hook attached".into())),
        }
    }

    fn signal(&mut self, result: SmpResult<()>) {
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.try_send(result);
        }
    }

    /// Sends Pairing Failed and produces the matching error.
    fn fail(&self, reason: u8) -> SmpError {
        let _ = self.send(&[PAIRING_FAILED, reason]);
        SmpError::PairingFailed(reason)
    }

    fn request_pdu(&self, opcode: u8) -> [u8; 7] {
        let oob = if self.config.oob_present || self.auth_data.oob_data.is_some() {
            OOB_PRESENT
        } else {
            OOB_NOT_PRESENT
        };
        [
            opcode,
            self.config.io_capability.to_u8(),
            oob,
            self.config.auth_req.to_u8(),
            self.config.max_key_size,
            self.config.initiator_key_dist,
            self.config.responder_key_dist,
        ]
    }

    fn bonding_agreed(&self, ctx: &PairingContext) -> bool {
        self.config.auth_req.bonding && ctx.remote_auth.bonding
    }

    fn remote_addr_wire(&self) -> BdAddr {
        let mut a = self.remote_addr;
        a.reverse();
        BdAddr::new(a)
    }

    fn store_key(&self) -> String {
        hex::encode(self.remote_addr)
    }

    // ---- feature exchange ----

    fn on_pairing_request(&mut self, data: &[u8]) -> SmpResult<()> {
        if self.state != PairingState::Init || self.role != Role::Peripheral {
            return Err(self.fail(REASON_UNSPECIFIED));
        }
        if data.len() < 6 {
            return Err(self.fail(REASON_INVALID_PARAMETERS));
        }
        let mut preq = [0u8; 7];
        preq[0] = PAIRING_REQUEST;
        preq[1..].copy_from_slice(&data[..6]);

        let pres = self.request_pdu(PAIRING_RESPONSE);
        self.send(&pres)?;

        let mut ctx = Box::new(PairingContext::new(preq, pres));
        let result = self.begin(&mut ctx);
        self.ctx = Some(ctx);
        result
    }

    fn on_pairing_response(&mut self, data: &[u8]) -> SmpResult<()> {
        if self.state != PairingState::WaitPairingResponse {
            return Err(self.fail(REASON_UNSPECIFIED));
        }
        if data.len() < 6 {
            return Err(self.fail(REASON_INVALID_PARAMETERS));
        }
        let mut ctx = match self.ctx.take() {
            Some(ctx) => ctx,
            None => return Err(self.fail(REASON_UNSPECIFIED)),
        };
        ctx.pres[0] = PAIRING_RESPONSE;
        ctx.pres[1..].copy_from_slice(&data[..6]);

        let result = self.begin(&mut ctx);
        self.ctx = Some(ctx);
        result
    }

    /// Common continuation once both feature PDUs are known.
    fn begin(&mut self, ctx: &mut PairingContext) -> SmpResult<()> {
        // Our own PDU is preq on a central, pres on a peripheral.
        let (local, remote) = match self.role {
            Role::Central => (ctx.preq, ctx.pres),
            Role::Peripheral => (ctx.pres, ctx.preq),
        };
        let remote_io = match IoCapability::from_u8(remote[1]) {
            Some(io) => io,
            None => return Err(self.fail(REASON_INVALID_PARAMETERS)),
        };
        let remote_oob = remote[2] == OOB_PRESENT;
        ctx.remote_auth = AuthReq::from_u8(remote[3]);
        let remote_key_size = remote[4];
        if !(MIN_ENCRYPTION_KEY_SIZE..=MAX_ENCRYPTION_KEY_SIZE).contains(&remote_key_size) {
            return Err(self.fail(REASON_ENCRYPTION_KEY_SIZE));
        }

        let local_auth = AuthReq::from_u8(local[3]);
        let sc = local_auth.secure_connections && ctx.remote_auth.secure_connections;
        let mitm = local_auth.mitm || ctx.remote_auth.mitm;
        let local_oob = local[2] == OOB_PRESENT;

        let (init_io, resp_io, init_oob, resp_oob) = match self.role {
            Role::Central => (self.config.io_capability, remote_io, local_oob, remote_oob),
            Role::Peripheral => (remote_io, self.config.io_capability, remote_oob, local_oob),
        };
        ctx.method = association_model(init_io, resp_io, init_oob, resp_oob, mitm, sc);
        ctx.legacy = !sc;
        info!(
            "pairing features agreed: sc={sc} method={:?} remote_io={remote_io} bonding={}",
            ctx.method,
            self.bonding_agreed(ctx),
        );

        if sc {
            // Public key exchange comes next; the central sends first.
            let keys = KeyPair::generate();
            if self.role == Role::Central {
                self.send(&public_key_pdu(&keys))?;
            }
            ctx.local_keys = Some(keys);
            self.state = PairingState::WaitPublicKey;
            return Ok(());
        }

        // Legacy pairing: derive the TK and run the c1 confirm exchange.
        ctx.tk = self.legacy_tk(ctx)?;
        if self.role == Role::Central {
            ctx.local_rand = crypto::random_128();
            ctx.local_confirm = self.c1_confirm(ctx, &ctx.local_rand);
            self.send(&value_pdu(PAIRING_CONFIRM, &ctx.local_confirm))?;
        }
        self.state = PairingState::WaitConfirm;
        Ok(())
    }

    fn legacy_tk(&mut self, ctx: &mut PairingContext) -> SmpResult<[u8; 16]> {
        let mut tk = [0u8; 16];
        match ctx.method {
            PairingMethod::PasskeyEntry => {
                let passkey = self.resolve_passkey()?;
                ctx.passkey = passkey;
                tk[12..].copy_from_slice(&passkey.to_be_bytes());
            }
            PairingMethod::OutOfBand => match self.auth_data.oob_data {
                Some(oob) => tk = oob,
                None => return Err(self.fail(REASON_OOB_NOT_AVAILABLE)),
            },
            _ => {}
        }
        Ok(tk)
    }

    /// Produces the passkey for passkey entry: from the application when
    /// the local side types it, freshly generated and displayed otherwise.
    fn resolve_passkey(&self) -> SmpResult<u32> {
        if let Some(passkey) = self.auth_data.passkey {
            return Ok(passkey);
        }
        let local_displays = matches!(
            self.config.io_capability,
            IoCapability::DisplayOnly | IoCapability::DisplayYesNo | IoCapability::KeyboardDisplay
        );
        if !local_displays {
            warn!("passkey entry selected but no passkey supplied");
            return Err(self.fail(REASON_PASSKEY_ENTRY_FAILED));
        }
        let passkey = crypto::random_passkey();
        if let Some(custom) = &self.custom {
            let _ = custom
                .decisions
                .send(PairingDecision::DisplayPasskey(passkey));
        } else {
            info!("display passkey: {passkey:06}");
        }
        Ok(passkey)
    }

    fn c1_confirm(&self, ctx: &PairingContext, rand: &[u8; 16]) -> [u8; 16] {
        let (iat, rat, ia, ra) = match self.role {
            Role::Central => (
                self.local_addr_type,
                self.remote_addr_type,
                self.local_addr,
                self.remote_addr,
            ),
            Role::Peripheral => (
                self.remote_addr_type,
                self.local_addr_type,
                self.remote_addr,
                self.local_addr,
            ),
        };
        crypto::c1(&ctx.tk, rand, &ctx.preq, &ctx.pres, iat, rat, &ia, &ra)
    }

    // ---- LESC public key exchange ----

    fn on_public_key(&mut self, ctx: &mut PairingContext, data: &[u8]) -> SmpResult<()> {
        if self.state != PairingState::WaitPublicKey {
            return Err(self.fail(REASON_UNSPECIFIED));
        }
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&data[..32]);
        y.copy_from_slice(&data[32..]);
        x.reverse();
        y.reverse();
        ctx.remote_pk = Some((x, y));

        let keys = match &ctx.local_keys {
            Some(keys) => keys,
            None => return Err(self.fail(REASON_UNSPECIFIED)),
        };
        let local_x = keys.public_x;
        let local_pk_pdu = public_key_pdu(keys);
        ctx.dh_key = match keys.dh_key(&x, &y) {
            Some(dh) => Some(dh),
            None => return Err(self.fail(REASON_INVALID_PARAMETERS)),
        };

        if self.role == Role::Peripheral {
            self.send(&local_pk_pdu)?;
            match ctx.method {
                PairingMethod::PasskeyEntry => {
                    // The central confirms first, one round per bit.
                    ctx.passkey = self.resolve_passkey()?;
                    self.state = PairingState::WaitConfirm;
                }
                PairingMethod::OutOfBand => {
                    ctx.local_rand = crypto::random_128();
                    self.state = PairingState::WaitRandom;
                }
                _ => {
                    // Just Works / Numeric: Cb = f4(PKbx, PKax, Nb, 0).
                    ctx.local_rand = crypto::random_128();
                    let confirm = crypto::f4(&local_x, &x, &ctx.local_rand, 0x00);
                    ctx.local_confirm = confirm;
                    self.send(&value_pdu(PAIRING_CONFIRM, &confirm))?;
                    self.state = PairingState::WaitRandom;
                }
            }
            return Ok(());
        }

        // Central.
        match ctx.method {
            PairingMethod::PasskeyEntry => {
                ctx.passkey = self.resolve_passkey()?;
                self.passkey_round_start(ctx)?;
            }
            PairingMethod::OutOfBand => {
                ctx.local_rand = crypto::random_128();
                self.send(&value_pdu(PAIRING_RANDOM, &ctx.local_rand))?;
                self.state = PairingState::WaitRandom;
            }
            _ => {
                // Na is revealed once the responder's confirm arrives.
                ctx.local_rand = crypto::random_128();
                self.state = PairingState::WaitConfirm;
            }
        }
        Ok(())
    }

    /// Central side of one passkey round: send Cai = f4(PKax, PKbx, Nai, z).
    fn passkey_round_start(&mut self, ctx: &mut PairingContext) -> SmpResult<()> {
        ctx.local_rand = crypto::random_128();
        let z = ctx.passkey_z();
        let keys = ctx.local_keys.as_ref().ok_or(SmpError::InvalidPdu)?;
        let (rx, _) = ctx.remote_pk.ok_or(SmpError::InvalidPdu)?;
        let confirm = crypto::f4(&keys.public_x, &rx, &ctx.local_rand, z);
        ctx.local_confirm = confirm;
        self.send(&value_pdu(PAIRING_CONFIRM, &confirm))?;
        self.state = PairingState::WaitConfirm;
        Ok(())
    }

    // ---- confirm / random exchange ----

    fn on_confirm(&mut self, ctx: &mut PairingContext, data: &[u8]) -> SmpResult<()> {
        if self.state != PairingState::WaitConfirm {
            return Err(self.fail(REASON_UNSPECIFIED));
        }
        let mut confirm = [0u8; 16];
        confirm.copy_from_slice(data);
        confirm.reverse();
        ctx.remote_confirm = confirm;

        match self.role {
            // Our turn to reveal the random. Covers legacy (Mrand), LESC
            // Just Works / Numeric (Na), and LESC passkey rounds (Nai).
            Role::Central => {
                self.send(&value_pdu(PAIRING_RANDOM, &ctx.local_rand))?;
                self.state = PairingState::WaitRandom;
            }
            Role::Peripheral => {
                if ctx.legacy {
                    // Reply with Sconfirm.
                    ctx.local_rand = crypto::random_128();
                    ctx.local_confirm = self.c1_confirm(ctx, &ctx.local_rand);
                    self.send(&value_pdu(PAIRING_CONFIRM, &ctx.local_confirm))?;
                    self.state = PairingState::WaitRandom;
                } else if ctx.method == PairingMethod::PasskeyEntry {
                    // Passkey round: reply with Cbi.
                    ctx.local_rand = crypto::random_128();
                    let z = ctx.passkey_z();
                    let keys = ctx.local_keys.as_ref().ok_or(SmpError::InvalidPdu)?;
                    let (rx, _) = ctx.remote_pk.ok_or(SmpError::InvalidPdu)?;
                    let confirm = crypto::f4(&keys.public_x, &rx, &ctx.local_rand, z);
                    ctx.local_confirm = confirm;
                    self.send(&value_pdu(PAIRING_CONFIRM, &confirm))?;
                    self.state = PairingState::WaitRandom;
                } else {
                    // JW/NC peripheral already confirmed; a confirm here is
                    // out of sequence.
                    return Err(self.fail(REASON_UNSPECIFIED));
                }
            }
        }
        Ok(())
    }

    fn on_random(&mut self, ctx: &mut PairingContext, data: &[u8]) -> SmpResult<()> {
        if self.state != PairingState::WaitRandom {
            return Err(self.fail(REASON_UNSPECIFIED));
        }
        let mut rand = [0u8; 16];
        rand.copy_from_slice(data);
        rand.reverse();
        ctx.remote_rand = rand;

        if ctx.legacy {
            return self.legacy_on_random(ctx);
        }
        match ctx.method {
            PairingMethod::PasskeyEntry => self.lesc_passkey_on_random(ctx),
            _ => self.lesc_on_random(ctx),
        }
    }

    fn legacy_on_random(&mut self, ctx: &mut PairingContext) -> SmpResult<()> {
        // Verify the peer's confirm against the revealed random.
        if self.c1_confirm(ctx, &ctx.remote_rand) != ctx.remote_confirm {
            return Err(self.fail(REASON_CONFIRM_VALUE_FAILED));
        }

        match self.role {
            Role::Central => {
                // STK = s1(TK, Srand, Mrand); encryption starts right away.
                let stk = crypto::s1(&ctx.tk, &ctx.remote_rand, &ctx.local_rand);
                self.enc_key = Some(stk);
                self.state = PairingState::Finished;

                let mut stk_wire = stk;
                stk_wire.reverse();
                let transient = BondInfo {
                    identity_addr: self.remote_addr_wire(),
                    identity_addr_type: AddrType::from(self.remote_addr_type),
                    ltk: stk_wire,
                    ediv: 0,
                    rand: [0; 8],
                    irk: None,
                    csrk: None,
                    secure_connections: false,
                    authenticated: ctx.method != PairingMethod::JustWorks,
                };
                self.run_encrypt(&transient)?;
            }
            Role::Peripheral => {
                self.send(&value_pdu(PAIRING_RANDOM, &ctx.local_rand))?;
                let stk = crypto::s1(&ctx.tk, &ctx.local_rand, &ctx.remote_rand);
                self.enc_key = Some(stk);
                self.state = PairingState::Finished;
            }
        }
        Ok(())
    }

    fn lesc_on_random(&mut self, ctx: &mut PairingContext) -> SmpResult<()> {
        match self.role {
            Role::Central => {
                // Verify Cb = f4(PKbx, PKax, Nb, 0).
                if ctx.method != PairingMethod::OutOfBand {
                    let keys = ctx.local_keys.as_ref().ok_or(SmpError::InvalidPdu)?;
                    let (rx, _) = ctx.remote_pk.ok_or(SmpError::InvalidPdu)?;
                    let expected = crypto::f4(&rx, &keys.public_x, &ctx.remote_rand, 0x00);
                    if expected != ctx.remote_confirm {
                        return Err(self.fail(REASON_CONFIRM_VALUE_FAILED));
                    }
                }
            }
            Role::Peripheral => {
                // Reveal Nb now that Na arrived.
                self.send(&value_pdu(PAIRING_RANDOM, &ctx.local_rand))?;
            }
        }

        if ctx.method == PairingMethod::NumericComparison {
            let keys = ctx.local_keys.as_ref().ok_or(SmpError::InvalidPdu)?;
            let (rx, _) = ctx.remote_pk.ok_or(SmpError::InvalidPdu)?;
            let value = match self.role {
                Role::Central => crypto::g2(&keys.public_x, &rx, &ctx.local_rand, &ctx.remote_rand),
                Role::Peripheral => {
                    crypto::g2(&rx, &keys.public_x, &ctx.remote_rand, &ctx.local_rand)
                }
            };
            self.confirm_with_user(PairingDecision::NumericComparison(value))?;
        }

        self.derive_lesc_keys(ctx)?;

        if self.role == Role::Central {
            let ea = self.check_value(ctx, true)?;
            self.send(&value_pdu(PAIRING_DHKEY_CHECK, &ea))?;
        }
        self.state = PairingState::WaitDhKeyCheck;
        Ok(())
    }

    fn lesc_passkey_on_random(&mut self, ctx: &mut PairingContext) -> SmpResult<()> {
        // Verify the peer's round confirm.
        let keys = ctx.local_keys.as_ref().ok_or(SmpError::InvalidPdu)?;
        let (rx, _) = ctx.remote_pk.ok_or(SmpError::InvalidPdu)?;
        let z = ctx.passkey_z();
        let expected = crypto::f4(&rx, &keys.public_x, &ctx.remote_rand, z);
        if expected != ctx.remote_confirm {
            return Err(self.fail(REASON_CONFIRM_VALUE_FAILED));
        }

        if self.role == Role::Peripheral {
            self.send(&value_pdu(PAIRING_RANDOM, &ctx.local_rand))?;
        }

        ctx.round += 1;
        if ctx.round < PASSKEY_ROUNDS {
            match self.role {
                Role::Central => self.passkey_round_start(ctx)?,
                Role::Peripheral => self.state = PairingState::WaitConfirm,
            }
            return Ok(());
        }

        self.derive_lesc_keys(ctx)?;
        if self.role == Role::Central {
            let ea = self.check_value(ctx, true)?;
            self.send(&value_pdu(PAIRING_DHKEY_CHECK, &ea))?;
        }
        self.state = PairingState::WaitDhKeyCheck;
        Ok(())
    }

    /// Runs f5 over the agreed DHKey and final nonces.
    fn derive_lesc_keys(&self, ctx: &mut PairingContext) -> SmpResult<()> {
        let dh = ctx.dh_key.ok_or(SmpError::InvalidPdu)?;
        let local_a7 = crypto::addr7(self.local_addr_type, &self.local_addr);
        let remote_a7 = crypto::addr7(self.remote_addr_type, &self.remote_addr);
        // f5 takes the initiator's nonce and address first.
        let (n1, n2, a1, a2) = match self.role {
            Role::Central => (ctx.local_rand, ctx.remote_rand, local_a7, remote_a7),
            Role::Peripheral => (ctx.remote_rand, ctx.local_rand, remote_a7, local_a7),
        };
        let (mac_key, ltk) = crypto::f5(&dh, &n1, &n2, &a1, &a2);
        ctx.mac_key = Some(mac_key);
        ctx.ltk = Some(ltk);
        Ok(())
    }

    /// f6 check value: ours when `local` is true, the expected peer value
    /// otherwise.
    fn check_value(&self, ctx: &PairingContext, local: bool) -> SmpResult<[u8; 16]> {
        let mac_key = ctx.mac_key.ok_or(SmpError::InvalidPdu)?;
        let r = ctx.r_value(self.auth_data.oob_data);

        let local_a7 = crypto::addr7(self.local_addr_type, &self.local_addr);
        let remote_a7 = crypto::addr7(self.remote_addr_type, &self.remote_addr);
        // IOcap comes from the PDUs as exchanged, so both sides agree even
        // when configuration and wire diverge.
        let (local_pdu, remote_pdu) = match self.role {
            Role::Central => (&ctx.preq, &ctx.pres),
            Role::Peripheral => (&ctx.pres, &ctx.preq),
        };
        let local_io = crypto::io_cap3(local_pdu[3], local_pdu[2], local_pdu[1]);
        let remote_io = crypto::io_cap3(remote_pdu[3], remote_pdu[2], remote_pdu[1]);

        let value = if local {
            crypto::f6(
                &mac_key,
                &ctx.local_rand,
                &ctx.remote_rand,
                &r,
                &local_io,
                &local_a7,
                &remote_a7,
            )
        } else {
            crypto::f6(
                &mac_key,
                &ctx.remote_rand,
                &ctx.local_rand,
                &r,
                &remote_io,
                &remote_a7,
                &local_a7,
            )
        };
        Ok(value)
    }

    // ---- DHKey check ----

    fn on_dhkey_check(&mut self, ctx: &mut PairingContext, data: &[u8]) -> SmpResult<()> {
        if self.state != PairingState::WaitDhKeyCheck {
            return Err(self.fail(REASON_UNSPECIFIED));
        }
        let mut check = [0u8; 16];
        check.copy_from_slice(data);
        check.reverse();

        if self.check_value(ctx, false)? != check {
            return Err(self.fail(REASON_DHKEY_CHECK_FAILED));
        }

        if self.role == Role::Peripheral {
            let eb = self.check_value(ctx, true)?;
            self.send(&value_pdu(PAIRING_DHKEY_CHECK, &eb))?;
        }

        self.finish_lesc(ctx)
    }

    fn finish_lesc(&mut self, ctx: &mut PairingContext) -> SmpResult<()> {
        let ltk = ctx.ltk.ok_or(SmpError::InvalidPdu)?;
        self.enc_key = Some(ltk);
        self.state = PairingState::Finished;

        let mut ltk_wire = ltk;
        ltk_wire.reverse();
        let bond = BondInfo {
            identity_addr: self.remote_addr_wire(),
            identity_addr_type: AddrType::from(self.remote_addr_type),
            ltk: ltk_wire,
            ediv: 0,
            rand: [0; 8],
            irk: None,
            csrk: None,
            secure_connections: true,
            authenticated: ctx.method != PairingMethod::JustWorks,
        };
        if self.bonding_agreed(ctx) {
            self.bond_store.save(&self.store_key(), &bond)?;
        }
        self.bond = Some(bond.clone());

        if self.role == Role::Central {
            self.run_encrypt(&bond)?;
        }
        info!("LESC pairing finished");
        Ok(())
    }

    // ---- user interaction ----

    fn confirm_with_user(&self, decision: PairingDecision) -> SmpResult<()> {
        let Some(custom) = &self.custom else {
            debug!("no custom pairing channel, accepting {decision:?}");
            return Ok(());
        };
        if custom.decisions.send(decision).is_err() {
            return Err(self.fail(REASON_UNSPECIFIED));
        }
        let reply = {
            let replies = custom.replies.lock().unwrap();
            replies.recv_timeout(CUSTOM_REPLY_TIMEOUT)
        };
        match reply {
            Ok(true) => Ok(()),
            Ok(false) => Err(self.fail(REASON_NUMERIC_COMPARISON_FAILED)),
            Err(_) => Err(self.fail(REASON_UNSPECIFIED)),
        }
    }

    // ---- key distribution ----

    fn on_encryption_information(&mut self, data: &[u8]) -> SmpResult<()> {
        if data.len() != 16 {
            return Err(SmpError::InvalidPdu);
        }
        let mut ltk = [0u8; 16];
        ltk.copy_from_slice(data);
        self.pending_bond().ltk = ltk;
        Ok(())
    }

    fn on_central_identification(&mut self, data: &[u8]) -> SmpResult<()> {
        if data.len() != 10 {
            return Err(SmpError::InvalidPdu);
        }
        let ediv = u16::from_le_bytes([data[0], data[1]]);
        let mut rand = [0u8; 8];
        rand.copy_from_slice(&data[2..10]);
        {
            let bond = self.pending_bond();
            bond.ediv = ediv;
            bond.rand = rand;
        }
        self.save_pending_bond()
    }

    fn on_identity_information(&mut self, data: &[u8]) -> SmpResult<()> {
        if data.len() != 16 {
            return Err(SmpError::InvalidPdu);
        }
        let mut irk = [0u8; 16];
        irk.copy_from_slice(data);
        self.pending_bond().irk = Some(irk);
        self.save_pending_bond()
    }

    fn on_identity_address(&mut self, data: &[u8]) -> SmpResult<()> {
        if data.len() != 7 {
            return Err(SmpError::InvalidPdu);
        }
        let addr_type = AddrType::from(data[0]);
        let addr = BdAddr::from_slice(&data[1..7]).ok_or(SmpError::InvalidPdu)?;
        {
            let bond = self.pending_bond();
            bond.identity_addr = addr;
            bond.identity_addr_type = addr_type;
        }
        self.save_pending_bond()
    }

    fn on_signing_information(&mut self, data: &[u8]) -> SmpResult<()> {
        if data.len() != 16 {
            return Err(SmpError::InvalidPdu);
        }
        let mut csrk = [0u8; 16];
        csrk.copy_from_slice(data);
        self.pending_bond().csrk = Some(csrk);
        self.save_pending_bond()
    }

    fn on_security_request(&mut self, _data: &[u8]) -> SmpResult<()> {
        if self.role != Role::Central {
            return Err(SmpError::InvalidPdu);
        }
        // Re-encrypt from an existing bond; the application drives fresh
        // pairing.
        match self.start_encryption() {
            Ok(()) => Ok(()),
            Err(SmpError::NoBond) => {
                debug!("security request but no bond stored");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn pending_bond(&mut self) -> &mut BondInfo {
        let remote_addr = self.remote_addr_wire();
        let remote_addr_type = AddrType::from(self.remote_addr_type);
        self.bond.get_or_insert_with(|| BondInfo {
            identity_addr: remote_addr,
            identity_addr_type: remote_addr_type,
            ltk: [0; 16],
            ediv: 0,
            rand: [0; 8],
            irk: None,
            csrk: None,
            secure_connections: false,
            authenticated: false,
        })
    }

    fn save_pending_bond(&mut self) -> SmpResult<()> {
        let bonding = self
            .ctx
            .as_deref()
            .map(|ctx| self.bonding_agreed(ctx))
            .unwrap_or(true);
        if !bonding {
            return Ok(());
        }
        if let Some(bond) = self.bond.clone() {
            self.bond_store.save(&self.store_key(), &bond)?;
        }
        Ok(())
    }

    /// Peripheral-side legacy key distribution after encryption: generate
    /// and hand out an LTK the central can reconnect with.
    fn distribute_legacy_keys(&mut self) -> SmpResult<()> {
        let ltk = crypto::random_128();
        let ediv = (crypto::random_passkey() & 0xFFFF) as u16;
        let mut rand = [0u8; 8];
        rand.copy_from_slice(&crypto::random_128()[..8]);

        let mut pdu = vec![ENCRYPTION_INFORMATION];
        pdu.extend_from_slice(&ltk);
        self.send(&pdu)?;

        let mut pdu = vec![CENTRAL_IDENTIFICATION];
        pdu.extend_from_slice(&ediv.to_le_bytes());
        pdu.extend_from_slice(&rand);
        self.send(&pdu)?;

        let bond = BondInfo {
            identity_addr: self.remote_addr_wire(),
            identity_addr_type: AddrType::from(self.remote_addr_type),
            ltk,
            ediv,
            rand,
            irk: None,
            csrk: None,
            secure_connections: false,
            authenticated: false,
        };
        self.bond_store.save(&self.store_key(), &bond)?;
        self.bond = Some(bond);
        Ok(())
    }
}

fn value_pdu(opcode: u8, value: &[u8; 16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(17);
    pdu.push(opcode);
    let mut wire = *value;
    wire.reverse();
    pdu.extend_from_slice(&wire);
    pdu
}

fn public_key_pdu(keys: &KeyPair) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(65);
    pdu.push(PAIRING_PUBLIC_KEY);
    let mut x = keys.public_x;
    let mut y = keys.public_y;
    x.reverse();
    y.reverse();
    pdu.extend_from_slice(&x);
    pdu.extend_from_slice(&y);
    pdu
}
