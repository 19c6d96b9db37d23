//! Two-sided pairing tests: a central and a peripheral manager exchanging
//! PDUs over in-memory queues.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::gap::{AddrType, BdAddr, Role};

use super::constants::*;
use super::keys::{BondStore, MemoryBondStore};
use super::manager::{PairingState, SecurityManager};
use super::types::{AuthData, AuthReq, IoCapability, SmpConfig, SmpError};

const CENTRAL_ADDR: BdAddr = BdAddr([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
const PERIPHERAL_ADDR: BdAddr = BdAddr([0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6]);

struct PairedRig {
    central: Arc<Mutex<SecurityManager>>,
    peripheral: Arc<Mutex<SecurityManager>>,
    central_store: Arc<MemoryBondStore>,
    peripheral_store: Arc<MemoryBondStore>,
    pumps: Vec<JoinHandle<()>>,
}

fn make_manager(
    config: SmpConfig,
    store: Arc<MemoryBondStore>,
    role: Role,
    out: Sender<Vec<u8>>,
) -> SecurityManager {
    let (local, remote) = match role {
        Role::Central => (CENTRAL_ADDR, PERIPHERAL_ADDR),
        Role::Peripheral => (PERIPHERAL_ADDR, CENTRAL_ADDR),
    };
    let mut manager = SecurityManager::new(
        config,
        store,
        role,
        local,
        AddrType::Public,
        remote,
        AddrType::Public,
    );
    manager.set_write_pdu(Box::new(move |pdu| {
        out.send(pdu.to_vec()).map_err(|_| SmpError::Disconnected)
    }));
    // Encryption start is a controller matter; accept it silently here.
    manager.set_encrypt(Box::new(|_bond| Ok(())));
    manager
}

fn pump(rx: Receiver<Vec<u8>>, manager: Arc<Mutex<SecurityManager>>) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(pdu) = rx.recv() {
            // Errors surface through the result channel; the pump just
            // keeps draining.
            let _ = manager.lock().unwrap().handle(&pdu);
        }
    })
}

fn rig(central_cfg: SmpConfig, peripheral_cfg: SmpConfig) -> PairedRig {
    let (c2p_tx, c2p_rx) = channel();
    let (p2c_tx, p2c_rx) = channel();
    let central_store = Arc::new(MemoryBondStore::new());
    let peripheral_store = Arc::new(MemoryBondStore::new());

    let central = Arc::new(Mutex::new(make_manager(
        central_cfg,
        Arc::clone(&central_store),
        Role::Central,
        c2p_tx,
    )));
    let peripheral = Arc::new(Mutex::new(make_manager(
        peripheral_cfg,
        Arc::clone(&peripheral_store),
        Role::Peripheral,
        p2c_tx,
    )));

    let pumps = vec![
        pump(c2p_rx, Arc::clone(&peripheral)),
        pump(p2c_rx, Arc::clone(&central)),
    ];

    PairedRig {
        central,
        peripheral,
        central_store,
        peripheral_store,
        pumps,
    }
}

fn sc_config(io: IoCapability) -> SmpConfig {
    SmpConfig {
        io_capability: io,
        auth_req: AuthReq {
            bonding: true,
            mitm: false,
            secure_connections: true,
            keypress: false,
        },
        ..SmpConfig::default()
    }
}

fn legacy_config(io: IoCapability) -> SmpConfig {
    SmpConfig {
        io_capability: io,
        auth_req: AuthReq {
            bonding: true,
            mitm: false,
            secure_connections: false,
            keypress: false,
        },
        ..SmpConfig::default()
    }
}

fn run_pairing(rig: &PairedRig) -> Result<(), SmpError> {
    let result_rx = rig
        .central
        .lock()
        .unwrap()
        .pair(AuthData::default())
        .unwrap();
    result_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("pairing result within deadline")
}

#[test]
fn lesc_just_works_derives_equal_ltks() {
    let rig = rig(
        sc_config(IoCapability::NoInputNoOutput),
        sc_config(IoCapability::NoInputNoOutput),
    );
    run_pairing(&rig).unwrap();

    let central_ltk = rig.central.lock().unwrap().derived_key().unwrap();

    // The peripheral finishes after sending its DHKey check; give its pump
    // a moment to settle.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        {
            let peripheral = rig.peripheral.lock().unwrap();
            if peripheral.state() == PairingState::Finished {
                assert_eq!(peripheral.derived_key().unwrap(), central_ltk);
                break;
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "peripheral never finished"
        );
        thread::sleep(Duration::from_millis(10));
    }

    // Both sides persisted exactly one bond, keyed by the peer's identity
    // address.
    assert_eq!(rig.central_store.len(), 1);
    assert_eq!(rig.peripheral_store.len(), 1);
    let bond = rig
        .central_store
        .find(&hex::encode(PERIPHERAL_ADDR.swapped()))
        .unwrap()
        .expect("central bonded to peripheral address");
    assert!(bond.secure_connections);
    assert!(!bond.authenticated);
    assert_eq!(bond.ediv, 0);
    drop(rig.pumps);
}

#[test]
fn lesc_numeric_comparison_without_channel_auto_accepts() {
    let rig = rig(
        SmpConfig {
            io_capability: IoCapability::DisplayYesNo,
            auth_req: AuthReq {
                bonding: true,
                mitm: true,
                secure_connections: true,
                keypress: false,
            },
            ..SmpConfig::default()
        },
        SmpConfig {
            io_capability: IoCapability::KeyboardDisplay,
            auth_req: AuthReq {
                bonding: true,
                mitm: true,
                secure_connections: true,
                keypress: false,
            },
            ..SmpConfig::default()
        },
    );
    run_pairing(&rig).unwrap();

    let bond = rig
        .central_store
        .find(&hex::encode(PERIPHERAL_ADDR.swapped()))
        .unwrap()
        .unwrap();
    assert!(bond.authenticated);
}

#[test]
fn legacy_just_works_derives_equal_stks() {
    let rig = rig(
        legacy_config(IoCapability::NoInputNoOutput),
        legacy_config(IoCapability::NoInputNoOutput),
    );
    run_pairing(&rig).unwrap();

    let central_stk = rig.central.lock().unwrap().derived_key().unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        {
            let peripheral = rig.peripheral.lock().unwrap();
            if peripheral.state() == PairingState::Finished {
                assert_eq!(peripheral.derived_key().unwrap(), central_stk);
                break;
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "peripheral never finished"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn mixed_sc_support_falls_back_to_legacy() {
    // The peripheral clears the Secure Connections bit; the exchange must
    // still complete with an identical STK.
    let rig = rig(
        sc_config(IoCapability::NoInputNoOutput),
        legacy_config(IoCapability::NoInputNoOutput),
    );
    run_pairing(&rig).unwrap();
    let central_stk = rig.central.lock().unwrap().derived_key().unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        {
            let peripheral = rig.peripheral.lock().unwrap();
            if peripheral.derived_key() == Some(central_stk) {
                break;
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "STKs never converged"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn unknown_opcode_answers_pairing_not_supported() {
    let (out_tx, out_rx) = channel();
    let store = Arc::new(MemoryBondStore::new());
    let mut manager = make_manager(
        sc_config(IoCapability::NoInputNoOutput),
        store,
        Role::Peripheral,
        out_tx,
    );
    manager.handle(&[0xEE]).unwrap();
    assert_eq!(
        out_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        vec![PAIRING_FAILED, REASON_PAIRING_NOT_SUPPORTED]
    );
}

#[test]
fn pairing_failed_from_peer_reaches_the_caller() {
    let (out_tx, _out_rx) = channel();
    let store = Arc::new(MemoryBondStore::new());
    let mut manager = make_manager(
        sc_config(IoCapability::NoInputNoOutput),
        store,
        Role::Central,
        out_tx,
    );
    let result_rx = manager.pair(AuthData::default()).unwrap();
    manager
        .handle(&[PAIRING_FAILED, REASON_PAIRING_NOT_SUPPORTED])
        .unwrap();
    assert_eq!(
        result_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        Err(SmpError::PairingFailed(REASON_PAIRING_NOT_SUPPORTED))
    );
    assert_eq!(manager.state(), PairingState::Error);
}

#[test]
fn pair_twice_is_rejected() {
    let (out_tx, _out_rx) = channel();
    let store = Arc::new(MemoryBondStore::new());
    let mut manager = make_manager(
        sc_config(IoCapability::NoInputNoOutput),
        store,
        Role::Central,
        out_tx,
    );
    let _rx = manager.pair(AuthData::default()).unwrap();
    assert_eq!(
        manager.pair(AuthData::default()).unwrap_err(),
        SmpError::AlreadyInProgress
    );
}

#[test]
fn responder_rejects_bad_key_size() {
    let (out_tx, out_rx) = channel();
    let store = Arc::new(MemoryBondStore::new());
    let mut manager = make_manager(
        sc_config(IoCapability::NoInputNoOutput),
        store,
        Role::Peripheral,
        out_tx,
    );
    // Pairing Request advertising a 3-byte key.
    let request = [
        PAIRING_REQUEST,
        IO_CAP_NO_INPUT_NO_OUTPUT,
        OOB_NOT_PRESENT,
        AUTH_REQ_BONDING | AUTH_REQ_SC,
        0x03,
        KEY_DIST_ENC_KEY,
        KEY_DIST_ENC_KEY,
    ];
    let err = manager.handle(&request[..]).unwrap_err();
    assert_eq!(err, SmpError::PairingFailed(REASON_ENCRYPTION_KEY_SIZE));
    // The response went out first, then the failure.
    let first = out_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(first[0], PAIRING_RESPONSE);
    let second = out_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(second, vec![PAIRING_FAILED, REASON_ENCRYPTION_KEY_SIZE]);
}
