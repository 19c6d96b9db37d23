//! HCI core tests over a mock transport.

use std::io;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::gap::{AddrType, BdAddr};
use crate::smp::{MemoryBondStore, SmpConfig};

use super::constants::*;
use super::core::Hci;
use super::packet::*;
use super::transport::Transport;
use super::HciError;

struct MockTransport {
    inbound: Mutex<Receiver<Vec<u8>>>,
    outbound: Sender<Vec<u8>>,
}

impl Transport for MockTransport {
    fn read_packet(&self) -> io::Result<Vec<u8>> {
        self.inbound
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "mock closed"))
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock closed"))
    }

    fn close(&self) {}
}

struct Harness {
    hci: Hci,
    feed: Sender<Vec<u8>>,
    out: Arc<Mutex<Receiver<Vec<u8>>>>,
}

fn harness() -> Harness {
    let (feed_tx, feed_rx) = channel();
    let (out_tx, out_rx) = channel();
    let transport = Box::new(MockTransport {
        inbound: Mutex::new(feed_rx),
        outbound: out_tx,
    });
    let hci = Hci::new(
        transport,
        SmpConfig::default(),
        Arc::new(MemoryBondStore::new()),
    );
    Harness {
        hci,
        feed: feed_tx,
        out: Arc::new(Mutex::new(out_rx)),
    }
}

fn event_packet(code: u8, params: &[u8]) -> Vec<u8> {
    let mut packet = vec![HCI_EVENT_PKT, code, params.len() as u8];
    packet.extend_from_slice(params);
    packet
}

fn command_complete(opcode: u16, status: u8, ret: &[u8]) -> Vec<u8> {
    let mut params = vec![1u8];
    params.extend_from_slice(&opcode.to_le_bytes());
    params.push(status);
    params.extend_from_slice(ret);
    event_packet(EVT_COMMAND_COMPLETE, &params)
}

/// Answers each outbound command with a successful Command Complete.
fn auto_responder(harness: &Harness) -> thread::JoinHandle<()> {
    let out = Arc::clone(&harness.out);
    let feed = harness.feed.clone();
    thread::spawn(move || {
        eprintln!("DEBUG: auto_responder started");
        while let Ok(packet) = out.lock().unwrap().recv() {
            eprintln!("DEBUG: auto_responder got packet {packet:?}");
            if packet.first() != Some(&HCI_COMMAND_PKT) || packet.len() < 3 {
                continue;
            }
            let opcode = u16::from_le_bytes([packet[1], packet[2]]);
            eprintln!("DEBUG: auto_responder sending command_complete for {opcode:x}");
            if feed.send(command_complete(opcode, 0x00, &[])).is_err() {
                return;
            }
        }
        eprintln!("DEBUG: auto_responder loop exited");
    })
}

fn le_connection_complete(handle: u16, role: u8, peer: BdAddr) -> Vec<u8> {
    let mut params = vec![EVT_LE_CONNECTION_COMPLETE, 0x00];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(role);
    params.push(0x00); // public peer address
    params.extend_from_slice(peer.as_slice());
    params.extend_from_slice(&0x0010u16.to_le_bytes());
    params.extend_from_slice(&0x0000u16.to_le_bytes());
    params.extend_from_slice(&0x00C8u16.to_le_bytes());
    params.push(0x00);
    event_packet(EVT_LE_META, &params)
}

#[test]
fn command_completes_with_return_parameters() {
    let h = harness();
    let responder = {
        let out = Arc::clone(&h.out);
        let feed = h.feed.clone();
        thread::spawn(move || {
            let packet = out.lock().unwrap().recv().unwrap();
            assert_eq!(packet[0], HCI_COMMAND_PKT);
            let opcode = u16::from_le_bytes([packet[1], packet[2]]);
            assert_eq!(opcode, super::constants::opcode(OGF_HOST_CTL, OCF_RESET));
            feed.send(command_complete(opcode, 0x00, &[0xAB])).unwrap();
        })
    };

    let ret = h.hci.send_command(&HciCommand::Reset).unwrap();
    assert_eq!(ret, vec![0xAB]);
    responder.join().unwrap();
}

#[test]
fn failed_status_becomes_an_error() {
    let h = harness();
    {
        let out = Arc::clone(&h.out);
        let feed = h.feed.clone();
        thread::spawn(move || {
            let packet = out.lock().unwrap().recv().unwrap();
            let opcode = u16::from_le_bytes([packet[1], packet[2]]);
            feed.send(command_complete(opcode, 0x0C, &[])).unwrap();
        });
    }

    match h.hci.send_command(&HciCommand::Reset) {
        Err(HciError::CommandFailed { status: 0x0C, .. }) => {}
        other => panic!("expected CommandFailed, got {other:?}"),
    }
}

#[test]
fn command_timeout_leaves_the_hci_usable() {
    let h = harness();

    // Nothing answers: the command must time out after ~2 s.
    match h.hci.send_command(&HciCommand::Reset) {
        Err(HciError::CommandTimeout { .. }) => {}
        other => panic!("expected CommandTimeout, got {other:?}"),
    }

    // A later command with a live responder still works.
    let responder = auto_responder(&h);
    eprintln!("DEBUG: calling send_command #2");
    h.hci.send_command(&HciCommand::Reset).unwrap();
    eprintln!("DEBUG: send_command #2 returned ok, dropping h");
    drop(h);
    eprintln!("DEBUG: h dropped, joining responder");
    let _ = responder.join();
    eprintln!("DEBUG: responder joined");
}

#[test]
fn inbound_connection_is_accepted() {
    let h = harness();
    let peer = BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    h.feed
        .send(le_connection_complete(0x0040, 0x01, peer))
        .unwrap();

    let conn = h.hci.accept().unwrap();
    assert_eq!(conn.handle(), 0x0040);
    assert_eq!(conn.peer_addr(), peer);
    assert_eq!(conn.role(), crate::gap::Role::Peripheral);
}

#[test]
fn dial_returns_the_central_connection() {
    let h = harness();
    let peer = BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    {
        let out = Arc::clone(&h.out);
        let feed = h.feed.clone();
        thread::spawn(move || {
            // Answer LE Create Connection with Command Status, then the
            // connection complete meta event.
            let packet = out.lock().unwrap().recv().unwrap();
            let opcode = u16::from_le_bytes([packet[1], packet[2]]);
            let mut params = vec![0x00, 1];
            params.extend_from_slice(&opcode.to_le_bytes());
            feed.send(event_packet(EVT_COMMAND_STATUS, &params)).unwrap();
            feed.send(le_connection_complete(0x0041, 0x00, peer)).unwrap();
        });
    }

    let conn = h
        .hci
        .dial(peer, AddrType::Public, Duration::from_secs(2))
        .unwrap();
    assert_eq!(conn.handle(), 0x0041);
    assert_eq!(conn.role(), crate::gap::Role::Central);
}

#[test]
fn acl_fragments_are_reassembled_and_routed() {
    let h = harness();
    let peer = BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    h.feed
        .send(le_connection_complete(0x0040, 0x01, peer))
        .unwrap();
    let conn = h.hci.accept().unwrap();

    // An ATT payload of 5 bytes split across two ACL fragments.
    let payload = [0x1B, 0x12, 0x00, 0xAA, 0xBB];
    let mut l2cap = Vec::new();
    l2cap.extend_from_slice(&5u16.to_le_bytes());
    l2cap.extend_from_slice(&0x0004u16.to_le_bytes());
    l2cap.extend_from_slice(&payload);

    let first = AclData {
        handle: 0x0040,
        pb_flag: ACL_PB_FIRST,
        data: l2cap[..6].to_vec(),
    };
    let rest = AclData {
        handle: 0x0040,
        pb_flag: ACL_PB_CONTINUATION,
        data: l2cap[6..].to_vec(),
    };
    h.feed.send(first.to_packet()).unwrap();
    h.feed.send(rest.to_packet()).unwrap();

    assert_eq!(conn.read_att().unwrap(), payload.to_vec());
}

#[test]
fn unknown_cid_is_dropped() {
    let h = harness();
    let peer = BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    h.feed
        .send(le_connection_complete(0x0040, 0x01, peer))
        .unwrap();
    let conn = h.hci.accept().unwrap();

    // CID 0x0005 is not a recognized fixed channel.
    let mut l2cap = Vec::new();
    l2cap.extend_from_slice(&1u16.to_le_bytes());
    l2cap.extend_from_slice(&0x0005u16.to_le_bytes());
    l2cap.push(0xFF);
    let acl = AclData {
        handle: 0x0040,
        pb_flag: ACL_PB_FIRST,
        data: l2cap,
    };
    h.feed.send(acl.to_packet()).unwrap();

    // Now a valid ATT frame; the bogus one must not have reached us.
    let mut good = Vec::new();
    good.extend_from_slice(&1u16.to_le_bytes());
    good.extend_from_slice(&0x0004u16.to_le_bytes());
    good.push(0x0B);
    let acl = AclData {
        handle: 0x0040,
        pb_flag: ACL_PB_FIRST,
        data: good,
    };
    h.feed.send(acl.to_packet()).unwrap();

    assert_eq!(conn.read_att().unwrap(), vec![0x0B]);
}

#[test]
fn disconnection_complete_closes_the_connection() {
    let h = harness();
    let peer = BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    h.feed
        .send(le_connection_complete(0x0040, 0x01, peer))
        .unwrap();
    let conn = h.hci.accept().unwrap();

    let mut params = vec![0x00];
    params.extend_from_slice(&0x0040u16.to_le_bytes());
    params.push(0x13);
    h.feed
        .send(event_packet(EVT_DISCONNECTION_COMPLETE, &params))
        .unwrap();

    assert!(matches!(conn.read_att(), Err(HciError::Disconnected)));
    assert!(conn.is_disconnected());
}

#[test]
fn transport_eof_closes_accept() {
    let h = harness();
    drop(h.feed);
    assert!(matches!(h.hci.accept(), Err(HciError::Closed)));
}

#[test]
fn advertising_report_reaches_the_handler() {
    let h = harness();
    let (seen_tx, seen_rx) = channel();
    h.hci.set_adv_handler(Arc::new(move |adv| {
        seen_tx.send(adv).unwrap();
    }));

    // One report: connectable, public address, flags + name records.
    let mut data = vec![0x02, 0x01, 0x06];
    data.extend_from_slice(&[0x05, 0x09, b't', b'e', b's', b't']);
    let mut params = vec![EVT_LE_ADVERTISING_REPORT, 0x01, 0x00, 0x00];
    params.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    params.push(data.len() as u8);
    params.extend_from_slice(&data);
    params.push(0xC8u8); // RSSI -56
    h.feed.send(event_packet(EVT_LE_META, &params)).unwrap();

    let adv = seen_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(adv.local_name.as_deref(), Some("test"));
    assert_eq!(adv.flags, Some(0x06));
    assert_eq!(adv.rssi, -56);
    assert!(adv.connectable());
}

#[test]
fn hci_command_wire_layout() {
    let packet = HciCommand::LeSetScanEnable {
        enable: true,
        filter_duplicates: true,
    }
    .to_packet();
    // opcode 0x200C, two parameter bytes.
    assert_eq!(packet, vec![0x01, 0x0C, 0x20, 0x02, 0x01, 0x01]);

    let packet = HciCommand::Reset.to_packet();
    assert_eq!(packet, vec![0x01, 0x03, 0x0C, 0x00]);
}

#[test]
fn adv_data_commands_pad_to_32_bytes() {
    let packet = HciCommand::LeSetAdvertisingData {
        data: vec![0x02, 0x01, 0x06],
    }
    .to_packet();
    // indicator + opcode(2) + len(1) + 32 parameter bytes.
    assert_eq!(packet.len(), 36);
    assert_eq!(packet[4], 3); // significant length
    assert_eq!(&packet[5..8], &[0x02, 0x01, 0x06]);
    assert!(packet[8..].iter().all(|b| *b == 0));
}
