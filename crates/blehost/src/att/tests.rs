//! Bearer-level tests over in-memory channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::att::bearer::{AttChannel, Bearer, Notification};
use crate::att::constants::*;
use crate::att::error::{code, AttError, AttResult};
use crate::gatt::db::LinkSecurity;

/// An ATT channel over a pair of in-memory pipes.
pub(crate) struct TestChannel {
    inbound: Mutex<Receiver<Vec<u8>>>,
    outbound: Sender<Vec<u8>>,
    rx_mtu: AtomicUsize,
    tx_mtu: AtomicUsize,
    cccds: Mutex<HashMap<u16, u16>>,
}

impl TestChannel {
    pub(crate) fn new(inbound: Receiver<Vec<u8>>, outbound: Sender<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(inbound),
            outbound,
            rx_mtu: AtomicUsize::new(DEFAULT_MTU),
            tx_mtu: AtomicUsize::new(DEFAULT_MTU),
            cccds: Mutex::new(HashMap::new()),
        })
    }

    /// Two channels wired back to back, as the two ends of one connection.
    pub(crate) fn linked_pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = channel();
        let (b_tx, a_rx) = channel();
        (Self::new(a_rx, a_tx), Self::new(b_rx, b_tx))
    }

    pub(crate) fn cccd(&self, handle: u16) -> u16 {
        *self.cccds.lock().unwrap().get(&handle).unwrap_or(&0)
    }
}

impl AttChannel for TestChannel {
    fn read(&self) -> AttResult<Vec<u8>> {
        self.inbound
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| AttError::Disconnected)
    }

    fn write(&self, payload: &[u8]) -> AttResult<()> {
        self.outbound
            .send(payload.to_vec())
            .map_err(|_| AttError::Disconnected)
    }

    fn rx_mtu(&self) -> usize {
        self.rx_mtu.load(Ordering::Relaxed)
    }

    fn set_rx_mtu(&self, mtu: usize) {
        self.rx_mtu.store(mtu, Ordering::Relaxed);
    }

    fn tx_mtu(&self) -> usize {
        self.tx_mtu.load(Ordering::Relaxed)
    }

    fn set_tx_mtu(&self, mtu: usize) {
        self.tx_mtu.store(mtu, Ordering::Relaxed);
    }

    fn cccd_value(&self, handle: u16) -> u16 {
        self.cccd(handle)
    }

    fn set_cccd_value(&self, handle: u16, value: u16) {
        self.cccds.lock().unwrap().insert(handle, value);
    }

    fn link_security(&self) -> LinkSecurity {
        LinkSecurity::Plain
    }
}

/// A bearer whose peer is the test itself, driven through raw pipes.
fn manual_bearer() -> (Arc<Bearer>, Sender<Vec<u8>>, Receiver<Vec<u8>>) {
    let (feed_tx, feed_rx) = channel();
    let (out_tx, out_rx) = channel();
    let chan = TestChannel::new(feed_rx, out_tx);
    let bearer = Bearer::spawn(chan, None, None);
    (bearer, feed_tx, out_rx)
}

#[test]
fn read_round_trip() {
    let (bearer, feed, out) = manual_bearer();

    let done = std::thread::spawn(move || {
        let req = out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(req, vec![READ_REQ, 0x12, 0x00]);
        feed.send(vec![READ_RSP, 0xAA, 0xBB]).unwrap();
    });

    let value = bearer.read(0x0012).unwrap();
    assert_eq!(value, vec![0xAA, 0xBB]);
    done.join().unwrap();
}

#[test]
fn error_response_surfaces_att_code() {
    let (bearer, feed, out) = manual_bearer();

    std::thread::spawn(move || {
        let _req = out.recv_timeout(Duration::from_secs(1)).unwrap();
        feed.send(vec![
            ERROR_RSP,
            READ_REQ,
            0x12,
            0x00,
            code::READ_NOT_PERMITTED,
        ])
        .unwrap();
        // Keep the feeder alive until the test is done.
        std::thread::sleep(Duration::from_millis(200));
    });

    let err = bearer.read(0x0012).unwrap_err();
    assert_eq!(err, AttError::Protocol(code::READ_NOT_PERMITTED));
}

#[test]
fn attribute_not_found_is_a_terminator_not_an_error_code() {
    let (bearer, feed, out) = manual_bearer();

    std::thread::spawn(move || {
        let _req = out.recv_timeout(Duration::from_secs(1)).unwrap();
        feed.send(vec![
            ERROR_RSP,
            READ_BY_GROUP_TYPE_REQ,
            0x01,
            0x00,
            code::ATTRIBUTE_NOT_FOUND,
        ])
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));
    });

    let err = bearer
        .read_by_group_type(0x0001, 0xFFFF, &crate::uuid::PRIMARY_SERVICE_UUID)
        .unwrap_err();
    assert_eq!(err, AttError::AttrNotFound);
}

#[test]
fn malformed_error_response_is_invalid() {
    let (bearer, feed, out) = manual_bearer();

    std::thread::spawn(move || {
        let _req = out.recv_timeout(Duration::from_secs(1)).unwrap();
        // Six bytes: one too many for an Error Response.
        feed.send(vec![ERROR_RSP, READ_REQ, 0x12, 0x00, 0x01, 0xFF])
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));
    });

    let err = bearer.read(0x0012).unwrap_err();
    assert_eq!(err, AttError::InvalidResponse);
}

#[test]
fn cross_talk_is_refused_and_the_wait_continues() {
    let (bearer, feed, out) = manual_bearer();

    let done = std::thread::spawn(move || {
        let req = out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(req[0], WRITE_REQ);

        // Interleave a response that pairs with no pending request.
        feed.send(vec![READ_RSP, 0x01]).unwrap();

        // The bearer must refuse it with RequestNotSupported...
        let refusal = out.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            refusal,
            vec![ERROR_RSP, READ_RSP, 0x00, 0x00, code::REQUEST_NOT_SUPPORTED]
        );

        // ...and still accept the real response afterwards.
        feed.send(vec![WRITE_RSP]).unwrap();
    });

    bearer.write(0x0040, &[0x01]).unwrap();
    done.join().unwrap();
}

#[test]
fn request_times_out_after_two_seconds() {
    let (bearer, _feed, _out) = manual_bearer();
    let start = std::time::Instant::now();
    let err = bearer.read(0x0001).unwrap_err();
    assert_eq!(err, AttError::SeqProtoTimeout);
    assert!(start.elapsed() >= Duration::from_secs(2));
}

#[test]
fn disconnect_fails_pending_request() {
    let (bearer, feed, out) = manual_bearer();

    std::thread::spawn(move || {
        let _req = out.recv_timeout(Duration::from_secs(1)).unwrap();
        drop(feed);
    });

    let err = bearer.read(0x0012).unwrap_err();
    assert_eq!(err, AttError::Disconnected);
}

#[test]
fn indication_is_confirmed_without_a_handler() {
    let (feed_tx, feed_rx) = channel();
    let (out_tx, out_rx) = channel();
    let chan = TestChannel::new(feed_rx, out_tx);
    let _bearer = Bearer::spawn(chan, None, None);

    feed_tx
        .send(vec![HANDLE_VALUE_IND, 0x12, 0x00, 0x55])
        .unwrap();
    let confirmation = out_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(confirmation, vec![HANDLE_VALUE_CNF]);
}

#[test]
fn notifications_are_delivered_in_wire_order() {
    let (feed_tx, feed_rx) = channel();
    let (out_tx, _out_rx) = channel();
    let chan = TestChannel::new(feed_rx, out_tx);

    let (seen_tx, seen_rx) = channel();
    let handler = Arc::new(move |n: Notification| {
        seen_tx.send((n.handle, n.value)).unwrap();
    });
    let _bearer = Bearer::spawn(chan, Some(handler), None);

    feed_tx.send(vec![HANDLE_VALUE_NTF, 0x12, 0x00, 0x01]).unwrap();
    feed_tx.send(vec![HANDLE_VALUE_NTF, 0x12, 0x00, 0x02]).unwrap();

    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        (0x0012, vec![0x01])
    );
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        (0x0012, vec![0x02])
    );
}

#[test]
fn mtu_exchange_validates_range() {
    let (bearer, _feed, _out) = manual_bearer();
    assert_eq!(bearer.exchange_mtu(10).unwrap_err(), AttError::InvalidArgument);
    assert_eq!(
        bearer.exchange_mtu(MAX_MTU + 1).unwrap_err(),
        AttError::InvalidArgument
    );
}

#[test]
fn oversized_write_is_rejected_locally() {
    let (bearer, _feed, _out) = manual_bearer();
    // Default MTU 23 allows at most 20 value bytes.
    let err = bearer.write(0x0001, &[0u8; 21]).unwrap_err();
    assert_eq!(err, AttError::InvalidArgument);
}

#[test]
fn read_multiple_needs_two_handles() {
    let (bearer, _feed, _out) = manual_bearer();
    assert_eq!(
        bearer.read_multiple(&[0x0001]).unwrap_err(),
        AttError::InvalidArgument
    );
}
