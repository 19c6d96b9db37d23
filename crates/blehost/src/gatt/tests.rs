//! End-to-end GATT tests: a discovery client wired back-to-back with an
//! ATT server over in-memory channels.

use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use crate::att::tests::TestChannel;
use crate::att::{AttChannel, Bearer, Server};
use crate::gatt::client::GattClient;
use crate::gatt::db::{AttributeDb, LocalCharacteristic, LocalService};
use crate::gatt::server::GattServer;
use crate::gatt::types::Properties;
use crate::uuid::{Uuid, BATTERY_UUID, GAP_UUID, GATT_UUID};

/// The peripheral side of one wired-up session.
struct PeripheralEnd {
    chan: Arc<TestChannel>,
}

/// Wires a fresh client against a peripheral serving `server`'s database.
fn connect(server: &GattServer) -> (GattClient, PeripheralEnd) {
    let (client_chan, server_chan) = TestChannel::linked_pair();
    let att_server = Arc::new(Server::new(
        server.db(),
        server_chan.clone() as Arc<dyn AttChannel>,
    ));
    let bearer = Bearer::spawn(server_chan.clone(), None, Some(att_server));
    server.attach_session(server_chan.clone() as Arc<dyn AttChannel>, bearer);
    let client = GattClient::new(client_chan as Arc<dyn AttChannel>, None);
    (client, PeripheralEnd { chan: server_chan })
}

fn battery_server() -> GattServer {
    let server = GattServer::new("test-device");
    let mut svc = LocalService::new(BATTERY_UUID);
    svc.characteristics.push(LocalCharacteristic::new(
        Uuid::from_u16(0x2A19),
        Properties::READ | Properties::NOTIFY | Properties::INDICATE,
        vec![0x64],
    ));
    server.add_service(&svc).unwrap();
    server
}

#[test]
fn service_discovery_happy_path() {
    let server = battery_server();
    let (client, _peripheral) = connect(&server);

    let services = client.discover_services(None).unwrap();
    let uuids: Vec<Uuid> = services.iter().map(|s| s.uuid).collect();
    assert!(uuids.contains(&GAP_UUID));
    assert!(uuids.contains(&GATT_UUID));
    assert!(uuids.contains(&BATTERY_UUID));

    let battery = services.iter().find(|s| s.uuid == BATTERY_UUID).unwrap();
    let range = server
        .db()
        .services()
        .into_iter()
        .find(|r| r.uuid == BATTERY_UUID)
        .unwrap();
    assert_eq!(battery.handle, range.start);
    assert_eq!(battery.end_handle, range.end);
    // Declaration, value, CCCD.
    assert_eq!(range.end - range.start, 3);
}

#[test]
fn service_discovery_with_filter() {
    let server = battery_server();
    let (client, _peripheral) = connect(&server);

    let services = client.discover_services(Some(&[BATTERY_UUID])).unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].uuid, BATTERY_UUID);
}

#[test]
fn characteristic_and_descriptor_discovery() {
    let server = battery_server();
    let (client, _peripheral) = connect(&server);

    let mut services = client.discover_services(Some(&[BATTERY_UUID])).unwrap();
    let svc = &mut services[0];
    client.discover_characteristics(svc).unwrap();
    assert_eq!(svc.characteristics.len(), 1);

    let mut ch = svc.characteristics[0].clone();
    assert_eq!(ch.uuid, Uuid::from_u16(0x2A19));
    assert_eq!(ch.value_handle, ch.handle + 1);
    assert!(ch.properties.can_notify());

    client.discover_descriptors(&mut ch).unwrap();
    let cccd = ch.cccd.expect("notify characteristic must expose a CCCD");
    assert_eq!(cccd.handle, ch.value_handle + 1);
}

#[test]
fn discover_profile_walks_the_whole_hierarchy() {
    let server = battery_server();
    let (client, _peripheral) = connect(&server);

    let profile = client.discover_profile(false).unwrap();
    let battery = profile.find_service(BATTERY_UUID).unwrap();
    assert_eq!(battery.characteristics.len(), 1);
    assert!(battery.characteristics[0].cccd.is_some());

    // Cached on second call.
    let again = client.discover_profile(false).unwrap();
    assert_eq!(again.services.len(), profile.services.len());
}

#[test]
fn read_and_write_characteristic() {
    let server = battery_server();
    let (client, _peripheral) = connect(&server);

    let profile = client.discover_profile(false).unwrap();
    let ch = profile.find_characteristic(Uuid::from_u16(0x2A19)).unwrap();

    assert_eq!(client.read_characteristic(ch).unwrap(), vec![0x64]);
    client.write_characteristic(ch, &[0x32], false).unwrap();
    assert_eq!(client.read_characteristic(ch).unwrap(), vec![0x32]);
}

#[test]
fn long_read_reassembles_byte_for_byte() {
    let server = GattServer::new("test-device");
    let value: Vec<u8> = (0u8..40).collect();
    let mut svc = LocalService::new(Uuid::from_u16(0x1810));
    svc.characteristics.push(LocalCharacteristic::new(
        Uuid::from_u16(0x2A35),
        Properties::READ,
        value.clone(),
    ));
    server.add_service(&svc).unwrap();
    let (client, _peripheral) = connect(&server);

    // TxMTU stays at the default 23: Read returns 22 bytes, then Read Blob
    // continues from offset 22 until a short chunk.
    let profile = client.discover_profile(false).unwrap();
    let ch = profile.find_characteristic(Uuid::from_u16(0x2A35)).unwrap();
    let long = client.read_long_characteristic(ch).unwrap();
    assert_eq!(long, value);
}

#[test]
fn mtu_negotiation_settles_on_the_minimum() {
    let server = battery_server();
    let (client, peripheral) = connect(&server);

    // The server side accepts at most 100 bytes.
    peripheral.chan.set_rx_mtu(100);
    let mtu = client.exchange_mtu(185).unwrap();
    assert_eq!(mtu, 100);
    assert_eq!(client.bearer().tx_mtu(), 100);
    assert_eq!(peripheral.chan.tx_mtu(), 100);
}

#[test]
fn notification_ids_start_at_zero_and_increment() {
    let server = battery_server();
    let (client, _peripheral) = connect(&server);

    let profile = client.discover_profile(false).unwrap();
    let ch = profile
        .find_characteristic(Uuid::from_u16(0x2A19))
        .unwrap()
        .clone();

    let (seen_tx, seen_rx) = channel();
    client
        .subscribe(
            &ch,
            false,
            Arc::new(move |id, value| {
                seen_tx.send((id, value.to_vec())).unwrap();
            }),
        )
        .unwrap();

    assert_eq!(server.notify(ch.value_handle, &[0xAA, 0xBB]).unwrap(), 1);
    assert_eq!(server.notify(ch.value_handle, &[0xCC]).unwrap(), 1);

    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        (0, vec![0xAA, 0xBB])
    );
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        (1, vec![0xCC])
    );
}

#[test]
fn subscribe_is_idempotent() {
    let server = battery_server();
    let (client, peripheral) = connect(&server);

    let profile = client.discover_profile(false).unwrap();
    let ch = profile
        .find_characteristic(Uuid::from_u16(0x2A19))
        .unwrap()
        .clone();
    let cccd_handle = ch.cccd.unwrap().handle;

    client.subscribe(&ch, false, Arc::new(|_, _| {})).unwrap();
    assert_eq!(peripheral.chan.cccd(cccd_handle), 0x0001);
    // A second subscribe in the same mode changes nothing.
    client.subscribe(&ch, false, Arc::new(|_, _| {})).unwrap();
    assert_eq!(peripheral.chan.cccd(cccd_handle), 0x0001);

    client.unsubscribe(&ch, false).unwrap();
    assert_eq!(peripheral.chan.cccd(cccd_handle), 0x0000);
}

#[test]
fn cccd_state_is_per_connection() {
    let server = battery_server();
    let (client_a, peripheral_a) = connect(&server);
    let (client_b, peripheral_b) = connect(&server);

    let profile = client_a.discover_profile(false).unwrap();
    let ch = profile
        .find_characteristic(Uuid::from_u16(0x2A19))
        .unwrap()
        .clone();
    let cccd_handle = ch.cccd.unwrap().handle;

    let (seen_tx, seen_rx) = channel();
    client_a
        .subscribe(
            &ch,
            false,
            Arc::new(move |id, value| {
                seen_tx.send((id, value.to_vec())).unwrap();
            }),
        )
        .unwrap();

    // Connection A sees its subscription; connection B still reads zero.
    assert_eq!(peripheral_a.chan.cccd(cccd_handle), 0x0001);
    assert_eq!(peripheral_b.chan.cccd(cccd_handle), 0x0000);
    let b_reads = client_b.bearer().read(cccd_handle).unwrap();
    assert_eq!(b_reads, vec![0x00, 0x00]);

    // Fan-out reaches only the subscribed connection.
    assert_eq!(server.notify(ch.value_handle, &[0x01]).unwrap(), 1);
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        (0, vec![0x01])
    );
}

#[test]
fn indication_blocks_for_confirmation() {
    let server = battery_server();
    let (client, _peripheral) = connect(&server);

    let profile = client.discover_profile(false).unwrap();
    let ch = profile
        .find_characteristic(Uuid::from_u16(0x2A19))
        .unwrap()
        .clone();

    let (seen_tx, seen_rx) = channel();
    client
        .subscribe(
            &ch,
            true,
            Arc::new(move |id, value| {
                seen_tx.send((id, value.to_vec())).unwrap();
            }),
        )
        .unwrap();

    // indicate() returns only after the client's bearer wrote the
    // confirmation back.
    assert_eq!(server.indicate(ch.value_handle, &[0x0F]).unwrap(), 1);
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        (0, vec![0x0F])
    );
}

#[test]
fn remove_all_services_keeps_gap_and_gatt() {
    let server = battery_server();
    assert_eq!(server.db().services().len(), 3);
    server.remove_all_services();
    let remaining: Vec<Uuid> = server.db().services().iter().map(|r| r.uuid).collect();
    assert_eq!(remaining, vec![GAP_UUID, GATT_UUID]);
}

#[test]
fn handles_are_contiguous_and_value_follows_declaration() {
    let db = AttributeDb::new("x");
    let mut svc = LocalService::new(Uuid::from_u16(0x1810));
    svc.characteristics.push(LocalCharacteristic::new(
        Uuid::from_u16(0x2A35),
        Properties::READ | Properties::NOTIFY,
        vec![],
    ));
    svc.characteristics.push(LocalCharacteristic::new(
        Uuid::from_u16(0x2A36),
        Properties::READ,
        vec![],
    ));
    let range = db.add_service(&svc).unwrap();

    // decl, char decl, value, cccd, char decl, value.
    assert_eq!(range.end - range.start + 1, 6);
    let decl = db.attribute(range.start + 1).unwrap();
    let value_handle = u16::from_le_bytes([decl.value[1], decl.value[2]]);
    assert_eq!(value_handle, range.start + 2);
    assert_eq!(db.cccd_for_value(value_handle), Some(range.start + 3));
}
