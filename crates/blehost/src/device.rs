//! The device orchestrator: transport selection, the HCI core, the GATT
//! server, and the accept loop that serves inbound connections.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::adv;
use crate::att::{AttChannel, Bearer, NotificationHandler, Server, DEFAULT_MTU, MAX_MTU};
use crate::error::{Error, Result};
use crate::gap::{AddrType, BdAddr};
use crate::gatt::db::{LocalService, ServiceRange};
use crate::gatt::{GattClient, GattServer};
use crate::hci::{AdvParams, Conn, H4Stream, Hci, HciSocket, Transport};
use crate::smp::{AuthData, AuthReq, BondStore, IoCapability, MemoryBondStore, SmpConfig, SmpError};
use crate::uuid::Uuid;

/// How the controller is reached.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// Kernel HCI device by index (hci0 = 0).
    HciIndex(u16),
    /// H4 over a serial device path.
    Serial(String),
    /// H4 over TCP, e.g. an emulated controller.
    Tcp(String),
}

/// Options accepted by [`Device::new`].
pub struct DeviceOptions {
    /// Advertised name, also the GAP Device Name attribute.
    pub name: String,
    pub transport: TransportConfig,
    /// ATT_MTU this device accepts; `DEFAULT_MTU ..= MAX_MTU`.
    pub att_mtu: usize,
    pub io_capability: IoCapability,
    pub auth_req: AuthReq,
    /// Bond persistence; in-memory when unset.
    pub bond_store: Option<Arc<dyn BondStore>>,
    /// Delivery of notifications received on accepted connections.
    pub notification_handler: Option<NotificationHandler>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            name: "blehost".to_string(),
            transport: TransportConfig::HciIndex(0),
            att_mtu: MAX_MTU,
            io_capability: IoCapability::NoInputNoOutput,
            auth_req: AuthReq::default(),
            bond_store: None,
            notification_handler: None,
        }
    }
}

/// A dialed peer: the connection and its GATT client.
pub struct Peer {
    pub conn: Conn,
    pub gatt: GattClient,
}

impl Peer {
    /// Initiates pairing with the default or given timeout.
    pub fn pair(&self, auth_data: AuthData, timeout: Duration) -> std::result::Result<(), SmpError> {
        self.conn.pair(auth_data, timeout)
    }

    pub fn close(&self) -> Result<()> {
        self.conn.close()?;
        Ok(())
    }
}

/// A BLE device running both roles over one controller.
pub struct Device {
    hci: Arc<Hci>,
    server: Arc<GattServer>,
}

impl Device {
    /// Opens the transport, initializes the controller, and starts serving
    /// inbound connections.
    pub fn new(options: DeviceOptions) -> Result<Self> {
        if !(DEFAULT_MTU..=MAX_MTU).contains(&options.att_mtu) {
            return Err(Error::InvalidArgument(format!(
                "ATT_MTU must be within {DEFAULT_MTU}..={MAX_MTU}, got {}",
                options.att_mtu
            )));
        }

        let transport: Box<dyn Transport> = match &options.transport {
            TransportConfig::HciIndex(index) => Box::new(HciSocket::open(*index)?),
            TransportConfig::Serial(path) => Box::new(H4Stream::serial(path)?),
            TransportConfig::Tcp(addr) => {
                Box::new(H4Stream::tcp(addr.as_str(), Duration::from_secs(5))?)
            }
        };

        let smp_config = SmpConfig {
            io_capability: options.io_capability,
            auth_req: options.auth_req,
            ..SmpConfig::default()
        };
        let bond_store = options
            .bond_store
            .unwrap_or_else(|| Arc::new(MemoryBondStore::new()));

        let hci = Arc::new(Hci::new(transport, smp_config, bond_store));
        hci.init()?;
        hci.set_att_mtu(options.att_mtu);

        let server = Arc::new(GattServer::new(&options.name));

        let device = Self {
            hci: Arc::clone(&hci),
            server: Arc::clone(&server),
        };
        device.spawn_accept_loop(options.notification_handler);
        Ok(device)
    }

    /// Runs the loop that turns controller-accepted connections into live
    /// ATT server sessions.
    fn spawn_accept_loop(&self, handler: Option<NotificationHandler>) {
        let hci = Arc::clone(&self.hci);
        let server = Arc::clone(&self.server);
        thread::Builder::new()
            .name("accept".into())
            .spawn(move || loop {
                let conn = match hci.accept() {
                    Ok(conn) => conn,
                    Err(_) => {
                        debug!("accept loop exiting");
                        return;
                    }
                };
                info!("serving inbound connection from {}", conn.peer_addr());
                let chan: Arc<dyn AttChannel> = Arc::new(conn);
                let att_server = Arc::new(Server::new(server.db(), Arc::clone(&chan)));
                let bearer = Bearer::spawn(Arc::clone(&chan), handler.clone(), Some(att_server));
                server.attach_session(chan, bearer);
            })
            .expect("spawn accept loop");
    }

    /// The controller address.
    pub fn address(&self) -> BdAddr {
        self.hci.addr()
    }

    /// The GATT server.
    pub fn server(&self) -> &Arc<GattServer> {
        &self.server
    }

    /// Registers a service in the local database.
    pub fn add_service(&self, svc: &LocalService) -> Result<ServiceRange> {
        Ok(self.server.add_service(svc)?)
    }

    /// Removes every registered service except GAP and GATT.
    pub fn remove_all_services(&self) {
        self.server.remove_all_services()
    }

    /// Replaces the registered services.
    pub fn set_services(&self, services: &[LocalService]) -> Result<()> {
        self.server.set_services(services)?;
        Ok(())
    }

    /// Notifies subscribed centrals of a new characteristic value.
    pub fn notify(&self, value_handle: u16, value: &[u8]) -> Result<usize> {
        Ok(self.server.notify(value_handle, value)?)
    }

    /// Indicates a new characteristic value, blocking per connection for
    /// the confirmation.
    pub fn indicate(&self, value_handle: u16, value: &[u8]) -> Result<usize> {
        Ok(self.server.indicate(value_handle, value)?)
    }

    /// Advertises the device name and service UUIDs, spilling the name to
    /// the scan response when it does not fit.
    pub fn advertise_name_and_services(&self, name: &str, uuids: &[Uuid]) -> Result<()> {
        let (ad, scan_rsp) = adv::pack_name_and_uuids(name, uuids)?;
        self.hci
            .start_advertising(&ad, &scan_rsp, AdvParams::default())?;
        Ok(())
    }

    /// Advertises manufacturer data.
    pub fn advertise_mfg_data(&self, company: u16, data: &[u8]) -> Result<()> {
        let ad = adv::pack_mfg_data(company, data)?;
        self.hci.start_advertising(&ad, &[], AdvParams::default())?;
        Ok(())
    }

    /// Advertises service data bound to a 16-bit UUID.
    pub fn advertise_service_data16(&self, id: u16, data: &[u8]) -> Result<()> {
        let ad = adv::pack_service_data16(id, data)?;
        self.hci.start_advertising(&ad, &[], AdvParams::default())?;
        Ok(())
    }

    /// Advertises an iBeacon frame.
    pub fn advertise_ibeacon(&self, uuid: &Uuid, major: u16, minor: u16, power: i8) -> Result<()> {
        let ad = adv::pack_ibeacon(uuid, major, minor, power)?;
        let params = AdvParams {
            connectable: false,
            ..AdvParams::default()
        };
        self.hci.start_advertising(&ad, &[], params)?;
        Ok(())
    }

    /// Advertises pre-assembled iBeacon manufacturer data.
    pub fn advertise_ibeacon_data(&self, body: &[u8]) -> Result<()> {
        let ad = adv::pack_ibeacon_data(body)?;
        let params = AdvParams {
            connectable: false,
            ..AdvParams::default()
        };
        self.hci.start_advertising(&ad, &[], params)?;
        Ok(())
    }

    pub fn stop_advertising(&self) -> Result<()> {
        self.hci.stop_advertising()?;
        Ok(())
    }

    /// Starts scanning, delivering each decoded advertisement to the
    /// handler. With `allow_dup` unset the controller suppresses duplicate
    /// reports.
    pub fn scan(
        &self,
        allow_dup: bool,
        handler: impl Fn(adv::Advertisement) + Send + Sync + 'static,
    ) -> Result<()> {
        self.hci.set_adv_handler(Arc::new(handler));
        self.hci.start_scan(allow_dup)?;
        Ok(())
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.hci.stop_scan()?;
        Ok(())
    }

    /// Connects to a peripheral and attaches a GATT client. The local
    /// database is served over the same bearer, so the peer can discover
    /// us back.
    pub fn dial(&self, addr: BdAddr, addr_type: AddrType, timeout: Duration) -> Result<Peer> {
        let conn = self.hci.dial(addr, addr_type, timeout)?;
        let chan: Arc<dyn AttChannel> = Arc::new(conn.clone());
        let att_server = Arc::new(Server::new(self.server.db(), Arc::clone(&chan)));
        let gatt = GattClient::new(Arc::clone(&chan), Some(att_server));
        Ok(Peer { conn, gatt })
    }

    /// Shuts the stack down, tearing down every connection.
    pub fn stop(&self) {
        self.hci.close();
    }
}
