//! Connect to a peripheral, discover its services, and subscribe to the
//! first notifying characteristic.
//!
//! Usage: `sudo cargo run --example central AA:BB:CC:DD:EE:FF`

use std::sync::Arc;
use std::time::Duration;

use blehost::gap::BdAddr;
use blehost::{AddrType, Device, DeviceOptions};

fn parse_addr(text: &str) -> Option<BdAddr> {
    let parts: Vec<u8> = text
        .split(':')
        .filter_map(|p| u8::from_str_radix(p, 16).ok())
        .collect();
    if parts.len() != 6 {
        return None;
    }
    // Wire order is the reverse of the printed form.
    let mut bytes = [0u8; 6];
    for (i, b) in parts.iter().enumerate() {
        bytes[5 - i] = *b;
    }
    Some(BdAddr::new(bytes))
}

fn main() -> blehost::Result<()> {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .and_then(|arg| parse_addr(&arg))
        .expect("usage: central AA:BB:CC:DD:EE:FF");

    let device = Device::new(DeviceOptions {
        name: "blehost-central".into(),
        ..DeviceOptions::default()
    })?;

    println!("dialing {addr}...");
    let peer = device.dial(addr, AddrType::Public, Duration::from_secs(10))?;

    let mtu = peer.gatt.exchange_mtu(185)?;
    println!("negotiated MTU {mtu}");

    let profile = peer.gatt.discover_profile(false)?;
    for service in &profile.services {
        println!("service {} [{:#06x}..{:#06x}]", service.uuid, service.handle, service.end_handle);
        for ch in &service.characteristics {
            println!("  characteristic {} value={:#06x}", ch.uuid, ch.value_handle);
        }
    }

    let notifying = profile
        .services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.properties.can_notify() && c.cccd.is_some());

    if let Some(ch) = notifying {
        println!("subscribing to {}", ch.uuid);
        peer.gatt.subscribe(
            ch,
            false,
            Arc::new(|id, value| {
                println!("notification #{id}: {value:02x?}");
            }),
        )?;
        std::thread::sleep(Duration::from_secs(30));
    }

    peer.close()?;
    device.stop();
    Ok(())
}
