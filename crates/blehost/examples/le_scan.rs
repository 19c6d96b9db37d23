//! Scan for nearby LE devices and print each advertisement.
//!
//! Usage: `sudo cargo run --example le_scan [hci-index]`

use std::time::Duration;

use blehost::{Device, DeviceOptions, TransportConfig};

fn main() -> blehost::Result<()> {
    env_logger::init();

    let index: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(0);

    let device = Device::new(DeviceOptions {
        name: "scanner".into(),
        transport: TransportConfig::HciIndex(index),
        ..DeviceOptions::default()
    })?;

    println!("scanning on {} for 10s...", device.address());
    device.scan(false, |adv| {
        let name = adv.local_name.clone().unwrap_or_else(|| "<unknown>".into());
        println!(
            "{} rssi {} dBm {} services={}",
            adv.addr,
            adv.rssi,
            name,
            adv.services.len()
        );
    })?;

    std::thread::sleep(Duration::from_secs(10));
    device.stop_scan()?;
    device.stop();
    Ok(())
}
