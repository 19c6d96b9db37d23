//! Advertise a battery service and notify subscribers once a second.
//!
//! Usage: `sudo cargo run --example peripheral`

use std::time::Duration;

use blehost::gatt::db::{LocalCharacteristic, LocalService};
use blehost::gatt::Properties;
use blehost::uuid::BATTERY_UUID;
use blehost::{Device, DeviceOptions, Uuid};

fn main() -> blehost::Result<()> {
    env_logger::init();

    let device = Device::new(DeviceOptions {
        name: "blehost-battery".into(),
        ..DeviceOptions::default()
    })?;

    let mut service = LocalService::new(BATTERY_UUID);
    service.characteristics.push(LocalCharacteristic::new(
        Uuid::from_u16(0x2A19), // Battery Level
        Properties::READ | Properties::NOTIFY,
        vec![100],
    ));
    let range = device.add_service(&service)?;
    let level_handle = range.start + 2;

    device.advertise_name_and_services("blehost-battery", &[BATTERY_UUID])?;
    println!("advertising as {}...", device.address());

    let mut level = 100u8;
    loop {
        std::thread::sleep(Duration::from_secs(1));
        level = if level == 0 { 100 } else { level - 1 };
        let sent = device.notify(level_handle, &[level])?;
        if sent > 0 {
            println!("battery {level}% -> {sent} subscriber(s)");
        }
    }
}
