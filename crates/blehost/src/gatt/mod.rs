//! Generic Attribute Profile: the server database and the discovery client.

pub mod client;
pub mod db;
pub mod server;
pub mod types;

#[cfg(test)]
mod tests;

pub use client::GattClient;
pub use db::{AttributeDb, LocalCharacteristic, LocalDescriptor, LocalService, Permissions};
pub use server::GattServer;
pub use types::{Characteristic, Descriptor, Profile, Properties, Service};
