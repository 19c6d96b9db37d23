//! Attribute Protocol: the single-bearer request/response engine and the
//! server-side request handlers.

pub mod bearer;
pub mod constants;
pub mod error;
pub mod server;
pub mod types;

#[cfg(test)]
pub(crate) mod tests;

pub use bearer::{AttChannel, Bearer, Notification, NotificationHandler};
pub use constants::{DEFAULT_MTU, MAX_MTU};
pub use error::{AttError, AttResult};
pub use server::Server;
