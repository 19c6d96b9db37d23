//! GAP-level primitives: device addresses and roles.

mod types;

pub use types::{AddrType, BdAddr, Role};
